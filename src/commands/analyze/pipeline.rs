use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::aggregate::WindowedAggregator;
use super::cluster::OnlineClusterer;
use super::report::{ReportFiles, ReportLabels, ReportWriter};
use crate::cancel::CancellationToken;
use crate::conditions::ConditionSet;
use crate::model::{AnalysisCounts, InspectionRecord};
use crate::util::{ensure_directory, local_compact_stamp};

/// Accepted records between two full-grid prune sweeps.
pub const PRUNE_INTERVAL: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct AnalysisSummary {
    pub files: ReportFiles,
    pub counts: AnalysisCounts,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(AnalysisSummary),
    Canceled,
}

/// Runs one forward pass over `source` and writes the three reports under
/// `<output_root>/exports`.
///
/// Invalid conditions fail with a [`crate::conditions::ConditionErrors`]
/// before anything is read or created.
pub fn run_analysis<I>(
    source: I,
    conditions: &ConditionSet,
    output_root: &Path,
    cancel: &CancellationToken,
) -> Result<RunOutcome>
where
    I: IntoIterator<Item = InspectionRecord>,
{
    conditions.validate()?;

    let exports_dir = output_root.join("exports");
    ensure_directory(&exports_dir)?;
    let run_stamp = local_compact_stamp();

    info!(
        exports_dir = %exports_dir.display(),
        cluster_radius = conditions.cluster_radius,
        cluster_window_secs = conditions.cluster_time_window.num_seconds(),
        alarm_window_secs = conditions.alarm_window.num_seconds(),
        alarm_threshold = conditions.alarm_threshold,
        "starting analysis"
    );

    let mut clusterer =
        OnlineClusterer::new(conditions.cluster_radius, conditions.cluster_time_window);
    let mut aggregator =
        WindowedAggregator::new(conditions.alarm_window, conditions.alarm_threshold);
    let mut writer: Option<ReportWriter> = None;
    let mut records_read = 0u64;
    let mut records = source.into_iter();

    loop {
        if cancel.is_cancelled() {
            warn!(records_read, accepted = aggregator.total(), "analysis canceled");
            return Ok(RunOutcome::Canceled);
        }

        let Some(record) = records.next() else {
            break;
        };
        records_read += 1;

        if !conditions.matches(&record) {
            continue;
        }

        let cluster_id = clusterer.assign(record.x, record.y, record.timestamp);
        aggregator.add(&record);

        if writer.is_none() {
            let labels = ReportLabels::resolve(conditions, Some(&record), &run_stamp);
            match ReportWriter::open(&exports_dir, &labels) {
                Ok(report) => writer = Some(report),
                Err(err) => return cancel_precedence(err, cancel),
            }
        }
        if let Some(report) = writer.as_mut()
            && let Err(err) = report.write_cluster_row(&record, cluster_id)
        {
            return cancel_precedence(err, cancel);
        }

        if aggregator.total() % PRUNE_INTERVAL == 0 {
            let removed = clusterer.prune(record.timestamp);
            debug!(
                removed,
                live = clusterer.live_anchor_count(),
                "pruned expired cluster anchors"
            );
        }
    }

    let report = match writer {
        Some(report) => report,
        None => {
            let labels = ReportLabels::resolve(conditions, None, &run_stamp);
            info!(ic = %labels.ic, lot = %labels.lot, "no records matched; writing empty reports");
            match ReportWriter::open(&exports_dir, &labels) {
                Ok(report) => report,
                Err(err) => return cancel_precedence(err, cancel),
            }
        }
    };

    for (face, total) in aggregator.face_totals() {
        debug!(face = face.as_str(), total, "face total");
    }
    let aggregate_rows = aggregator.aggregate_rows();
    let alarm_rows = aggregator.alarm_rows();
    let counts = AnalysisCounts {
        records_read,
        accepted_records: aggregator.total(),
        clusters: clusterer.clusters_created(),
        alarm_windows: alarm_rows.len(),
        alarm_windows_triggered: alarm_rows.iter().filter(|row| row.alarm).count(),
        face_code_groups: aggregate_rows.len(),
    };

    let files = match report.finish(&aggregate_rows, &alarm_rows) {
        Ok(files) => files,
        Err(err) => return cancel_precedence(err, cancel),
    };

    info!(
        cluster = %files.cluster.display(),
        aggregate = %files.aggregate.display(),
        alarm = %files.alarm.display(),
        records_read = counts.records_read,
        accepted = counts.accepted_records,
        clusters = counts.clusters,
        alarm_windows = counts.alarm_windows,
        alarm_windows_triggered = counts.alarm_windows_triggered,
        "analysis completed"
    );

    Ok(RunOutcome::Completed(AnalysisSummary { files, counts }))
}

/// A fatal error observed while cancellation is pending reports as canceled.
fn cancel_precedence(err: anyhow::Error, cancel: &CancellationToken) -> Result<RunOutcome> {
    if cancel.is_cancelled() {
        warn!(error = %err, "analysis canceled while an output error was pending");
        return Ok(RunOutcome::Canceled);
    }
    Err(err)
}
