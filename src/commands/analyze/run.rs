use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use super::pipeline::{AnalysisSummary, RunOutcome, run_analysis};
use crate::cancel::CancellationToken;
use crate::cli::AnalyzeArgs;
use crate::commands::inputs::{build_conditions, resolve_output_root, select_inputs};
use crate::conditions::ConditionSet;
use crate::model::{AnalysisRunManifest, SourceFileEntry};
use crate::settings::load_paths;
use crate::source::RecordStream;
use crate::util::{
    format_timestamp, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

/// Process exit status for a run stopped by cancellation or `--timeout-ms`.
pub const CANCELED_EXIT_CODE: i32 = 3;

/// How an `analyze` invocation ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Canceled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Canceled => CANCELED_EXIT_CODE,
        }
    }
}

pub fn run(args: AnalyzeArgs) -> Result<RunStatus> {
    let cancel = CancellationToken::with_timeout_ms(args.timeout_ms);
    run_with_token(args, &cancel)
}

pub(super) fn run_with_token(
    args: AnalyzeArgs,
    cancel: &CancellationToken,
) -> Result<RunStatus> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("analysis-{}", utc_compact_string(started_ts));

    let paths = load_paths(args.input.settings.as_deref())?;
    let selection = select_inputs(&args.input, &args.files, &paths)?;
    let output_root = resolve_output_root(
        args.output_root.as_deref(),
        &paths,
        selection.input_root.as_deref(),
    );
    let conditions = build_conditions(&args.input, &args.conditions);

    if selection.files.is_empty() {
        warn!("no input files selected; reports will contain headers only");
    }
    info!(
        run_id = %run_id,
        files = selection.files.len(),
        output_root = %output_root.display(),
        "starting analyze"
    );

    let mut stream = RecordStream::new(selection.files.clone());
    let outcome = run_analysis(&mut stream, &conditions, &output_root, cancel)?;

    let summary = match outcome {
        RunOutcome::Completed(summary) => summary,
        RunOutcome::Canceled => {
            warn!(
                run_id = %run_id,
                timeout_ms = args.timeout_ms,
                "analysis canceled; aggregate and alarm reports are incomplete"
            );
            return Ok(RunStatus::Canceled);
        }
    };

    let mut warnings = Vec::new();
    if stream.skipped_rows() > 0 {
        warnings.push(format!(
            "{} source rows could not be parsed and were skipped",
            stream.skipped_rows()
        ));
    }
    for rejected in stream.rejected_files() {
        warnings.push(format!("source file rejected: {}", rejected.display()));
    }

    log_summary(&summary, &conditions);
    if args.no_manifest {
        return Ok(RunStatus::Completed);
    }

    let manifest_path = output_root
        .join("exports")
        .join(format!("analysis_run_{}.json", utc_compact_string(started_ts)));
    let manifest = AnalysisRunManifest {
        manifest_version: 1,
        run_id,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_analyze_command(&args),
        conditions: conditions.snapshot(),
        outputs: summary.files.to_manifest_paths(),
        counts: summary.counts,
        source_hashes: hash_sources(&selection.files, stream.rejected_files()),
        warnings,
    };
    write_json_pretty(&manifest_path, &manifest)?;

    info!(path = %manifest_path.display(), "wrote analysis run manifest");
    Ok(RunStatus::Completed)
}

fn hash_sources(files: &[PathBuf], rejected: &[PathBuf]) -> Vec<SourceFileEntry> {
    let mut entries = Vec::new();
    for path in files {
        if rejected.contains(path) {
            continue;
        }
        match sha256_file(path) {
            Ok(sha256) => entries.push(SourceFileEntry {
                path: path.display().to_string(),
                sha256,
            }),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to hash source file"),
        }
    }
    entries
}

fn log_summary(summary: &AnalysisSummary, conditions: &ConditionSet) {
    if summary.counts.alarm_windows_triggered > 0 {
        warn!(
            triggered = summary.counts.alarm_windows_triggered,
            threshold = conditions.alarm_threshold,
            alarm = %summary.files.alarm.display(),
            "alarm windows reached the threshold"
        );
    }
}

pub(super) fn render_analyze_command(args: &AnalyzeArgs) -> String {
    let mut command = vec!["defect-analyzer".to_string(), "analyze".to_string()];

    push_path(&mut command, "--input-root", args.input.input_root.as_deref());
    push_path(&mut command, "--settings", args.input.settings.as_deref());
    push_value(&mut command, "--ic", args.input.ic.as_ref());
    push_value(&mut command, "--lot", args.input.lot.as_ref());
    push_value(
        &mut command,
        "--date",
        args.input.date.map(|date| date.format("%Y%m%d")).as_ref(),
    );
    push_value(
        &mut command,
        "--date-from",
        args.input.date_from.map(|date| date.format("%Y%m%d")).as_ref(),
    );
    push_value(
        &mut command,
        "--date-to",
        args.input.date_to.map(|date| date.format("%Y%m%d")).as_ref(),
    );
    for file in &args.files {
        push_path(&mut command, "--file", Some(file.as_path()));
    }
    push_path(&mut command, "--output-root", args.output_root.as_deref());

    let conditions = &args.conditions;
    push_value(&mut command, "--equipment-code", conditions.equipment_code.as_ref());
    push_value(&mut command, "--code-filter", conditions.code_filter.as_ref());
    push_value(&mut command, "--severity-min", conditions.severity_min.as_ref());
    push_value(
        &mut command,
        "--from",
        conditions.from.map(quoted_timestamp).as_ref(),
    );
    push_value(
        &mut command,
        "--to",
        conditions.to.map(quoted_timestamp).as_ref(),
    );
    push_value(&mut command, "--cluster-radius", Some(&conditions.cluster_radius));
    push_value(
        &mut command,
        "--cluster-window-secs",
        Some(&conditions.cluster_window_secs),
    );
    push_value(&mut command, "--alarm-window-secs", Some(&conditions.alarm_window_secs));
    push_value(&mut command, "--alarm-threshold", Some(&conditions.alarm_threshold));
    if args.timeout_ms > 0 {
        push_value(&mut command, "--timeout-ms", Some(&args.timeout_ms));
    }

    command.join(" ")
}

fn quoted_timestamp(ts: chrono::NaiveDateTime) -> String {
    format!("\"{}\"", format_timestamp(ts))
}

fn push_value<T: ToString>(command: &mut Vec<String>, flag: &str, value: Option<&T>) {
    if let Some(value) = value {
        command.push(flag.to_string());
        command.push(value.to_string());
    }
}

fn push_path(command: &mut Vec<String>, flag: &str, value: Option<&Path>) {
    if let Some(path) = value {
        command.push(flag.to_string());
        command.push(path.display().to_string());
    }
}
