use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::aggregate::{AggregateRow, AlarmRow};
use crate::conditions::ConditionSet;
use crate::model::{InspectionRecord, ReportPaths};
use crate::util::{
    UTF8_BOM, escape_csv_cell, format_ratio, format_timestamp, sanitize_file_label,
};

pub(super) const CLUSTER_HEADER: &str =
    "LotNo,Timestamp,EquipmentCode,LedgerNo,Face,X,Y,Severity,CodeRaw,ClusterId";
pub(super) const AGGREGATE_HEADER: &str = "Face,Code,Count,RatioInFace";
pub(super) const ALARM_HEADER: &str = "WindowStart,WindowEnd,Count,Threshold,Alarm";

const FALLBACK_IC: &str = "IC";
const FALLBACK_LOT: &str = "ALL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ReportLabels {
    pub(super) ic: String,
    pub(super) lot: String,
    pub(super) range_or_stamp: String,
}

impl ReportLabels {
    /// Condition values win; otherwise the first accepted record names the files.
    pub(super) fn resolve(
        conditions: &ConditionSet,
        first: Option<&InspectionRecord>,
        run_stamp: &str,
    ) -> Self {
        let ic = conditions
            .ic_filter()
            .map(ToOwned::to_owned)
            .or_else(|| non_blank(first.map(|record| record.equipment_code.as_str())))
            .unwrap_or_else(|| FALLBACK_IC.to_string());
        let lot = conditions
            .lot_filter()
            .map(ToOwned::to_owned)
            .or_else(|| non_blank(first.map(|record| record.lot_no.as_str())))
            .unwrap_or_else(|| FALLBACK_LOT.to_string());
        let range_or_stamp = conditions
            .range_label()
            .unwrap_or_else(|| run_stamp.to_string());

        Self {
            ic,
            lot,
            range_or_stamp,
        }
    }

    fn file_name(&self, kind: &str) -> String {
        format!(
            "{kind}_{}_{}_{}.csv",
            sanitize_file_label(&self.ic),
            sanitize_file_label(&self.lot),
            sanitize_file_label(&self.range_or_stamp)
        )
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFiles {
    pub cluster: PathBuf,
    pub aggregate: PathBuf,
    pub alarm: PathBuf,
}

impl ReportFiles {
    pub fn to_manifest_paths(&self) -> ReportPaths {
        ReportPaths {
            cluster_path: self.cluster.display().to_string(),
            aggregate_path: self.aggregate.display().to_string(),
            alarm_path: self.alarm.display().to_string(),
        }
    }
}

struct CsvTable {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvTable {
    fn create(path: PathBuf, header: &str) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create report file: {}", path.display()))?;
        let mut table = Self {
            path,
            writer: BufWriter::new(file),
        };
        table.write_raw(UTF8_BOM)?;
        table.write_line(header)?;
        Ok(table)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .with_context(|| format!("failed to write report file: {}", self.path.display()))
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.write_raw(line.as_bytes())?;
        self.write_raw(b"\n")
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush report file: {}", self.path.display()))
    }
}

/// The three output tables of one run.
///
/// Opened once the first accepted record is known (or at end of stream when
/// nothing matched). Dropping the writer closes every file.
pub(super) struct ReportWriter {
    files: ReportFiles,
    cluster: CsvTable,
    aggregate: CsvTable,
    alarm: CsvTable,
}

impl ReportWriter {
    pub(super) fn open(exports_dir: &Path, labels: &ReportLabels) -> Result<Self> {
        let files = ReportFiles {
            cluster: exports_dir.join(labels.file_name("Cluster")),
            aggregate: exports_dir.join(labels.file_name("Aggregate")),
            alarm: exports_dir.join(labels.file_name("AlarmRate")),
        };

        let cluster = CsvTable::create(files.cluster.clone(), CLUSTER_HEADER)?;
        let aggregate = CsvTable::create(files.aggregate.clone(), AGGREGATE_HEADER)?;
        let alarm = CsvTable::create(files.alarm.clone(), ALARM_HEADER)?;

        Ok(Self {
            files,
            cluster,
            aggregate,
            alarm,
        })
    }

    pub(super) fn write_cluster_row(
        &mut self,
        record: &InspectionRecord,
        cluster_id: u64,
    ) -> Result<()> {
        let line = [
            escape_csv_cell(&record.lot_no),
            format_timestamp(record.timestamp),
            escape_csv_cell(&record.equipment_code),
            escape_csv_cell(&record.ledger_no),
            record.face.as_str().to_string(),
            record.x.to_string(),
            record.y.to_string(),
            record.severity.to_string(),
            escape_csv_cell(&record.code_raw),
            cluster_id.to_string(),
        ]
        .join(",");
        self.cluster.write_line(&line)
    }

    /// Writes the summary tables and flushes all three files.
    ///
    /// Every table is flushed even when an earlier one failed; the first error wins.
    pub(super) fn finish(
        mut self,
        aggregate_rows: &[AggregateRow],
        alarm_rows: &[AlarmRow],
    ) -> Result<ReportFiles> {
        let mut first_error = write_aggregate_rows(&mut self.aggregate, aggregate_rows).err();
        if let Err(err) = write_alarm_rows(&mut self.alarm, alarm_rows) {
            first_error.get_or_insert(err);
        }

        for table in [&mut self.cluster, &mut self.aggregate, &mut self.alarm] {
            if let Err(err) = table.flush() {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(self.files),
        }
    }
}

fn write_aggregate_rows(table: &mut CsvTable, rows: &[AggregateRow]) -> Result<()> {
    for row in rows {
        let line = [
            row.face.as_str().to_string(),
            escape_csv_cell(&row.code),
            row.count.to_string(),
            format_ratio(row.ratio_in_face),
        ]
        .join(",");
        table.write_line(&line)?;
    }
    Ok(())
}

fn write_alarm_rows(table: &mut CsvTable, rows: &[AlarmRow]) -> Result<()> {
    for row in rows {
        let line = [
            format_timestamp(row.window_start),
            format_timestamp(row.window_end),
            row.count.to_string(),
            row.threshold.to_string(),
            if row.alarm { "1" } else { "0" }.to_string(),
        ]
        .join(",");
        table.write_line(&line)?;
    }
    Ok(())
}
