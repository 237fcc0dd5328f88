use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Face {
    Front,
    Back,
    #[default]
    Unspecified,
}

impl Face {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Front => "Front",
            Self::Back => "Back",
            Self::Unspecified => "Unspecified",
        }
    }

    pub fn parse_label(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed == "表" {
            return Self::Front;
        }
        if trimmed == "裏" {
            return Self::Back;
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "f" | "front" | "top" => Self::Front,
            "b" | "back" | "bottom" => Self::Back,
            _ => Self::Unspecified,
        }
    }
}

/// One defect observation as delivered by the record source.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectionRecord {
    pub lot_no: String,
    pub timestamp: NaiveDateTime,
    pub equipment_code: String,
    pub ledger_no: String,
    pub face: Face,
    pub x: f64,
    pub y: f64,
    pub severity: u32,
    pub code_raw: String,
    /// Vendor-specific quality metrics, carried through untouched.
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefectCode {
    pub code: u32,
    pub name: String,
}

impl fmt::Display for DefectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}_{}", self.code, self.name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFileEntry {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportPaths {
    pub cluster_path: String,
    pub aggregate_path: String,
    pub alarm_path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisCounts {
    pub records_read: u64,
    pub accepted_records: u64,
    pub clusters: u64,
    pub alarm_windows: usize,
    pub alarm_windows_triggered: usize,
    pub face_code_groups: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionSnapshot {
    pub ic: Option<String>,
    pub lot: Option<String>,
    pub equipment_code: Option<String>,
    pub code_filter: Option<String>,
    pub severity_min: Option<u32>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cluster_radius: f64,
    pub cluster_time_window_secs: i64,
    pub alarm_window_secs: i64,
    pub alarm_threshold: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub conditions: ConditionSnapshot,
    pub outputs: ReportPaths,
    pub counts: AnalysisCounts,
    pub source_hashes: Vec<SourceFileEntry>,
    pub warnings: Vec<String>,
}
