use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};

use crate::conditions::{
    DEFAULT_ALARM_THRESHOLD, DEFAULT_ALARM_WINDOW_SECS, DEFAULT_CLUSTER_RADIUS,
    DEFAULT_CLUSTER_WINDOW_SECS,
};
use crate::source::parse_timestamp;

#[derive(Parser, Debug)]
#[command(
    name = "defect-analyzer",
    version,
    about = "Streaming cluster, aggregate and alarm-rate analysis of inspection defect CSVs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the CSV files selected by the directory filters.
    Scan(ScanArgs),
    /// Cluster, aggregate and alarm-rate reports for the matching records.
    Analyze(AnalyzeArgs),
    /// Daily counts for selected defect codes.
    Trend(TrendArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct InputArgs {
    /// Root of the `<IC>/<yyyyMMdd>/<Lot>/` tree.
    #[arg(long)]
    pub input_root: Option<PathBuf>,

    /// Settings file with a `Paths` object; `appsettings.json` is used when present.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    #[arg(long)]
    pub ic: Option<String>,

    #[arg(long)]
    pub lot: Option<String>,

    /// Single inspection day (yyyyMMdd).
    #[arg(long, value_parser = parse_cli_date, conflicts_with_all = ["date_from", "date_to"])]
    pub date: Option<NaiveDate>,

    #[arg(long, value_parser = parse_cli_date)]
    pub date_from: Option<NaiveDate>,

    #[arg(long, value_parser = parse_cli_date)]
    pub date_to: Option<NaiveDate>,
}

#[derive(Args, Debug, Clone)]
pub struct ConditionArgs {
    #[arg(long)]
    pub equipment_code: Option<String>,

    #[arg(long)]
    pub code_filter: Option<String>,

    #[arg(long)]
    pub severity_min: Option<u32>,

    #[arg(long, value_parser = parse_cli_timestamp)]
    pub from: Option<NaiveDateTime>,

    #[arg(long, value_parser = parse_cli_timestamp)]
    pub to: Option<NaiveDateTime>,

    #[arg(long, default_value_t = DEFAULT_CLUSTER_RADIUS, allow_negative_numbers = true)]
    pub cluster_radius: f64,

    #[arg(long, default_value_t = DEFAULT_CLUSTER_WINDOW_SECS, allow_negative_numbers = true)]
    pub cluster_window_secs: i64,

    #[arg(long, default_value_t = DEFAULT_ALARM_WINDOW_SECS, allow_negative_numbers = true)]
    pub alarm_window_secs: i64,

    #[arg(long, default_value_t = DEFAULT_ALARM_THRESHOLD, allow_negative_numbers = true)]
    pub alarm_threshold: i64,
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    #[command(flatten)]
    pub input: InputArgs,
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub conditions: ConditionArgs,

    /// Explicit input files; bypasses the directory scan.
    #[arg(long = "file")]
    pub files: Vec<PathBuf>,

    #[arg(long)]
    pub output_root: Option<PathBuf>,

    /// Cancel the run once this budget is spent; 0 disables it.
    #[arg(long, default_value_t = 0)]
    pub timeout_ms: u64,

    #[arg(long, default_value_t = false)]
    pub no_manifest: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TrendArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub conditions: ConditionArgs,

    #[arg(long = "file")]
    pub files: Vec<PathBuf>,

    #[arg(long)]
    pub output_root: Option<PathBuf>,

    /// Codes to track, separated by `,` or `;` (`01_Kizu`, `Kizu` or `01`).
    #[arg(long)]
    pub trend_codes: String,

    #[arg(long)]
    pub codebook: Option<PathBuf>,
}

fn parse_cli_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .map_err(|err| format!("expected yyyyMMdd: {err}"))
}

fn parse_cli_timestamp(value: &str) -> Result<NaiveDateTime, String> {
    parse_timestamp(value).map_err(|err| err.to_string())
}
