use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tracing::info;

use crate::cli::{ConditionArgs, InputArgs};
use crate::commands::scan::{ScanFilter, enumerate_csv_files};
use crate::conditions::{ConditionSet, window_from_secs};
use crate::settings::ResolvedPaths;

/// Files selected for one run and the tree they came from, if any.
#[derive(Debug, Clone)]
pub struct InputSelection {
    pub files: Vec<PathBuf>,
    pub input_root: Option<PathBuf>,
}

pub fn resolve_input_root(args: &InputArgs, paths: &ResolvedPaths) -> Result<PathBuf> {
    match args.input_root.as_ref().or(paths.input_root.as_ref()) {
        Some(root) => Ok(root.clone()),
        None => bail!("no input root: pass --input-root or set Paths.InputRoot in the settings file"),
    }
}

/// Explicit `--file` inputs bypass the directory scan.
pub fn select_inputs(
    args: &InputArgs,
    explicit_files: &[PathBuf],
    paths: &ResolvedPaths,
) -> Result<InputSelection> {
    if !explicit_files.is_empty() {
        return Ok(InputSelection {
            files: explicit_files.to_vec(),
            input_root: args.input_root.clone().or_else(|| paths.input_root.clone()),
        });
    }

    let input_root = resolve_input_root(args, paths)?;
    let files = enumerate_csv_files(&input_root, &ScanFilter::from_args(args))?;
    info!(root = %input_root.display(), files = files.len(), "selected input files");
    Ok(InputSelection {
        files,
        input_root: Some(input_root),
    })
}

/// Command line, then settings, then `<input root parent>/../out`, then `out`.
pub fn resolve_output_root(
    explicit: Option<&Path>,
    paths: &ResolvedPaths,
    input_root: Option<&Path>,
) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = paths.output_root.as_ref() {
        return path.clone();
    }
    match input_root {
        Some(root) => root.parent().unwrap_or(root).join("..").join("out"),
        None => PathBuf::from("out"),
    }
}

pub fn build_conditions(input: &InputArgs, args: &ConditionArgs) -> ConditionSet {
    let mut from = args.from;
    let mut to = args.to;
    if let Some(date) = input.date {
        from = from.or_else(|| Some(start_of_day(date)));
        to = to.or_else(|| Some(end_of_day(date)));
    }

    ConditionSet {
        ic: input.ic.clone(),
        lot: input.lot.clone(),
        equipment_code: args.equipment_code.clone(),
        code_filter: args.code_filter.clone(),
        severity_min: args.severity_min,
        from,
        to,
        cluster_radius: args.cluster_radius,
        cluster_time_window: window_from_secs(args.cluster_window_secs),
        alarm_window: window_from_secs(args.alarm_window_secs),
        alarm_threshold: args.alarm_threshold,
    }
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59).unwrap_or_else(|| start_of_day(date))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use chrono::NaiveDate;

    use super::{build_conditions, resolve_output_root};
    use crate::cli::{ConditionArgs, InputArgs};
    use crate::conditions::{
        DEFAULT_ALARM_THRESHOLD, DEFAULT_ALARM_WINDOW_SECS, DEFAULT_CLUSTER_RADIUS,
        DEFAULT_CLUSTER_WINDOW_SECS,
    };
    use crate::settings::ResolvedPaths;

    fn condition_args() -> ConditionArgs {
        ConditionArgs {
            equipment_code: None,
            code_filter: Some("Kizu".to_string()),
            severity_min: Some(2),
            from: None,
            to: None,
            cluster_radius: DEFAULT_CLUSTER_RADIUS,
            cluster_window_secs: DEFAULT_CLUSTER_WINDOW_SECS,
            alarm_window_secs: DEFAULT_ALARM_WINDOW_SECS,
            alarm_threshold: DEFAULT_ALARM_THRESHOLD,
        }
    }

    #[test]
    fn date_expands_to_whole_day_bounds() {
        let input = InputArgs {
            ic: Some("NG1ISL001".to_string()),
            date: NaiveDate::from_ymd_opt(2024, 8, 12),
            ..InputArgs::default()
        };

        let conditions = build_conditions(&input, &condition_args());
        assert_eq!(
            conditions.from.map(|ts| ts.to_string()).as_deref(),
            Some("2024-08-12 00:00:00")
        );
        assert_eq!(
            conditions.to.map(|ts| ts.to_string()).as_deref(),
            Some("2024-08-12 23:59:59")
        );
        assert_eq!(conditions.ic.as_deref(), Some("NG1ISL001"));
        assert_eq!(conditions.severity_min, Some(2));
        assert_eq!(conditions.cluster_time_window.num_seconds(), 60);
        assert!(conditions.validate().is_ok());
    }

    #[test]
    fn oversized_window_flags_become_field_errors() {
        let args = ConditionArgs {
            alarm_window_secs: i64::MAX / 10,
            cluster_window_secs: i64::MAX,
            ..condition_args()
        };

        let errors = build_conditions(&InputArgs::default(), &args)
            .validate()
            .expect_err("oversized windows must be rejected");
        assert!(errors.errors.contains_key("alarm_window"));
        assert!(errors.errors.contains_key("cluster_time_window"));
    }

    #[test]
    fn output_root_prefers_flag_then_settings_then_input_tree() {
        let settings = ResolvedPaths {
            output_root: Some(PathBuf::from("/data/out")),
            ..ResolvedPaths::default()
        };

        assert_eq!(
            resolve_output_root(Some(Path::new("/tmp/x")), &settings, None),
            PathBuf::from("/tmp/x")
        );
        assert_eq!(
            resolve_output_root(None, &settings, Some(Path::new("/data/in"))),
            PathBuf::from("/data/out")
        );
        assert_eq!(
            resolve_output_root(None, &ResolvedPaths::default(), Some(Path::new("/data/in"))),
            PathBuf::from("/data/../out")
        );
        assert_eq!(
            resolve_output_root(None, &ResolvedPaths::default(), None),
            PathBuf::from("out")
        );
    }
}
