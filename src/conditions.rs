use std::collections::BTreeMap;

use chrono::{NaiveDateTime, TimeDelta};
use thiserror::Error;

use crate::model::{ConditionSnapshot, InspectionRecord};
use crate::util::format_timestamp;

pub const DEFAULT_CLUSTER_RADIUS: f64 = 3.0;
pub const DEFAULT_CLUSTER_WINDOW_SECS: i64 = 60;
pub const DEFAULT_ALARM_WINDOW_SECS: i64 = 300;
pub const DEFAULT_ALARM_THRESHOLD: i64 = 10;

/// Upper bound for both windows; keeps window arithmetic inside the calendar range.
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// Query and run parameters for one analysis.
#[derive(Debug, Clone)]
pub struct ConditionSet {
    pub ic: Option<String>,
    pub lot: Option<String>,
    pub equipment_code: Option<String>,
    pub code_filter: Option<String>,
    pub severity_min: Option<u32>,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
    pub cluster_radius: f64,
    pub cluster_time_window: TimeDelta,
    pub alarm_window: TimeDelta,
    pub alarm_threshold: i64,
}

impl Default for ConditionSet {
    fn default() -> Self {
        Self {
            ic: None,
            lot: None,
            equipment_code: None,
            code_filter: None,
            severity_min: None,
            from: None,
            to: None,
            cluster_radius: DEFAULT_CLUSTER_RADIUS,
            cluster_time_window: TimeDelta::seconds(DEFAULT_CLUSTER_WINDOW_SECS),
            alarm_window: TimeDelta::seconds(DEFAULT_ALARM_WINDOW_SECS),
            alarm_threshold: DEFAULT_ALARM_THRESHOLD,
        }
    }
}

/// Field-keyed validation messages for a rejected [`ConditionSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("invalid analysis conditions: {}", render_errors(.errors))]
pub struct ConditionErrors {
    pub errors: BTreeMap<&'static str, Vec<String>>,
}

impl ConditionErrors {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.entry(field).or_default().push(message.into());
    }
}

fn render_errors(errors: &BTreeMap<&'static str, Vec<String>>) -> String {
    errors
        .iter()
        .flat_map(|(field, messages)| {
            messages
                .iter()
                .map(move |message| format!("{field}: {message}"))
        })
        .collect::<Vec<String>>()
        .join("; ")
}

impl ConditionSet {
    pub fn validate(&self) -> Result<(), ConditionErrors> {
        let mut errors = ConditionErrors::default();

        if let (Some(from), Some(to)) = (self.from, self.to)
            && from > to
        {
            errors.add("from", "from must not be later than to");
            errors.add("to", "to must not be earlier than from");
        }
        if !self.cluster_radius.is_finite() || self.cluster_radius <= 0.0 {
            errors.add("cluster_radius", "cluster radius must be a positive number");
        }
        check_window(
            &mut errors,
            "cluster_time_window",
            "cluster time window",
            self.cluster_time_window,
        );
        check_window(&mut errors, "alarm_window", "alarm window", self.alarm_window);
        if self.alarm_threshold < 0 {
            errors.add("alarm_threshold", "alarm threshold must be zero or greater");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Inclusive time bounds, case-insensitive text filters, all ANDed.
    pub fn matches(&self, record: &InspectionRecord) -> bool {
        if let Some(from) = self.from
            && record.timestamp < from
        {
            return false;
        }
        if let Some(to) = self.to
            && record.timestamp > to
        {
            return false;
        }
        if let Some(ic) = active_filter(&self.ic)
            && !record.equipment_code.eq_ignore_ascii_case(ic)
        {
            return false;
        }
        if let Some(lot) = active_filter(&self.lot)
            && !record.lot_no.eq_ignore_ascii_case(lot)
        {
            return false;
        }
        if let Some(equipment_code) = active_filter(&self.equipment_code)
            && !record.equipment_code.eq_ignore_ascii_case(equipment_code)
        {
            return false;
        }
        if let Some(severity_min) = self.severity_min
            && record.severity < severity_min
        {
            return false;
        }
        if let Some(code_filter) = active_filter(&self.code_filter)
            && !contains_ignore_case(&record.code_raw, code_filter)
        {
            return false;
        }
        true
    }

    pub fn ic_filter(&self) -> Option<&str> {
        active_filter(&self.ic)
    }

    pub fn lot_filter(&self) -> Option<&str> {
        active_filter(&self.lot)
    }

    /// `yyyyMMdd-yyyyMMdd` when either bound is set; a missing side mirrors the other.
    pub fn range_label(&self) -> Option<String> {
        let from = self.from.or(self.to)?;
        let to = self.to.or(self.from)?;
        Some(format!(
            "{}-{}",
            from.format("%Y%m%d"),
            to.format("%Y%m%d")
        ))
    }

    pub fn snapshot(&self) -> ConditionSnapshot {
        ConditionSnapshot {
            ic: self.ic.clone(),
            lot: self.lot.clone(),
            equipment_code: self.equipment_code.clone(),
            code_filter: self.code_filter.clone(),
            severity_min: self.severity_min,
            from: self.from.map(format_timestamp),
            to: self.to.map(format_timestamp),
            cluster_radius: self.cluster_radius,
            cluster_time_window_secs: self.cluster_time_window.num_seconds(),
            alarm_window_secs: self.alarm_window.num_seconds(),
            alarm_threshold: self.alarm_threshold,
        }
    }
}

fn check_window(
    errors: &mut ConditionErrors,
    field: &'static str,
    label: &str,
    window: TimeDelta,
) {
    if window <= TimeDelta::zero() {
        errors.add(field, format!("{label} must be a positive duration"));
    } else if window > TimeDelta::days(MAX_WINDOW_DAYS) {
        errors.add(field, format!("{label} must not exceed {MAX_WINDOW_DAYS} days"));
    }
}

/// Whole seconds as a duration; values beyond the representable range saturate
/// so that validation reports them instead of panicking.
pub fn window_from_secs(secs: i64) -> TimeDelta {
    TimeDelta::try_seconds(secs).unwrap_or(if secs < 0 {
        TimeDelta::MIN
    } else {
        TimeDelta::MAX
    })
}

fn active_filter(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

    use super::{ConditionSet, MAX_WINDOW_DAYS, window_from_secs};
    use crate::model::{Face, InspectionRecord};

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|date| date.and_hms_opt(hour, minute, second))
            .expect("valid test timestamp")
    }

    fn record() -> InspectionRecord {
        InspectionRecord {
            lot_no: "24081234".to_string(),
            timestamp: at(1, 12, 30, 0),
            equipment_code: "NG1ISL001".to_string(),
            ledger_no: "LD01".to_string(),
            face: Face::Front,
            x: 10.0,
            y: 10.0,
            severity: 5,
            code_raw: "01_Kizu".to_string(),
            metrics: BTreeMap::new(),
        }
    }

    #[test]
    fn validate_rejects_inverted_range_on_both_fields() {
        let conditions = ConditionSet {
            from: Some(at(2, 0, 0, 0)),
            to: Some(at(1, 0, 0, 0)),
            ..ConditionSet::default()
        };

        let errors = conditions.validate().expect_err("inverted range must fail");
        assert_eq!(errors.errors.get("from").map(Vec::len), Some(1));
        assert_eq!(errors.errors.get("to").map(Vec::len), Some(1));
        assert!(!errors.errors.contains_key("cluster_radius"));
    }

    #[test]
    fn validate_rejects_non_positive_parameters() {
        let conditions = ConditionSet {
            cluster_radius: 0.0,
            cluster_time_window: TimeDelta::zero(),
            alarm_window: TimeDelta::seconds(-5),
            alarm_threshold: -1,
            ..ConditionSet::default()
        };

        let errors = conditions.validate().expect_err("bad parameters must fail");
        for field in [
            "cluster_radius",
            "cluster_time_window",
            "alarm_window",
            "alarm_threshold",
        ] {
            assert!(errors.errors.contains_key(field), "missing error for {field}");
        }
        assert!(errors.to_string().contains("cluster_radius"));
    }

    #[test]
    fn validate_rejects_windows_beyond_calendar_range() {
        let conditions = ConditionSet {
            cluster_time_window: TimeDelta::seconds(1_000_000_000_000_000),
            alarm_window: TimeDelta::seconds(1_000_000_000_000_000),
            ..ConditionSet::default()
        };

        let errors = conditions.validate().expect_err("huge windows must fail");
        assert!(errors.errors.contains_key("cluster_time_window"));
        assert!(errors.errors.contains_key("alarm_window"));

        let at_limit = ConditionSet {
            alarm_window: TimeDelta::days(MAX_WINDOW_DAYS),
            ..ConditionSet::default()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn window_from_secs_saturates_out_of_range_values() {
        assert_eq!(window_from_secs(60), TimeDelta::seconds(60));
        assert_eq!(window_from_secs(i64::MAX / 10), TimeDelta::MAX);
        assert_eq!(window_from_secs(i64::MIN / 10), TimeDelta::MIN);

        let conditions = ConditionSet {
            alarm_window: window_from_secs(i64::MAX / 10),
            cluster_time_window: window_from_secs(i64::MIN / 10),
            ..ConditionSet::default()
        };
        let errors = conditions.validate().expect_err("saturated windows must fail");
        assert!(errors.errors.contains_key("alarm_window"));
        assert!(errors.errors.contains_key("cluster_time_window"));
    }

    #[test]
    fn validate_accepts_defaults_and_equal_bounds() {
        assert!(ConditionSet::default().validate().is_ok());

        let same = ConditionSet {
            from: Some(at(1, 0, 0, 0)),
            to: Some(at(1, 0, 0, 0)),
            alarm_threshold: 0,
            ..ConditionSet::default()
        };
        assert!(same.validate().is_ok());
    }

    #[test]
    fn matches_uses_inclusive_time_bounds() {
        let exact = ConditionSet {
            from: Some(at(1, 12, 30, 0)),
            to: Some(at(1, 12, 30, 0)),
            ..ConditionSet::default()
        };
        assert!(exact.matches(&record()));

        let later = ConditionSet {
            from: Some(at(1, 12, 30, 1)),
            ..ConditionSet::default()
        };
        assert!(!later.matches(&record()));

        let earlier = ConditionSet {
            to: Some(at(1, 12, 29, 59)),
            ..ConditionSet::default()
        };
        assert!(!earlier.matches(&record()));
    }

    #[test]
    fn matches_compares_text_filters_case_insensitively() {
        let conditions = ConditionSet {
            ic: Some("ng1isl001".to_string()),
            lot: Some("24081234".to_string()),
            equipment_code: Some("NG1ISL001".to_string()),
            code_filter: Some("kizu".to_string()),
            ..ConditionSet::default()
        };
        assert!(conditions.matches(&record()));

        let wrong_lot = ConditionSet {
            lot: Some("99999999".to_string()),
            ..ConditionSet::default()
        };
        assert!(!wrong_lot.matches(&record()));

        let wrong_secondary = ConditionSet {
            equipment_code: Some("NG2".to_string()),
            ..ConditionSet::default()
        };
        assert!(!wrong_secondary.matches(&record()));

        let wrong_code = ConditionSet {
            code_filter: Some("Ibutsu".to_string()),
            ..ConditionSet::default()
        };
        assert!(!wrong_code.matches(&record()));
    }

    #[test]
    fn matches_treats_blank_filters_as_unconstrained() {
        let conditions = ConditionSet {
            ic: Some("   ".to_string()),
            lot: Some(String::new()),
            code_filter: Some(" ".to_string()),
            ..ConditionSet::default()
        };
        assert!(conditions.matches(&record()));
    }

    #[test]
    fn matches_applies_severity_floor() {
        let at_floor = ConditionSet {
            severity_min: Some(5),
            ..ConditionSet::default()
        };
        assert!(at_floor.matches(&record()));

        let above = ConditionSet {
            severity_min: Some(6),
            ..ConditionSet::default()
        };
        assert!(!above.matches(&record()));
    }

    #[test]
    fn range_label_mirrors_missing_bound() {
        let only_from = ConditionSet {
            from: Some(at(3, 8, 0, 0)),
            ..ConditionSet::default()
        };
        assert_eq!(only_from.range_label().as_deref(), Some("20240103-20240103"));

        let both = ConditionSet {
            from: Some(at(1, 0, 0, 0)),
            to: Some(at(5, 23, 59, 59)),
            ..ConditionSet::default()
        };
        assert_eq!(both.range_label().as_deref(), Some("20240101-20240105"));
        assert_eq!(ConditionSet::default().range_label(), None);
    }
}
