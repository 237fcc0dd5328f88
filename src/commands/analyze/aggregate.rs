use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use crate::model::{Face, InspectionRecord};

#[derive(Debug, Clone, PartialEq)]
pub(super) struct AggregateRow {
    pub(super) face: Face,
    pub(super) code: String,
    pub(super) count: u64,
    pub(super) ratio_in_face: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct AlarmRow {
    pub(super) window_start: NaiveDateTime,
    pub(super) window_end: NaiveDateTime,
    pub(super) count: u64,
    pub(super) threshold: i64,
    pub(super) alarm: bool,
}

#[derive(Debug, Default)]
struct CodeTally {
    label: String,
    count: u64,
}

#[derive(Debug, Default)]
struct FaceTally {
    total: u64,
    codes: HashMap<String, CodeTally>,
}

/// Single-pass counters for the aggregate and alarm-rate tables.
#[derive(Debug)]
pub(super) struct WindowedAggregator {
    window: TimeDelta,
    window_ms: i64,
    threshold: i64,
    total: u64,
    faces: BTreeMap<Face, FaceTally>,
    windows: BTreeMap<i64, u64>,
}

impl WindowedAggregator {
    pub(super) fn new(window: TimeDelta, threshold: i64) -> Self {
        Self {
            window,
            window_ms: window.num_milliseconds().max(1),
            threshold,
            total: 0,
            faces: BTreeMap::new(),
            windows: BTreeMap::new(),
        }
    }

    pub(super) fn add(&mut self, record: &InspectionRecord) {
        self.total += 1;

        let face = self.faces.entry(record.face).or_default();
        face.total += 1;
        let tally = face
            .codes
            .entry(record.code_raw.to_lowercase())
            .or_insert_with(|| CodeTally {
                label: record.code_raw.clone(),
                count: 0,
            });
        tally.count += 1;

        let start = window_start_ticks(record.timestamp, self.window_ms);
        *self.windows.entry(start).or_insert(0) += 1;
    }

    pub(super) fn total(&self) -> u64 {
        self.total
    }

    /// Faces in declaration order, codes by descending count then by label.
    pub(super) fn aggregate_rows(&self) -> Vec<AggregateRow> {
        let mut rows = Vec::new();

        for (face, tally) in &self.faces {
            let mut codes = tally.codes.values().collect::<Vec<&CodeTally>>();
            codes.sort_by(|left, right| {
                right
                    .count
                    .cmp(&left.count)
                    .then_with(|| left.label.cmp(&right.label))
            });

            for code in codes {
                let ratio_in_face = if tally.total == 0 {
                    0.0
                } else {
                    code.count as f64 / tally.total as f64
                };
                rows.push(AggregateRow {
                    face: *face,
                    code: code.label.clone(),
                    count: code.count,
                    ratio_in_face,
                });
            }
        }

        rows
    }

    pub(super) fn face_totals(&self) -> Vec<(Face, u64)> {
        self.faces
            .iter()
            .map(|(face, tally)| (*face, tally.total))
            .collect()
    }

    pub(super) fn alarm_rows(&self) -> Vec<AlarmRow> {
        self.windows
            .iter()
            .map(|(start, count)| {
                let window_start = ticks_to_timestamp(*start);
                AlarmRow {
                    window_start,
                    window_end: window_start
                        .checked_add_signed(self.window)
                        .unwrap_or(NaiveDateTime::MAX),
                    count: *count,
                    threshold: self.threshold,
                    alarm: is_alarm(*count, self.threshold),
                }
            })
            .collect()
    }
}

/// Inclusive: a window alarms once its count reaches the threshold.
pub(super) fn is_alarm(count: u64, threshold: i64) -> bool {
    i128::from(count) >= i128::from(threshold)
}

fn tick_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Milliseconds since 0001-01-01T00:00:00, floored to a multiple of `window_ms`.
pub(super) fn window_start_ticks(ts: NaiveDateTime, window_ms: i64) -> i64 {
    let ticks = (ts - tick_epoch()).num_milliseconds();
    ticks.div_euclid(window_ms) * window_ms
}

fn ticks_to_timestamp(ticks: i64) -> NaiveDateTime {
    tick_epoch()
        .checked_add_signed(TimeDelta::milliseconds(ticks))
        .unwrap_or(NaiveDateTime::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

    use super::{WindowedAggregator, is_alarm, window_start_ticks};
    use crate::model::{Face, InspectionRecord};

    fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_opt(hour, minute, second))
            .expect("valid test timestamp")
    }

    fn record(face: Face, code: &str, timestamp: NaiveDateTime) -> InspectionRecord {
        InspectionRecord {
            lot_no: "24081234".to_string(),
            timestamp,
            equipment_code: "NG1ISL001".to_string(),
            ledger_no: "LD01".to_string(),
            face,
            x: 0.0,
            y: 0.0,
            severity: 1,
            code_raw: code.to_string(),
            metrics: BTreeMap::new(),
        }
    }

    #[test]
    fn alarm_is_inclusive_at_threshold() {
        assert!(is_alarm(2, 2));
        assert!(!is_alarm(1, 2));
        assert!(is_alarm(0, 0));
        assert!(is_alarm(5, 2));
    }

    #[test]
    fn two_records_in_one_window_reach_threshold_two() {
        let mut aggregator = WindowedAggregator::new(TimeDelta::seconds(60), 2);
        aggregator.add(&record(Face::Front, "01_Kizu", at(12, 30, 1)));
        aggregator.add(&record(Face::Front, "02_Ibutsu", at(12, 30, 30)));

        let rows = aggregator.alarm_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 2);
        assert!(rows[0].alarm);
        assert_eq!(rows[0].window_start, at(12, 30, 0));
        assert_eq!(rows[0].window_end, at(12, 31, 0));
    }

    #[test]
    fn window_one_below_threshold_does_not_alarm() {
        let mut aggregator = WindowedAggregator::new(TimeDelta::seconds(60), 3);
        aggregator.add(&record(Face::Front, "01_Kizu", at(12, 30, 1)));
        aggregator.add(&record(Face::Front, "01_Kizu", at(12, 30, 2)));

        let rows = aggregator.alarm_rows();
        assert_eq!(rows[0].count, 2);
        assert!(!rows[0].alarm);
    }

    #[test]
    fn windows_are_emitted_in_ascending_order() {
        let mut aggregator = WindowedAggregator::new(TimeDelta::seconds(300), 1);
        aggregator.add(&record(Face::Front, "a", at(13, 0, 0)));
        aggregator.add(&record(Face::Front, "a", at(12, 0, 0)));
        aggregator.add(&record(Face::Front, "a", at(12, 4, 59)));

        let starts = aggregator
            .alarm_rows()
            .iter()
            .map(|row| (row.window_start, row.count))
            .collect::<Vec<(NaiveDateTime, u64)>>();
        assert_eq!(starts, vec![(at(12, 0, 0), 2), (at(13, 0, 0), 1)]);
    }

    #[test]
    fn window_start_floors_relative_to_common_era_epoch() {
        let minute = window_start_ticks(at(12, 30, 59), 60_000);
        assert_eq!(minute, window_start_ticks(at(12, 30, 0), 60_000));
        assert_eq!(minute % 60_000, 0);
        assert_ne!(minute, window_start_ticks(at(12, 31, 0), 60_000));
    }

    #[test]
    fn face_code_counts_sum_to_face_totals_and_ratios_sum_to_one() {
        let mut aggregator = WindowedAggregator::new(TimeDelta::seconds(60), 1);
        for code in ["01_Kizu", "01_Kizu", "02_Ibutsu", "03_Yogore"] {
            aggregator.add(&record(Face::Front, code, at(12, 0, 0)));
        }
        for code in ["02_Ibutsu", "02_Ibutsu", "01_Kizu"] {
            aggregator.add(&record(Face::Back, code, at(12, 0, 0)));
        }
        assert_eq!(aggregator.total(), 7);

        let rows = aggregator.aggregate_rows();
        for (face, total) in aggregator.face_totals() {
            let face_rows = rows.iter().filter(|row| row.face == face);
            let count_sum = face_rows.clone().map(|row| row.count).sum::<u64>();
            let ratio_sum = face_rows.map(|row| row.ratio_in_face).sum::<f64>();
            assert_eq!(count_sum, total);
            assert!((ratio_sum - 1.0).abs() < 1e-9, "ratios for {face:?} sum to {ratio_sum}");
        }
    }

    #[test]
    fn aggregate_rows_group_by_face_and_sort_by_descending_count() {
        let mut aggregator = WindowedAggregator::new(TimeDelta::seconds(60), 1);
        aggregator.add(&record(Face::Back, "02_Ibutsu", at(12, 0, 0)));
        aggregator.add(&record(Face::Front, "03_Yogore", at(12, 0, 0)));
        aggregator.add(&record(Face::Front, "01_Kizu", at(12, 0, 1)));
        aggregator.add(&record(Face::Front, "01_kizu", at(12, 0, 2)));

        let rows = aggregator
            .aggregate_rows()
            .into_iter()
            .map(|row| (row.face, row.code, row.count))
            .collect::<Vec<(Face, String, u64)>>();
        assert_eq!(
            rows,
            vec![
                (Face::Front, "01_Kizu".to_string(), 2),
                (Face::Front, "03_Yogore".to_string(), 1),
                (Face::Back, "02_Ibutsu".to_string(), 1),
            ]
        );
    }

    #[test]
    fn empty_aggregator_has_no_rows() {
        let aggregator = WindowedAggregator::new(TimeDelta::seconds(60), 1);
        assert!(aggregator.aggregate_rows().is_empty());
        assert!(aggregator.alarm_rows().is_empty());
    }

    #[test]
    fn window_end_saturates_at_the_calendar_limit() {
        let window = TimeDelta::days(36_500);
        let mut aggregator = WindowedAggregator::new(window, 1);
        aggregator.add(&record(
            Face::Front,
            "01_Kizu",
            NaiveDateTime::MAX - TimeDelta::days(1),
        ));

        let rows = aggregator.alarm_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].window_end, NaiveDateTime::MAX);
        assert!(rows[0].window_start <= NaiveDateTime::MAX - TimeDelta::days(1));
        assert!(rows[0].alarm);
    }
}
