use std::collections::HashMap;

use chrono::{NaiveDateTime, TimeDelta};

pub(super) type Cell = (i64, i64);

#[derive(Debug, Clone)]
struct ClusterAnchor {
    id: u64,
    x: f64,
    y: f64,
    last_seen: NaiveDateTime,
}

/// Greedy single-pass clusterer over a sliding time window.
///
/// Anchors live in an arena; the grid holds arena slot indices keyed by the
/// cell an anchor was created in. A matched anchor follows its newest member
/// but keeps its original bucket.
#[derive(Debug)]
pub(super) struct OnlineClusterer {
    radius: f64,
    radius_sq: f64,
    window: TimeDelta,
    anchors: Vec<Option<ClusterAnchor>>,
    free_slots: Vec<usize>,
    grid: HashMap<Cell, Vec<usize>>,
    next_id: u64,
}

impl OnlineClusterer {
    pub(super) fn new(radius: f64, window: TimeDelta) -> Self {
        Self {
            radius,
            radius_sq: radius * radius,
            window,
            anchors: Vec::new(),
            free_slots: Vec::new(),
            grid: HashMap::new(),
            next_id: 1,
        }
    }

    pub(super) fn cell_of(&self, x: f64, y: f64) -> Cell {
        ((x / self.radius).floor() as i64, (y / self.radius).floor() as i64)
    }

    pub(super) fn assign(&mut self, x: f64, y: f64, ts: NaiveDateTime) -> u64 {
        let cell = self.cell_of(x, y);

        if let Some(slot) = self.find_live_match(cell, x, y, ts)
            && let Some(anchor) = self.anchors[slot].as_mut()
        {
            anchor.x = x;
            anchor.y = y;
            anchor.last_seen = ts;
            return anchor.id;
        }

        let id = self.next_id;
        self.next_id += 1;
        let anchor = ClusterAnchor {
            id,
            x,
            y,
            last_seen: ts,
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.anchors[slot] = Some(anchor);
                slot
            }
            None => {
                self.anchors.push(Some(anchor));
                self.anchors.len() - 1
            }
        };
        self.grid.entry(cell).or_default().push(slot);
        id
    }

    /// Scans the 3x3 block around `cell`, evicting expired anchors on the way.
    fn find_live_match(
        &mut self,
        cell: Cell,
        x: f64,
        y: f64,
        ts: NaiveDateTime,
    ) -> Option<usize> {
        for dx in -1..=1 {
            for dy in -1..=1 {
                let key = (cell.0 + dx, cell.1 + dy);
                let Some(bucket) = self.grid.get_mut(&key) else {
                    continue;
                };

                let mut found = None;
                let mut index = bucket.len();
                while index > 0 {
                    index -= 1;
                    let slot = bucket[index];
                    let Some(anchor) = self.anchors[slot].as_ref() else {
                        bucket.remove(index);
                        continue;
                    };

                    if is_expired(anchor.last_seen, ts, self.window) {
                        bucket.remove(index);
                        self.anchors[slot] = None;
                        self.free_slots.push(slot);
                        continue;
                    }

                    let ddx = anchor.x - x;
                    let ddy = anchor.y - y;
                    if ddx * ddx + ddy * ddy <= self.radius_sq {
                        found = Some(slot);
                        break;
                    }
                }

                if bucket.is_empty() {
                    self.grid.remove(&key);
                }
                if found.is_some() {
                    return found;
                }
            }
        }
        None
    }

    /// Drops every anchor whose age at `now` exceeds the window.
    pub(super) fn prune(&mut self, now: NaiveDateTime) -> usize {
        let window = self.window;
        let anchors = &mut self.anchors;
        let free_slots = &mut self.free_slots;
        let mut removed = 0usize;

        self.grid.retain(|_, bucket| {
            bucket.retain(|&slot| {
                let expired = anchors[slot]
                    .as_ref()
                    .map(|anchor| is_expired(anchor.last_seen, now, window))
                    .unwrap_or(true);
                if expired && anchors[slot].take().is_some() {
                    free_slots.push(slot);
                    removed += 1;
                }
                !expired
            });
            !bucket.is_empty()
        });

        removed
    }

    pub(super) fn live_anchor_count(&self) -> usize {
        self.grid.values().map(Vec::len).sum()
    }

    pub(super) fn clusters_created(&self) -> u64 {
        self.next_id - 1
    }
}

pub(super) fn is_expired(
    last_seen: NaiveDateTime,
    now: NaiveDateTime,
    window: TimeDelta,
) -> bool {
    now - last_seen > window
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

    use super::{OnlineClusterer, is_expired};

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_opt(12, 30, 0))
            .expect("valid test timestamp")
    }

    fn secs(offset: i64) -> NaiveDateTime {
        base() + TimeDelta::seconds(offset)
    }

    fn clusterer() -> OnlineClusterer {
        OnlineClusterer::new(3.0, TimeDelta::seconds(60))
    }

    #[test]
    fn nearby_records_share_first_cluster_and_far_record_opens_second() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.assign(10.0, 10.0, secs(0)), 1);
        assert_eq!(clusterer.assign(11.0, 11.0, secs(1)), 1);
        assert_eq!(clusterer.assign(100.0, 100.0, secs(70)), 2);
    }

    #[test]
    fn distance_exactly_at_radius_matches() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.assign(0.0, 0.0, secs(0)), 1);
        assert_eq!(clusterer.assign(3.0, 0.0, secs(1)), 1);
        assert_eq!(clusterer.assign(6.5, 0.0, secs(2)), 2);
    }

    #[test]
    fn match_spans_neighbouring_cells() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.cell_of(2.9, 2.9), (0, 0));
        assert_eq!(clusterer.cell_of(3.1, 3.1), (1, 1));
        assert_eq!(clusterer.assign(2.9, 2.9, secs(0)), 1);
        assert_eq!(clusterer.assign(3.1, 3.1, secs(1)), 1);
    }

    #[test]
    fn negative_coordinates_floor_into_negative_cells() {
        let clusterer = clusterer();

        assert_eq!(clusterer.cell_of(-0.5, -3.0), (-1, -1));
        assert_eq!(clusterer.cell_of(-3.5, 0.0), (-2, 0));
    }

    #[test]
    fn expired_anchor_is_never_reused_without_prune() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.assign(10.0, 10.0, secs(0)), 1);
        assert_eq!(clusterer.assign(10.0, 10.0, secs(61)), 2);
        assert_eq!(clusterer.live_anchor_count(), 1);
    }

    #[test]
    fn age_equal_to_window_still_matches() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.assign(10.0, 10.0, secs(0)), 1);
        assert_eq!(clusterer.assign(10.5, 10.5, secs(60)), 1);
    }

    #[test]
    fn members_refresh_anchor_time_so_chain_stays_alive() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.assign(10.0, 10.0, secs(0)), 1);
        assert_eq!(clusterer.assign(10.0, 10.0, secs(50)), 1);
        assert_eq!(clusterer.assign(10.0, 10.0, secs(100)), 1);
    }

    #[test]
    fn anchor_follows_latest_member_position() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.assign(0.0, 0.0, secs(0)), 1);
        assert_eq!(clusterer.assign(2.5, 0.0, secs(1)), 1);
        // 5.0 is beyond the radius from the original point but within it from the drifted anchor.
        assert_eq!(clusterer.assign(5.0, 0.0, secs(2)), 1);
        // The first member's position no longer represents the cluster.
        assert_eq!(clusterer.assign(-2.9, 0.0, secs(3)), 2);
    }

    #[test]
    fn drifted_anchor_stays_in_its_original_bucket() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.assign(1.0, 1.0, secs(0)), 1);
        assert_eq!(clusterer.assign(3.5, 1.0, secs(1)), 1);
        // The anchor now sits at x=3.5 but is still filed under cell (0, 0),
        // which a record in cell (2, 0) does not search.
        assert_eq!(clusterer.assign(6.0, 1.0, secs(2)), 2);
    }

    #[test]
    fn ids_are_sequential_without_gaps() {
        let mut clusterer = clusterer();

        let ids = (0..5_i32)
            .map(|index| clusterer.assign(f64::from(index) * 100.0, 0.0, secs(i64::from(index))))
            .collect::<Vec<u64>>();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(clusterer.clusters_created(), 5);
    }

    #[test]
    fn prune_cadence_does_not_change_assignments() {
        let points = [
            (10.0, 10.0, 0),
            (11.0, 11.0, 1),
            (40.0, 40.0, 5),
            (41.0, 40.0, 30),
            (10.5, 10.5, 90),
            (40.5, 40.0, 95),
            (100.0, 100.0, 200),
            (100.0, 101.0, 230),
        ];

        let run = |prune_every: Option<usize>| {
            let mut clusterer = clusterer();
            let mut ids = Vec::new();
            for (index, (x, y, offset)) in points.iter().enumerate() {
                ids.push(clusterer.assign(*x, *y, secs(*offset)));
                if let Some(every) = prune_every
                    && (index + 1) % every == 0
                {
                    clusterer.prune(secs(*offset));
                }
            }
            ids
        };

        let without_prune = run(None);
        assert_eq!(without_prune, vec![1, 1, 2, 2, 3, 4, 5, 5]);
        assert_eq!(run(Some(1)), without_prune);
        assert_eq!(run(Some(3)), without_prune);
    }

    #[test]
    fn prune_removes_only_expired_anchors_and_reuses_slots() {
        let mut clusterer = clusterer();

        clusterer.assign(0.0, 0.0, secs(0));
        clusterer.assign(50.0, 50.0, secs(30));
        clusterer.assign(100.0, 100.0, secs(70));

        assert_eq!(clusterer.prune(secs(70)), 1);
        assert_eq!(clusterer.live_anchor_count(), 2);
        assert_eq!(clusterer.prune(secs(70)), 0);

        let slots_before = clusterer.anchors.len();
        assert_eq!(clusterer.assign(200.0, 200.0, secs(71)), 4);
        assert_eq!(clusterer.anchors.len(), slots_before);
    }

    #[test]
    fn pruned_anchor_does_not_merge_with_later_record() {
        let mut clusterer = clusterer();

        assert_eq!(clusterer.assign(10.0, 10.0, secs(0)), 1);
        clusterer.prune(secs(70));
        assert_eq!(clusterer.live_anchor_count(), 0);
        assert_eq!(clusterer.assign(10.0, 10.0, secs(70)), 2);
    }

    #[test]
    fn expiry_is_strictly_greater_than_window() {
        let window = TimeDelta::seconds(60);
        assert!(!is_expired(secs(0), secs(60), window));
        assert!(is_expired(secs(0), secs(61), window));
        assert!(!is_expired(secs(10), secs(0), window));
    }
}
