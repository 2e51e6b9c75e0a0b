use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use crate::overlap::iou;
use crate::Detection;

use super::table::TrackTable;

/// What one frame did to the track table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    pub matched: usize,
    pub created: usize,
    pub expired: usize,
    /// Tracks matched or created in this frame.
    pub occupancy: usize,
}

/// Greedy per-class IoU matcher.
///
/// Not an optimal assignment: the highest-IoU pair is committed first, with
/// ties going to the oldest track. This is O(n*m) per class and deterministic.
#[derive(Clone, Copy, Debug)]
pub struct FrameMatcher {
    iou_threshold: f64,
}

struct Candidate {
    iou: f64,
    track_id: u64,
    det_idx: usize,
}

impl FrameMatcher {
    pub fn new(iou_threshold: f64) -> Self {
        Self { iou_threshold }
    }

    /// Applies one frame of already-validated detections to `table`.
    pub fn apply(
        &self,
        table: &mut TrackTable,
        frame_ts_ms: u64,
        detections: &[&Detection],
    ) -> FrameOutcome {
        let mut by_class: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, det) in detections.iter().enumerate() {
            by_class.entry(det.class.as_str()).or_default().push(idx);
        }

        let mut outcome = FrameOutcome::default();
        let mut seen: HashSet<u64> = HashSet::new();

        for (class, det_indices) in by_class {
            let mut candidates = Vec::new();
            for track in table.live().iter().filter(|t| t.class == class) {
                for &det_idx in &det_indices {
                    let overlap = iou(&track.last_bbox, &detections[det_idx].bbox);
                    if overlap >= self.iou_threshold && overlap > 0.0 {
                        candidates.push(Candidate {
                            iou: overlap,
                            track_id: track.id,
                            det_idx,
                        });
                    }
                }
            }
            candidates.sort_by(|a, b| {
                b.iou
                    .partial_cmp(&a.iou)
                    .unwrap_or(Ordering::Equal)
                    .then(a.track_id.cmp(&b.track_id))
                    .then(a.det_idx.cmp(&b.det_idx))
            });

            let mut used_dets: HashSet<usize> = HashSet::new();
            for cand in candidates {
                if seen.contains(&cand.track_id) || used_dets.contains(&cand.det_idx) {
                    continue;
                }
                table.absorb(cand.track_id, detections[cand.det_idx].bbox, frame_ts_ms);
                seen.insert(cand.track_id);
                used_dets.insert(cand.det_idx);
                outcome.matched += 1;
            }

            for det_idx in det_indices {
                if used_dets.contains(&det_idx) {
                    continue;
                }
                let id = table.create(class, detections[det_idx].bbox, frame_ts_ms);
                seen.insert(id);
                outcome.created += 1;
            }
        }

        outcome.expired = table.age_unseen(&seen);
        outcome.occupancy = outcome.matched + outcome.created;
        log::debug!(
            "frame {}: matched={} created={} expired={} live={}",
            frame_ts_ms,
            outcome.matched,
            outcome.created,
            outcome.expired,
            table.len()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoundingBox, StreamKey};

    fn det(class: &str, x1: f64, y1: f64, x2: f64, y2: f64) -> Detection {
        Detection::new(
            StreamKey::new("live", "lobby", "_defaultVHost_"),
            class,
            BoundingBox::from_corners(x1, y1, x2, y2),
            0.9,
            0,
        )
    }

    fn run(matcher: &FrameMatcher, table: &mut TrackTable, ts: u64, dets: &[Detection]) -> FrameOutcome {
        let refs: Vec<&Detection> = dets.iter().collect();
        matcher.apply(table, ts, &refs)
    }

    #[test]
    fn shifting_object_keeps_one_track() {
        let matcher = FrameMatcher::new(0.3);
        let mut table = TrackTable::new(30);
        for step in 0..10 {
            let x = step as f64 * 0.5;
            let out = run(&matcher, &mut table, step, &[det("person", x, 0.0, x + 10.0, 10.0)]);
            assert_eq!(out.occupancy, 1);
        }
        assert_eq!(table.created_count(), 1);
        assert_eq!(table.live()[0].hits, 10);
    }

    #[test]
    fn non_overlapping_objects_get_new_tracks() {
        let matcher = FrameMatcher::new(0.3);
        let mut table = TrackTable::new(30);
        run(&matcher, &mut table, 0, &[det("person", 0.0, 0.0, 1.0, 1.0)]);
        let out = run(&matcher, &mut table, 1, &[det("person", 5.0, 5.0, 6.0, 6.0)]);
        assert_eq!(out.created, 1);
        assert_eq!(out.matched, 0);
        assert_eq!(table.created_count(), 2);
    }

    #[test]
    fn classes_never_cross_match() {
        let matcher = FrameMatcher::new(0.3);
        let mut table = TrackTable::new(30);
        run(&matcher, &mut table, 0, &[det("person", 0.0, 0.0, 1.0, 1.0)]);
        let out = run(&matcher, &mut table, 1, &[det("dog", 0.0, 0.0, 1.0, 1.0)]);
        assert_eq!(out.created, 1);
        assert_eq!(table.created_count(), 2);
    }

    #[test]
    fn highest_iou_pair_wins() {
        let matcher = FrameMatcher::new(0.3);
        let mut table = TrackTable::new(30);
        run(
            &matcher,
            &mut table,
            0,
            &[det("car", 0.0, 0.0, 10.0, 10.0), det("car", 6.0, 0.0, 16.0, 10.0)],
        );
        // IoU 0.43 with track 1, 0.67 with track 2.
        let out = run(&matcher, &mut table, 1, &[det("car", 4.0, 0.0, 14.0, 10.0)]);
        assert_eq!(out.matched, 1);
        assert_eq!(table.get(2).unwrap().frames_since_seen, 0);
        assert_eq!(table.get(1).unwrap().frames_since_seen, 1);
    }

    #[test]
    fn ties_go_to_oldest_track() {
        let matcher = FrameMatcher::new(0.3);
        let mut table = TrackTable::new(30);
        // Two identical boxes in one frame become two tracks.
        run(
            &matcher,
            &mut table,
            0,
            &[det("person", 0.0, 0.0, 2.0, 2.0), det("person", 0.0, 0.0, 2.0, 2.0)],
        );
        assert_eq!(table.created_count(), 2);
        run(&matcher, &mut table, 1, &[det("person", 0.0, 0.0, 2.0, 2.0)]);
        assert_eq!(table.get(1).unwrap().frames_since_seen, 0);
        assert_eq!(table.get(2).unwrap().frames_since_seen, 1);
    }

    #[test]
    fn unmatched_track_expires_after_limit() {
        let matcher = FrameMatcher::new(0.3);
        let mut table = TrackTable::new(2);
        run(&matcher, &mut table, 0, &[det("person", 0.0, 0.0, 1.0, 1.0)]);
        let far = det("person", 50.0, 50.0, 51.0, 51.0);
        let mut expired = 0;
        for ts in 1..=3 {
            expired += run(&matcher, &mut table, ts, std::slice::from_ref(&far)).expired;
        }
        assert_eq!(expired, 1);
        assert!(table.get(1).is_none());
        assert_eq!(table.created_count(), 2);
    }

    #[test]
    fn below_threshold_overlap_creates_track() {
        let matcher = FrameMatcher::new(0.5);
        let mut table = TrackTable::new(30);
        run(&matcher, &mut table, 0, &[det("person", 0.0, 0.0, 2.0, 1.0)]);
        // IoU = 1/3 < 0.5
        let out = run(&matcher, &mut table, 1, &[det("person", 1.0, 0.0, 3.0, 1.0)]);
        assert_eq!(out.created, 1);
        assert_eq!(out.occupancy, 1);
    }
}
