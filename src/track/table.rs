use std::collections::HashSet;

use crate::BoundingBox;

/// A hypothesis of one physical object persisting across frames.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: u64,
    pub class: String,
    pub last_bbox: BoundingBox,
    /// Reset on match, incremented once per frame without one.
    pub frames_since_seen: u32,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    /// Detections absorbed, including the one that created the track.
    pub hits: u32,
}

/// Live tracks of one stream's current window.
///
/// Tracks are stored in creation order, so iteration order is ascending id.
#[derive(Debug)]
pub struct TrackTable {
    tracks: Vec<Track>,
    next_id: u64,
    expiry_frames: u32,
}

impl TrackTable {
    pub fn new(expiry_frames: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            expiry_frames,
        }
    }

    /// Starts a new track and returns its id.
    pub fn create(&mut self, class: &str, bbox: BoundingBox, seen_ms: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.push(Track {
            id,
            class: class.to_string(),
            last_bbox: bbox,
            frames_since_seen: 0,
            first_seen_ms: seen_ms,
            last_seen_ms: seen_ms,
            hits: 1,
        });
        id
    }

    /// Folds a matched detection into an existing track.
    ///
    /// Returns false when the id is not live.
    pub fn absorb(&mut self, id: u64, bbox: BoundingBox, seen_ms: u64) -> bool {
        let Some(track) = self.get_mut(id) else {
            return false;
        };
        track.last_bbox = bbox;
        track.frames_since_seen = 0;
        track.last_seen_ms = track.last_seen_ms.max(seen_ms);
        track.hits = track.hits.saturating_add(1);
        true
    }

    /// Ages every live track not in `seen` by one frame and drops the ones
    /// past the expiry limit. Returns the number removed.
    pub fn age_unseen(&mut self, seen: &HashSet<u64>) -> usize {
        let before = self.tracks.len();
        let limit = self.expiry_frames;
        self.tracks.retain_mut(|track| {
            if seen.contains(&track.id) {
                return true;
            }
            track.frames_since_seen = track.frames_since_seen.saturating_add(1);
            track.frames_since_seen <= limit
        });
        before - self.tracks.len()
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// Live tracks in ascending id order.
    pub fn live(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Tracks ever created by this table, expired ones included.
    pub fn created_count(&self) -> u64 {
        self.next_id - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx() -> BoundingBox {
        BoundingBox::from_corners(0.0, 0.0, 1.0, 1.0)
    }

    #[test]
    fn ids_are_monotonic() {
        let mut table = TrackTable::new(3);
        assert_eq!(table.create("person", bx(), 0), 1);
        assert_eq!(table.create("car", bx(), 0), 2);
        assert_eq!(table.created_count(), 2);
        let ids: Vec<u64> = table.live().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn absorb_resets_staleness() {
        let mut table = TrackTable::new(3);
        let id = table.create("person", bx(), 10);
        table.age_unseen(&HashSet::new());
        assert_eq!(table.get(id).unwrap().frames_since_seen, 1);

        let moved = BoundingBox::from_corners(0.1, 0.0, 1.1, 1.0);
        assert!(table.absorb(id, moved, 20));
        let track = table.get(id).unwrap();
        assert_eq!(track.frames_since_seen, 0);
        assert_eq!(track.last_bbox, moved);
        assert_eq!(track.last_seen_ms, 20);
        assert_eq!(track.hits, 2);
        assert!(!table.absorb(99, moved, 20));
    }

    #[test]
    fn expiry_is_strictly_greater_than_limit() {
        let mut table = TrackTable::new(2);
        table.create("person", bx(), 0);
        assert_eq!(table.age_unseen(&HashSet::new()), 0);
        assert_eq!(table.age_unseen(&HashSet::new()), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.age_unseen(&HashSet::new()), 1);
        assert!(table.is_empty());
        assert_eq!(table.created_count(), 1);
    }

    #[test]
    fn seen_tracks_are_not_aged() {
        let mut table = TrackTable::new(0);
        let keep = table.create("person", bx(), 0);
        table.create("person", bx(), 0);
        let seen: HashSet<u64> = [keep].into_iter().collect();
        assert_eq!(table.age_unseen(&seen), 1);
        assert_eq!(table.live()[0].id, keep);
    }
}
