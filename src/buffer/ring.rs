//! Bounded, ordered collection of completed segments.
//!
//! The ring only tracks metadata and decides which files are safe to delete.
//! Deletion itself is done by the caller through `SegmentStore`, so the ring
//! stays free of I/O and can be driven directly in tests.
//!
//! Files referenced by a live snapshot are pinned: evicting such a segment
//! defers its deletion until every snapshot holding it is released.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use super::errors::BufferError;
use super::types::Segment;

/// Result of admitting one segment.
#[derive(Debug, Default, PartialEq)]
pub struct AdmitOutcome {
    /// Member dropped to keep the ring within capacity.
    pub evicted: Option<Segment>,
    /// Files no longer referenced by anything and safe to delete now.
    pub reclaim: Vec<PathBuf>,
}

/// Immutable, chronologically ordered copy of the ring taken for an export.
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    pub id: u64,
    pub segments: Vec<Segment>,
}

impl RingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn indices(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.index).collect()
    }
}

#[derive(Debug)]
pub struct SegmentRing {
    capacity: usize,
    members: VecDeque<Segment>,
    pins: HashMap<u64, Vec<PathBuf>>,
    deferred: Vec<PathBuf>,
    next_snapshot_id: u64,
}

impl SegmentRing {
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidConfig(
                "segment ring capacity must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            members: VecDeque::with_capacity(capacity + 1),
            pins: HashMap::new(),
            deferred: Vec::new(),
            next_snapshot_id: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in admission order (oldest first).
    pub fn members(&self) -> impl Iterator<Item = &Segment> {
        self.members.iter()
    }

    /// Nominal span of time currently covered by retained segments.
    pub fn retained_duration(&self) -> Duration {
        self.members.iter().map(|s| s.duration_nominal).sum()
    }

    pub fn active_snapshots(&self) -> usize {
        self.pins.len()
    }

    /// Appends a completed segment, evicting the oldest member when over
    /// capacity. Re-admitting an index already present replaces that entry.
    pub fn admit(&mut self, segment: Segment) -> AdmitOutcome {
        let mut outcome = AdmitOutcome::default();

        if let Some(pos) = self.members.iter().position(|m| m.index == segment.index) {
            if let Some(replaced) = self.members.remove(pos) {
                if replaced.path != segment.path {
                    self.retire(replaced.path, &mut outcome.reclaim);
                }
            }
        }

        self.members.push_back(segment);

        if self.members.len() > self.capacity {
            if let Some(oldest) = self.members.pop_front() {
                self.retire(oldest.path.clone(), &mut outcome.reclaim);
                outcome.evicted = Some(oldest);
            }
        }

        outcome
    }

    fn retire(&mut self, path: PathBuf, reclaim: &mut Vec<PathBuf>) {
        // cyclic filename reuse: a newer member may already own this file
        if self.members.iter().any(|m| m.path == path) {
            return;
        }
        if self.is_pinned(&path) {
            if !self.deferred.contains(&path) {
                self.deferred.push(path);
            }
            return;
        }
        reclaim.push(path);
    }

    fn is_pinned(&self, path: &PathBuf) -> bool {
        self.pins.values().any(|paths| paths.contains(path))
    }

    /// Takes a pinned, chronologically ordered copy of the current members.
    /// Order is by `(generation, index)`: indices never wrap within a
    /// generation, so they follow completion order even if the wall clock
    /// steps backwards.
    pub fn snapshot(&mut self) -> RingSnapshot {
        let mut segments: Vec<Segment> = self.members.iter().cloned().collect();
        segments.sort_by_key(|s| (s.generation, s.index));

        let id = self.next_snapshot_id;
        self.next_snapshot_id += 1;
        self.pins
            .insert(id, segments.iter().map(|s| s.path.clone()).collect());

        RingSnapshot { id, segments }
    }

    /// Unpins a snapshot. Returns deferred files that are now safe to delete.
    pub fn release(&mut self, snapshot_id: u64) -> Vec<PathBuf> {
        if self.pins.remove(&snapshot_id).is_none() {
            return Vec::new();
        }

        let deferred = std::mem::take(&mut self.deferred);
        let mut reclaim = Vec::new();
        for path in deferred {
            if self.is_pinned(&path) {
                self.deferred.push(path);
            } else if !self.members.iter().any(|m| m.path == path) {
                reclaim.push(path);
            }
        }
        reclaim
    }

    /// Forgets all members. Backing files are removed by `SegmentStore::clear`.
    pub fn clear(&mut self) {
        self.members.clear();
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn segment(index: u64) -> Segment {
        Segment::new(
            index,
            0,
            PathBuf::from(format!("/scratch/segment_0_{:06}.mp4", index)),
            Duration::from_secs(2),
        )
    }

    fn cyclic_segment(index: u64, capacity: u64) -> Segment {
        Segment::new(
            index,
            0,
            PathBuf::from(format!("/scratch/slot_{}.mp4", index % capacity)),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_zero_capacity_fails_fast() {
        assert!(matches!(
            SegmentRing::new(0),
            Err(BufferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_retains_min_of_completions_and_capacity() {
        for capacity in 1..6usize {
            for completions in 0..12u64 {
                let mut ring = SegmentRing::new(capacity).unwrap();
                for i in 0..completions {
                    ring.admit(segment(i));
                }

                let expected = completions.min(capacity as u64);
                assert_eq!(ring.len() as u64, expected);

                let first_kept = completions - expected;
                let kept: Vec<u64> = ring.members().map(|s| s.index).collect();
                assert_eq!(kept, (first_kept..completions).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_seven_completions_into_capacity_five() {
        let mut ring = SegmentRing::new(5).unwrap();
        let mut evicted = Vec::new();
        for i in 0..7 {
            let outcome = ring.admit(segment(i));
            if let Some(old) = outcome.evicted {
                assert_eq!(outcome.reclaim, vec![old.path.clone()]);
                evicted.push(old.index);
            }
        }

        assert_eq!(evicted, vec![0, 1]);
        assert_eq!(ring.snapshot().indices(), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_cyclic_reuse_evicts_metadata_without_deleting_live_file() {
        let capacity = 4u64;
        let mut ring = SegmentRing::new(capacity as usize).unwrap();
        for i in 0..capacity {
            ring.admit(cyclic_segment(i, capacity));
        }

        let outcome = ring.admit(cyclic_segment(capacity, capacity));

        assert_eq!(outcome.evicted.map(|s| s.index), Some(0));
        // slot_0 now belongs to index 4
        assert!(outcome.reclaim.is_empty());
        assert_eq!(ring.len(), capacity as usize);

        let indices: Vec<u64> = ring.members().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_readmitting_same_index_replaces_entry() {
        let mut ring = SegmentRing::new(3).unwrap();
        ring.admit(segment(0));
        ring.admit(segment(1));
        let outcome = ring.admit(segment(1));

        assert!(outcome.evicted.is_none());
        assert!(outcome.reclaim.is_empty());
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_snapshot_orders_by_index_not_admission() {
        let mut ring = SegmentRing::new(5).unwrap();
        ring.admit(segment(1));
        ring.admit(segment(0));

        assert_eq!(ring.snapshot().indices(), vec![0, 1]);
    }

    #[test]
    fn test_snapshot_ignores_backward_clock_step() {
        let mut ring = SegmentRing::new(5).unwrap();
        let now = Utc::now();

        ring.admit(segment(0));
        let mut after_step = segment(1);
        // clock corrected backwards between the two completions
        after_step.created_at = now - ChronoDuration::seconds(30);
        ring.admit(after_step);
        ring.admit(segment(2));

        assert_eq!(ring.snapshot().indices(), vec![0, 1, 2]);
    }

    #[test]
    fn test_snapshot_orders_older_generation_first() {
        let mut ring = SegmentRing::new(5).unwrap();
        let mut newer = segment(0);
        newer.generation = 2;
        let mut older = segment(3);
        older.generation = 1;
        ring.admit(newer);
        ring.admit(older);

        assert_eq!(ring.snapshot().indices(), vec![3, 0]);
    }

    #[test]
    fn test_pinned_eviction_is_deferred_until_release() {
        let mut ring = SegmentRing::new(2).unwrap();
        ring.admit(segment(0));
        ring.admit(segment(1));

        let snapshot = ring.snapshot();
        assert_eq!(ring.active_snapshots(), 1);

        let outcome = ring.admit(segment(2));
        assert_eq!(outcome.evicted.as_ref().map(|s| s.index), Some(0));
        assert!(outcome.reclaim.is_empty());

        let reclaimed = ring.release(snapshot.id);
        assert_eq!(reclaimed, vec![segment(0).path]);
        assert_eq!(ring.active_snapshots(), 0);
    }

    #[test]
    fn test_release_keeps_files_pinned_by_other_snapshots() {
        let mut ring = SegmentRing::new(1).unwrap();
        ring.admit(segment(0));

        let first = ring.snapshot();
        let second = ring.snapshot();
        ring.admit(segment(1));

        assert!(ring.release(first.id).is_empty());
        assert_eq!(ring.release(second.id), vec![segment(0).path]);
    }

    #[test]
    fn test_release_unknown_snapshot_is_noop() {
        let mut ring = SegmentRing::new(1).unwrap();
        assert!(ring.release(99).is_empty());
    }

    #[test]
    fn test_clear_forgets_members() {
        let mut ring = SegmentRing::new(3).unwrap();
        ring.admit(segment(0));
        ring.admit(segment(1));
        ring.clear();

        assert!(ring.is_empty());
        assert!(ring.snapshot().is_empty());
        assert_eq!(ring.retained_duration(), Duration::ZERO);
    }
}
