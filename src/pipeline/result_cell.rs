//! Latest-value mailbox between inference and its two readers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::detect::{Detection, DetectionSet};
use crate::frame::Frame;

/// A frame and the detection sets computed from exactly that frame.
#[derive(Debug)]
pub struct ResultSnapshot {
    pub frame: Frame,
    pub sets: Vec<DetectionSet>,
    /// Cell write counter at the time this snapshot was stored.
    pub generation: u64,
    pub produced_at: Instant,
}

impl ResultSnapshot {
    /// All detections across sets, in set order.
    pub fn detections(&self) -> impl Iterator<Item = &Detection> + '_ {
        self.sets.iter().flat_map(|set| set.detections.iter())
    }
}

#[derive(Default)]
struct CellState {
    latest: Option<Arc<ResultSnapshot>>,
    generation: u64,
}

/// Single writer, many readers. Writes replace the whole snapshot under the
/// lock; reads clone the `Arc` and release immediately.
#[derive(Default)]
pub struct SharedResultCell {
    state: Mutex<CellState>,
}

impl SharedResultCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new snapshot and return its generation.
    pub fn publish(&self, frame: Frame, sets: Vec<DetectionSet>) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        let generation = state.generation;
        state.latest = Some(Arc::new(ResultSnapshot {
            frame,
            sets,
            generation,
            produced_at: Instant::now(),
        }));
        generation
    }

    pub fn latest(&self) -> Option<Arc<ResultSnapshot>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .clone()
    }

    /// Latest snapshot only if it is newer than `seen`.
    pub fn latest_since(&self, seen: u64) -> Option<Arc<ResultSnapshot>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &state.latest {
            Some(snapshot) if snapshot.generation > seen => Some(snapshot.clone()),
            _ => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    pub fn clear(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, ObjectClass};

    fn set_for(seq: u64) -> Vec<DetectionSet> {
        vec![DetectionSet::new(
            "rider-model",
            vec![Detection::new(
                ObjectClass::Helmet,
                0.9,
                BoundingBox::new(seq as f32, 0.0, seq as f32 + 1.0, 1.0),
            )],
        )]
    }

    #[test]
    fn latest_since_skips_seen_generations() {
        let cell = SharedResultCell::new();
        assert!(cell.latest().is_none());
        let g1 = cell.publish(Frame::filled(4, 4, [0, 0, 0], 1), set_for(1));
        assert!(cell.latest_since(0).is_some());
        assert!(cell.latest_since(g1).is_none());
        let g2 = cell.publish(Frame::filled(4, 4, [0, 0, 0], 2), set_for(2));
        assert_eq!(g2, g1 + 1);
        assert_eq!(cell.latest_since(g1).map(|s| s.frame.seq), Some(2));
    }

    #[test]
    fn readers_keep_their_snapshot_after_overwrite_and_clear() {
        let cell = SharedResultCell::new();
        cell.publish(Frame::filled(4, 4, [0, 0, 0], 1), set_for(1));
        let held = cell.latest().expect("snapshot");
        cell.publish(Frame::filled(4, 4, [0, 0, 0], 2), set_for(2));
        cell.clear();
        assert!(cell.latest().is_none());
        assert_eq!(held.frame.seq, 1);
        assert_eq!(held.detections().count(), 1);
    }
}
