//! Per-event finalization: plate lookup, persistence, notification.
//!
//! Every step may end the event early. Nothing is retried.

use std::sync::Arc;
use std::time::Instant;

use crate::frame::encode_jpeg;
use crate::lpr::PlateRecognizer;
use crate::pipeline::correlator::EventDispatcher;
use crate::pipeline::stats::PipelineStats;
use crate::storage::ViolationStore;
use crate::transport::NotificationBus;
use crate::violation::{NewViolation, PersistedRecord, ViolationEvent};

#[derive(Clone, Debug, PartialEq)]
pub enum FinalizeOutcome {
    /// The crop could not be encoded.
    EncodeFailed,
    /// Recognition answered "no plate" or "no owner".
    NoPlate,
    RecognitionFailed,
    /// No candidate produced a new record.
    NothingPersisted,
    Persisted(Vec<PersistedRecord>),
}

pub struct Finalizer {
    recognizer: Arc<dyn PlateRecognizer>,
    store: Arc<dyn ViolationStore>,
    bus: Arc<dyn NotificationBus>,
    violation_address: String,
    jpeg_quality: u8,
    stats: Arc<PipelineStats>,
}

impl Finalizer {
    pub fn new(
        recognizer: Arc<dyn PlateRecognizer>,
        store: Arc<dyn ViolationStore>,
        bus: Arc<dyn NotificationBus>,
        violation_address: impl Into<String>,
        jpeg_quality: u8,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            recognizer,
            store,
            bus,
            violation_address: violation_address.into(),
            jpeg_quality,
            stats,
        }
    }

    pub fn finalize(&self, event: ViolationEvent) -> FinalizeOutcome {
        let started = Instant::now();
        let outcome = self.run_steps(&event, started);
        if !matches!(outcome, FinalizeOutcome::Persisted(_)) {
            self.stats.event_abandoned();
        }
        log::info!(
            "finalizer: frame {} done in {:.3}s ({})",
            event.frame_seq,
            started.elapsed().as_secs_f64(),
            match &outcome {
                FinalizeOutcome::EncodeFailed => "encode failed".to_string(),
                FinalizeOutcome::NoPlate => "no plate".to_string(),
                FinalizeOutcome::RecognitionFailed => "recognition failed".to_string(),
                FinalizeOutcome::NothingPersisted => "nothing persisted".to_string(),
                FinalizeOutcome::Persisted(records) => format!("{} record(s)", records.len()),
            }
        );
        outcome
    }

    fn run_steps(&self, event: &ViolationEvent, started: Instant) -> FinalizeOutcome {
        let crop_jpeg = match encode_jpeg(&event.crop, self.jpeg_quality) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("finalizer: frame {}: {:#}", event.frame_seq, e);
                return FinalizeOutcome::EncodeFailed;
            }
        };

        let owner = match self.recognizer.recognize(&crop_jpeg) {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                log::info!(
                    "finalizer: frame {}: no plate ({} lookup {:.3}s)",
                    event.frame_seq,
                    self.recognizer.name(),
                    started.elapsed().as_secs_f64()
                );
                return FinalizeOutcome::NoPlate;
            }
            Err(e) => {
                log::error!(
                    "finalizer: frame {}: plate recognition failed after {:.3}s: {:#}",
                    event.frame_seq,
                    started.elapsed().as_secs_f64(),
                    e
                );
                return FinalizeOutcome::RecognitionFailed;
            }
        };
        log::info!(
            "finalizer: frame {}: plate {} ({:.3}s)",
            event.frame_seq,
            owner.license_plate_number,
            started.elapsed().as_secs_f64()
        );

        let persist_started = Instant::now();
        let mut records = Vec::with_capacity(event.candidates.len());
        for candidate in &event.candidates {
            let violation = NewViolation {
                owner: &owner,
                violation_type: candidate.violation_type,
                violation_address: &self.violation_address,
                fine: candidate.fine,
                confidence: candidate.confidence,
                crop_jpeg: &crop_jpeg,
                detected_at: event.created_at,
            };
            match self.store.insert(&violation) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => log::info!(
                    "finalizer: frame {}: {} already recorded",
                    event.frame_seq,
                    candidate.violation_type
                ),
                Err(e) => log::error!(
                    "finalizer: frame {}: persisting {} failed: {:#}",
                    event.frame_seq,
                    candidate.violation_type,
                    e
                ),
            }
        }
        log::debug!(
            "finalizer: frame {}: persistence took {:.3}s",
            event.frame_seq,
            persist_started.elapsed().as_secs_f64()
        );
        if records.is_empty() {
            return FinalizeOutcome::NothingPersisted;
        }
        self.stats.event_persisted(records.len() as u64);

        for record in &records {
            if let Err(e) = self.bus.publish(record) {
                log::warn!("finalizer: publishing record {} failed: {:#}", record.id, e);
            }
        }
        FinalizeOutcome::Persisted(records)
    }
}

/// Runs each event's finalization on its own detached thread.
///
/// Threads are not tracked; an event still in flight at shutdown may be lost.
pub struct ThreadDispatcher {
    finalizer: Arc<Finalizer>,
}

impl ThreadDispatcher {
    pub fn new(finalizer: Arc<Finalizer>) -> Self {
        Self { finalizer }
    }
}

impl EventDispatcher for ThreadDispatcher {
    fn dispatch(&self, event: ViolationEvent) {
        let finalizer = Arc::clone(&self.finalizer);
        let name = format!("finalizer-{}", event.frame_seq);
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            finalizer.finalize(event);
        });
        if let Err(e) = spawned {
            log::error!("finalizer: could not spawn thread: {}", e);
            self.finalizer.stats.event_abandoned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::lpr::StaticPlateRecognizer;
    use crate::storage::InMemoryViolationStore;
    use crate::transport::BroadcastBus;
    use crate::violation::{
        EventOrigin, OwnerRecord, ViolationCandidate, ViolationType,
    };
    use image::RgbImage;
    use std::time::SystemTime;

    fn event(candidates: Vec<ViolationCandidate>) -> ViolationEvent {
        ViolationEvent {
            crop: RgbImage::from_pixel(16, 16, image::Rgb([200, 10, 10])),
            region: BoundingBox::new(0.0, 0.0, 16.0, 16.0),
            candidates,
            origin: EventOrigin::Anchor,
            frame_seq: 42,
            created_at: SystemTime::now(),
        }
    }

    fn no_helmet() -> ViolationCandidate {
        ViolationCandidate {
            violation_type: ViolationType::NoHelmet,
            fine: 800,
            confidence: 0.8,
        }
    }

    fn overload() -> ViolationCandidate {
        ViolationCandidate {
            violation_type: ViolationType::Overload,
            fine: 600,
            confidence: 0.9,
        }
    }

    struct Harness {
        store: Arc<InMemoryViolationStore>,
        bus: Arc<BroadcastBus>,
        stats: Arc<PipelineStats>,
        finalizer: Finalizer,
    }

    fn harness(recognizer: StaticPlateRecognizer) -> Harness {
        let store = Arc::new(InMemoryViolationStore::new());
        let bus = Arc::new(BroadcastBus::new());
        let stats = Arc::new(PipelineStats::default());
        let finalizer = Finalizer::new(
            Arc::new(recognizer),
            store.clone(),
            bus.clone(),
            "Gate 3",
            65,
            stats.clone(),
        );
        Harness {
            store,
            bus,
            stats,
            finalizer,
        }
    }

    #[test]
    fn persists_and_publishes_every_candidate() -> anyhow::Result<()> {
        let h = harness(StaticPlateRecognizer::found(OwnerRecord {
            license_plate_number: "ABC1234".to_string(),
            ..OwnerRecord::default()
        }));
        let rx = h.bus.subscribe()?;

        let outcome = h.finalizer.finalize(event(vec![overload(), no_helmet()]));
        let FinalizeOutcome::Persisted(records) = outcome else {
            panic!("expected persisted, got {:?}", outcome);
        };
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].violation_type, ViolationType::Overload);
        assert_eq!(records[1].violation_address, "Gate 3");
        assert_eq!(h.store.len(), 2);
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(h.stats.snapshot().events_persisted, 2);
        Ok(())
    }

    #[test]
    fn no_plate_abandons_without_touching_store() {
        let h = harness(StaticPlateRecognizer::not_found());
        assert_eq!(
            h.finalizer.finalize(event(vec![no_helmet()])),
            FinalizeOutcome::NoPlate
        );
        assert!(h.store.is_empty());
        assert_eq!(h.stats.snapshot().events_abandoned, 1);
    }

    #[test]
    fn recognition_error_abandons() {
        let h = harness(StaticPlateRecognizer::failing("service down"));
        assert_eq!(
            h.finalizer.finalize(event(vec![no_helmet()])),
            FinalizeOutcome::RecognitionFailed
        );
        assert!(h.store.is_empty());
    }

    #[test]
    fn duplicate_evidence_persists_nothing() {
        let h = harness(StaticPlateRecognizer::found(OwnerRecord {
            license_plate_number: "XYZ987".to_string(),
            ..OwnerRecord::default()
        }));
        let first = event(vec![no_helmet()]);
        let again = first.clone();
        assert!(matches!(
            h.finalizer.finalize(first),
            FinalizeOutcome::Persisted(_)
        ));
        assert_eq!(
            h.finalizer.finalize(again),
            FinalizeOutcome::NothingPersisted
        );
        assert_eq!(h.store.len(), 1);
    }
}
