//! Violation correlator.
//!
//! Each tick reads the latest result snapshot and decides whether it shows a
//! violation worth one event:
//!
//! 1. Detections below the decision threshold are ignored. The rest split into
//!    anchors (plate, vehicle) and riders (helmet, no-helmet).
//! 2. Every anchor gets an ROI grown mostly upward (riders sit above the plate)
//!    and clamped to the frame. A rider belongs to the first anchor, in
//!    detection order, whose ROI contains the rider's center. Claimed riders are
//!    not offered to later anchors.
//! 3. The first anchor with candidates (overload, no-helmet) produces the event
//!    and ends the tick.
//! 4. Otherwise the first unclaimed no-helmet rider produces a fallback event
//!    with a crop guessed around the rider.
//!
//! A single process-wide cooldown gates all events. It is owned by the
//! correlator thread and never shared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::config::{CorrelatorSettings, FallbackCrop, RoiFactors, SharedSettings};
use crate::detect::{BoundingBox, Detection, ObjectClass};
use crate::pipeline::result_cell::SharedResultCell;
use crate::pipeline::stats::PipelineStats;
use crate::violation::{
    EventOrigin, FineSchedule, ViolationCandidate, ViolationEvent, ViolationType,
};

/// Hands events to finalization. Must not block the correlator.
pub trait EventDispatcher: Send {
    fn dispatch(&self, event: ViolationEvent);
}

impl<F> EventDispatcher for F
where
    F: Fn(ViolationEvent) + Send,
{
    fn dispatch(&self, event: ViolationEvent) {
        self(event)
    }
}

/// Timestamp of the last dispatched event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CooldownState {
    last_trigger: Option<Instant>,
}

impl CooldownState {
    pub fn last_trigger(&self) -> Option<Instant> {
        self.last_trigger
    }

    pub fn is_active(&self, now: Instant, window: Duration) -> bool {
        match self.last_trigger {
            Some(last) => now.saturating_duration_since(last) < window,
            None => false,
        }
    }

    fn trigger(&mut self, now: Instant) {
        self.last_trigger = Some(now);
    }
}

/// One anchor and the riders it claimed in this pass.
#[derive(Clone, Debug)]
pub struct AssociationGroup<'a> {
    pub anchor: &'a Detection,
    pub roi: BoundingBox,
    pub riders: Vec<&'a Detection>,
}

/// Result of associating riders to anchors.
#[derive(Clone, Debug)]
pub struct Association<'a> {
    pub groups: Vec<AssociationGroup<'a>>,
    /// Riders no anchor claimed, in detection order.
    pub unassociated: Vec<&'a Detection>,
}

pub fn anchor_roi(
    anchor: &BoundingBox,
    factors: &RoiFactors,
    frame_width: f32,
    frame_height: f32,
) -> BoundingBox {
    anchor
        .expand(factors.up, factors.down, factors.sides)
        .clamp_to(frame_width, frame_height)
}

pub fn fallback_region(
    rider: &BoundingBox,
    crop: &FallbackCrop,
    frame_width: f32,
    frame_height: f32,
) -> BoundingBox {
    rider
        .expand(0.0, crop.down, crop.sides)
        .clamp_to(frame_width, frame_height)
}

/// First-match-wins association of riders to anchors.
pub fn associate<'a>(
    anchors: &[&'a Detection],
    riders: &[&'a Detection],
    factors: &RoiFactors,
    frame_width: f32,
    frame_height: f32,
) -> Association<'a> {
    let mut claimed = vec![false; riders.len()];
    let mut groups = Vec::with_capacity(anchors.len());

    for anchor in anchors {
        let roi = anchor_roi(&anchor.bbox, factors, frame_width, frame_height);
        let mut members = Vec::new();
        for (rider, taken) in riders.iter().zip(claimed.iter_mut()) {
            if *taken {
                continue;
            }
            let (cx, cy) = rider.bbox.center();
            if roi.contains_point(cx, cy) {
                *taken = true;
                members.push(*rider);
            }
        }
        groups.push(AssociationGroup {
            anchor,
            roi,
            riders: members,
        });
    }

    let unassociated = riders
        .iter()
        .zip(claimed.iter())
        .filter(|(_, taken)| !**taken)
        .map(|(rider, _)| *rider)
        .collect();

    Association {
        groups,
        unassociated,
    }
}

/// Candidates for one group: overload first, then no-helmet.
pub fn classify_group(
    group: &AssociationGroup<'_>,
    occupancy_limit: usize,
    fines: &FineSchedule,
) -> Vec<ViolationCandidate> {
    let mut candidates = Vec::new();

    if group.riders.len() > occupancy_limit {
        candidates.push(ViolationCandidate {
            violation_type: ViolationType::Overload,
            fine: fines.fine_for(ViolationType::Overload),
            confidence: group.anchor.confidence,
        });
    }

    let no_helmet = group
        .riders
        .iter()
        .filter(|r| r.class == ObjectClass::NoHelmet)
        .map(|r| r.confidence)
        .fold(None, |best: Option<f32>, c| Some(best.map_or(c, |b| b.max(c))));
    if let Some(confidence) = no_helmet {
        candidates.push(ViolationCandidate {
            violation_type: ViolationType::NoHelmet,
            fine: fines.fine_for(ViolationType::NoHelmet),
            confidence,
        });
    }

    candidates
}

/// What one correlation pass decided, before cropping.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub region: BoundingBox,
    pub candidates: Vec<ViolationCandidate>,
    pub origin: EventOrigin,
}

/// Full correlation pass over already-thresholded detections.
pub fn correlate<'a, I>(
    detections: I,
    frame_width: f32,
    frame_height: f32,
    occupancy_limit: usize,
    params: &CorrelatorSettings,
) -> Option<Decision>
where
    I: IntoIterator<Item = &'a Detection>,
{
    let mut anchors = Vec::new();
    let mut riders = Vec::new();
    for detection in detections {
        if detection.class.is_anchor() {
            anchors.push(detection);
        } else if detection.class.is_rider() {
            riders.push(detection);
        }
    }

    let association = associate(&anchors, &riders, &params.roi, frame_width, frame_height);
    for group in &association.groups {
        let candidates = classify_group(group, occupancy_limit, &params.fines);
        if !candidates.is_empty() {
            return Some(Decision {
                region: group.roi,
                candidates,
                origin: EventOrigin::Anchor,
            });
        }
    }

    association
        .unassociated
        .iter()
        .find(|r| r.class == ObjectClass::NoHelmet)
        .map(|rider| Decision {
            region: fallback_region(&rider.bbox, &params.fallback_crop, frame_width, frame_height),
            candidates: vec![ViolationCandidate {
                violation_type: ViolationType::NoHelmet,
                fine: params.fines.fine_for(ViolationType::NoHelmet),
                confidence: rider.confidence,
            }],
            origin: EventOrigin::Fallback,
        })
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    NoSnapshot,
    CoolingDown,
    NoViolation,
    /// A decision was reached but its region had no pixels to crop.
    EmptyCrop,
    Dispatched {
        origin: EventOrigin,
        candidates: Vec<ViolationCandidate>,
    },
}

pub struct Correlator {
    cell: Arc<SharedResultCell>,
    settings: Arc<SharedSettings>,
    params: CorrelatorSettings,
    dispatcher: Box<dyn EventDispatcher>,
    stats: Arc<PipelineStats>,
    cooldown: CooldownState,
}

impl Correlator {
    pub fn new(
        cell: Arc<SharedResultCell>,
        settings: Arc<SharedSettings>,
        params: CorrelatorSettings,
        dispatcher: Box<dyn EventDispatcher>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            cell,
            settings,
            params,
            dispatcher,
            stats,
            cooldown: CooldownState::default(),
        }
    }

    pub fn cooldown(&self) -> CooldownState {
        self.cooldown
    }

    /// One correlation pass at time `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        self.stats.correlator_tick();
        let Some(snapshot) = self.cell.latest() else {
            return TickOutcome::NoSnapshot;
        };
        let settings = self.settings.snapshot();
        if self.cooldown.is_active(now, settings.cooldown) {
            return TickOutcome::CoolingDown;
        }

        let frame = &snapshot.frame;
        let confident = snapshot
            .sets
            .iter()
            .flat_map(|set| set.confident(settings.decision_threshold));
        let Some(decision) = correlate(
            confident,
            frame.width() as f32,
            frame.height() as f32,
            settings.occupancy_limit,
            &self.params,
        ) else {
            return TickOutcome::NoViolation;
        };

        let Some(crop) = frame.crop(&decision.region) else {
            log::warn!(
                "correlator: empty crop region {:?} on frame {}",
                decision.region,
                frame.seq
            );
            return TickOutcome::EmptyCrop;
        };

        log::info!(
            "correlator: {:?} event on frame {} with {} candidate(s)",
            decision.origin,
            frame.seq,
            decision.candidates.len()
        );
        self.dispatcher.dispatch(ViolationEvent {
            crop,
            region: decision.region,
            candidates: decision.candidates.clone(),
            origin: decision.origin,
            frame_seq: frame.seq,
            created_at: SystemTime::now(),
        });
        self.stats.event_dispatched();
        self.cooldown.trigger(now);

        TickOutcome::Dispatched {
            origin: decision.origin,
            candidates: decision.candidates,
        }
    }

    /// Tick every poll interval until `stop` is raised.
    pub fn run(mut self, stop: &AtomicBool) {
        log::info!(
            "correlator: started (poll {:?})",
            self.params.poll_interval
        );
        while !stop.load(Ordering::SeqCst) {
            self.tick(Instant::now());
            std::thread::sleep(self.params.poll_interval);
        }
        log::info!("correlator: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: ObjectClass, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(class, confidence, BoundingBox::new(x1, y1, x2, y2))
    }

    #[test]
    fn roi_is_clamped_to_frame() {
        let plate = BoundingBox::new(10.0, 50.0, 30.0, 60.0);
        let roi = anchor_roi(&plate, &RoiFactors::default(), 100.0, 62.0);
        assert_eq!(roi, BoundingBox::new(0.0, 0.0, 50.0, 62.0));
    }

    #[test]
    fn fallback_region_keeps_top_edge() {
        let rider = BoundingBox::new(100.0, 100.0, 120.0, 140.0);
        let region = fallback_region(&rider, &FallbackCrop::default(), 1000.0, 1000.0);
        assert_eq!(region, BoundingBox::new(76.0, 100.0, 144.0, 260.0));
    }

    #[test]
    fn rider_center_on_roi_edge_is_associated() {
        // Plate 100..140 x 200..220 -> ROI 60..180 x 100..230.
        let plate = det(ObjectClass::Plate, 0.9, 100.0, 200.0, 140.0, 220.0);
        let on_edge = det(ObjectClass::Helmet, 0.9, 170.0, 90.0, 190.0, 110.0);
        let outside = det(ObjectClass::Helmet, 0.9, 181.0, 90.0, 201.0, 110.0);
        let assoc = associate(
            &[&plate],
            &[&on_edge, &outside],
            &RoiFactors::default(),
            640.0,
            480.0,
        );
        assert_eq!(assoc.groups[0].riders.len(), 1);
        assert_eq!(assoc.unassociated.len(), 1);
        assert_eq!(assoc.unassociated[0].bbox.x1, 181.0);
    }

    #[test]
    fn helmeted_riders_only_yield_overload() {
        let plate = det(ObjectClass::Plate, 0.8, 100.0, 200.0, 140.0, 220.0);
        let riders: Vec<Detection> = (0..3)
            .map(|i| det(ObjectClass::Helmet, 0.9, 100.0 + i as f32, 150.0, 120.0, 170.0))
            .collect();
        let group = AssociationGroup {
            anchor: &plate,
            roi: BoundingBox::new(0.0, 0.0, 640.0, 480.0),
            riders: riders.iter().collect(),
        };
        let candidates = classify_group(&group, 2, &FineSchedule::default());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].violation_type, ViolationType::Overload);
        assert_eq!(candidates[0].fine, 600);
        assert_eq!(candidates[0].confidence, 0.8);
    }

    #[test]
    fn later_anchor_can_win_when_first_has_no_candidates() {
        let params = CorrelatorSettings::default();
        let quiet_plate = det(ObjectClass::Plate, 0.9, 10.0, 400.0, 50.0, 420.0);
        let helmet = det(ObjectClass::Helmet, 0.9, 20.0, 350.0, 40.0, 380.0);
        let busy_plate = det(ObjectClass::Vehicle, 0.7, 400.0, 400.0, 440.0, 420.0);
        let bare = det(ObjectClass::NoHelmet, 0.75, 410.0, 350.0, 430.0, 380.0);
        let dets = [quiet_plate, helmet, busy_plate, bare];
        let decision = correlate(dets.iter(), 640.0, 480.0, 2, &params).expect("decision");
        assert_eq!(decision.origin, EventOrigin::Anchor);
        assert_eq!(decision.candidates.len(), 1);
        assert_eq!(decision.candidates[0].confidence, 0.75);
        assert_eq!(decision.region.x1, 360.0);
    }

    #[test]
    fn cooldown_window_is_exclusive_at_its_end() {
        let mut cooldown = CooldownState::default();
        let t0 = Instant::now();
        let window = Duration::from_secs(3);
        assert!(!cooldown.is_active(t0, window));
        cooldown.trigger(t0);
        assert!(cooldown.is_active(t0 + Duration::from_millis(2999), window));
        assert!(!cooldown.is_active(t0 + window, window));
    }
}
