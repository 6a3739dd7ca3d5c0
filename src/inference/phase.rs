//! Journey-phase state machine: which leg of its day's work a vehicle is
//! on, and the guards that move it between legs.

use serde::{Deserialize, Serialize};

use crate::config::InferenceConfig;
use crate::inference::scoring::BlockStateObservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JourneyPhase {
    /// Waiting out the layover before the block's first trip.
    LayoverBefore,
    /// Actively serving a trip.
    InProgress,
    /// At a scheduled layover between trips of the block.
    LayoverDuring,
    /// Off the known route for a sustained stretch.
    Deadhead,
    /// No candidate hypotheses, or none scored yet.
    Unknown,
}

impl JourneyPhase {
    pub fn label(&self) -> &'static str {
        match self {
            JourneyPhase::LayoverBefore => "layover-before",
            JourneyPhase::InProgress => "in-progress",
            JourneyPhase::LayoverDuring => "layover-during",
            JourneyPhase::Deadhead => "deadhead",
            JourneyPhase::Unknown => "unknown",
        }
    }
}

/// Advances the phase for one particle given its freshly scored hypothesis.
///
/// A sustained run of off-route observations forces `Deadhead`; a single
/// unsnapped observation holds the prior phase. A snapped observation
/// reclassifies from scratch, which is also how `Deadhead` and `Unknown`
/// recover without an external reset.
pub fn transition(
    prior: JourneyPhase,
    hypothesis: &BlockStateObservation,
    off_route_count: u32,
    cfg: &InferenceConfig,
) -> JourneyPhase {
    if off_route_count >= cfg.deadhead_after_off_route {
        return JourneyPhase::Deadhead;
    }

    if !hypothesis.is_snapped() {
        return prior;
    }

    if hypothesis.is_at_potential_layover_spot() {
        let layover = classify_layover(hypothesis, cfg);
        let was_laying_over = matches!(
            prior,
            JourneyPhase::LayoverBefore | JourneyPhase::LayoverDuring
        );
        if was_laying_over && departure_indicated(hypothesis, cfg) {
            return JourneyPhase::InProgress;
        }
        return layover;
    }

    JourneyPhase::InProgress
}

/// A layover within the window of the first trip's start is the
/// pre-service layover; any other boundary is a mid-block layover.
fn classify_layover(hypothesis: &BlockStateObservation, cfg: &InferenceConfig) -> JourneyPhase {
    let state = hypothesis.block_state();
    let first_start = state
        .block
        .block
        .trips
        .first()
        .map(|t| t.start_dist)
        .unwrap_or(0.0);

    if state.distance_along_block <= first_start + cfg.layover_window_m {
        JourneyPhase::LayoverBefore
    } else {
        JourneyPhase::LayoverDuring
    }
}

/// Departure from a layover: the clock has reached the next trip's
/// scheduled start minus the grace window, or the vehicle has moved
/// materially away from the layover point.
fn departure_indicated(hypothesis: &BlockStateObservation, cfg: &InferenceConfig) -> bool {
    let state = hypothesis.block_state();
    let block = &state.block.block;
    let dab = state.distance_along_block;

    if block.distance_to_trip_boundary(dab) > cfg.layover_departure_distance_m {
        return true;
    }

    let next_start = block
        .trips
        .iter()
        .find(|t| t.start_dist + cfg.layover_window_m >= dab)
        .map(|t| block.scheduled_departure_at(t.start_dist));

    match next_start {
        Some(start_secs) => {
            let elapsed_secs = (hypothesis.observation().time.timestamp_millis()
                - state.block.service_date_epoch_ms()) as f64
                / 1000.0;
            elapsed_secs >= start_secs - cfg.layover_departure_grace_secs as f64
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::ShapePoint;
    use crate::inference::candidates::BlockState;
    use crate::observation::Observation;
    use crate::schedule::{BlockEntry, BlockInstance, TimePoint, TripSpan};
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::Arc;

    fn block() -> Arc<BlockInstance> {
        Arc::new(BlockInstance {
            service_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            block: Arc::new(BlockEntry {
                block_id: "B1".to_string(),
                run_id: None,
                dsc: None,
                trips: vec![
                    TripSpan {
                        trip_id: "T1".to_string(),
                        start_dist: 0.0,
                        end_dist: 5000.0,
                    },
                    TripSpan {
                        trip_id: "T2".to_string(),
                        start_dist: 5000.0,
                        end_dist: 10_000.0,
                    },
                ],
                shape: vec![
                    ShapePoint {
                        lat: 40.70,
                        lon: -74.00,
                        shape_dist: 0.0,
                    },
                    ShapePoint {
                        lat: 40.79,
                        lon: -74.00,
                        shape_dist: 10_000.0,
                    },
                ],
                // First trip 08:00-08:40, second 09:00-09:40
                timetable: vec![
                    TimePoint {
                        dist: 0.0,
                        secs: 28_800.0,
                    },
                    TimePoint {
                        dist: 5000.0,
                        secs: 31_200.0,
                    },
                    TimePoint {
                        dist: 5000.0,
                        secs: 32_400.0,
                    },
                    TimePoint {
                        dist: 10_000.0,
                        secs: 34_800.0,
                    },
                ],
            }),
        })
    }

    fn hypothesis(dist: f64, hour: u32, min: u32, is_snapped: bool) -> BlockStateObservation {
        let cfg = InferenceConfig::default();
        let state = Arc::new(BlockState::at_distance(block(), dist).unwrap());
        let obs = Arc::new(Observation {
            vehicle_id: "V1".to_string(),
            time: Utc.with_ymd_and_hms(2024, 3, 4, hour, min, 0).unwrap(),
            lat: 40.70,
            lon: -74.0,
            op_assigned_run_id: None,
            best_fuzzy_run_ids: None,
            fuzzy_match_distance: None,
            assigned_block_id: None,
            dsc: None,
        });
        BlockStateObservation::new(state, obs, is_snapped, cfg.layover_window_m)
    }

    #[test]
    fn test_mid_trip_is_in_progress() {
        let cfg = InferenceConfig::default();
        let h = hypothesis(2500.0, 8, 20, true);
        assert_eq!(
            transition(JourneyPhase::Unknown, &h, 0, &cfg),
            JourneyPhase::InProgress
        );
    }

    #[test]
    fn test_in_progress_enters_layover_at_boundary() {
        let cfg = InferenceConfig::default();
        let h = hypothesis(5000.0, 8, 40, true);
        assert_eq!(
            transition(JourneyPhase::InProgress, &h, 0, &cfg),
            JourneyPhase::LayoverDuring
        );
    }

    #[test]
    fn test_layover_before_at_block_start() {
        let cfg = InferenceConfig::default();
        let h = hypothesis(0.0, 7, 40, true);
        assert_eq!(
            transition(JourneyPhase::Unknown, &h, 0, &cfg),
            JourneyPhase::LayoverBefore
        );
    }

    #[test]
    fn test_layover_departs_when_next_trip_is_due() {
        let cfg = InferenceConfig::default();
        // Next trip starts 09:00; grace is 120 s, so 08:59 departs
        let early = hypothesis(5000.0, 8, 45, true);
        assert_eq!(
            transition(JourneyPhase::LayoverDuring, &early, 0, &cfg),
            JourneyPhase::LayoverDuring
        );

        let due = hypothesis(5000.0, 8, 59, true);
        assert_eq!(
            transition(JourneyPhase::LayoverDuring, &due, 0, &cfg),
            JourneyPhase::InProgress
        );
    }

    #[test]
    fn test_layover_before_departs_at_scheduled_start() {
        let cfg = InferenceConfig::default();
        let waiting = hypothesis(0.0, 7, 40, true);
        assert_eq!(
            transition(JourneyPhase::LayoverBefore, &waiting, 0, &cfg),
            JourneyPhase::LayoverBefore
        );

        let due = hypothesis(0.0, 7, 59, true);
        assert_eq!(
            transition(JourneyPhase::LayoverBefore, &due, 0, &cfg),
            JourneyPhase::InProgress
        );
    }

    #[test]
    fn test_single_unsnapped_observation_holds_phase() {
        let cfg = InferenceConfig::default();
        let h = hypothesis(2500.0, 8, 20, false);
        assert_eq!(
            transition(JourneyPhase::InProgress, &h, 1, &cfg),
            JourneyPhase::InProgress
        );
    }

    #[test]
    fn test_sustained_off_route_goes_deadhead() {
        let cfg = InferenceConfig::default();
        let h = hypothesis(2500.0, 8, 20, false);
        assert_eq!(
            transition(JourneyPhase::InProgress, &h, cfg.deadhead_after_off_route, &cfg),
            JourneyPhase::Deadhead
        );
    }

    #[test]
    fn test_deadhead_recovers_when_snapped_again() {
        let cfg = InferenceConfig::default();
        let h = hypothesis(2500.0, 8, 20, true);
        assert_eq!(
            transition(JourneyPhase::Deadhead, &h, 0, &cfg),
            JourneyPhase::InProgress
        );
    }
}
