//! Per-vehicle coordinator: owns the particle filter, enforces timestamp
//! ordering, and exposes snapshot views for downstream reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::geo::haversine_distance;
use crate::inference::filter::{Particle, ParticleFilter};
use crate::inference::phase::JourneyPhase;
use crate::observation::Observation;
use crate::schedule::ScheduleIndex;

const MAX_JOURNEY_SUMMARIES: usize = 512;

/// Movement below this is not considered progress for stall detection.
const STALL_DISTANCE_M: f64 = 50.0;

/// The reported inferred state for one vehicle, flattened for output.
#[derive(Debug, Clone, Serialize)]
pub struct BestEstimate {
    pub vehicle_id: String,
    pub last_update: DateTime<Utc>,
    pub block_id: String,
    pub trip_id: String,
    pub distance_along_block: f64,
    pub schedule_deviation_min: f64,
    pub phase: JourneyPhase,
    /// DSC the schedule says this block should display.
    pub inferred_dsc: Option<String>,
    /// DSC the vehicle actually reported.
    pub observed_dsc: Option<String>,
    /// Agreement between the two, when both are present.
    pub dsc_matches: Option<bool>,
    pub lat: f64,
    pub lon: f64,
    pub is_run_formal: bool,
    pub is_off_route: bool,
    pub is_stalled: bool,
}

/// One entry of the per-vehicle phase history, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct JourneySummary {
    pub time: DateTime<Utc>,
    pub phase: JourneyPhase,
    pub block_id: Option<String>,
    pub trip_id: Option<String>,
}

pub struct VehicleInferenceInstance {
    vehicle_id: String,
    filter: ParticleFilter,
    enabled: bool,
    last_obs_time: Option<DateTime<Utc>>,
    last_raw: Option<Arc<Observation>>,
    last_motion: Option<(DateTime<Utc>, f64, f64)>,
    best: Option<BestEstimate>,
    summaries: Vec<JourneySummary>,
    cfg: Arc<InferenceConfig>,
}

impl VehicleInferenceInstance {
    pub fn new(
        vehicle_id: String,
        index: Arc<ScheduleIndex>,
        cfg: Arc<InferenceConfig>,
        seed: u64,
    ) -> Self {
        VehicleInferenceInstance {
            vehicle_id,
            filter: ParticleFilter::new(index, Arc::clone(&cfg), seed),
            enabled: true,
            last_obs_time: None,
            last_raw: None,
            last_motion: None,
            best: None,
            summaries: Vec::new(),
            cfg,
        }
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabled instances keep accepting reports (and keep the stale-check
    /// clock advancing) but produce no new estimate.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn last_observation_time(&self) -> Option<DateTime<Utc>> {
        self.last_obs_time
    }

    /// Clears the particle population and returns to `Unknown`. The
    /// last-processed timestamp survives so replayed history stays stale.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.best = None;
        self.last_raw = None;
        self.last_motion = None;
        self.summaries.clear();
    }

    /// Applies one observation as an atomic filter step.
    ///
    /// # Errors
    ///
    /// [`Error::StaleObservation`] when the timestamp is at or before the
    /// last processed one; the instance is left untouched.
    pub fn ingest(&mut self, obs: Arc<Observation>) -> Result<()> {
        if let Some(last) = self.last_obs_time {
            if obs.time <= last {
                return Err(Error::StaleObservation {
                    vehicle_id: self.vehicle_id.clone(),
                    timestamp: obs.time,
                });
            }
        }

        self.last_obs_time = Some(obs.time);
        self.last_raw = Some(Arc::clone(&obs));
        self.track_motion(&obs);

        if !self.enabled {
            debug!(vehicle_id = %self.vehicle_id, "instance disabled; report accepted without inference");
            return Ok(());
        }

        self.filter.step(Arc::clone(&obs));

        self.best = self.filter.best().map(|p| self.to_estimate(p, &obs));
        self.push_summary(obs.time);

        Ok(())
    }

    pub fn current_phase(&self) -> JourneyPhase {
        self.filter
            .best()
            .map(|p| p.phase)
            .unwrap_or(JourneyPhase::Unknown)
    }

    pub fn best_estimate(&self) -> Option<BestEstimate> {
        self.best.clone()
    }

    /// The most recent raw observation. Survives candidate loss, so a
    /// vehicle with no estimate can still be displayed at its reported
    /// position.
    pub fn last_raw_observation(&self) -> Option<Arc<Observation>> {
        self.last_raw.clone()
    }

    /// Owned snapshot of the current particle population.
    pub fn particles(&self) -> Vec<Particle> {
        self.filter.particles().to_vec()
    }

    /// Owned snapshot of the phase history.
    pub fn journey_summaries(&self) -> Vec<JourneySummary> {
        self.summaries.clone()
    }

    fn track_motion(&mut self, obs: &Observation) {
        let moved = match self.last_motion {
            Some((_, lat, lon)) => haversine_distance(obs.lat, obs.lon, lat, lon) > STALL_DISTANCE_M,
            None => true,
        };
        if moved {
            self.last_motion = Some((obs.time, obs.lat, obs.lon));
        }
    }

    fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        match self.last_motion {
            Some((since, _, _)) => (now - since).num_seconds() >= self.cfg.stalled_time_secs,
            None => false,
        }
    }

    fn to_estimate(&self, particle: &Particle, obs: &Observation) -> BestEstimate {
        let hypothesis = &particle.hypothesis;
        let state = hypothesis.block_state();

        let (lat, lon) = if hypothesis.is_snapped() {
            state.position().unwrap_or((obs.lat, obs.lon))
        } else {
            (obs.lat, obs.lon)
        };

        let inferred_dsc = state.block.block.dsc.clone();
        let dsc_matches = match (&inferred_dsc, &obs.dsc) {
            (Some(a), Some(b)) => Some(a == b),
            _ => None,
        };

        BestEstimate {
            vehicle_id: self.vehicle_id.clone(),
            last_update: obs.time,
            block_id: state.block_id().to_string(),
            trip_id: state.trip_id.clone(),
            distance_along_block: state.distance_along_block,
            schedule_deviation_min: hypothesis.schedule_deviation(),
            phase: particle.phase,
            inferred_dsc,
            observed_dsc: obs.dsc.clone(),
            dsc_matches,
            lat,
            lon,
            is_run_formal: hypothesis.is_run_formal(),
            is_off_route: !hypothesis.is_snapped(),
            is_stalled: self.is_stalled(obs.time),
        }
    }

    fn push_summary(&mut self, time: DateTime<Utc>) {
        let (block_id, trip_id) = match self.filter.best() {
            Some(p) => {
                let state = p.hypothesis.block_state();
                (
                    Some(state.block_id().to_string()),
                    Some(state.trip_id.clone()),
                )
            }
            None => (None, None),
        };
        self.summaries.push(JourneySummary {
            time,
            phase: self.current_phase(),
            block_id,
            trip_id,
        });
        if self.summaries.len() > MAX_JOURNEY_SUMMARIES {
            let excess = self.summaries.len() - MAX_JOURNEY_SUMMARIES;
            self.summaries.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::ShapePoint;
    use crate::schedule::{BlockRecord, ScheduleBundle, ScheduleIndex, TimePoint, TripSpan};
    use chrono::{NaiveDate, TimeZone};

    fn index() -> Arc<ScheduleIndex> {
        Arc::new(ScheduleIndex::from_bundle(ScheduleBundle {
            blocks: vec![BlockRecord {
                block_id: "B1".to_string(),
                run_id: Some("R123".to_string()),
                dsc: Some("6010".to_string()),
                active_dates: vec![NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()],
                trips: vec![TripSpan {
                    trip_id: "T1".to_string(),
                    start_dist: 0.0,
                    end_dist: 11_130.0,
                }],
                shape: vec![
                    ShapePoint {
                        lat: 40.70,
                        lon: -74.00,
                        shape_dist: 0.0,
                    },
                    ShapePoint {
                        lat: 40.80,
                        lon: -74.00,
                        shape_dist: 11_130.0,
                    },
                ],
                timetable: vec![
                    TimePoint {
                        dist: 0.0,
                        secs: 28_800.0,
                    },
                    TimePoint {
                        dist: 11_130.0,
                        secs: 30_150.0,
                    },
                ],
            }],
        }))
    }

    fn instance() -> VehicleInferenceInstance {
        VehicleInferenceInstance::new(
            "V1".to_string(),
            index(),
            Arc::new(InferenceConfig::default()),
            42,
        )
    }

    fn obs(lat: f64, secs_after_8: i64) -> Arc<Observation> {
        Arc::new(Observation {
            vehicle_id: "V1".to_string(),
            time: Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
                + chrono::Duration::seconds(secs_after_8),
            lat,
            lon: -74.0,
            op_assigned_run_id: None,
            best_fuzzy_run_ids: None,
            fuzzy_match_distance: None,
            assigned_block_id: None,
            dsc: Some("6010".to_string()),
        })
    }

    #[test]
    fn test_first_ingest_produces_estimate() {
        let mut inst = instance();
        assert_eq!(inst.current_phase(), JourneyPhase::Unknown);

        inst.ingest(obs(40.705, 60)).unwrap();
        let best = inst.best_estimate().unwrap();
        assert_eq!(best.block_id, "B1");
        assert_eq!(best.trip_id, "T1");
        assert_eq!(best.dsc_matches, Some(true));
    }

    #[test]
    fn test_stale_observation_rejected_and_state_unchanged() {
        let mut inst = instance();
        inst.ingest(obs(40.705, 60)).unwrap();
        let before = inst.best_estimate().unwrap();

        let err = inst.ingest(obs(40.710, 60)).unwrap_err();
        assert!(matches!(err, Error::StaleObservation { .. }));
        let err = inst.ingest(obs(40.710, 30)).unwrap_err();
        assert!(matches!(err, Error::StaleObservation { .. }));

        let after = inst.best_estimate().unwrap();
        assert_eq!(before.last_update, after.last_update);
        assert_eq!(before.distance_along_block, after.distance_along_block);
    }

    #[test]
    fn test_disabled_accepts_but_does_not_estimate() {
        let mut inst = instance();
        inst.ingest(obs(40.705, 60)).unwrap();
        let before = inst.best_estimate().unwrap();

        inst.set_enabled(false);
        inst.ingest(obs(40.710, 120)).unwrap();
        let after = inst.best_estimate().unwrap();
        assert_eq!(before.last_update, after.last_update);

        // The clock still advanced: the skipped timestamp is now stale
        assert!(inst.ingest(obs(40.710, 120)).is_err());
    }

    #[test]
    fn test_reset_returns_to_unknown() {
        let mut inst = instance();
        inst.ingest(obs(40.705, 60)).unwrap();
        assert!(inst.best_estimate().is_some());

        inst.reset();
        assert!(inst.best_estimate().is_none());
        assert!(inst.particles().is_empty());
        assert_eq!(inst.current_phase(), JourneyPhase::Unknown);
        assert!(inst.journey_summaries().is_empty());
    }

    #[test]
    fn test_stall_detection() {
        let mut inst = instance();
        inst.ingest(obs(40.705, 0)).unwrap();
        assert!(!inst.best_estimate().unwrap().is_stalled);

        // Same position for three minutes (threshold is 120 s)
        inst.ingest(obs(40.705, 90)).unwrap();
        inst.ingest(obs(40.705, 180)).unwrap();
        assert!(inst.best_estimate().unwrap().is_stalled);

        // Movement clears the stall
        inst.ingest(obs(40.715, 240)).unwrap();
        assert!(!inst.best_estimate().unwrap().is_stalled);
    }

    #[test]
    fn test_raw_observation_survives_candidate_loss() {
        let mut inst = instance();

        // Far from any route: no candidates, so no estimate, but the raw
        // position stays available for display
        inst.ingest(obs(45.0, 60)).unwrap();
        assert!(inst.best_estimate().is_none());
        assert_eq!(inst.current_phase(), JourneyPhase::Unknown);

        let raw = inst.last_raw_observation().unwrap();
        assert_eq!(raw.lat, 45.0);
        assert_eq!(raw.time, obs(45.0, 60).time);

        inst.reset();
        assert!(inst.last_raw_observation().is_none());
    }

    #[test]
    fn test_journey_summaries_record_phases() {
        let mut inst = instance();
        inst.ingest(obs(40.705, 60)).unwrap();
        inst.ingest(obs(40.710, 120)).unwrap();

        let summaries = inst.journey_summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].block_id.as_deref(), Some("B1"));
    }
}
