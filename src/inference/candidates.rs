//! Block-state hypotheses and the two candidate generation modes: spatial
//! cold start and phase-aware warm propagation.

use rand::Rng;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::config::InferenceConfig;
use crate::geo::haversine_distance;
use crate::inference::phase::JourneyPhase;
use crate::inference::randn;
use crate::observation::Observation;
use crate::schedule::{BlockInstance, ScheduleIndex};

/// A specific (block instance, trip, distance-along-block) hypothesis.
/// Shared read-only between the candidate generator, the scorer, and the
/// particles that carry it forward.
#[derive(Debug, Clone)]
pub struct BlockState {
    pub block: Arc<BlockInstance>,
    pub trip_id: String,
    pub distance_along_block: f64,
}

impl BlockState {
    /// Places a hypothesis at `dist` along the block, clamped to the
    /// block's span. Returns `None` for blocks with no trips.
    pub fn at_distance(block: Arc<BlockInstance>, dist: f64) -> Option<BlockState> {
        let clamped = dist.clamp(0.0, block.block.total_distance());
        let trip = block.block.trip_at(clamped)?;
        Some(BlockState {
            trip_id: trip.trip_id.clone(),
            distance_along_block: clamped,
            block,
        })
    }

    pub fn block_id(&self) -> &str {
        &self.block.block.block_id
    }

    pub fn run_id(&self) -> Option<&str> {
        self.block.block.run_id.as_deref()
    }

    pub fn total_distance(&self) -> f64 {
        self.block.block.total_distance()
    }

    /// On-route position at this hypothesis's distance.
    pub fn position(&self) -> Option<(f64, f64)> {
        self.block.block.point_at(self.distance_along_block)
    }

    /// Whether the distance falls strictly within the block's trips (not
    /// before the first trip or past the last).
    pub fn is_on_trip(&self) -> bool {
        let trips = &self.block.block.trips;
        match (trips.first(), trips.last()) {
            (Some(first), Some(last)) => {
                self.distance_along_block > first.start_dist
                    && self.distance_along_block < last.end_dist
            }
            _ => false,
        }
    }

    /// Whether the distance lies within the layover window of a trip
    /// boundary.
    pub fn is_at_potential_layover_spot(&self, layover_window_m: f64) -> bool {
        self.block
            .block
            .distance_to_trip_boundary(self.distance_along_block)
            <= layover_window_m
    }
}

impl PartialEq for BlockState {
    fn eq(&self, other: &Self) -> bool {
        self.block_id() == other.block_id()
            && self.block.service_date == other.block.service_date
            && self.trip_id == other.trip_id
            && self.distance_along_block.to_bits() == other.distance_along_block.to_bits()
    }
}

impl Eq for BlockState {}

impl Hash for BlockState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.block_id().hash(state);
        self.block.service_date.hash(state);
        self.trip_id.hash(state);
        self.distance_along_block.to_bits().hash(state);
    }
}

impl PartialOrd for BlockState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockState {
    /// Natural order: block id, then distance-along-block ascending.
    fn cmp(&self, other: &Self) -> Ordering {
        self.block_id()
            .cmp(other.block_id())
            .then_with(|| self.block.service_date.cmp(&other.block.service_date))
            .then_with(|| {
                self.distance_along_block
                    .total_cmp(&other.distance_along_block)
            })
            .then_with(|| self.trip_id.cmp(&other.trip_id))
    }
}

/// A generated hypothesis plus its spatial offset from the observation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub state: Arc<BlockState>,
    /// Great-circle distance from the observation to the hypothesis's
    /// on-route position, meters.
    pub offset_m: f64,
}

/// Cold start / reseed: every active block whose geometry passes within the
/// configured radius of the observation.
pub fn cold_start(
    index: &ScheduleIndex,
    obs: &Observation,
    cfg: &InferenceConfig,
) -> Vec<Candidate> {
    index
        .blocks_near(obs.lat, obs.lon, obs.time, cfg.cold_search_radius_m)
        .into_iter()
        .filter_map(|(instance, snap)| {
            let state = BlockState::at_distance(instance, snap.distance_along)?;
            Some(Candidate {
                state: Arc::new(state),
                offset_m: snap.offset_m,
            })
        })
        .collect()
}

/// Warm propagation: advances a prior hypothesis by the motion model for
/// its journey phase and re-snaps to the geometry. A layover holds its
/// position and keeps the prior state allocation, so the scorer can tell
/// the hypothesis identity did not change.
pub fn propagate<R: Rng>(
    prior: &Arc<BlockState>,
    phase: JourneyPhase,
    speed_mps: f64,
    elapsed_secs: f64,
    obs: &Observation,
    rng: &mut R,
    cfg: &InferenceConfig,
) -> Option<Candidate> {
    let block = &prior.block.block;

    let state = match phase {
        JourneyPhase::InProgress => {
            let speed = (speed_mps + randn(rng) * cfg.speed_noise_mps).max(0.0);
            let new_dist = prior.distance_along_block + speed * elapsed_secs;
            Arc::new(BlockState::at_distance(Arc::clone(&prior.block), new_dist)?)
        }
        JourneyPhase::LayoverBefore | JourneyPhase::LayoverDuring => Arc::clone(prior),
        JourneyPhase::Deadhead | JourneyPhase::Unknown => {
            // The vehicle may rejoin anywhere; re-anchor on the geometry.
            let new_dist = match block.snap(obs.lat, obs.lon) {
                Some(snap) => snap.distance_along,
                None => prior.distance_along_block,
            };
            Arc::new(BlockState::at_distance(Arc::clone(&prior.block), new_dist)?)
        }
    };

    let (lat, lon) = state.position()?;
    let offset_m = haversine_distance(obs.lat, obs.lon, lat, lon);

    Some(Candidate { state, offset_m })
}
