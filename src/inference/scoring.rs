//! A block-state hypothesis evaluated against one observation, with the
//! total order used to rank competing hypotheses.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::inference::candidates::BlockState;
use crate::observation::Observation;

/// A [`BlockState`] judged against one [`Observation`]. All fields are
/// derived at construction and immutable afterwards; re-evaluating the same
/// hypothesis against a newer observation reuses the block state and
/// recomputes everything observation-dependent.
#[derive(Debug, Clone)]
pub struct BlockStateObservation {
    block_state: Arc<BlockState>,
    obs: Arc<Observation>,
    is_op_assigned: Option<bool>,
    is_run_reported: Option<bool>,
    is_run_formal: bool,
    is_at_potential_layover_spot: bool,
    is_on_trip: bool,
    is_snapped: bool,
    /// Minutes; clamped to 0 at the block's start and end.
    schedule_deviation: f64,
}

impl BlockStateObservation {
    pub fn new(
        block_state: Arc<BlockState>,
        obs: Arc<Observation>,
        is_snapped: bool,
        layover_window_m: f64,
    ) -> Self {
        let is_on_trip = block_state.is_on_trip();
        Self::build(block_state, obs, is_snapped, is_on_trip, layover_window_m)
    }

    /// Re-evaluates a prior hypothesis against a new observation. The
    /// hypothesis identity (block state) and its snap/on-trip status carry
    /// over; the run flags, layover flag, and deviation are recomputed
    /// since they change with the clock.
    pub fn with_observation(
        prior: &BlockStateObservation,
        obs: Arc<Observation>,
        layover_window_m: f64,
    ) -> Self {
        Self::build(
            Arc::clone(&prior.block_state),
            obs,
            prior.is_snapped,
            prior.is_on_trip,
            layover_window_m,
        )
    }

    fn build(
        block_state: Arc<BlockState>,
        obs: Arc<Observation>,
        is_snapped: bool,
        is_on_trip: bool,
        layover_window_m: f64,
    ) -> Self {
        let run_id = block_state.run_id();

        let is_op_assigned = obs
            .op_assigned_run_id
            .as_deref()
            .map(|assigned| Some(assigned) == run_id);

        let is_run_reported = match (run_id, &obs.best_fuzzy_run_ids, obs.fuzzy_match_distance) {
            (Some(run_id), Some(ids), Some(_)) => Some(ids.contains(run_id)),
            _ => None,
        };

        let is_run_formal = is_op_assigned == Some(true)
            || (is_run_reported == Some(true) && obs.fuzzy_match_distance == Some(0))
            || obs.assigned_block_id.as_deref() == Some(block_state.block_id());

        let is_at_potential_layover_spot =
            block_state.is_at_potential_layover_spot(layover_window_m);

        let schedule_deviation = compute_schedule_deviation(&obs, &block_state);

        BlockStateObservation {
            block_state,
            obs,
            is_op_assigned,
            is_run_reported,
            is_run_formal,
            is_at_potential_layover_spot,
            is_on_trip,
            is_snapped,
            schedule_deviation,
        }
    }

    pub fn block_state(&self) -> &Arc<BlockState> {
        &self.block_state
    }

    pub fn observation(&self) -> &Arc<Observation> {
        &self.obs
    }

    pub fn is_op_assigned(&self) -> Option<bool> {
        self.is_op_assigned
    }

    pub fn is_run_reported(&self) -> Option<bool> {
        self.is_run_reported
    }

    pub fn is_run_formal(&self) -> bool {
        self.is_run_formal
    }

    pub fn is_at_potential_layover_spot(&self) -> bool {
        self.is_at_potential_layover_spot
    }

    pub fn is_on_trip(&self) -> bool {
        self.is_on_trip
    }

    pub fn is_snapped(&self) -> bool {
        self.is_snapped
    }

    pub fn schedule_deviation(&self) -> f64 {
        self.schedule_deviation
    }
}

/// Schedule deviation in minutes: observation time against the scheduled
/// time at the hypothesis's distance. Zero at the block's start (distance
/// and deviation both nonpositive: not yet started) and at the block's end
/// (distance and deviation both nonnegative: already finished).
pub fn compute_schedule_deviation(obs: &Observation, block_state: &BlockState) -> f64 {
    let dab = block_state.distance_along_block;
    let elapsed_secs =
        (obs.time.timestamp_millis() - block_state.block.service_date_epoch_ms()) as f64 / 1000.0;
    let sched_dev = (elapsed_secs - block_state.block.block.scheduled_time_at(dab)) / 60.0;

    if (dab <= 0.0 && sched_dev <= 0.0)
        || (dab >= block_state.total_distance() && sched_dev >= 0.0)
    {
        0.0
    } else {
        sched_dev
    }
}

/// Rank for tri-state flags: true, then false, then unknown.
fn tri_state_rank(value: Option<bool>) -> u8 {
    match value {
        Some(true) => 0,
        Some(false) => 1,
        None => 2,
    }
}

impl PartialEq for BlockStateObservation {
    fn eq(&self, other: &Self) -> bool {
        self.block_state == other.block_state
            && self.obs == other.obs
            && self.is_op_assigned == other.is_op_assigned
            && self.is_run_reported == other.is_run_reported
            && self.is_run_formal == other.is_run_formal
            && self.is_at_potential_layover_spot == other.is_at_potential_layover_spot
            && self.is_on_trip == other.is_on_trip
            && self.is_snapped == other.is_snapped
            && self.schedule_deviation.to_bits() == other.schedule_deviation.to_bits()
    }
}

impl Eq for BlockStateObservation {}

impl Hash for BlockStateObservation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.block_state.hash(state);
        self.obs.hash(state);
        self.is_op_assigned.hash(state);
        self.is_run_reported.hash(state);
        self.is_run_formal.hash(state);
        self.is_at_potential_layover_spot.hash(state);
        self.is_on_trip.hash(state);
        self.is_snapped.hash(state);
        self.schedule_deviation.to_bits().hash(state);
    }
}

impl PartialOrd for BlockStateObservation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockStateObservation {
    /// Best-first total order: formal run, then reported run (unknown
    /// last), then operator assignment (unknown last), then the block
    /// state's natural order, with deviation and the remaining flags as
    /// final tie-breaks so distinct hypotheses never compare equal.
    fn cmp(&self, other: &Self) -> Ordering {
        (!self.is_run_formal)
            .cmp(&!other.is_run_formal)
            .then_with(|| tri_state_rank(self.is_run_reported).cmp(&tri_state_rank(other.is_run_reported)))
            .then_with(|| tri_state_rank(self.is_op_assigned).cmp(&tri_state_rank(other.is_op_assigned)))
            .then_with(|| self.block_state.cmp(&other.block_state))
            .then_with(|| self.schedule_deviation.total_cmp(&other.schedule_deviation))
            .then_with(|| self.is_snapped.cmp(&other.is_snapped))
            .then_with(|| self.is_at_potential_layover_spot.cmp(&other.is_at_potential_layover_spot))
            .then_with(|| self.is_on_trip.cmp(&other.is_on_trip))
    }
}
