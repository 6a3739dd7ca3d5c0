//! Aggregate management service: an explicit registry of per-vehicle
//! inference instances, created lazily as vehicles first report.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::inference::filter::Particle;
use crate::inference::instance::{BestEstimate, JourneySummary, VehicleInferenceInstance};
use crate::observation::{Observation, RawReport};
use crate::schedule::ScheduleIndex;

/// Stable per-vehicle seed so replays are deterministic regardless of how
/// vehicle ingestion interleaves. FNV-1a over the vehicle id, folded into
/// the configured base seed.
pub fn derive_seed(base: u64, vehicle_id: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in vehicle_id.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    base ^ h
}

pub struct InferenceService {
    index: Arc<ScheduleIndex>,
    cfg: Arc<InferenceConfig>,
    instances: HashMap<String, VehicleInferenceInstance>,
}

impl InferenceService {
    pub fn new(index: Arc<ScheduleIndex>, cfg: Arc<InferenceConfig>) -> Self {
        InferenceService {
            index,
            cfg,
            instances: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Arc<InferenceConfig> {
        &self.cfg
    }

    pub fn schedule_index(&self) -> &Arc<ScheduleIndex> {
        &self.index
    }

    /// Normalizes a raw report and applies it to the reporting vehicle's
    /// instance, creating the instance on first contact.
    ///
    /// Stale observations are dropped silently (logged at debug); invalid
    /// reports are returned as errors for the caller to count, with the
    /// instance left untouched.
    pub fn ingest_report(&mut self, report: &RawReport) -> Result<()> {
        let obs = Arc::new(Observation::from_report(report, &self.index)?);
        let instance = self.instance_for(&report.vehicle_id);

        match instance.ingest(obs) {
            Ok(()) => Ok(()),
            Err(Error::StaleObservation { vehicle_id, timestamp }) => {
                debug!(vehicle_id = %vehicle_id, %timestamp, "dropping stale observation");
                Ok(())
            }
            Err(other) => {
                warn!(vehicle_id = %report.vehicle_id, error = %other, "ingest failed");
                Err(other)
            }
        }
    }

    pub fn best_estimate(&self, vehicle_id: &str) -> Result<Option<BestEstimate>> {
        Ok(self.lookup(vehicle_id)?.best_estimate())
    }

    /// The vehicle's most recent raw observation, for display when
    /// candidate loss leaves it without an estimate.
    pub fn last_raw_observation(&self, vehicle_id: &str) -> Result<Option<Arc<Observation>>> {
        Ok(self.lookup(vehicle_id)?.last_raw_observation())
    }

    pub fn reset_vehicle(&mut self, vehicle_id: &str) -> Result<()> {
        self.lookup_mut(vehicle_id)?.reset();
        Ok(())
    }

    pub fn set_vehicle_enabled(&mut self, vehicle_id: &str, enabled: bool) -> Result<()> {
        self.lookup_mut(vehicle_id)?.set_enabled(enabled);
        Ok(())
    }

    /// Debug surface: the current particle population.
    pub fn particles(&self, vehicle_id: &str) -> Result<Vec<Particle>> {
        Ok(self.lookup(vehicle_id)?.particles())
    }

    /// Debug surface: the journey-phase history.
    pub fn journey_summaries(&self, vehicle_id: &str) -> Result<Vec<JourneySummary>> {
        Ok(self.lookup(vehicle_id)?.journey_summaries())
    }

    pub fn vehicle_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn instance_for(&mut self, vehicle_id: &str) -> &mut VehicleInferenceInstance {
        self.instances
            .entry(vehicle_id.to_string())
            .or_insert_with(|| {
                debug!(vehicle_id, "creating inference instance");
                VehicleInferenceInstance::new(
                    vehicle_id.to_string(),
                    Arc::clone(&self.index),
                    Arc::clone(&self.cfg),
                    derive_seed(self.cfg.seed, vehicle_id),
                )
            })
    }

    fn lookup(&self, vehicle_id: &str) -> Result<&VehicleInferenceInstance> {
        self.instances
            .get(vehicle_id)
            .ok_or_else(|| Error::VehicleNotFound(vehicle_id.to_string()))
    }

    fn lookup_mut(&mut self, vehicle_id: &str) -> Result<&mut VehicleInferenceInstance> {
        self.instances
            .get_mut(vehicle_id)
            .ok_or_else(|| Error::VehicleNotFound(vehicle_id.to_string()))
    }
}
