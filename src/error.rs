//! Error taxonomy for the inference engine.
//!
//! Loss of track is deliberately not represented here: a vehicle with no
//! candidate hypotheses stays tracked in the `Unknown` phase.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The raw report had a missing timestamp or coordinates outside a sane
    /// geographic envelope. The report is dropped; instance state is
    /// unaffected.
    #[error("invalid observation for vehicle {vehicle_id}: {reason}")]
    InvalidObservation { vehicle_id: String, reason: String },

    /// The observation's timestamp is at or before the instance's last
    /// processed timestamp. Dropped without reprocessing.
    #[error("stale observation for vehicle {vehicle_id}: {timestamp} <= last processed")]
    StaleObservation {
        vehicle_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The schedule snapshot could not be loaded. Fatal for the whole
    /// service; surfaced at startup, never per observation.
    #[error("schedule index unavailable: {0}")]
    ScheduleIndexUnavailable(String),

    /// A query named a vehicle that has never reported.
    #[error("vehicle {0} is not tracked")]
    VehicleNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
