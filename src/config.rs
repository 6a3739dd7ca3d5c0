//! Tunable thresholds for candidate generation, the motion model, and the
//! journey-phase guards.

use serde::{Deserialize, Serialize};

/// Inference thresholds. Defaults mirror the operational values the engine
/// has historically run with (150 m off-route, 120 s stalled).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Max snap offset before a candidate is considered off its route, meters.
    pub off_route_distance_m: f64,
    /// Seconds without material movement before a vehicle counts as stalled.
    pub stalled_time_secs: i64,
    /// Cold-start spatial search radius, meters.
    pub cold_search_radius_m: f64,
    /// Target particle population size.
    pub particle_count: usize,
    /// Fraction of each generation drawn from fresh cold-start candidates.
    pub cold_injection_fraction: f64,
    /// Resample when effective sample size drops below this fraction of the
    /// population.
    pub ess_resample_fraction: f64,
    /// GPS noise sigma for the spatial likelihood, meters.
    pub gps_sigma_m: f64,
    /// Schedule-deviation sigma for the temporal likelihood, minutes.
    pub deviation_sigma_min: f64,
    /// Nominal in-progress speed, m/s.
    pub nominal_speed_mps: f64,
    /// Std-dev of per-step speed noise, m/s.
    pub speed_noise_mps: f64,
    /// Window around a trip boundary that counts as a layover spot, meters.
    pub layover_window_m: f64,
    /// Grace before the scheduled next-trip start during which a layover may
    /// become in-progress, seconds.
    pub layover_departure_grace_secs: i64,
    /// Movement away from the layover point that forces departure, meters.
    pub layover_departure_distance_m: f64,
    /// Consecutive off-route observations before a particle goes deadhead.
    pub deadhead_after_off_route: u32,
    /// Base seed; per-vehicle seeds are derived from it.
    pub seed: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            off_route_distance_m: 150.0,
            stalled_time_secs: 120,
            cold_search_radius_m: 400.0,
            particle_count: 200,
            cold_injection_fraction: 0.1,
            ess_resample_fraction: 0.5,
            gps_sigma_m: 50.0,
            deviation_sigma_min: 15.0,
            nominal_speed_mps: 8.0,
            speed_noise_mps: 2.5,
            layover_window_m: 200.0,
            layover_departure_grace_secs: 120,
            layover_departure_distance_m: 100.0,
            deadhead_after_off_route: 3,
            seed: 0x0b5e_7a11,
        }
    }
}
