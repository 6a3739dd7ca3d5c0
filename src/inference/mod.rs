//! The inference engine: block-state hypotheses, hypothesis scoring, the
//! journey-phase state machine, the per-vehicle particle filter, and the
//! per-vehicle coordinator that ties them together.

pub mod candidates;
pub mod filter;
pub mod instance;
pub mod phase;
pub mod scoring;

use rand::Rng;

/// Standard normal draw via Box-Muller.
pub(crate) fn randn<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.gen_range(0.0..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
