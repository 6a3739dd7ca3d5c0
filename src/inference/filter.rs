//! Per-vehicle particle filter: propagate, score, normalize, resample,
//! and advance journey phases, one observation at a time.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::debug;

use crate::config::InferenceConfig;
use crate::inference::candidates::{self, Candidate};
use crate::inference::phase::{self, JourneyPhase};
use crate::inference::randn;
use crate::inference::scoring::BlockStateObservation;
use crate::observation::Observation;
use crate::schedule::ScheduleIndex;

/// One weighted sample of the vehicle's hidden state. Value-like: a filter
/// step builds a new generation rather than mutating reported particles.
#[derive(Debug, Clone)]
pub struct Particle {
    pub hypothesis: BlockStateObservation,
    pub phase: JourneyPhase,
    pub weight: f64,
    /// Along-route speed carried between steps, m/s.
    pub speed_mps: f64,
    /// Consecutive observations beyond the off-route threshold.
    pub off_route_count: u32,
}

/// Effective sample size of a normalized weight vector, `1 / Σw²`.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq == 0.0 { 0.0 } else { 1.0 / sum_sq }
}

pub struct ParticleFilter {
    index: Arc<ScheduleIndex>,
    cfg: Arc<InferenceConfig>,
    rng: ChaCha8Rng,
    particles: Vec<Particle>,
    last_obs: Option<Arc<Observation>>,
    best: Option<Particle>,
}

/// A candidate staged for scoring, before it becomes a particle.
struct Staged {
    candidate: Candidate,
    prior_weight: f64,
    prior_phase: JourneyPhase,
    speed_mps: f64,
    prior_off_route: u32,
    /// The hypothesis this candidate was propagated from, when warm.
    prior_hypothesis: Option<BlockStateObservation>,
}

impl ParticleFilter {
    pub fn new(index: Arc<ScheduleIndex>, cfg: Arc<InferenceConfig>, seed: u64) -> Self {
        ParticleFilter {
            index,
            cfg,
            rng: ChaCha8Rng::seed_from_u64(seed),
            particles: Vec::new(),
            last_obs: None,
            best: None,
        }
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Highest-weight particle of the last step, ties broken by hypothesis
    /// rank. Captured before any resample so the ranking survives weight
    /// equalization.
    pub fn best(&self) -> Option<&Particle> {
        self.best.as_ref()
    }

    pub fn last_observation(&self) -> Option<&Arc<Observation>> {
        self.last_obs.as_ref()
    }

    pub fn reset(&mut self) {
        self.particles.clear();
        self.last_obs = None;
        self.best = None;
    }

    /// Runs one full filter step. An empty candidate set is not an error:
    /// the population empties and the vehicle is reported `Unknown` until
    /// candidates reappear.
    pub fn step(&mut self, obs: Arc<Observation>) {
        let elapsed_secs = self
            .last_obs
            .as_ref()
            .map(|prev| (obs.time - prev.time).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        let staged = self.generate_candidates(&obs, elapsed_secs);

        if staged.is_empty() {
            debug!(
                vehicle_id = %obs.vehicle_id,
                "no candidate hypotheses; tracking as unknown"
            );
            self.particles.clear();
            self.best = None;
            self.last_obs = Some(obs);
            return;
        }

        let mut generation = self.score(staged, &obs);
        normalize(&mut generation);

        // Phases advance before the resample; survivors are clones, so the
        // result is the same and the best-estimate snapshot carries the
        // current phase.
        for p in &mut generation {
            p.phase = phase::transition(p.phase, &p.hypothesis, p.off_route_count, &self.cfg);
        }

        self.best = generation
            .iter()
            .max_by(|a, b| {
                a.weight
                    .total_cmp(&b.weight)
                    .then_with(|| b.hypothesis.cmp(&a.hypothesis))
            })
            .cloned();

        let weights: Vec<f64> = generation.iter().map(|p| p.weight).collect();
        let ess = effective_sample_size(&weights);
        let target = self.cfg.particle_count;
        if ess < self.cfg.ess_resample_fraction * generation.len() as f64
            || generation.len() > target
        {
            generation = self.resample(generation, target);
        }

        self.particles = generation;
        self.last_obs = Some(obs);
    }

    /// Step 1: warm-propagate the prior generation and inject a fraction of
    /// fresh cold-start candidates; cold-start everything when there is no
    /// prior generation.
    fn generate_candidates(&mut self, obs: &Arc<Observation>, elapsed_secs: f64) -> Vec<Staged> {
        let cfg = Arc::clone(&self.cfg);
        let mut staged = Vec::new();

        if self.particles.is_empty() {
            for candidate in candidates::cold_start(&self.index, obs, &cfg) {
                let speed_mps =
                    (cfg.nominal_speed_mps + randn(&mut self.rng) * cfg.speed_noise_mps).max(0.0);
                staged.push(Staged {
                    candidate,
                    prior_weight: 1.0,
                    prior_phase: JourneyPhase::Unknown,
                    speed_mps,
                    prior_off_route: 0,
                    prior_hypothesis: None,
                });
            }
            return staged;
        }

        let prior = std::mem::take(&mut self.particles);
        for p in &prior {
            let Some(candidate) = candidates::propagate(
                p.hypothesis.block_state(),
                p.phase,
                p.speed_mps,
                elapsed_secs,
                obs,
                &mut self.rng,
                &cfg,
            ) else {
                continue;
            };
            staged.push(Staged {
                candidate,
                prior_weight: p.weight,
                prior_phase: p.phase,
                speed_mps: p.speed_mps,
                prior_off_route: p.off_route_count,
                prior_hypothesis: Some(p.hypothesis.clone()),
            });
        }

        // Recovery path for hypothesis deprivation
        let inject = ((cfg.particle_count as f64) * cfg.cold_injection_fraction).ceil() as usize;
        let fresh = candidates::cold_start(&self.index, obs, &cfg);
        for candidate in fresh.into_iter().take(inject) {
            let speed_mps =
                (cfg.nominal_speed_mps + randn(&mut self.rng) * cfg.speed_noise_mps).max(0.0);
            staged.push(Staged {
                candidate,
                prior_weight: 1.0 / cfg.particle_count as f64,
                prior_phase: JourneyPhase::Unknown,
                speed_mps,
                prior_off_route: 0,
                prior_hypothesis: None,
            });
        }

        staged
    }

    /// Step 2: wrap each candidate with the observation and weight it by
    /// the observation likelihood.
    fn score(&mut self, staged: Vec<Staged>, obs: &Arc<Observation>) -> Vec<Particle> {
        let cfg = &self.cfg;
        staged
            .into_iter()
            .map(|s| {
                let is_snapped = s.candidate.offset_m <= cfg.off_route_distance_m;
                let hypothesis = match &s.prior_hypothesis {
                    // Same block state held over (a layover): re-evaluate
                    // the prior hypothesis against the new clock
                    Some(prior)
                        if Arc::ptr_eq(prior.block_state(), &s.candidate.state)
                            && prior.is_snapped() == is_snapped =>
                    {
                        BlockStateObservation::with_observation(
                            prior,
                            Arc::clone(obs),
                            cfg.layover_window_m,
                        )
                    }
                    _ => BlockStateObservation::new(
                        Arc::clone(&s.candidate.state),
                        Arc::clone(obs),
                        is_snapped,
                        cfg.layover_window_m,
                    ),
                };

                let dev = hypothesis.schedule_deviation() / cfg.deviation_sigma_min;
                let snap = s.candidate.offset_m / cfg.gps_sigma_m;
                let mut likelihood = (-0.5 * dev * dev).exp() * (-0.5 * snap * snap).exp();
                if hypothesis.is_run_formal() {
                    likelihood *= 4.0;
                }
                if hypothesis.is_run_reported() == Some(true) {
                    likelihood *= 2.0;
                }
                if hypothesis.is_op_assigned() == Some(true) {
                    likelihood *= 2.0;
                }
                likelihood = likelihood.max(1e-12);

                let off_route_count = if is_snapped { 0 } else { s.prior_off_route + 1 };

                Particle {
                    hypothesis,
                    phase: s.prior_phase,
                    weight: s.prior_weight * likelihood,
                    speed_mps: s.speed_mps,
                    off_route_count,
                }
            })
            .collect()
    }

    /// Step 4: systematic CDF resampling to an equal-weight population of
    /// the target size.
    fn resample(&mut self, generation: Vec<Particle>, target: usize) -> Vec<Particle> {
        let step = 1.0 / target as f64;
        let start = self.rng.gen_range(0.0..1.0) * step;

        let mut out = Vec::with_capacity(target);
        let mut i = 0;
        let mut cum = generation[0].weight;

        for k in 0..target {
            let u = start + k as f64 * step;
            while cum < u && i + 1 < generation.len() {
                i += 1;
                cum += generation[i].weight;
            }
            let mut p = generation[i].clone();
            p.weight = step;
            out.push(p);
        }

        out
    }
}

/// Step 3: normalize weights to sum to 1; degenerate weights fall back to
/// uniform.
fn normalize(generation: &mut [Particle]) {
    let sum: f64 = generation.iter().map(|p| p.weight).sum();
    if sum > 0.0 && sum.is_finite() {
        for p in generation {
            p.weight /= sum;
        }
    } else {
        let uniform = 1.0 / generation.len() as f64;
        for p in generation {
            p.weight = uniform;
        }
    }
}
