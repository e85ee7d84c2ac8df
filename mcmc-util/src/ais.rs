//! Annealed importance sampling over a Gaussian base distribution.
//!
//! The intermediate targets are `q(z) exp(β_t ℓ(z))` with
//! `0 = β_0 < β_1 < ... < β_T = 1`, where `q` is a zero-mean Gaussian
//! the caller can draw from and `ℓ` is the log-ratio between the
//! target and `q`. Transitions are elliptical slice steps, which leave
//! each intermediate target invariant without any tuning.

use rand::rngs::SmallRng;

use crate::ess::elliptical_slice_step;
use crate::traits::EssParam;

/// Inverse temperatures of an annealing run
#[derive(Debug, Clone)]
pub struct AisSchedule {
    betas: Vec<f64>,
}

impl AisSchedule {
    /// `β_t = t / T`. With zero steps the run degenerates to a single
    /// importance weight drawn from the base distribution.
    pub fn linear(num_steps: usize) -> Self {
        let num_steps = num_steps.max(1);
        Self {
            betas: (0..=num_steps)
                .map(|t| t as f64 / num_steps as f64)
                .collect(),
        }
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn num_steps(&self) -> usize {
        self.betas.len() - 1
    }
}

/// Annealing runner
pub struct AisSampler {
    pub schedule: AisSchedule,
    /// elliptical slice steps per intermediate distribution
    pub num_transitions: usize,
    pub seed: u64,
}

impl AisSampler {
    /// One annealing run started from a fresh base draw; returns the
    /// log importance weight
    /// `Σ_t (β_t - β_{t-1}) ℓ(z_{t-1})`.
    ///
    /// - `loglik`: `ℓ(z) = log f(z) - log q(z)`
    /// - `prior_draw`: a draw from the zero-mean Gaussian base `q`
    pub fn run_one<P: EssParam>(
        &self,
        loglik: &impl Fn(&P) -> f64,
        prior_draw: &impl Fn(&mut SmallRng) -> P,
        rng: &mut SmallRng,
    ) -> f64 {
        let betas = self.schedule.betas();
        let last = betas.len() - 1;

        let mut z = prior_draw(rng);
        let mut ell = loglik(&z);
        let mut log_weight = 0.0;

        for t in 1..=last {
            log_weight += (betas[t] - betas[t - 1]) * ell;

            if t == last {
                break;
            }

            let beta = betas[t];
            let tempered = |p: &P| beta * loglik(p);
            for _ in 0..self.num_transitions {
                let nu = prior_draw(rng);
                let (next, next_lnpdf) =
                    elliptical_slice_step(&z, &nu, &tempered, beta * ell, rng);
                z = next;
                ell = next_lnpdf / beta;
            }
        }
        log_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    fn run_many(
        sampler: &AisSampler,
        num_runs: usize,
        loglik: &impl Fn(&DVector<f64>) -> f64,
        prior_draw: &impl Fn(&mut SmallRng) -> DVector<f64>,
    ) -> Vec<f64> {
        let mut rng = SmallRng::seed_from_u64(sampler.seed);
        (0..num_runs)
            .map(|_| sampler.run_one(loglik, prior_draw, &mut rng))
            .collect()
    }

    fn logmeanexp(xx: &[f64]) -> f64 {
        let max = xx.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        max + (xx.iter().map(|x| (x - max).exp()).sum::<f64>() / xx.len() as f64).ln()
    }

    #[test]
    fn schedules_start_at_zero_and_end_at_one() {
        let lin = AisSchedule::linear(4);
        assert_eq!(lin.betas(), &[0.0, 0.25, 0.5, 0.75, 1.0]);

        let degenerate = AisSchedule::linear(0);
        assert_eq!(degenerate.betas(), &[0.0, 1.0]);
        assert_eq!(degenerate.num_steps(), 1);
    }

    #[test]
    fn constant_log_ratio_gives_exact_weights() {
        let sampler = AisSampler {
            schedule: AisSchedule::linear(3),
            num_transitions: 1,
            seed: 42,
        };
        let loglik = |_: &DVector<f64>| -1.25;
        let prior_draw = |rng: &mut SmallRng| DVector::from_fn(2, |_, _| StandardNormal.sample(rng));

        for w in run_many(&sampler, 8, &loglik, &prior_draw) {
            assert!((w + 1.25).abs() < 1e-12);
        }
    }

    /// q = N(0,1), f(z) = N(z; 0, 1) N(y; z, σ²) so that
    /// Z = N(y; 0, 1 + σ²)
    #[test]
    fn gaussian_evidence_is_recovered() {
        let y = 1.5;
        let sigma_sq: f64 = 0.5;
        let loglik = move |z: &DVector<f64>| {
            let diff = y - z[0];
            -0.5 * diff * diff / sigma_sq - 0.5 * (2.0 * std::f64::consts::PI * sigma_sq).ln()
        };
        let prior_draw = |rng: &mut SmallRng| DVector::from_fn(1, |_, _| StandardNormal.sample(rng));

        let tot = 1.0 + sigma_sq;
        let log_z = -0.5 * y * y / tot - 0.5 * (2.0 * std::f64::consts::PI * tot).ln();

        let sampler = AisSampler {
            schedule: AisSchedule::linear(20),
            num_transitions: 1,
            seed: 7,
        };
        let weights = run_many(&sampler, 2_000, &loglik, &prior_draw);
        let estimate = logmeanexp(&weights);

        assert!(
            (estimate - log_z).abs() < 0.05,
            "estimate {} vs exact {}",
            estimate,
            log_z
        );
    }
}
