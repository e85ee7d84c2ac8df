//! Log-likelihood of an ISA model.
//!
//! Complete models are evaluated exactly. Overcomplete models use
//! annealed importance sampling over the null space coordinates `z`
//! of `s = W_x x + W_z z`. The base distribution is the posterior over
//! `z` under a moment-matched Gaussian prior `N(0, D)`, whose evidence
//! `N(x; 0, A D A')` is known in closed form; each importance weight
//! then corrects it by `ln p(s) - ln N(s; 0, D)` along the annealing
//! path.

use super::Isa;
use crate::{bits_per_dim, DVec, Mat};
use log::info;
use matrix_util::check_finite;
use matrix_util::dmatrix_util::logmeanexp_columns;
use matrix_util::parallel::{column_seed, map_over_columns};
use mcmc_util::{AisSampler, AisSchedule};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::{LN_2, PI};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikelihoodOptions {
    /// Annealing runs per data point. Default: 10
    pub num_samples: usize,
    /// Intermediate distributions per run. Default: 100
    pub num_steps: usize,
    /// Elliptical slice steps per intermediate distribution. Default: 1
    pub num_transitions: usize,
}

impl Default for LikelihoodOptions {
    fn default() -> Self {
        Self {
            num_samples: 10,
            num_steps: 100,
            num_transitions: 1,
        }
    }
}

/// Average bits per dimension with its standard error across data points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AisSummary {
    pub bits_per_dim: f64,
    pub sem: f64,
}

/// Summarize a `samples x data` matrix of log importance weights
pub fn ais_summary(weights: &Mat, dim: usize) -> AisSummary {
    loglik_summary(&logmeanexp_columns(weights), dim)
}

/// Bits per dimension of per-column log-likelihoods, with the standard
/// error of their mean
pub fn loglik_summary(loglik: &DVec, dim: usize) -> AisSummary {
    let nn = loglik.len();
    let scale = LN_2 * dim as f64;

    let sem = if nn > 1 {
        let mean = loglik.mean();
        let var = loglik.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / (nn - 1) as f64;
        (var / nn as f64).sqrt() / scale
    } else {
        0.0
    };

    AisSummary {
        bits_per_dim: bits_per_dim(loglik, dim),
        sem,
    }
}

impl Isa {
    /// `ln p(x)` for every column
    pub fn loglikelihood(&self, data: &Mat, options: &LikelihoodOptions) -> anyhow::Result<DVec> {
        if self.is_complete() {
            return self.exact_loglikelihood(data);
        }
        let weights = self.ais_weights(data, options)?;
        Ok(logmeanexp_columns(&weights))
    }

    /// Average negative log-likelihood in bits per dimension
    pub fn evaluate(&self, data: &Mat, options: &LikelihoodOptions) -> anyhow::Result<f64> {
        let ll = self.loglikelihood(data, options)?;
        Ok(bits_per_dim(&ll, self.num_visibles()))
    }

    /// `-E(A⁻¹ x) - ln|det A|`
    fn exact_loglikelihood(&self, data: &Mat) -> anyhow::Result<DVec> {
        self.check_invariants()?;
        self.check_visible_rows(data)?;
        let hidden = self.least_norm_hidden(data)?;
        let log_det = self.log_abs_det_completed()?;
        let ret = -self.prior_energy(&hidden)?.add_scalar(log_det);
        check_finite(&ret, "log-likelihood")?;
        Ok(ret)
    }

    /// Log importance weights, `num_samples x N`. Each entry is an
    /// unbiased estimate of `p(x)` in log-space; complete models give
    /// the exact value in every row.
    pub fn ais_weights(&self, data: &Mat, options: &LikelihoodOptions) -> anyhow::Result<Mat> {
        self.check_invariants()?;
        self.check_visible_rows(data)?;
        check_finite(data, "AIS input")?;
        anyhow::ensure!(options.num_samples > 0, "AIS needs at least one sample");

        if self.is_complete() {
            let ll = self.exact_loglikelihood(data)?;
            return Ok(Mat::from_fn(options.num_samples, data.ncols(), |_, j| ll[j]));
        }

        let nv = self.num_visibles();
        let nh = self.num_hiddens();
        let nz = nh - nv;

        let var = self.prior_variances();
        let inv_var = var.map(|v| 1.0 / v);
        let log_norm_const: f64 = var.iter().map(|v| -0.5 * (2.0 * PI * v).ln()).sum();

        let winv = self.completed_inverse()?;
        let wx = winv.columns(0, nv).into_owned();
        let wz = winv.columns(nv, nz).into_owned();

        // base posterior over z: precision P and mean μ = M x
        let wz_scaled = Mat::from_fn(nh, nz, |i, k| wz[(i, k)] * inv_var[i]);
        let precision = wz.transpose() * &wz_scaled;
        let chol = precision
            .clone()
            .cholesky()
            .ok_or(anyhow::anyhow!("AIS base precision is not positive definite"))?;
        let mean_map = -chol.solve(&(wz_scaled.transpose() * &wx));
        let draw_map = chol
            .l()
            .transpose()
            .try_inverse()
            .ok_or(anyhow::anyhow!("AIS base precision is singular"))?;

        // Gaussian evidence N(x; 0, A D A')
        let aa = self.basis();
        let model_cov = aa * Mat::from_diagonal(&var) * aa.transpose();
        let cov_chol = model_cov
            .cholesky()
            .ok_or(anyhow::anyhow!("model covariance is not positive definite"))?;
        let cov_logdet: f64 = 2.0 * cov_chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();

        let ranges = self.subspace_ranges();
        let sampler = AisSampler {
            schedule: AisSchedule::linear(options.num_steps),
            num_transitions: options.num_transitions,
            seed: self.options.seed,
        };
        let num_samples = options.num_samples;

        let ret = map_over_columns(data, self.options.max_threads, |lb, block| {
            let mut out = Mat::zeros(num_samples, block.ncols());

            for j in 0..block.ncols() {
                let mut rng = SmallRng::seed_from_u64(column_seed(sampler.seed, lb + j));
                let xx = block.column(j).into_owned();
                let gaussian = {
                    let sol = cov_chol.solve(&xx);
                    -0.5 * xx.dot(&sol) - 0.5 * cov_logdet - 0.5 * nv as f64 * (2.0 * PI).ln()
                };

                let offset = &wx * &xx;
                let mu = &mean_map * &xx;
                let base = &offset + &wz * &mu;

                let log_ratio = |u: &DVec| -> f64 {
                    let ss = &base + &wz * u;
                    let mut ret = -log_norm_const;
                    for (gsm, &(lb, ub)) in self.subspaces().iter().zip(ranges.iter()) {
                        let block = ss.rows(lb, ub - lb);
                        ret += gsm.logdensity_sq(block.norm_squared());
                        ret += 0.5 * block.norm_squared() / var[lb];
                    }
                    ret
                };
                let prior_draw = |rng: &mut SmallRng| -> DVec {
                    let eps = DVec::from_fn(nz, |_, _| rng.sample::<f64, _>(StandardNormal));
                    &draw_map * eps
                };

                for i in 0..num_samples {
                    out[(i, j)] = gaussian + sampler.run_one(&log_ratio, &prior_draw, &mut rng);
                }
            }
            Ok(out)
        })?;

        check_finite(&ret, "AIS weights")?;

        if self.options.verbose {
            let summary = ais_summary(&ret, nv);
            info!(
                "AIS: {:.4} ± {:.4} bits/dim over {} data points",
                summary.bits_per_dim,
                summary.sem,
                data.ncols()
            );
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::{Gsm, GsmInit};
    use approx::assert_abs_diff_eq;
    use matrix_util::traits::SampleOps;

    #[test]
    fn complete_model_is_exact() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 2)?;
        isa.set_subspaces(vec![Gsm::standard_normal(1), Gsm::standard_normal(1)])?;
        isa.set_basis(Mat::identity(2, 2) * 2.0)?;

        let xx = Mat::from_column_slice(2, 1, &[1.0, -2.0]);
        let expected = -0.5 * (0.25 + 1.0) - (2.0 * PI).ln() - 2.0 * 2f64.ln();
        let ll = isa.loglikelihood(&xx, &LikelihoodOptions::default())?;
        assert_abs_diff_eq!(ll[0], expected, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn gaussian_priors_make_every_weight_exact() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 5)?;
        isa.initialize(None, GsmInit::Gaussian)?;
        let mut rng = SmallRng::seed_from_u64(4);
        isa.set_basis(Mat::rnorm_with(2, 5, &mut rng))?;

        let xx = Mat::rnorm_with(2, 6, &mut rng);
        let opts = LikelihoodOptions {
            num_samples: 3,
            num_steps: 4,
            num_transitions: 1,
        };
        let weights = isa.ais_weights(&xx, &opts)?;
        assert_eq!(weights.shape(), (3, 6));

        let cov = isa.basis() * isa.basis().transpose();
        let cov_inv = cov.clone().try_inverse().unwrap();
        let logdet = cov.determinant().ln();
        for j in 0..6 {
            let x = xx.column(j);
            let exact = -0.5 * (x.transpose() * &cov_inv * x)[0] - 0.5 * logdet - (2.0 * PI).ln();
            for i in 0..3 {
                assert_abs_diff_eq!(weights[(i, j)], exact, epsilon = 1e-8);
            }
        }
        Ok(())
    }

    #[test]
    fn ais_is_reproducible_and_finite() -> anyhow::Result<()> {
        let mut isa = Isa::with_subspace_size(2, 4, 2)?;
        isa.initialize(None, GsmInit::Laplace)?;
        let mut rng = SmallRng::seed_from_u64(10);
        let xx = isa.sample(8, &mut rng);

        let opts = LikelihoodOptions {
            num_samples: 4,
            num_steps: 10,
            num_transitions: 1,
        };
        let w1 = isa.ais_weights(&xx, &opts)?;
        let w2 = isa.ais_weights(&xx, &opts)?;
        assert_eq!(w1, w2);

        let summary = ais_summary(&w1, 2);
        assert!(summary.bits_per_dim.is_finite());
        assert!(summary.sem >= 0.0);
        Ok(())
    }

    #[test]
    fn ais_weights_do_not_depend_on_the_thread_count() -> anyhow::Result<()> {
        let mut isa = Isa::with_subspace_size(2, 4, 2)?;
        isa.initialize(None, GsmInit::Laplace)?;
        let mut rng = SmallRng::seed_from_u64(14);
        let xx = isa.sample(11, &mut rng);

        let opts = LikelihoodOptions {
            num_samples: 3,
            num_steps: 5,
            num_transitions: 1,
        };
        isa.options.max_threads = 1;
        let w1 = isa.ais_weights(&xx, &opts)?;
        isa.options.max_threads = 4;
        let w4 = isa.ais_weights(&xx, &opts)?;
        assert_eq!(w1, w4);
        Ok(())
    }

    #[test]
    fn summary_of_constant_weights_has_zero_error() {
        let weights = Mat::from_element(5, 4, -LN_2);
        let summary = ais_summary(&weights, 1);
        assert_abs_diff_eq!(summary.bits_per_dim, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.sem, 0.0, epsilon = 1e-12);
    }
}
