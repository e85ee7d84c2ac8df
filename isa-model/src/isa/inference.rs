//! Posterior sampling and MAP inference of the hidden causes.

use super::Isa;
use crate::gsm::sample_index;
use crate::optim::{minimize, LbfgsSettings};
use crate::{DVec, Mat};
use log::debug;
use matrix_util::check_finite;
use matrix_util::dmatrix_util::{logsumexp, vstack};
use matrix_util::parallel::{column_seed, map_over_columns};
use matrix_util::traits::LinalgOps;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GibbsOptions {
    /// Sweeps over (scale indices, hidden units). Default: 10
    pub num_steps: usize,
}

impl Default for GibbsOptions {
    fn default() -> Self {
        Self { num_steps: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapOptions {
    /// Gradient norm tolerance. Default: 1e-8
    pub tol: f64,
    /// Iteration cap per start. Default: 100
    pub max_iter: usize,
    /// Extra starts drawn from the posterior. Default: 2
    pub num_restarts: usize,
    /// Gibbs sweeps per extra start. Default: 5
    pub gibbs_steps: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            max_iter: 100,
            num_restarts: 2,
            gibbs_steps: 5,
        }
    }
}

impl Isa {
    /// Least-norm hidden states `A⁺ x`
    pub fn least_norm_hidden(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.check_visible_rows(data)?;
        if self.is_complete() {
            return Ok(self.basis().checked_inverse()? * data);
        }
        Ok(self.basis().right_pseudo_inverse()? * data)
    }

    /// Blocked Gibbs sampling of `p(s | x)`.
    ///
    /// Each sweep draws the scale index of every subspace given `s`,
    /// then `s` given the scales by exact Gaussian conditioning on
    /// `A s = x`. Chains start from `init` (`H x N`) or from `A⁺ x`.
    pub fn sample_posterior<R: Rng + ?Sized>(
        &self,
        data: &Mat,
        init: Option<&Mat>,
        options: &GibbsOptions,
        rng: &mut R,
    ) -> anyhow::Result<Mat> {
        self.check_invariants()?;
        self.check_visible_rows(data)?;
        check_finite(data, "posterior sampling input")?;

        if self.is_complete() {
            return self.least_norm_hidden(data);
        }

        let init = match init {
            Some(init) => {
                anyhow::ensure!(
                    init.shape() == (self.num_hiddens(), data.ncols()),
                    "initial hidden states must be {} x {}",
                    self.num_hiddens(),
                    data.ncols()
                );
                init.clone()
            }
            None => self.least_norm_hidden(data)?,
        };

        let nv = self.num_visibles();
        let nh = self.num_hiddens();
        let stacked = vstack(&[data.clone(), init])?;
        let base_seed: u64 = rng.random();

        // one chain per column, seeded by its global index
        let ret = map_over_columns(&stacked, self.options.max_threads, |lb, block| {
            let mut out = Mat::zeros(nh, block.ncols());
            for j in 0..block.ncols() {
                let mut rng = SmallRng::seed_from_u64(column_seed(base_seed, lb + j));
                let xx = block.view((0, j), (nv, 1)).into_owned();
                let mut ss = block.view((nv, j), (nh, 1)).into_owned();
                for _ in 0..options.num_steps {
                    ss = self.gibbs_sweep(&xx, &ss, &mut rng)?;
                }
                out.set_column(j, &ss.column(0));
            }
            Ok(out)
        })?;

        check_finite(&ret, "posterior samples")?;
        Ok(ret)
    }

    fn gibbs_sweep(&self, xx: &Mat, ss: &Mat, rng: &mut SmallRng) -> anyhow::Result<Mat> {
        let nh = self.num_hiddens();
        let ranges = self.subspace_ranges();
        let aa = self.basis();
        let mut ret = Mat::zeros(nh, ss.ncols());

        for j in 0..ss.ncols() {
            let mut var = DVec::zeros(nh);
            for (gsm, &(lb, ub)) in self.subspaces().iter().zip(ranges.iter()) {
                let sq = ss.column(j).rows(lb, ub - lb).norm_squared();
                let log_joint = gsm.component_log_joint(sq);
                let lz = logsumexp(&log_joint);
                let probs: Vec<f64> = log_joint.iter().map(|l| (l - lz).exp()).collect();
                let k = sample_index(&probs, rng.random::<f64>());
                let s = gsm.scales[k];
                var.rows_mut(lb, ub - lb).fill(s * s);
            }

            let s0 = DVec::from_fn(nh, |i, _| {
                var[i].sqrt() * rng.sample::<f64, _>(StandardNormal)
            });

            let mut ad = aa.clone();
            for (mut col, v) in ad.column_iter_mut().zip(var.iter()) {
                col *= *v;
            }
            let gram = &ad * aa.transpose();
            let resid = xx.column(j) - aa * &s0;
            let chol = gram
                .cholesky()
                .ok_or(anyhow::anyhow!("posterior covariance is singular"))?;
            let sol = chol.solve(&resid);

            ret.set_column(j, &(s0 + ad.transpose() * sol));
        }
        Ok(ret)
    }

    /// MAP hidden states, `argmin_s E(s)` subject to `A s = x`
    pub fn compute_map(&self, data: &Mat, options: &MapOptions) -> anyhow::Result<Mat> {
        self.compute_map_with_starts(data, &[], options)
    }

    /// Like [`Isa::compute_map`] with extra starting points (`H x N`
    /// each). The result is never worse than any start.
    ///
    /// The search runs over null space coordinates `z` with
    /// `s = A⁺ x + B' z`, so the constraint holds exactly throughout.
    pub fn compute_map_with_starts(
        &self,
        data: &Mat,
        starts: &[Mat],
        options: &MapOptions,
    ) -> anyhow::Result<Mat> {
        self.check_invariants()?;
        self.check_visible_rows(data)?;
        check_finite(data, "MAP input")?;

        if self.is_complete() {
            return self.least_norm_hidden(data);
        }

        let nv = self.num_visibles();
        let nh = self.num_hiddens();
        let nz = nh - nv;
        let nn = data.ncols();

        let winv = self.completed_inverse()?;
        let wx = winv.columns(0, nv).into_owned();
        let wz = winv.columns(nv, nz).into_owned();
        let null_rows = self.nullspace_basis()?.clone();

        let mut z_starts = vec![Mat::zeros(nz, nn)];
        for s in starts {
            anyhow::ensure!(
                s.shape() == (nh, nn),
                "starting points must be {} x {}",
                nh,
                nn
            );
            z_starts.push(&null_rows * s);
        }

        let mut rng = SmallRng::seed_from_u64(self.options.seed);
        let gibbs = GibbsOptions {
            num_steps: options.gibbs_steps,
        };
        for _ in 0..options.num_restarts {
            let ss = self.sample_posterior(data, None, &gibbs, &mut rng)?;
            z_starts.push(&null_rows * ss);
        }

        let num_starts = z_starts.len();
        let mut blocks = vec![data.clone()];
        blocks.extend(z_starts);
        let stacked = vstack(&blocks)?;

        let settings = LbfgsSettings {
            max_iter: options.max_iter,
            tol_grad: options.tol,
            ..Default::default()
        };

        let ret = map_over_columns(&stacked, self.options.max_threads, |_, block| {
            let mut out = Mat::zeros(nh, block.ncols());

            for j in 0..block.ncols() {
                let offset = &wx * block.column(j).rows(0, nv);

                let objective = |z: &[f64]| -> anyhow::Result<(f64, Vec<f64>)> {
                    let ss = &offset + &wz * DVec::from_column_slice(z);
                    let ss = Mat::from_column_slice(nh, 1, ss.as_slice());
                    let energy = self.prior_energy(&ss)?[0];
                    let grad = wz.transpose() * self.prior_energy_gradient(&ss)?;
                    Ok((energy, grad.as_slice().to_vec()))
                };

                let mut best: Option<(f64, Vec<f64>)> = None;
                for r in 0..num_starts {
                    let z0 = block.column(j).rows(nv + r * nz, nz).iter().cloned().collect();
                    let res = minimize(&objective, z0, &settings)?;
                    if !res.converged {
                        debug!(
                            "MAP start {} stopped after {} iterations without converging",
                            r, res.iterations
                        );
                    }
                    if best.as_ref().is_none_or(|(c, _)| res.cost < *c) {
                        best = Some((res.cost, res.param));
                    }
                }

                if let Some((_, z)) = best {
                    let ss = &offset + &wz * DVec::from_vec(z);
                    out.set_column(j, &ss);
                }
            }
            Ok(out)
        })?;

        check_finite(&ret, "MAP estimate")?;
        Ok(ret)
    }
}
