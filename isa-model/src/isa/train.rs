//! Training of the basis and the subspace priors.
//!
//! Every method alternates between guessing hidden states for the data
//! and updating the parameters given those states:
//!
//! * `Analytic`: closed-form least squares for the feature basis and
//!   the noise level, then EM on the priors
//! * `Sgd`: natural gradient steps with momentum on minibatches
//! * `Lbfgs`: Monte Carlo EM whose M-step runs L-BFGS over the feature
//!   basis and the log-scales
//! * `Of`: Olshausen-Field sparse coding with a Cauchy penalty and
//!   gain adaptation
//!
//! Noise columns of the basis are never changed by gradient updates.

use super::inference::{GibbsOptions, MapOptions};
use super::{Isa, Phase};
use crate::gsm::{Gsm, MIN_SCALE};
use crate::optim::{minimize, LbfgsSettings};
use crate::{DVec, Mat};
use log::{debug, info};
use matrix_util::{check_finite, check_finite_scalar};
use matrix_util::dmatrix_util::vstack;
use matrix_util::parallel::map_over_columns;
use matrix_util::traits::LinalgOps;
use matrix_util::utils::generate_minibatch_intervals;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Noise variance is never estimated below this
const MIN_NOISE_VAR: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainMethodKind {
    Analytic,
    Sgd,
    Lbfgs,
    Of,
}

/// How hidden states are filled in for the data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMethod {
    Gibbs,
    Map,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdParams {
    /// Minibatch updates. Default: 100
    pub max_iter: usize,
    /// Default: 0.001
    pub step_width: f64,
    /// Default: 0.8
    pub momentum: f64,
    /// Default: 100
    pub batch_size: usize,
    /// L2 penalty on the feature basis. Default: 0.0
    pub weight_decay: f64,
    /// Default: true
    pub train_basis: bool,
    /// Default: true
    pub train_prior: bool,
    /// EM iterations on the priors per update. Default: 1
    pub prior_em_iter: usize,
    /// Keep the hidden states between updates. Default: true
    pub persistent: bool,
    /// Default: Gibbs
    pub sampling_method: SamplingMethod,
    pub gibbs: GibbsOptions,
    pub map: MapOptions,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self {
            max_iter: 100,
            step_width: 0.001,
            momentum: 0.8,
            batch_size: 100,
            weight_decay: 0.0,
            train_basis: true,
            train_prior: true,
            prior_em_iter: 1,
            persistent: true,
            sampling_method: SamplingMethod::Gibbs,
            gibbs: GibbsOptions { num_steps: 2 },
            map: MapOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbfgsParams {
    /// EM iterations. Default: 10
    pub max_iter: usize,
    /// L-BFGS iterations per M-step. Default: 50
    pub max_fun: usize,
    /// L2 penalty on the feature basis. Default: 0.0
    pub weight_decay: f64,
    /// Default: true
    pub train_basis: bool,
    /// Default: true
    pub train_prior: bool,
    /// Default: true
    pub persistent: bool,
    /// Default: Gibbs
    pub sampling_method: SamplingMethod,
    pub gibbs: GibbsOptions,
    pub map: MapOptions,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            max_iter: 10,
            max_fun: 50,
            weight_decay: 0.0,
            train_basis: true,
            train_prior: true,
            persistent: true,
            sampling_method: SamplingMethod::Gibbs,
            gibbs: GibbsOptions::default(),
            map: MapOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticParams {
    /// Default: 10
    pub max_iter: usize,
    /// Ridge penalty on the feature basis. Default: 0.0
    pub weight_decay: f64,
    /// EM iterations on the priors per update. Default: 20
    pub prior_em_iter: usize,
    /// Default: true
    pub persistent: bool,
    pub gibbs: GibbsOptions,
}

impl Default for AnalyticParams {
    fn default() -> Self {
        Self {
            max_iter: 10,
            weight_decay: 0.0,
            prior_em_iter: 20,
            persistent: true,
            gibbs: GibbsOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfParams {
    /// Default: 100
    pub max_iter: usize,
    /// Variance of the reconstruction error. Default: 0.05
    pub noise_var: f64,
    /// Target variance of every coefficient. Default: 1.0
    pub var_goal: f64,
    /// Weight of the sparsity penalty. Default: 10.0
    pub beta: f64,
    /// Default: 0.01
    pub step_width: f64,
    /// Scale of the Cauchy penalty `ln(1 + (s / σ)²)`. Default: 0.5
    pub sigma: f64,
    /// Default: 100
    pub batch_size: usize,
    /// L-BFGS iterations per inferred code. Default: 50
    pub max_fun: usize,
}

impl Default for OfParams {
    fn default() -> Self {
        Self {
            max_iter: 100,
            noise_var: 0.05,
            var_goal: 1.0,
            beta: 10.0,
            step_width: 0.01,
            sigma: 0.5,
            batch_size: 100,
            max_fun: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrainMethod {
    Analytic(AnalyticParams),
    Sgd(SgdParams),
    Lbfgs(LbfgsParams),
    Of(OfParams),
}

impl TrainMethod {
    pub fn kind(&self) -> TrainMethodKind {
        match self {
            TrainMethod::Analytic(_) => TrainMethodKind::Analytic,
            TrainMethod::Sgd(_) => TrainMethodKind::Sgd,
            TrainMethod::Lbfgs(_) => TrainMethodKind::Lbfgs,
            TrainMethod::Of(_) => TrainMethodKind::Of,
        }
    }
}

impl Default for TrainMethod {
    fn default() -> Self {
        TrainMethod::Sgd(SgdParams::default())
    }
}

/// State that survives between calls to [`Isa::train_with_session`]
#[derive(Debug, Clone, Default)]
pub struct TrainingSession {
    /// Persistent hidden states, `H x N`
    pub chains: Option<Mat>,
    /// Momentum of the feature basis updates
    pub momentum: Option<Mat>,
    /// Sparse coding gains, one per feature
    pub of_gain: Option<DVec>,
    /// Running coefficient variances of sparse coding
    pub of_var: Option<DVec>,
    /// Updates done so far
    pub iteration: usize,
}

impl TrainingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored hidden states for columns `[lb, ub)`, if they match
    fn chain_block(&self, nh: usize, ntot: usize, lb: usize, ub: usize) -> Option<Mat> {
        self.chains
            .as_ref()
            .filter(|c| c.shape() == (nh, ntot))
            .map(|c| c.columns(lb, ub - lb).into_owned())
    }

    fn store_chain_block(&mut self, block: &Mat, ntot: usize, lb: usize) {
        let nh = block.nrows();
        let chains = self
            .chains
            .get_or_insert_with(|| Mat::zeros(nh, ntot));
        if chains.shape() != (nh, ntot) {
            *chains = Mat::zeros(nh, ntot);
        }
        chains.columns_mut(lb, block.ncols()).copy_from(block);
    }
}

/// Observer called after every update. It only ever sees the model
/// read-only; returning an error stops training.
pub trait TrainCallback {
    fn on_iteration(
        &mut self,
        kind: TrainMethodKind,
        model: &Isa,
        iteration: usize,
    ) -> anyhow::Result<()>;
}

impl<F> TrainCallback for F
where
    F: FnMut(TrainMethodKind, &Isa, usize) -> anyhow::Result<()>,
{
    fn on_iteration(
        &mut self,
        kind: TrainMethodKind,
        model: &Isa,
        iteration: usize,
    ) -> anyhow::Result<()> {
        self(kind, model, iteration)
    }
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub method: TrainMethodKind,
    pub iterations: usize,
    /// Objective after each update (lower is better)
    pub trace: Vec<f64>,
}

impl Isa {
    /// Train with a fresh session
    pub fn train(
        &mut self,
        data: &Mat,
        method: &TrainMethod,
        callback: Option<&mut dyn TrainCallback>,
    ) -> anyhow::Result<TrainReport> {
        let mut session = TrainingSession::new();
        self.train_with_session(data, method, &mut session, callback)
    }

    /// Train, reusing persistent chains and momentum from `session`
    pub fn train_with_session(
        &mut self,
        data: &Mat,
        method: &TrainMethod,
        session: &mut TrainingSession,
        mut callback: Option<&mut dyn TrainCallback>,
    ) -> anyhow::Result<TrainReport> {
        self.check_invariants()?;
        self.check_visible_rows(data)?;
        check_finite(data, "training data")?;
        anyhow::ensure!(data.ncols() > 0, "no training data");

        let kind = method.kind();
        self.set_phase(Phase::Training(kind));

        if self.options.verbose {
            info!(
                "training {:?} on {} data points of dimension {}",
                kind,
                data.ncols(),
                data.nrows()
            );
        }

        let mut trace = vec![];
        match method {
            TrainMethod::Analytic(params) => {
                for _ in 0..params.max_iter {
                    trace.push(self.analytic_update(data, params, session)?);
                    self.finish_update(kind, session, &trace, &mut callback)?;
                }
            }
            TrainMethod::Sgd(params) => {
                let batches = generate_minibatch_intervals(data.ncols(), params.batch_size);
                for _ in 0..params.max_iter {
                    let (lb, ub) = batches[session.iteration % batches.len()];
                    trace.push(self.sgd_update(data, lb, ub, params, session)?);
                    self.finish_update(kind, session, &trace, &mut callback)?;
                }
            }
            TrainMethod::Lbfgs(params) => {
                for _ in 0..params.max_iter {
                    trace.push(self.lbfgs_update(data, params, session)?);
                    self.finish_update(kind, session, &trace, &mut callback)?;
                }
            }
            TrainMethod::Of(params) => {
                let batches = generate_minibatch_intervals(data.ncols(), params.batch_size);
                for _ in 0..params.max_iter {
                    let (lb, ub) = batches[session.iteration % batches.len()];
                    trace.push(self.of_update(data, lb, ub, params, session)?);
                    self.finish_update(kind, session, &trace, &mut callback)?;
                }
            }
        }

        self.check_invariants()?;
        self.set_phase(Phase::Trained);

        Ok(TrainReport {
            method: kind,
            iterations: trace.len(),
            trace,
        })
    }

    fn finish_update(
        &self,
        kind: TrainMethodKind,
        session: &mut TrainingSession,
        trace: &[f64],
        callback: &mut Option<&mut dyn TrainCallback>,
    ) -> anyhow::Result<()> {
        session.iteration += 1;
        let objective = trace.last().copied().unwrap_or(f64::NAN);
        check_finite_scalar(objective, "training objective")?;

        if self.options.verbose {
            info!(
                "[{:?}] iteration {}: objective {:.6}",
                kind, session.iteration, objective
            );
        }
        if let Some(cb) = callback.as_mut() {
            cb.on_iteration(kind, self, session.iteration)?;
        }
        Ok(())
    }

    fn session_rng(&self, session: &TrainingSession) -> SmallRng {
        SmallRng::seed_from_u64(self.options.seed.wrapping_add(session.iteration as u64))
    }

    /// Hidden states for columns `[lb, ub)` of `data`, continuing the
    /// session's chains when `persistent` is set
    #[allow(clippy::too_many_arguments)]
    fn infer_hidden_block<R: Rng + ?Sized>(
        &self,
        data: &Mat,
        lb: usize,
        ub: usize,
        sampling: SamplingMethod,
        gibbs: &GibbsOptions,
        map: &MapOptions,
        persistent: bool,
        session: &mut TrainingSession,
        rng: &mut R,
    ) -> anyhow::Result<Mat> {
        let xx = data.columns(lb, ub - lb).into_owned();
        let init = if persistent {
            session.chain_block(self.num_hiddens(), data.ncols(), lb, ub)
        } else {
            None
        };

        let ss = match sampling {
            SamplingMethod::Gibbs => self.sample_posterior(&xx, init.as_ref(), gibbs, rng)?,
            SamplingMethod::Map => {
                let starts: Vec<Mat> = init.into_iter().collect();
                self.compute_map_with_starts(&xx, &starts, map)?
            }
        };

        if persistent {
            session.store_chain_block(&ss, data.ncols(), lb);
        }
        Ok(ss)
    }

    /// EM on the feature priors, each on its own rows of `hidden`
    fn fit_feature_priors(&mut self, hidden: &Mat, em_iter: usize) -> anyhow::Result<()> {
        let ranges = self.subspace_ranges();
        let nf = self.num_feature_subspaces();
        for (gsm, &(lb, ub)) in self.subspaces_mut()[..nf].iter_mut().zip(ranges.iter()) {
            let iters = gsm.train_em(&hidden.rows(lb, ub - lb).into_owned(), em_iter)?;
            debug!("prior EM on units [{}, {}) ran {} iterations", lb, ub, iters);
        }
        Ok(())
    }

    fn mean_prior_energy(&self, hidden: &Mat) -> anyhow::Result<f64> {
        Ok(self.prior_energy(hidden)?.mean())
    }

    fn analytic_update(
        &mut self,
        data: &Mat,
        params: &AnalyticParams,
        session: &mut TrainingSession,
    ) -> anyhow::Result<f64> {
        let mut rng = self.session_rng(session);
        let nn = data.ncols();
        let ss = self.infer_hidden_block(
            data,
            0,
            nn,
            SamplingMethod::Gibbs,
            &params.gibbs,
            &MapOptions::default(),
            params.persistent,
            session,
            &mut rng,
        )?;

        if self.has_noise() {
            let nf = self.num_features();
            let sf = ss.rows(0, nf).into_owned();
            let ridge = params.weight_decay * nn as f64 + 1e-10;
            let gram = &sf * sf.transpose() + Mat::identity(nf, nf) * ridge;
            let gram_inv = gram.checked_inverse()?;
            let features = data * sf.transpose() * gram_inv;

            let resid = data - &features * &sf;
            let noise_var = (resid.norm_squared() / resid.len() as f64).max(MIN_NOISE_VAR);

            self.set_feature_basis(&features)?;
            self.set_noise_std(noise_var.sqrt())?;
        }

        self.fit_feature_priors(&ss, params.prior_em_iter)?;
        self.mean_prior_energy(&ss)
    }

    fn sgd_update(
        &mut self,
        data: &Mat,
        lb: usize,
        ub: usize,
        params: &SgdParams,
        session: &mut TrainingSession,
    ) -> anyhow::Result<f64> {
        let mut rng = self.session_rng(session);
        let ss = self.infer_hidden_block(
            data,
            lb,
            ub,
            params.sampling_method,
            &params.gibbs,
            &params.map,
            params.persistent,
            session,
            &mut rng,
        )?;
        let nb = ss.ncols() as f64;

        if params.train_basis {
            let nf = self.num_features();
            let psi = self.prior_energy_gradient(&ss)?;
            let mut mm = psi * ss.transpose() / nb;
            mm -= Mat::identity(mm.nrows(), mm.ncols());
            let grad = (self.basis() * mm).columns(0, nf).into_owned()
                - self.feature_basis() * params.weight_decay;

            let velocity = match session.momentum.take() {
                Some(v) if v.shape() == grad.shape() => v * params.momentum + grad * params.step_width,
                _ => grad * params.step_width,
            };
            let features = self.feature_basis() + &velocity;
            session.momentum = Some(velocity);
            self.set_feature_basis(&features)?;
        }

        if params.train_prior {
            self.fit_feature_priors(&ss, params.prior_em_iter)?;
        }
        self.mean_prior_energy(&ss)
    }

    fn lbfgs_update(
        &mut self,
        data: &Mat,
        params: &LbfgsParams,
        session: &mut TrainingSession,
    ) -> anyhow::Result<f64> {
        let mut rng = self.session_rng(session);
        let ss = self.infer_hidden_block(
            data,
            0,
            data.ncols(),
            params.sampling_method,
            &params.gibbs,
            &params.map,
            params.persistent,
            session,
            &mut rng,
        )?;

        if !params.train_basis && !params.train_prior {
            return self.mean_prior_energy(&ss);
        }

        let problem = MStep::new(self, data, &ss, params)?;
        let settings = LbfgsSettings {
            max_iter: params.max_fun,
            ..Default::default()
        };
        let res = minimize(&|theta: &[f64]| problem.evaluate(theta), problem.init(), &settings)?;
        debug!(
            "M-step: {} L-BFGS iterations, objective {:.6}, converged {}",
            res.iterations, res.cost, res.converged
        );

        let (features, subspaces) = problem.unpack(&res.param);
        if params.train_basis {
            self.set_feature_basis(&features)?;
        }
        if params.train_prior {
            self.set_subspaces(subspaces)?;
        }
        Ok(res.cost)
    }

    fn of_update(
        &mut self,
        data: &Mat,
        lb: usize,
        ub: usize,
        params: &OfParams,
        session: &mut TrainingSession,
    ) -> anyhow::Result<f64> {
        const VAR_ETA: f64 = 0.01;
        const GAIN_ALPHA: f64 = 0.02;

        anyhow::ensure!(
            params.noise_var > 0.0 && params.sigma > 0.0,
            "sparse coding needs positive noise_var and sigma"
        );

        let nf = self.num_features();
        let xx = data.columns(lb, ub - lb).into_owned();
        let features = self.feature_basis();

        let gain = match session.of_gain.take() {
            Some(g) if g.len() == nf => g,
            _ => DVec::from_iterator(nf, features.column_iter().map(|c| c.norm())),
        };

        let ss = sparse_codes(&features, &xx, params, self.options.max_threads)?;
        let nb = ss.ncols() as f64;

        let resid = &xx - &features * &ss;
        let mut features = features + &resid * ss.transpose() * (params.step_width / nb);

        let var = match session.of_var.take() {
            Some(v) if v.len() == nf => v,
            _ => DVec::from_element(nf, params.var_goal),
        };

        let sq_mean = DVec::from_iterator(
            nf,
            ss.row_iter().map(|r| r.iter().map(|s| s * s).sum::<f64>() / nb),
        );
        let var = var * (1.0 - VAR_ETA) + sq_mean * VAR_ETA;
        let gain = gain.zip_map(&var, |g, v| g * (v / params.var_goal).powf(GAIN_ALPHA));

        for (mut col, &g) in features.column_iter_mut().zip(gain.iter()) {
            let norm = col.norm();
            if norm > 0.0 {
                col *= g / norm;
            }
        }
        check_finite(&features, "sparse coding basis")?;
        self.set_feature_basis(&features)?;

        session.of_gain = Some(gain);
        session.of_var = Some(var);

        let recon = resid.norm_squared() / (2.0 * params.noise_var) / nb;
        let sparsity = params.beta
            * ss.iter().map(|s| (1.0 + (s / params.sigma).powi(2)).ln()).sum::<f64>()
            / nb;
        Ok(recon + sparsity)
    }
}

/// MAP codes under the Cauchy sparse coding prior, one L-BFGS run per
/// column started from the least-norm solution
fn sparse_codes(
    features: &Mat,
    data: &Mat,
    params: &OfParams,
    max_threads: usize,
) -> anyhow::Result<Mat> {
    let nf = features.ncols();
    let init = features.right_pseudo_inverse()?;
    let settings = LbfgsSettings {
        max_iter: params.max_fun,
        ..Default::default()
    };
    let inv_sig2 = 1.0 / (params.sigma * params.sigma);

    map_over_columns(data, max_threads, |_, block| {
        let mut out = Mat::zeros(nf, block.ncols());
        for j in 0..block.ncols() {
            let xx = block.column(j).into_owned();
            let objective = |s: &[f64]| -> anyhow::Result<(f64, Vec<f64>)> {
                let ss = DVec::from_column_slice(s);
                let resid = &xx - features * &ss;
                let mut cost = resid.norm_squared() / (2.0 * params.noise_var);
                let mut grad = -(features.transpose() * &resid) / params.noise_var;
                for (i, &si) in s.iter().enumerate() {
                    let t = 1.0 + si * si * inv_sig2;
                    cost += params.beta * t.ln();
                    grad[i] += params.beta * 2.0 * si * inv_sig2 / t;
                }
                Ok((cost, grad.as_slice().to_vec()))
            };
            let s0 = (&init * &xx).as_slice().to_vec();
            let res = minimize(&objective, s0, &settings)?;
            out.set_column(j, &DVec::from_vec(res.param));
        }
        Ok(out)
    })
}

/// The M-step of Monte Carlo EM: maximize the average complete-data
/// log-likelihood of `ŷ = [x; B s]` under `Â = [A; B]` with `B` held
/// fixed, over the feature columns of `A` and the log-scales of the
/// feature priors
struct MStep<'a> {
    model: &'a Isa,
    targets: Mat,
    nullspace: Mat,
    ranges: Vec<(usize, usize)>,
    num_feature_subspaces: usize,
    weight_decay: f64,
    train_basis: bool,
    train_prior: bool,
}

impl<'a> MStep<'a> {
    fn new(model: &'a Isa, data: &Mat, hidden: &Mat, params: &LbfgsParams) -> anyhow::Result<Self> {
        let nullspace = model.nullspace_basis()?.clone();
        let targets = if nullspace.nrows() > 0 {
            vstack(&[data.clone(), &nullspace * hidden])?
        } else {
            data.clone()
        };
        Ok(Self {
            model,
            targets,
            nullspace,
            ranges: model.subspace_ranges(),
            num_feature_subspaces: model.num_feature_subspaces(),
            weight_decay: params.weight_decay,
            train_basis: params.train_basis,
            train_prior: params.train_prior,
        })
    }

    fn num_basis_params(&self) -> usize {
        if self.train_basis {
            self.model.num_visibles() * self.model.num_features()
        } else {
            0
        }
    }

    fn init(&self) -> Vec<f64> {
        let mut ret = vec![];
        if self.train_basis {
            ret.extend(self.model.feature_basis().iter().cloned());
        }
        if self.train_prior {
            for gsm in &self.model.subspaces()[..self.num_feature_subspaces] {
                ret.extend(gsm.scales.iter().map(|s| s.ln()));
            }
        }
        ret
    }

    fn unpack(&self, theta: &[f64]) -> (Mat, Vec<Gsm>) {
        let nv = self.model.num_visibles();
        let nf = self.model.num_features();
        let nb = self.num_basis_params();

        let features = if self.train_basis {
            Mat::from_column_slice(nv, nf, &theta[..nb])
        } else {
            self.model.feature_basis()
        };

        let mut subspaces = self.model.subspaces().to_vec();
        if self.train_prior {
            let mut pos = nb;
            for gsm in subspaces[..self.num_feature_subspaces].iter_mut() {
                let kk = gsm.num_scales();
                for (s, &ls) in gsm.scales.iter_mut().zip(theta[pos..pos + kk].iter()) {
                    *s = ls.exp().max(MIN_SCALE);
                }
                pos += kk;
            }
        }
        (features, subspaces)
    }

    /// Negative penalized objective and its gradient
    fn evaluate(&self, theta: &[f64]) -> anyhow::Result<(f64, Vec<f64>)> {
        let nv = self.model.num_visibles();
        let nh = self.model.num_hiddens();
        let nf = self.model.num_features();
        let nn = self.targets.ncols() as f64;

        let (features, subspaces) = self.unpack(theta);
        let mut completed = Mat::zeros(nh, nh);
        completed.view_mut((0, 0), (nv, nh)).copy_from(self.model.basis());
        completed.view_mut((0, 0), (nv, nf)).copy_from(&features);
        if self.nullspace.nrows() > 0 {
            completed
                .view_mut((nv, 0), (nh - nv, nh))
                .copy_from(&self.nullspace);
        }

        let inverse = completed.checked_inverse()?;
        let hidden = &inverse * &self.targets;
        let log_det = completed.log_abs_det()?;

        let mut loglik = 0.0;
        let mut psi = Mat::zeros(nh, hidden.ncols());
        let mut scale_grad = vec![];
        let mut penalty = 0.0;

        for (k, (gsm, &(lb, ub))) in subspaces.iter().zip(self.ranges.iter()).enumerate() {
            let block = hidden.rows(lb, ub - lb).into_owned();
            loglik += gsm.logdensity(&block)?.sum() / nn;
            if self.train_basis {
                psi.rows_mut(lb, ub - lb).copy_from(&gsm.energy_gradient(&block)?);
            }
            if self.train_prior && k < self.num_feature_subspaces {
                penalty -= gsm.log_scale_prior() / nn;
                let grad = gsm.mean_log_scale_gradient(&block)?
                    + gsm.log_scale_prior_gradient() / nn;
                scale_grad.extend(grad.iter().map(|g| -g));
            }
        }

        let mut cost = -(loglik - log_det) + penalty;
        let mut ret = Vec::with_capacity(theta.len());

        if self.train_basis {
            cost += 0.5 * self.weight_decay * features.norm_squared();
            let mut mm = psi * hidden.transpose() / nn;
            mm -= Mat::identity(nh, nh);
            let grad_full = inverse.transpose() * mm;
            let grad = -grad_full.view((0, 0), (nv, nf)).into_owned() + &features * self.weight_decay;
            ret.extend(grad.iter().cloned());
        }
        ret.extend(scale_grad);

        Ok((check_finite_scalar(cost, "M-step objective")?, ret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::GsmInit;
    use crate::isa::{IsaConfig, IsaOptions};
    use matrix_util::dmatrix_util::column_sq_norms;

    fn noisy(nv: usize, nh: usize) -> anyhow::Result<Isa> {
        let config = IsaConfig {
            noise: true,
            ..IsaConfig::new(nv, nh)
        };
        Isa::from_config(&config, IsaOptions::default())
    }

    #[test]
    fn m_step_gradient_matches_finite_differences() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 3)?;
        isa.initialize(None, GsmInit::Student)?;
        let mut rng = SmallRng::seed_from_u64(5);
        let xx = isa.sample(20, &mut rng);
        let ss = isa.sample_posterior(&xx, None, &GibbsOptions::default(), &mut rng)?;

        let params = LbfgsParams {
            weight_decay: 0.1,
            ..Default::default()
        };
        let problem = MStep::new(&isa, &xx, &ss, &params)?;
        let theta = problem.init();
        let (_, grad) = problem.evaluate(&theta)?;
        assert_eq!(grad.len(), theta.len());

        let h = 1e-6;
        for i in 0..theta.len() {
            let mut tp = theta.clone();
            let mut tm = theta.clone();
            tp[i] += h;
            tm[i] -= h;
            let fd = (problem.evaluate(&tp)?.0 - problem.evaluate(&tm)?.0) / (2.0 * h);
            assert!(
                (fd - grad[i]).abs() < 1e-4 * (1.0 + fd.abs()),
                "parameter {}: finite difference {} vs gradient {}",
                i,
                fd,
                grad[i]
            );
        }
        Ok(())
    }

    #[test]
    fn callback_sees_every_update() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 3)?;
        isa.initialize(None, GsmInit::Laplace)?;
        let mut rng = SmallRng::seed_from_u64(1);
        let xx = isa.sample(50, &mut rng);

        let mut seen = vec![];
        let mut cb = |kind: TrainMethodKind, model: &Isa, it: usize| -> anyhow::Result<()> {
            assert_eq!(model.phase(), Phase::Training(kind));
            seen.push(it);
            Ok(())
        };
        let method = TrainMethod::Sgd(SgdParams {
            max_iter: 3,
            batch_size: 20,
            ..Default::default()
        });
        let report = isa.train(&xx, &method, Some(&mut cb))?;

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(report.iterations, 3);
        assert_eq!(isa.phase(), Phase::Trained);
        Ok(())
    }

    #[test]
    fn failing_callback_stops_training() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 2)?;
        let mut rng = SmallRng::seed_from_u64(1);
        let xx = isa.sample(30, &mut rng);
        let mut cb = |_: TrainMethodKind, _: &Isa, _: usize| -> anyhow::Result<()> {
            anyhow::bail!("stop")
        };
        assert!(isa.train(&xx, &TrainMethod::default(), Some(&mut cb)).is_err());
        Ok(())
    }

    #[test]
    fn persistent_chains_are_kept_in_the_session() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 4)?;
        let mut rng = SmallRng::seed_from_u64(2);
        let xx = isa.sample(40, &mut rng);

        let mut session = TrainingSession::new();
        let method = TrainMethod::Sgd(SgdParams {
            max_iter: 2,
            batch_size: 20,
            ..Default::default()
        });
        isa.train_with_session(&xx, &method, &mut session, None)?;

        let chains = session.chains.as_ref().unwrap();
        assert_eq!(chains.shape(), (4, 40));
        assert_eq!(session.iteration, 2);
        assert!(session.momentum.is_some());
        Ok(())
    }

    #[test]
    fn analytic_training_estimates_the_noise_level() -> anyhow::Result<()> {
        let truth = {
            let mut m = noisy(3, 3)?;
            m.set_noise_std(0.3)?;
            m
        };
        let mut rng = SmallRng::seed_from_u64(7);
        let xx = truth.sample(2_000, &mut rng);

        let mut isa = noisy(3, 3)?;
        isa.initialize(Some(&xx), GsmInit::Laplace)?;
        let method = TrainMethod::Analytic(AnalyticParams {
            max_iter: 5,
            ..Default::default()
        });
        isa.train(&xx, &method, None)?;

        let std = isa.noise_std().unwrap();
        assert!(std > 0.0 && std < 1.0, "noise std {}", std);
        Ok(())
    }

    #[test]
    fn sparse_coding_keeps_gains_on_the_columns() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 4)?;
        let mut rng = SmallRng::seed_from_u64(3);
        let xx = isa.sample(30, &mut rng);

        let mut session = TrainingSession::new();
        let method = TrainMethod::Of(OfParams {
            max_iter: 2,
            batch_size: 15,
            ..Default::default()
        });
        isa.train_with_session(&xx, &method, &mut session, None)?;

        let gain = session.of_gain.as_ref().unwrap();
        let norms = column_sq_norms(isa.basis()).map(f64::sqrt);
        for (g, n) in gain.iter().zip(norms.iter()) {
            assert!((g - n).abs() < 1e-10);
        }
        Ok(())
    }
}
