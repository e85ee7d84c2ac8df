//! Independent subspace analysis, `x = A s`.
//!
//! `A` is `V x H` with full row rank. Hidden units are split into
//! contiguous subspaces, each owning one [`Gsm`]. With `noise = true`
//! another `V` standard normal units are appended and `A` becomes
//! `[A_features | σ I]`, so observation noise is just more hidden
//! causes and every routine below handles it without special cases.
//!
//! For `H > V` the basis is completed to `Â = [A; B]` with rows `B`
//! spanning the null space of `A`. `B` is derived from `A` on demand
//! and dropped whenever `A` changes.

mod inference;
mod likelihood;
mod subspaces;
mod train;

pub use inference::{GibbsOptions, MapOptions};
pub use likelihood::{ais_summary, loglik_summary, AisSummary, LikelihoodOptions};
pub use subspaces::MergeReport;
pub use train::{
    AnalyticParams, LbfgsParams, OfParams, SamplingMethod, SgdParams, TrainCallback,
    TrainMethod, TrainMethodKind, TrainReport, TrainingSession,
};

use crate::gsm::{Gsm, GsmInit};
use crate::traits::Distribution;
use crate::{DVec, Mat};
use log::info;
use matrix_util::dmatrix_linalg::symmetric_eigen_sorted;
use matrix_util::dmatrix_util::vstack;
use matrix_util::traits::{LinalgOps, MatOps, SampleOps};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Where the model is in its life cycle. Only explicit calls to
/// `initialize` and `train` move it forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Uninitialized,
    Initialized,
    Training(TrainMethodKind),
    Trained,
}

/// Run-time settings shared by every routine of a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsaOptions {
    /// Column blocks for parallel work (0 = one per CPU). Results do
    /// not depend on it. Default: 0
    pub max_threads: usize,
    /// Seed for every random choice the model makes. Default: 42
    pub seed: u64,
    /// Log per-iteration summaries at `info` level. Default: false
    pub verbose: bool,
}

impl Default for IsaOptions {
    fn default() -> Self {
        Self {
            max_threads: 0,
            seed: 42,
            verbose: false,
        }
    }
}

/// Shape of a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsaConfig {
    pub num_visibles: usize,
    /// Number of feature units (noise units not included)
    pub num_hiddens: usize,
    /// Size of every subspace; must divide `num_hiddens`. Default: 1
    pub subspace_size: usize,
    /// Components per GSM. Default: 10
    pub num_scales: usize,
    /// Append `num_visibles` Gaussian noise units. Default: false
    pub noise: bool,
}

impl IsaConfig {
    pub fn new(num_visibles: usize, num_hiddens: usize) -> Self {
        Self {
            num_visibles,
            num_hiddens,
            subspace_size: 1,
            num_scales: 10,
            noise: false,
        }
    }
}

const INITIAL_NOISE_STD: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Isa {
    num_visibles: usize,
    num_features: usize,
    noise: bool,
    basis: Mat,
    subspaces: Vec<Gsm>,
    phase: Phase,
    pub options: IsaOptions,
    /// Settings used by the [`crate::Distribution`] interface
    pub train_method: TrainMethod,
    pub eval_options: LikelihoodOptions,
    #[serde(skip)]
    nullspace: OnceLock<Mat>,
}

impl Isa {
    pub fn from_config(config: &IsaConfig, options: IsaOptions) -> anyhow::Result<Self> {
        let IsaConfig {
            num_visibles: nv,
            num_hiddens: nf,
            subspace_size,
            num_scales,
            noise,
        } = *config;

        anyhow::ensure!(nv > 0, "at least one visible unit is required");
        anyhow::ensure!(
            nf >= nv,
            "{} hidden units cannot explain {} visible units",
            nf,
            nv
        );
        anyhow::ensure!(
            subspace_size > 0 && nf % subspace_size == 0,
            "subspace size {} does not divide {} hidden units",
            subspace_size,
            nf
        );

        let mut rng = SmallRng::seed_from_u64(options.seed);
        let features = Mat::rnorm_with(nv, nf, &mut rng).orthogonalize_rows()?;

        let mut subspaces: Vec<Gsm> = (0..nf / subspace_size)
            .map(|_| Gsm::new(subspace_size, num_scales))
            .collect();

        let basis = if noise {
            subspaces.extend((0..nv).map(|_| Gsm::standard_normal(1)));
            let mut aa = Mat::zeros(nv, nf + nv);
            aa.columns_mut(0, nf).copy_from(&features);
            aa.columns_mut(nf, nv)
                .copy_from(&(Mat::identity(nv, nv) * INITIAL_NOISE_STD));
            aa
        } else {
            features
        };

        let ret = Self {
            num_visibles: nv,
            num_features: nf,
            noise,
            basis,
            subspaces,
            phase: Phase::Uninitialized,
            options,
            train_method: TrainMethod::default(),
            eval_options: LikelihoodOptions::default(),
            nullspace: OnceLock::new(),
        };
        ret.check_invariants()?;
        Ok(ret)
    }

    /// One-dimensional subspaces
    pub fn new(num_visibles: usize, num_hiddens: usize) -> anyhow::Result<Self> {
        Self::from_config(
            &IsaConfig::new(num_visibles, num_hiddens),
            IsaOptions::default(),
        )
    }

    pub fn with_subspace_size(
        num_visibles: usize,
        num_hiddens: usize,
        subspace_size: usize,
    ) -> anyhow::Result<Self> {
        Self::from_config(
            &IsaConfig {
                subspace_size,
                ..IsaConfig::new(num_visibles, num_hiddens)
            },
            IsaOptions::default(),
        )
    }

    pub fn num_visibles(&self) -> usize {
        self.num_visibles
    }

    /// All hidden units, noise units included
    pub fn num_hiddens(&self) -> usize {
        self.basis.ncols()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn has_noise(&self) -> bool {
        self.noise
    }

    pub fn is_complete(&self) -> bool {
        self.num_hiddens() == self.num_visibles
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn basis(&self) -> &Mat {
        &self.basis
    }

    /// The columns of `A` that belong to feature units
    pub fn feature_basis(&self) -> Mat {
        self.basis.columns(0, self.num_features).into_owned()
    }

    /// Replace the whole filter matrix
    pub fn set_basis(&mut self, basis: Mat) -> anyhow::Result<()> {
        anyhow::ensure!(
            basis.shape() == self.basis.shape(),
            "basis must be {} x {}, got {} x {}",
            self.basis.nrows(),
            self.basis.ncols(),
            basis.nrows(),
            basis.ncols()
        );
        matrix_util::check_finite(&basis, "basis")?;
        basis.right_pseudo_inverse()?;
        self.basis = basis;
        self.nullspace = OnceLock::new();
        Ok(())
    }

    /// Replace the feature columns, keeping the noise columns
    pub fn set_feature_basis(&mut self, features: &Mat) -> anyhow::Result<()> {
        anyhow::ensure!(
            features.shape() == (self.num_visibles, self.num_features),
            "feature basis must be {} x {}",
            self.num_visibles,
            self.num_features
        );
        let mut basis = self.basis.clone();
        basis.columns_mut(0, self.num_features).copy_from(features);
        self.set_basis(basis)
    }

    /// Standard deviation of the observation noise, if modelled
    pub fn noise_std(&self) -> Option<f64> {
        self.noise.then(|| self.basis[(0, self.num_features)])
    }

    pub fn set_noise_std(&mut self, std: f64) -> anyhow::Result<()> {
        anyhow::ensure!(self.noise, "model has no noise units");
        anyhow::ensure!(
            std > 0.0 && std.is_finite(),
            "noise standard deviation must be positive"
        );
        let mut basis = self.basis.clone();
        basis
            .columns_mut(self.num_features, self.num_visibles)
            .copy_from(&(Mat::identity(self.num_visibles, self.num_visibles) * std));
        self.set_basis(basis)
    }

    pub fn subspaces(&self) -> &[Gsm] {
        &self.subspaces
    }

    /// Mutable access to the priors. The partition itself is checked
    /// again by every routine that relies on it.
    pub fn subspaces_mut(&mut self) -> &mut [Gsm] {
        &mut self.subspaces
    }

    /// Replace the partition and its priors
    pub fn set_subspaces(&mut self, subspaces: Vec<Gsm>) -> anyhow::Result<()> {
        let old = std::mem::replace(&mut self.subspaces, subspaces);
        if let Err(e) = self.check_invariants() {
            self.subspaces = old;
            return Err(e);
        }
        self.nullspace = OnceLock::new();
        Ok(())
    }

    /// Number of subspaces made of feature units
    pub fn num_feature_subspaces(&self) -> usize {
        self.subspaces.len() - if self.noise { self.num_visibles } else { 0 }
    }

    /// `[lb, ub)` row ranges of the subspaces in hidden space
    pub fn subspace_ranges(&self) -> Vec<(usize, usize)> {
        let mut lb = 0;
        self.subspaces
            .iter()
            .map(|gsm| {
                let ret = (lb, lb + gsm.dim());
                lb += gsm.dim();
                ret
            })
            .collect()
    }

    pub fn check_invariants(&self) -> anyhow::Result<()> {
        let nh = self.num_hiddens();
        anyhow::ensure!(
            self.basis.nrows() == self.num_visibles,
            "basis has {} rows for {} visible units",
            self.basis.nrows(),
            self.num_visibles
        );
        anyhow::ensure!(
            nh >= self.num_visibles,
            "fewer hidden units than visible units"
        );
        anyhow::ensure!(
            nh == self.num_features + if self.noise { self.num_visibles } else { 0 },
            "basis has {} columns but the model has {} hidden units",
            nh,
            self.num_features
        );
        let tot: usize = self.subspaces.iter().map(|g| g.dim()).sum();
        anyhow::ensure!(
            tot == nh,
            "subspace dimensions sum to {} instead of {}",
            tot,
            nh
        );
        if self.noise {
            anyhow::ensure!(
                self.subspaces[self.num_feature_subspaces()..]
                    .iter()
                    .all(|g| g.dim() == 1),
                "noise units must stay in one-dimensional subspaces"
            );
        }
        for gsm in &self.subspaces {
            gsm.validate()?;
        }
        Ok(())
    }

    /// Rows spanning the null space of `A`, `(H - V) x H`
    pub fn nullspace_basis(&self) -> anyhow::Result<&Mat> {
        if let Some(ret) = self.nullspace.get() {
            return Ok(ret);
        }
        let computed = self.basis.nullspace_rows()?;
        Ok(self.nullspace.get_or_init(|| computed))
    }

    /// `Â = [A; B]`
    pub fn completed_basis(&self) -> anyhow::Result<Mat> {
        if self.is_complete() {
            return Ok(self.basis.clone());
        }
        vstack(&[self.basis.clone(), self.nullspace_basis()?.clone()])
    }

    /// `Â^{-1} = [A⁺, B']`, valid because `B` is orthonormal and
    /// orthogonal to the rows of `A`
    pub fn completed_inverse(&self) -> anyhow::Result<Mat> {
        if self.is_complete() {
            return self.basis.checked_inverse();
        }
        let nv = self.num_visibles;
        let nh = self.num_hiddens();
        let mut ret = Mat::zeros(nh, nh);
        ret.columns_mut(0, nv)
            .copy_from(&self.basis.right_pseudo_inverse()?);
        ret.columns_mut(nv, nh - nv)
            .copy_from(&self.nullspace_basis()?.transpose());
        Ok(ret)
    }

    /// `log|det Â| = ½ log det(A A')`
    pub fn log_abs_det_completed(&self) -> anyhow::Result<f64> {
        if self.is_complete() {
            return self.basis.log_abs_det();
        }
        let gram = &self.basis * self.basis.transpose();
        let chol = gram
            .cholesky()
            .ok_or(anyhow::anyhow!("basis does not have full row rank"))?;
        Ok(chol.l().diagonal().iter().map(|d| d.ln()).sum())
    }

    /// Per-unit prior variances, `Σ_k w_k s_k²` of the owning GSM
    pub fn prior_variances(&self) -> DVec {
        let mut ret = DVec::zeros(self.num_hiddens());
        for (gsm, (lb, ub)) in self.subspaces.iter().zip(self.subspace_ranges()) {
            let var = gsm.variance();
            ret.rows_mut(lb, ub - lb).fill(var);
        }
        ret
    }

    fn check_hidden_rows(&self, hidden: &Mat) -> anyhow::Result<()> {
        anyhow::ensure!(
            hidden.nrows() == self.num_hiddens(),
            "expected {} hidden units, got {} rows",
            self.num_hiddens(),
            hidden.nrows()
        );
        Ok(())
    }

    pub(crate) fn check_visible_rows(&self, data: &Mat) -> anyhow::Result<()> {
        anyhow::ensure!(
            data.nrows() == self.num_visibles,
            "expected {} visible units, got {} rows",
            self.num_visibles,
            data.nrows()
        );
        Ok(())
    }

    /// Negative log-density of the factorial prior, summed over subspaces
    pub fn prior_energy(&self, hidden: &Mat) -> anyhow::Result<DVec> {
        self.check_hidden_rows(hidden)?;
        let mut ret = DVec::zeros(hidden.ncols());
        for (gsm, (lb, ub)) in self.subspaces.iter().zip(self.subspace_ranges()) {
            ret += gsm.energy(&hidden.rows(lb, ub - lb).into_owned())?;
        }
        Ok(ret)
    }

    pub fn prior_energy_gradient(&self, hidden: &Mat) -> anyhow::Result<Mat> {
        self.check_hidden_rows(hidden)?;
        let mut ret = Mat::zeros(hidden.nrows(), hidden.ncols());
        for (gsm, (lb, ub)) in self.subspaces.iter().zip(self.subspace_ranges()) {
            let grad = gsm.energy_gradient(&hidden.rows(lb, ub - lb).into_owned())?;
            ret.rows_mut(lb, ub - lb).copy_from(&grad);
        }
        Ok(ret)
    }

    /// Exact draws from the factorial prior, `H x n`
    pub fn sample_prior<R: Rng + ?Sized>(&self, num_samples: usize, rng: &mut R) -> Mat {
        let mut ret = Mat::zeros(self.num_hiddens(), num_samples);
        for (gsm, (lb, ub)) in self.subspaces.iter().zip(self.subspace_ranges()) {
            ret.rows_mut(lb, ub - lb)
                .copy_from(&gsm.sample(num_samples, rng));
        }
        ret
    }

    /// Draws from the model, noise included when modelled, `V x n`
    pub fn sample<R: Rng + ?Sized>(&self, num_samples: usize, rng: &mut R) -> Mat {
        &self.basis * self.sample_prior(num_samples, rng)
    }

    /// Set the priors by a named heuristic and, when data is given,
    /// the basis so that the model covariance matches the data's,
    /// `A = U (Λ - σ²)^{1/2} Q` with orthonormal rows `Q`
    pub fn initialize(&mut self, data: Option<&Mat>, method: GsmInit) -> anyhow::Result<()> {
        let nf = self.num_feature_subspaces();
        for gsm in self.subspaces[..nf].iter_mut() {
            gsm.initialize_with(method);
        }

        if let Some(data) = data {
            self.check_visible_rows(data)?;
            matrix_util::check_finite(data, "initialization data")?;

            let (values, vectors) = symmetric_eigen_sorted(&data.row_covariance());
            let min_value = values.min();
            anyhow::ensure!(
                min_value > 0.0,
                "data covariance is not positive definite"
            );

            let noise_var = if self.noise {
                let var = (INITIAL_NOISE_STD * INITIAL_NOISE_STD).min(0.5 * min_value);
                self.set_noise_std(var.sqrt())?;
                var
            } else {
                0.0
            };

            let mut rng = SmallRng::seed_from_u64(self.options.seed);
            let qq = Mat::rnorm_with(self.num_visibles, self.num_features, &mut rng)
                .orthogonalize_rows()?;
            let scale = Mat::from_diagonal(&values.map(|v| (v - noise_var).sqrt()));
            self.set_feature_basis(&(vectors * scale * qq))?;
        }

        self.check_invariants()?;
        self.phase = Phase::Initialized;

        if self.options.verbose {
            info!(
                "initialized {} x {} ISA with {} subspaces",
                self.num_visibles,
                self.num_hiddens(),
                self.subspaces.len()
            );
        }
        Ok(())
    }

    /// Symmetric orthogonalization of the feature rows,
    /// `A ← (A A')^{-1/2} A`
    pub fn orthogonalize(&mut self) -> anyhow::Result<()> {
        let features = self.feature_basis().orthogonalize_rows()?;
        self.set_feature_basis(&features)
    }
}

impl Distribution for Isa {
    fn dim(&self) -> usize {
        self.num_visibles
    }

    fn initialize(&mut self, data: &Mat) -> anyhow::Result<()> {
        Isa::initialize(self, Some(data), GsmInit::Laplace)
    }

    fn train(&mut self, data: &Mat) -> anyhow::Result<()> {
        let method = self.train_method.clone();
        Isa::train(self, data, &method, None)?;
        Ok(())
    }

    fn sample(&self, num_samples: usize, rng: &mut dyn RngCore) -> anyhow::Result<Mat> {
        Ok(Isa::sample(self, num_samples, rng))
    }

    fn loglikelihood(&self, data: &Mat, _rng: &mut dyn RngCore) -> anyhow::Result<DVec> {
        Isa::loglikelihood(self, data, &self.eval_options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn construction_checks_shapes() {
        assert!(Isa::new(4, 3).is_err());
        assert!(Isa::with_subspace_size(2, 5, 2).is_err());

        let isa = Isa::with_subspace_size(3, 6, 2).unwrap();
        assert_eq!(isa.subspaces().len(), 3);
        assert_eq!(isa.subspace_ranges(), vec![(0, 2), (2, 4), (4, 6)]);
        assert_eq!(isa.phase(), Phase::Uninitialized);
    }

    #[test]
    fn noise_units_are_appended() -> anyhow::Result<()> {
        let config = IsaConfig {
            noise: true,
            ..IsaConfig::new(2, 3)
        };
        let isa = Isa::from_config(&config, IsaOptions::default())?;
        assert_eq!(isa.num_hiddens(), 5);
        assert_eq!(isa.num_features(), 3);
        assert_eq!(isa.num_feature_subspaces(), 3);
        assert_abs_diff_eq!(isa.noise_std().unwrap(), INITIAL_NOISE_STD);
        Ok(())
    }

    #[test]
    fn completed_inverse_inverts_completed_basis() -> anyhow::Result<()> {
        let isa = Isa::with_subspace_size(3, 7, 1)?;
        let full = isa.completed_basis()?;
        let inv = isa.completed_inverse()?;
        assert_abs_diff_eq!(&full * &inv, Mat::identity(7, 7), epsilon = 1e-10);
        assert_abs_diff_eq!(
            isa.log_abs_det_completed()?,
            full.log_abs_det()?,
            epsilon = 1e-10
        );
        Ok(())
    }

    #[test]
    fn nullspace_is_refreshed_after_basis_change() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 4)?;
        let before = isa.nullspace_basis()?.clone();

        let mut rng = SmallRng::seed_from_u64(5);
        isa.set_basis(Mat::rnorm_with(2, 4, &mut rng))?;
        let after = isa.nullspace_basis()?.clone();

        assert!((before - &after).norm() > 1e-6);
        assert_abs_diff_eq!(isa.basis() * after.transpose(), Mat::zeros(2, 2), epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn bad_partitions_are_refused() -> anyhow::Result<()> {
        let mut isa = Isa::new(2, 4)?;
        assert!(isa
            .set_subspaces(vec![Gsm::new(2, 3), Gsm::new(1, 3)])
            .is_err());
        assert_eq!(isa.subspaces().len(), 4);
        isa.set_subspaces(vec![Gsm::new(3, 3), Gsm::new(1, 3)])?;
        assert_eq!(isa.subspace_ranges(), vec![(0, 3), (3, 4)]);
        Ok(())
    }

    #[test]
    fn data_initialization_matches_covariance() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(8);
        let mixing = Mat::rnorm_with(3, 3, &mut rng);
        let xx = mixing * Mat::rnorm_with(3, 400, &mut rng);

        let mut isa = Isa::new(3, 6)?;
        isa.initialize(Some(&xx), GsmInit::Laplace)?;

        let model_cov = isa.basis() * isa.basis().transpose();
        assert_abs_diff_eq!(model_cov, xx.row_covariance(), epsilon = 1e-8);
        assert_eq!(isa.phase(), Phase::Initialized);
        Ok(())
    }

    #[test]
    fn orthogonalize_gives_orthonormal_rows() -> anyhow::Result<()> {
        let mut isa = Isa::new(3, 5)?;
        let mut rng = SmallRng::seed_from_u64(1);
        isa.set_basis(Mat::rnorm_with(3, 5, &mut rng))?;
        isa.orthogonalize()?;
        assert_abs_diff_eq!(
            isa.basis() * isa.basis().transpose(),
            Mat::identity(3, 3),
            epsilon = 1e-10
        );
        Ok(())
    }
}
