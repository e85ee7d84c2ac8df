//! Gaussian scale mixtures, `p(x) = Σ_k w_k N(x; 0, s_k² I_d)`.

use crate::traits::Distribution;
use crate::{DVec, Mat};
use log::debug;
use matrix_util::dmatrix_util::{column_sq_norms, logsumexp};
use matrix_util::{check_finite, check_finite_scalar};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::{gamma_lr, gamma_ur};
use std::f64::consts::PI;

/// Scales are never allowed below this
pub const MIN_SCALE: f64 = 1e-6;

/// Mixture weights are floored at this before renormalization
pub const MIN_WEIGHT: f64 = 1e-12;

const DEFAULT_NUM_SCALES: usize = 10;
const DEFAULT_EM_ITER: usize = 100;
const EM_TOL: f64 = 1e-8;

/// Named initializations of the scale mixture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GsmInit {
    /// Exponential variance mixture, i.e. a Laplace marginal in 1-D
    Laplace,
    /// Inverse-gamma variance mixture with 3 degrees of freedom
    Student,
    /// All scales equal to one
    Gaussian,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gsm {
    dim: usize,
    pub scales: DVec,
    pub weights: DVec,
    /// Strength of the repulsion between log-scales. Default: 0.0
    pub gamma: f64,
    /// Shape of the inverse-gamma prior on the variances. Default: 1.0
    pub alpha: f64,
    /// Scale of the inverse-gamma prior on the variances. Default: 1e-3
    pub beta: f64,
}

impl Gsm {
    /// A Laplace-like mixture with unit variance per dimension
    pub fn new(dim: usize, num_scales: usize) -> Self {
        let num_scales = num_scales.max(1);
        let mut ret = Self {
            dim,
            scales: DVec::from_element(num_scales, 1.0),
            weights: DVec::from_element(num_scales, 1.0 / num_scales as f64),
            gamma: 0.0,
            alpha: 1.0,
            beta: 1e-3,
        };
        ret.initialize_with(GsmInit::Laplace);
        ret
    }

    /// A single standard normal component
    pub fn standard_normal(dim: usize) -> Self {
        let mut ret = Self::new(dim, 1);
        ret.initialize_with(GsmInit::Gaussian);
        ret
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_scales(&self) -> usize {
        self.scales.len()
    }

    /// Free parameters: the scales plus all but one weight
    pub fn num_parameters(&self) -> usize {
        2 * self.num_scales() - 1
    }

    /// Per-dimension variance, `Σ_k w_k s_k²`
    pub fn variance(&self) -> f64 {
        self.weights
            .iter()
            .zip(self.scales.iter())
            .map(|(w, s)| w * s * s)
            .sum()
    }

    /// Reset weights to uniform and place the variances at the
    /// quantile midpoints of the mixing distribution, normalized to
    /// unit variance
    pub fn initialize_with(&mut self, method: GsmInit) {
        let kk = self.num_scales();
        let probs = (0..kk).map(|k| (k as f64 + 0.5) / kk as f64);

        let variances: Vec<f64> = match method {
            GsmInit::Gaussian => vec![1.0; kk],
            GsmInit::Laplace => probs.map(|p| -(1.0 - p).ln()).collect(),
            GsmInit::Student => {
                // v ~ IG(ν/2, ν/2), so P(v <= q) = Q(ν/2, ν/(2q))
                let half_nu = 1.5;
                probs
                    .map(|p| {
                        let t = bisect_increasing(|t| gamma_lr(half_nu, t), 1.0 - p, 0.0, 1.0);
                        half_nu / t.max(f64::MIN_POSITIVE)
                    })
                    .collect()
            }
        };

        self.weights = DVec::from_element(kk, 1.0 / kk as f64);
        self.scales = DVec::from_iterator(kk, variances.iter().map(|v| v.sqrt()));
        self.normalize();
    }

    /// Rescale so that the per-dimension variance is one
    pub fn normalize(&mut self) {
        let var = self.variance();
        if var > 0.0 && var.is_finite() {
            self.scales /= var.sqrt();
        }
        self.clamp();
    }

    /// Keep scales and weights away from zero
    pub fn clamp(&mut self) {
        self.scales.iter_mut().for_each(|s| *s = s.max(MIN_SCALE));
        self.weights.iter_mut().for_each(|w| *w = w.max(MIN_WEIGHT));
        let tot = self.weights.sum();
        self.weights /= tot;
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.dim > 0, "GSM dimension must be positive");
        anyhow::ensure!(
            self.scales.len() == self.weights.len() && !self.scales.is_empty(),
            "GSM has {} scales but {} weights",
            self.scales.len(),
            self.weights.len()
        );
        check_finite(&self.scales, "GSM scales")?;
        anyhow::ensure!(
            self.scales.iter().all(|&s| s > 0.0),
            "GSM scales must be positive"
        );
        anyhow::ensure!(
            self.weights.iter().all(|&w| w >= 0.0 && w.is_finite()),
            "GSM weights must be non-negative"
        );
        anyhow::ensure!(
            (self.weights.sum() - 1.0).abs() < 1e-6,
            "GSM weights must sum to one"
        );
        Ok(())
    }

    /// Unnormalized log posterior over components for a point with
    /// squared norm `sq`, `ln w_k + ln N(x; 0, s_k² I)`
    pub fn component_log_joint(&self, sq: f64) -> Vec<f64> {
        let d = self.dim as f64;
        self.weights
            .iter()
            .zip(self.scales.iter())
            .map(|(&w, &s)| {
                w.ln() - d * s.ln() - 0.5 * sq / (s * s) - 0.5 * d * (2.0 * PI).ln()
            })
            .collect()
    }

    /// `ln p(x)` for a point with squared norm `sq`
    pub fn logdensity_sq(&self, sq: f64) -> f64 {
        logsumexp(&self.component_log_joint(sq))
    }

    /// Posterior component probabilities, `K x N`
    pub fn responsibilities(&self, sq_norms: &DVec) -> Mat {
        let kk = self.num_scales();
        let mut ret = Mat::zeros(kk, sq_norms.len());
        for (n, &sq) in sq_norms.iter().enumerate() {
            let lj = self.component_log_joint(sq);
            let lz = logsumexp(&lj);
            for k in 0..kk {
                ret[(k, n)] = (lj[k] - lz).exp();
            }
        }
        ret
    }

    pub fn logdensity(&self, data: &Mat) -> anyhow::Result<DVec> {
        self.check_rows(data)?;
        let ret = column_sq_norms(data).map(|sq| self.logdensity_sq(sq));
        check_finite(&ret, "GSM log-density")?;
        Ok(ret)
    }

    pub fn density(&self, data: &Mat) -> anyhow::Result<DVec> {
        Ok(self.logdensity(data)?.map(f64::exp))
    }

    /// Negative log-density of every column
    pub fn energy(&self, data: &Mat) -> anyhow::Result<DVec> {
        Ok(-self.logdensity(data)?)
    }

    /// Gradient of the energy with respect to each column,
    /// `x Σ_k r_k(x) / s_k²`
    pub fn energy_gradient(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.check_rows(data)?;
        let resp = self.responsibilities(&column_sq_norms(data));
        let inv_var = self.scales.map(|s| 1.0 / (s * s));
        let factor = resp.transpose() * inv_var;

        let mut ret = data.clone();
        for (mut col, &f) in ret.column_iter_mut().zip(factor.iter()) {
            col *= f;
        }
        check_finite(&ret, "GSM energy gradient")?;
        Ok(ret)
    }

    pub fn sample<R: Rng + ?Sized>(&self, num_samples: usize, rng: &mut R) -> Mat {
        let mut ret = Mat::zeros(self.dim, num_samples);
        for mut col in ret.column_iter_mut() {
            let k = sample_index(self.weights.as_slice(), rng.random::<f64>());
            let s = self.scales[k];
            col.iter_mut()
                .for_each(|x| *x = s * rng.sample::<f64, _>(StandardNormal));
        }
        ret
    }

    /// `(P(‖x‖ <= r), P(‖x‖ > r))`, each accurate in its own tail
    pub fn radial_tails(&self, radius: f64) -> (f64, f64) {
        let a = 0.5 * self.dim as f64;
        let u = 0.5 * radius * radius;
        self.weights
            .iter()
            .zip(self.scales.iter())
            .fold((0.0, 0.0), |(lo, hi), (&w, &s)| {
                let t = u / (s * s);
                (lo + w * gamma_lr(a, t), hi + w * gamma_ur(a, t))
            })
    }

    /// EM with the inverse-gamma prior in the M-step and a repulsion
    /// step between log-scales afterwards. Returns the number of
    /// iterations run.
    pub fn train_em(&mut self, data: &Mat, max_iter: usize) -> anyhow::Result<usize> {
        self.check_rows(data)?;
        let nn = data.ncols();
        if nn == 0 {
            return Ok(0);
        }

        let d = self.dim as f64;
        let sq = column_sq_norms(data);
        let mut prev = f64::NEG_INFINITY;

        for iter in 0..max_iter {
            let resp = self.responsibilities(&sq);

            for k in 0..self.num_scales() {
                let rk: f64 = resp.row(k).sum();
                let rs: f64 = resp.row(k).iter().zip(sq.iter()).map(|(r, s)| r * s).sum();
                let var = (rs + 2.0 * self.beta) / (rk * d + 2.0 * (self.alpha + 1.0));
                self.scales[k] = check_finite_scalar(var, "GSM M-step")?.sqrt();
                self.weights[k] = rk / nn as f64;
            }

            self.repulse_scales();
            self.clamp();

            let llik = sq.iter().map(|&s| self.logdensity_sq(s)).sum::<f64>() / nn as f64;
            check_finite_scalar(llik, "GSM EM objective")?;
            if (llik - prev).abs() < EM_TOL {
                debug!("GSM EM converged after {} iterations", iter + 1);
                return Ok(iter + 1);
            }
            prev = llik;
        }
        Ok(max_iter)
    }

    /// One gradient step on `γ Σ_{k<l} exp(-(ln s_k - ln s_l)² / 2)`
    fn repulse_scales(&mut self) {
        if self.gamma <= 0.0 {
            return;
        }
        let grad = self.repulsion_gradient();
        for (s, g) in self.scales.iter_mut().zip(grad.iter()) {
            *s = (s.max(MIN_SCALE).ln() - self.gamma * g).exp();
        }
    }

    /// Gradient of `Σ_{k<l} exp(-Δ_kl² / 2)` with respect to `ln s_k`
    fn repulsion_gradient(&self) -> DVec {
        let log_s = self.scales.map(|s| s.ln());
        DVec::from_fn(self.num_scales(), |k, _| {
            (0..self.num_scales())
                .filter(|&l| l != k)
                .map(|l| {
                    let delta = log_s[k] - log_s[l];
                    -delta * (-0.5 * delta * delta).exp()
                })
                .sum()
        })
    }

    /// Log of the scale regularizers (inverse-gamma prior on every
    /// variance minus the repulsion penalty)
    pub fn log_scale_prior(&self) -> f64 {
        let mut ret = 0.0;
        for &s in self.scales.iter() {
            let var = s * s;
            ret += -(self.alpha + 1.0) * var.ln() - self.beta / var;
        }
        if self.gamma > 0.0 {
            let log_s = self.scales.map(|s| s.ln());
            for k in 0..self.num_scales() {
                for l in (k + 1)..self.num_scales() {
                    let delta = log_s[k] - log_s[l];
                    ret -= self.gamma * (-0.5 * delta * delta).exp();
                }
            }
        }
        ret
    }

    /// Gradient of [`Gsm::log_scale_prior`] with respect to `ln s_k`
    pub fn log_scale_prior_gradient(&self) -> DVec {
        let mut ret = self
            .scales
            .map(|s| -2.0 * (self.alpha + 1.0) + 2.0 * self.beta / (s * s));
        if self.gamma > 0.0 {
            ret -= self.repulsion_gradient() * self.gamma;
        }
        ret
    }

    /// Mean gradient of `ln p(x)` with respect to `ln s_k`,
    /// `mean_n r_kn (‖x_n‖² / s_k² - d)`
    pub fn mean_log_scale_gradient(&self, data: &Mat) -> anyhow::Result<DVec> {
        self.check_rows(data)?;
        let nn = data.ncols().max(1) as f64;
        let sq = column_sq_norms(data);
        let resp = self.responsibilities(&sq);
        let d = self.dim as f64;
        Ok(DVec::from_fn(self.num_scales(), |k, _| {
            let s2 = self.scales[k] * self.scales[k];
            resp.row(k)
                .iter()
                .zip(sq.iter())
                .map(|(r, q)| r * (q / s2 - d))
                .sum::<f64>()
                / nn
        }))
    }

    fn check_rows(&self, data: &Mat) -> anyhow::Result<()> {
        anyhow::ensure!(
            data.nrows() == self.dim,
            "GSM of dimension {} got data with {} rows",
            self.dim,
            data.nrows()
        );
        Ok(())
    }
}

impl Default for Gsm {
    fn default() -> Self {
        Self::new(1, DEFAULT_NUM_SCALES)
    }
}

impl Distribution for Gsm {
    fn dim(&self) -> usize {
        self.dim
    }

    fn initialize(&mut self, data: &Mat) -> anyhow::Result<()> {
        self.check_rows(data)?;
        self.initialize_with(GsmInit::Laplace);
        let nn = data.ncols().max(1) as f64;
        let second_moment = column_sq_norms(data).sum() / nn / self.dim as f64;
        if second_moment > 0.0 {
            self.scales *= second_moment.sqrt();
        }
        self.clamp();
        Ok(())
    }

    fn train(&mut self, data: &Mat) -> anyhow::Result<()> {
        self.train_em(data, DEFAULT_EM_ITER)?;
        Ok(())
    }

    fn sample(&self, num_samples: usize, rng: &mut dyn RngCore) -> anyhow::Result<Mat> {
        Ok(Gsm::sample(self, num_samples, rng))
    }

    fn loglikelihood(&self, data: &Mat, _rng: &mut dyn RngCore) -> anyhow::Result<DVec> {
        self.logdensity(data)
    }
}

/// Index `k` such that the cumulative weight first exceeds `u * Σ w`
pub fn sample_index(weights: &[f64], u: f64) -> usize {
    let tot: f64 = weights.iter().sum();
    let target = u * tot;
    let mut acc = 0.0;
    for (k, &w) in weights.iter().enumerate() {
        acc += w;
        if target < acc {
            return k;
        }
    }
    weights.len().saturating_sub(1)
}

/// Solve `f(x) = target` for a non-decreasing `f` on `[lo, ∞)`,
/// doubling `hi` until the root is bracketed
pub fn bisect_increasing<F>(f: F, target: f64, lo: f64, hi: f64) -> f64
where
    F: Fn(f64) -> f64,
{
    let mut lo = lo;
    let mut hi = hi.max(lo + 1.0);
    while f(hi) < target && hi < 1e300 {
        lo = hi;
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        if f(mid) < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use matrix_util::traits::SampleOps;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn initializations_have_unit_variance() {
        for method in [GsmInit::Laplace, GsmInit::Student, GsmInit::Gaussian] {
            let mut gsm = Gsm::new(2, 10);
            gsm.initialize_with(method);
            assert_abs_diff_eq!(gsm.variance(), 1.0, epsilon = 1e-10);
            assert!(gsm.validate().is_ok());
        }
    }

    #[test]
    fn single_component_matches_gaussian() -> anyhow::Result<()> {
        let gsm = Gsm::standard_normal(3);
        let xx = Mat::from_column_slice(3, 1, &[1.0, -2.0, 0.5]);
        let expected = -0.5 * 5.25 - 1.5 * (2.0 * PI).ln();
        assert_abs_diff_eq!(gsm.logdensity(&xx)?[0], expected, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn logdensity_is_stable_far_in_the_tail() -> anyhow::Result<()> {
        let gsm = Gsm::new(1, 10);
        let xx = Mat::from_element(1, 1, 1e4);
        let ll = gsm.logdensity(&xx)?;
        assert!(ll[0].is_finite());
        Ok(())
    }

    #[test]
    fn energy_gradient_matches_finite_differences() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(2);
        let mut gsm = Gsm::new(3, 5);
        gsm.initialize_with(GsmInit::Student);

        let xx = Mat::rnorm_with(3, 4, &mut rng);
        let grad = gsm.energy_gradient(&xx)?;

        let h = 1e-5;
        for j in 0..xx.ncols() {
            for i in 0..3 {
                let mut xp = xx.clone();
                let mut xm = xx.clone();
                xp[(i, j)] += h;
                xm[(i, j)] -= h;
                let fd = (gsm.energy(&xp)?[j] - gsm.energy(&xm)?[j]) / (2.0 * h);
                assert_abs_diff_eq!(fd, grad[(i, j)], epsilon = 1e-5);
            }
        }
        Ok(())
    }

    #[test]
    fn em_recovers_the_variance() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(9);
        let truth = {
            let mut g = Gsm::new(1, 3);
            g.scales = DVec::from_vec(vec![0.2, 1.0, 3.0]);
            g
        };
        let data = truth.sample(20_000, &mut rng);

        let mut gsm = Gsm::new(1, 6);
        let iters = gsm.train_em(&data, 200)?;
        assert!(iters > 0);
        assert!(gsm.validate().is_ok());
        assert_abs_diff_eq!(gsm.weights.sum(), 1.0, epsilon = 1e-10);

        let empirical = data.map(|x| x * x).mean();
        assert!((gsm.variance() - empirical).abs() / empirical < 0.05);
        Ok(())
    }

    #[test]
    fn radial_tails_sum_to_one() {
        let gsm = Gsm::new(4, 10);
        for r in [0.0, 0.1, 1.0, 3.0, 10.0] {
            let (lo, hi) = gsm.radial_tails(r);
            assert_abs_diff_eq!(lo + hi, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn sampled_columns_have_the_right_shape() {
        let mut rng = SmallRng::seed_from_u64(4);
        let gsm = Gsm::new(2, 4);
        let xx = gsm.sample(50, &mut rng);
        assert_eq!(xx.shape(), (2, 50));
    }
}
