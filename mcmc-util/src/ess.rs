use rand::Rng;
use std::f64::consts::PI;

use crate::traits::EssParam;

/// A bracket narrower than this has collapsed onto the current state
const MIN_BRACKET: f64 = 1e-12;

/// One elliptical slice transition under a zero-mean Gaussian prior.
/// Returns `(new_state, new_lnpdf)`.
///
/// - `current`: current state `f`
/// - `prior_sample`: a draw `ν` from the Gaussian prior
/// - `lnpdf`: log-likelihood term only, without the prior
/// - `cur_lnpdf`: cached `lnpdf(current)`
pub fn elliptical_slice_step<P: EssParam, R: Rng + ?Sized>(
    current: &P,
    prior_sample: &P,
    lnpdf: &impl Fn(&P) -> f64,
    cur_lnpdf: f64,
    rng: &mut R,
) -> (P, f64) {
    let u: f64 = rng.random();
    let threshold = u.ln() + cur_lnpdf;

    let mut angle: f64 = rng.random_range(0.0..2.0 * PI);
    let (mut lo, mut hi) = (angle - 2.0 * PI, angle);

    loop {
        let proposal = current.linear_combine(angle.cos(), prior_sample, angle.sin());
        let new_lnpdf = lnpdf(&proposal);
        if new_lnpdf > threshold {
            return (proposal, new_lnpdf);
        }

        if angle < 0.0 {
            lo = angle;
        } else {
            hi = angle;
        }
        if hi - lo < MIN_BRACKET {
            return (current.clone(), cur_lnpdf);
        }
        angle = rng.random_range(lo..hi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    fn std_normal_vec(d: usize, rng: &mut SmallRng) -> DVector<f64> {
        DVector::from_fn(d, |_, _| StandardNormal.sample(rng))
    }

    /// Mean of `n` states after `warmup` transitions from the origin
    fn chain_mean(
        d: usize,
        n: usize,
        warmup: usize,
        seed: u64,
        lnpdf: impl Fn(&DVector<f64>) -> f64,
        prior_draw: impl Fn(&mut SmallRng) -> DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut state = DVector::zeros(d);
        let mut ll = lnpdf(&state);
        let mut sum = DVector::zeros(d);
        let mut sum_sq = DVector::zeros(d);
        for t in 0..(warmup + n) {
            let nu = prior_draw(&mut rng);
            (state, ll) = elliptical_slice_step(&state, &nu, &lnpdf, ll, &mut rng);
            if t >= warmup {
                sum += &state;
                sum_sq += state.component_mul(&state);
            }
        }
        let mean = sum / n as f64;
        let var = sum_sq / n as f64 - mean.component_mul(&mean);
        (mean, var)
    }

    /// N(0,1) prior with a N(y | f, σ²) likelihood
    #[test]
    fn conjugate_gaussian_posterior() {
        let (y, sigma_sq) = (3.0, 2.0);
        let var_post = 1.0 / (1.0 + 1.0 / sigma_sq);
        let mean_post = var_post * y / sigma_sq;

        let (mean, var) = chain_mean(
            1,
            10_000,
            2_000,
            123,
            move |f| -0.5 * (f[0] - y).powi(2) / sigma_sq,
            |rng| std_normal_vec(1, rng),
        );
        assert!((mean[0] - mean_post).abs() < 0.1, "mean {}", mean[0]);
        assert!((var[0] - var_post).abs() < 0.1, "var {}", var[0]);
    }

    /// Correlated prior N(0, Σ) with N(y | f, σ² I):
    /// the posterior mean is `(Σ⁻¹ + I/σ²)⁻¹ y / σ²`
    #[test]
    fn correlated_prior_posterior_mean() {
        let d = 3;
        let sigma_sq = 1.5;
        let y = DVector::from_vec(vec![2.0, -1.0, 1.5]);

        #[rustfmt::skip]
        let sigma = DMatrix::from_row_slice(d, d, &[
            1.0, 0.5, 0.2,
            0.5, 1.0, 0.3,
            0.2, 0.3, 1.0,
        ]);
        let chol = sigma.clone().cholesky().unwrap().l();
        let precision = sigma.try_inverse().unwrap() + DMatrix::identity(d, d) / sigma_sq;
        let expected = precision.try_inverse().unwrap() * &y / sigma_sq;

        let yy = y.clone();
        let (mean, _) = chain_mean(
            d,
            20_000,
            5_000,
            789,
            move |f| -0.5 * (f - &yy).norm_squared() / sigma_sq,
            move |rng| &chol * std_normal_vec(d, rng),
        );
        for j in 0..d {
            assert!(
                (mean[j] - expected[j]).abs() < 0.15,
                "dim {}: {} vs {}",
                j,
                mean[j],
                expected[j]
            );
        }
    }

    #[test]
    fn collapsed_bracket_keeps_the_state() {
        let mut rng = SmallRng::seed_from_u64(1);
        let current = DVector::from_vec(vec![0.5]);
        let nu = DVector::from_vec(vec![1.0]);
        // nothing beats the current value, so every proposal is rejected
        let lnpdf = |f: &DVector<f64>| if f == &current { 0.0 } else { f64::NEG_INFINITY };
        let (next, ll) = elliptical_slice_step(&current, &nu, &lnpdf, 0.0, &mut rng);
        assert_eq!(next, current);
        assert_eq!(ll, 0.0);
    }
}
