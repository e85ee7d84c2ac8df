//! One-dimensional mixture of Gaussians, used for the DC component of
//! image patches.

use crate::gsm::{sample_index, MIN_SCALE, MIN_WEIGHT};
use crate::traits::Distribution;
use crate::{DVec, Mat};
use log::debug;
use matrix_util::dmatrix_util::logsumexp;
use matrix_util::{check_finite, check_finite_scalar};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoGaussian {
    pub means: DVec,
    pub scales: DVec,
    pub weights: DVec,
    /// EM iterations run by `train`. Default: 100
    pub max_iter: usize,
}

impl MoGaussian {
    pub fn new(num_components: usize) -> Self {
        let kk = num_components.max(1);
        Self {
            means: DVec::from_fn(kk, |k, _| k as f64 - 0.5 * (kk - 1) as f64),
            scales: DVec::from_element(kk, 1.0),
            weights: DVec::from_element(kk, 1.0 / kk as f64),
            max_iter: 100,
        }
    }

    pub fn num_components(&self) -> usize {
        self.means.len()
    }

    fn component_log_joint(&self, x: f64) -> Vec<f64> {
        (0..self.num_components())
            .map(|k| {
                let s = self.scales[k];
                let z = (x - self.means[k]) / s;
                self.weights[k].ln() - s.ln() - 0.5 * z * z - 0.5 * (2.0 * PI).ln()
            })
            .collect()
    }

    fn check_rows(data: &Mat) -> anyhow::Result<()> {
        anyhow::ensure!(
            data.nrows() == 1,
            "mixture of Gaussians is one-dimensional, got {} rows",
            data.nrows()
        );
        Ok(())
    }

    pub fn logdensity(&self, data: &Mat) -> anyhow::Result<DVec> {
        Self::check_rows(data)?;
        let ret = DVec::from_iterator(
            data.ncols(),
            data.iter().map(|&x| logsumexp(&self.component_log_joint(x))),
        );
        check_finite(&ret, "mixture of Gaussians log-density")?;
        Ok(ret)
    }

    /// EM; returns the number of iterations run
    pub fn train_em(&mut self, data: &Mat, max_iter: usize) -> anyhow::Result<usize> {
        Self::check_rows(data)?;
        let nn = data.ncols();
        if nn == 0 {
            return Ok(0);
        }
        let kk = self.num_components();
        let mut prev = f64::NEG_INFINITY;

        for iter in 0..max_iter {
            let mut rsum = vec![0.0; kk];
            let mut rx = vec![0.0; kk];
            let mut rxx = vec![0.0; kk];
            let mut llik = 0.0;

            for &x in data.iter() {
                let lj = self.component_log_joint(x);
                let lz = logsumexp(&lj);
                llik += lz;
                for k in 0..kk {
                    let r = (lj[k] - lz).exp();
                    rsum[k] += r;
                    rx[k] += r * x;
                    rxx[k] += r * x * x;
                }
            }

            for k in 0..kk {
                let r = rsum[k].max(MIN_WEIGHT);
                let mean = rx[k] / r;
                let var = (rxx[k] / r - mean * mean).max(MIN_SCALE * MIN_SCALE);
                self.means[k] = check_finite_scalar(mean, "mixture of Gaussians M-step")?;
                self.scales[k] = var.sqrt();
                self.weights[k] = (rsum[k] / nn as f64).max(MIN_WEIGHT);
            }
            let tot = self.weights.sum();
            self.weights /= tot;

            let llik = llik / nn as f64;
            if (llik - prev).abs() < 1e-8 {
                debug!("mixture of Gaussians EM converged after {} iterations", iter + 1);
                return Ok(iter + 1);
            }
            prev = llik;
        }
        Ok(max_iter)
    }
}

impl Default for MoGaussian {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Distribution for MoGaussian {
    fn dim(&self) -> usize {
        1
    }

    /// Means at evenly spaced quantiles of the data, unit weights and
    /// the data's standard deviation as scale
    fn initialize(&mut self, data: &Mat) -> anyhow::Result<()> {
        Self::check_rows(data)?;
        anyhow::ensure!(data.ncols() > 0, "no data to initialize from");
        check_finite(data, "mixture of Gaussians data")?;

        let mut sorted: Vec<f64> = data.iter().cloned().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let kk = self.num_components();
        let nn = sorted.len();

        let std = data.row(0).variance().sqrt().max(MIN_SCALE);
        self.means = DVec::from_fn(kk, |k, _| {
            let q = (k as f64 + 0.5) / kk as f64;
            sorted[((q * nn as f64) as usize).min(nn - 1)]
        });
        self.scales = DVec::from_element(kk, std);
        self.weights = DVec::from_element(kk, 1.0 / kk as f64);
        Ok(())
    }

    fn train(&mut self, data: &Mat) -> anyhow::Result<()> {
        self.train_em(data, self.max_iter)?;
        Ok(())
    }

    fn sample(&self, num_samples: usize, rng: &mut dyn RngCore) -> anyhow::Result<Mat> {
        let mut ret = Mat::zeros(1, num_samples);
        for x in ret.iter_mut() {
            let k = sample_index(self.weights.as_slice(), rng.random::<f64>());
            *x = self.means[k] + self.scales[k] * rng.sample::<f64, _>(StandardNormal);
        }
        Ok(ret)
    }

    fn loglikelihood(&self, data: &Mat, _rng: &mut dyn RngCore) -> anyhow::Result<DVec> {
        self.logdensity(data)
    }
}
