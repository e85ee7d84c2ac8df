pub use nalgebra::{DMatrix, DVector};
pub use rand::Rng;
pub use rand_distr::StandardNormal;
pub use rayon::prelude::*;

use crate::traits::*;
use crate::{DVec, Mat};

impl SampleOps for Mat {
    type Mat = Self;
    type Scalar = f64;

    fn runif(dd: usize, nn: usize) -> Self::Mat {
        let rvec = (0..(dd * nn))
            .into_par_iter()
            .map_init(rand::rng, |rng, _| rng.random::<f64>())
            .collect();

        DMatrix::<f64>::from_vec(dd, nn, rvec)
    }

    fn runif_with<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat {
        DMatrix::<f64>::from_fn(dd, nn, |_, _| rng.random::<f64>())
    }

    fn rnorm_with<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat {
        DMatrix::<f64>::from_fn(dd, nn, |_, _| rng.sample::<f64, _>(StandardNormal))
    }
}

impl MatOps for Mat {
    type Mat = Self;
    type Scalar = f64;

    fn centre_rows_inplace(&mut self) {
        if self.ncols() == 0 {
            return;
        }
        let mu = self.column_mean();
        for mut xx_j in self.column_iter_mut() {
            xx_j -= &mu;
        }
    }

    fn centre_rows(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.centre_rows_inplace();
        ret
    }

    /// Sample covariance of the rows, `X X' / (n - 1)` after centring
    fn row_covariance(&self) -> Self::Mat {
        let nn = self.ncols();
        let xx = self.centre_rows();
        let denom = (nn.max(2) - 1) as f64;
        (&xx * xx.transpose()) / denom
    }
}

/// Numerically stable `log(sum(exp(x)))`
pub fn logsumexp(xx: &[f64]) -> f64 {
    let max = xx.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let tot: f64 = xx.iter().map(|&x| (x - max).exp()).sum();
    max + tot.ln()
}

/// Numerically stable `log(mean(exp(x)))`
pub fn logmeanexp(xx: &[f64]) -> f64 {
    if xx.is_empty() {
        return f64::NEG_INFINITY;
    }
    logsumexp(xx) - (xx.len() as f64).ln()
}

/// `log(mean(exp(.)))` of each column, averaging over rows
///
/// AIS weights are stored `samples x data points`; this collapses
/// them into one log-likelihood estimate per data point.
pub fn logmeanexp_columns(xx: &Mat) -> DVec {
    DVec::from_iterator(
        xx.ncols(),
        xx.column_iter()
            .map(|col| logmeanexp(&col.iter().cloned().collect::<Vec<_>>())),
    )
}

/// Concatenate matrices with equal number of rows side by side
pub fn hstack(blocks: &[Mat]) -> anyhow::Result<Mat> {
    let nrows = match blocks.first() {
        Some(b) => b.nrows(),
        None => return Ok(Mat::zeros(0, 0)),
    };
    if blocks.iter().any(|b| b.nrows() != nrows) {
        anyhow::bail!("hstack: blocks have different numbers of rows");
    }
    let ncols: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut ret = Mat::zeros(nrows, ncols);
    let mut lb = 0;
    for b in blocks {
        ret.columns_mut(lb, b.ncols()).copy_from(b);
        lb += b.ncols();
    }
    Ok(ret)
}

/// Stack matrices with equal number of columns on top of each other
pub fn vstack(blocks: &[Mat]) -> anyhow::Result<Mat> {
    let ncols = match blocks.first() {
        Some(b) => b.ncols(),
        None => return Ok(Mat::zeros(0, 0)),
    };
    if blocks.iter().any(|b| b.ncols() != ncols) {
        anyhow::bail!("vstack: blocks have different numbers of columns");
    }
    let nrows: usize = blocks.iter().map(|b| b.nrows()).sum();
    let mut ret = Mat::zeros(nrows, ncols);
    let mut lb = 0;
    for b in blocks {
        ret.rows_mut(lb, b.nrows()).copy_from(b);
        lb += b.nrows();
    }
    Ok(ret)
}

/// Squared Euclidean norm of every column
pub fn column_sq_norms(xx: &Mat) -> DVec {
    DVec::from_iterator(xx.ncols(), xx.column_iter().map(|c| c.norm_squared()))
}
