use crate::traits::Transform;
use crate::{DVec, Mat};
use matrix_util::dmatrix_linalg::symmetric_eigen_sorted;
use matrix_util::traits::{LinalgOps, MatOps};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhiteningKind {
    /// `W = U Λ^{-1/2} U'` (ZCA), staying close to the input space
    Symmetric,
    /// `W = Λ^{-1/2} U'` (PCA), components in decreasing variance
    Asymmetric,
}

/// `y = W (x - μ)` with `W` chosen so that `y` has identity covariance
/// on the training data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhiteningTransform {
    kind: WhiteningKind,
    mean: DVec,
    whiten: Mat,
    dewhiten: Mat,
}

impl WhiteningTransform {
    pub fn from_data(data: &Mat, kind: WhiteningKind) -> anyhow::Result<Self> {
        anyhow::ensure!(data.ncols() > 1, "whitening needs at least two data points");
        matrix_util::check_finite(data, "whitening input")?;

        let mean = data.column_mean();
        let cov = data.row_covariance();
        let (values, vectors) = symmetric_eigen_sorted(&cov);

        let top = values.iter().cloned().fold(0.0, f64::max);
        anyhow::ensure!(
            values.iter().all(|&v| v > 1e-12 * top.max(f64::MIN_POSITIVE)),
            "covariance is singular; project out the null directions first"
        );

        let inv_sqrt = Mat::from_diagonal(&values.map(|v| 1.0 / v.sqrt()));
        let sqrt = Mat::from_diagonal(&values.map(f64::sqrt));

        let (whiten, dewhiten) = match kind {
            WhiteningKind::Symmetric => (
                &vectors * inv_sqrt * vectors.transpose(),
                &vectors * sqrt * vectors.transpose(),
            ),
            WhiteningKind::Asymmetric => (inv_sqrt * vectors.transpose(), &vectors * sqrt),
        };

        Ok(Self {
            kind,
            mean,
            whiten,
            dewhiten,
        })
    }

    pub fn kind(&self) -> WhiteningKind {
        self.kind
    }

    pub fn mean(&self) -> &DVec {
        &self.mean
    }

    fn check_rows(&self, data: &Mat) -> anyhow::Result<()> {
        anyhow::ensure!(
            data.nrows() == self.mean.len(),
            "whitening expects {} rows, got {}",
            self.mean.len(),
            data.nrows()
        );
        Ok(())
    }
}

impl Transform for WhiteningTransform {
    fn apply(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.check_rows(data)?;
        let mut centred = data.clone();
        for mut col in centred.column_iter_mut() {
            col -= &self.mean;
        }
        Ok(&self.whiten * centred)
    }

    fn inverse(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.check_rows(data)?;
        let mut ret = &self.dewhiten * data;
        for mut col in ret.column_iter_mut() {
            col += &self.mean;
        }
        Ok(ret)
    }

    fn logjacobian(&self, data: &Mat) -> anyhow::Result<DVec> {
        self.check_rows(data)?;
        let logdet = self.whiten.log_abs_det()?;
        Ok(DVec::from_element(data.ncols(), logdet))
    }
}
