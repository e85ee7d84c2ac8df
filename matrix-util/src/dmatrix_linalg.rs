use crate::traits::LinalgOps;
use crate::{DVec, Mat};

/// Eigenvalues below this (relative to the largest) count as zero
const RANK_TOL: f64 = 1e-10;

impl LinalgOps for Mat {
    type Mat = Self;
    type Scalar = f64;

    /// The projector `I - A'(AA')^{-1}A` has eigenvalue one exactly on
    /// the null space of `A`; its leading eigenvectors are returned as
    /// orthonormal rows.
    fn nullspace_rows(&self) -> anyhow::Result<Self::Mat> {
        let (nv, nh) = self.shape();
        anyhow::ensure!(
            nv <= nh,
            "null space needs at least as many columns ({}) as rows ({})",
            nh,
            nv
        );

        if nv == nh {
            return Ok(Mat::zeros(0, nh));
        }

        let pinv = self.right_pseudo_inverse()?;
        let proj = Mat::identity(nh, nh) - pinv * self;
        let proj = (&proj + proj.transpose()) * 0.5;

        let (_, vectors) = symmetric_eigen_sorted(&proj);
        Ok(vectors.columns(0, nh - nv).transpose())
    }

    fn log_abs_det(&self) -> anyhow::Result<Self::Scalar> {
        anyhow::ensure!(self.is_square(), "log-determinant of a non-square matrix");
        let lu = self.clone().lu();
        let uu = lu.u();
        let mut ret = 0.0;
        for i in 0..uu.nrows() {
            let d = uu[(i, i)].abs();
            if d == 0.0 || !d.is_finite() {
                anyhow::bail!("singular matrix in log-determinant");
            }
            ret += d.ln();
        }
        Ok(ret)
    }

    fn checked_inverse(&self) -> anyhow::Result<Self::Mat> {
        anyhow::ensure!(self.is_square(), "inverse of a non-square matrix");
        let ret = self
            .clone()
            .try_inverse()
            .ok_or(anyhow::anyhow!("singular matrix"))?;
        crate::check_finite(&ret, "matrix inverse")?;
        Ok(ret)
    }

    fn orthogonalize_rows(&self) -> anyhow::Result<Self::Mat> {
        let gram = self * self.transpose();
        let inv_sqrt = inverse_sqrt_psd(&gram)?;
        Ok(inv_sqrt * self)
    }

    fn right_pseudo_inverse(&self) -> anyhow::Result<Self::Mat> {
        let gram = self * self.transpose();
        let chol = gram
            .cholesky()
            .ok_or(anyhow::anyhow!("matrix does not have full row rank"))?;
        Ok(self.transpose() * chol.inverse())
    }
}

/// Eigen-decomposition of a symmetric matrix with eigenvalues sorted
/// in descending order (eigenvectors in the corresponding columns)
pub fn symmetric_eigen_sorted(xx: &Mat) -> (DVec, Mat) {
    let eig = xx.clone().symmetric_eigen();
    let nn = eig.eigenvalues.len();

    let mut order: Vec<usize> = (0..nn).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

    let values = DVec::from_iterator(nn, order.iter().map(|&i| eig.eigenvalues[i]));
    let mut vectors = Mat::zeros(xx.nrows(), nn);
    for (j, &i) in order.iter().enumerate() {
        vectors.set_column(j, &eig.eigenvectors.column(i));
    }
    (values, vectors)
}

/// `M^{-1/2}` of a symmetric positive definite matrix
pub fn inverse_sqrt_psd(xx: &Mat) -> anyhow::Result<Mat> {
    let (values, vectors) = symmetric_eigen_sorted(xx);
    let top = values.iter().cloned().fold(0.0, f64::max);
    if values.iter().any(|&v| v <= RANK_TOL * top.max(f64::MIN_POSITIVE)) {
        anyhow::bail!("matrix is not positive definite");
    }
    let scaled = DVec::from_iterator(values.len(), values.iter().map(|v| 1.0 / v.sqrt()));
    Ok(&vectors * Mat::from_diagonal(&scaled) * vectors.transpose())
}
