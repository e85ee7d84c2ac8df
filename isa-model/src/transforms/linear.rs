use crate::traits::Transform;
use crate::{DVec, Mat};
use matrix_util::traits::LinalgOps;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// `y = M x` for a fixed matrix `M`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearTransform {
    matrix: Mat,
}

impl LinearTransform {
    pub fn new(matrix: Mat) -> anyhow::Result<Self> {
        matrix_util::check_finite(&matrix, "linear transform")?;
        Ok(Self { matrix })
    }

    pub fn identity(dim: usize) -> Self {
        Self {
            matrix: Mat::identity(dim, dim),
        }
    }

    /// Orthonormal 2-D DCT-II basis for `patch_size x patch_size`
    /// patches flattened in column-major order. Row `k1 * n + k2`
    /// holds frequency `(k1, k2)`, so the DC component comes first.
    pub fn dct(patch_size: usize) -> Self {
        let n = patch_size;
        let basis_1d = Mat::from_fn(n, n, |k, i| {
            let c = if k == 0 {
                (1.0 / n as f64).sqrt()
            } else {
                (2.0 / n as f64).sqrt()
            };
            c * (PI * (2 * i + 1) as f64 * k as f64 / (2 * n) as f64).cos()
        });
        Self {
            matrix: basis_1d.kronecker(&basis_1d),
        }
    }

    pub fn matrix(&self) -> &Mat {
        &self.matrix
    }

    pub fn dim_in(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn dim_out(&self) -> usize {
        self.matrix.nrows()
    }

    /// Keep only the given output components, e.g. everything but DC.
    /// The result is a projection and no longer invertible.
    pub fn select_rows(&self, rows: &[usize]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            rows.iter().all(|&r| r < self.matrix.nrows()),
            "row index out of range"
        );
        Ok(Self {
            matrix: self.matrix.select_rows(rows.iter()),
        })
    }

    /// The transform undoing this one
    pub fn inverted(&self) -> anyhow::Result<Self> {
        Ok(Self {
            matrix: self.matrix.checked_inverse()?,
        })
    }

    fn check_rows(&self, data: &Mat, expected: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            data.nrows() == expected,
            "linear transform expects {} rows, got {}",
            expected,
            data.nrows()
        );
        Ok(())
    }
}

impl Transform for LinearTransform {
    fn apply(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.check_rows(data, self.dim_in())?;
        Ok(&self.matrix * data)
    }

    fn inverse(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.check_rows(data, self.dim_out())?;
        anyhow::ensure!(
            self.matrix.is_square(),
            "a {} x {} projection cannot be inverted",
            self.dim_out(),
            self.dim_in()
        );
        let lu = self.matrix.clone().lu();
        lu.solve(data).ok_or(anyhow::anyhow!("singular linear transform"))
    }

    fn logjacobian(&self, data: &Mat) -> anyhow::Result<DVec> {
        self.check_rows(data, self.dim_in())?;
        let logdet = self.matrix.log_abs_det()?;
        Ok(DVec::from_element(data.ncols(), logdet))
    }
}
