//! Subspace Gaussianization: undo the completed ISA basis, then
//! radially Gaussianize each subspace on its own.
//!
//! For a model of `V` visible and `H` hidden units this maps the
//! `H`-dimensional vectors `ŷ = Â s` (visible data stacked with null
//! space coordinates) to `H`-dimensional vectors that are standard
//! normal whenever `s` follows the model's prior.

use super::radial::RadialGaussianization;
use crate::isa::Isa;
use crate::traits::Transform;
use crate::{DVec, Mat};
use matrix_util::dmatrix_util::vstack;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubspaceGaussianization {
    completed: Mat,
    completed_inverse: Mat,
    log_abs_det: f64,
    ranges: Vec<(usize, usize)>,
    radials: Vec<RadialGaussianization>,
}

impl SubspaceGaussianization {
    /// Snapshot of the model's current basis and priors
    pub fn new(isa: &Isa) -> anyhow::Result<Self> {
        isa.check_invariants()?;
        let radials = isa
            .subspaces()
            .iter()
            .map(|gsm| RadialGaussianization::new(gsm.clone()))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            completed: isa.completed_basis()?,
            completed_inverse: isa.completed_inverse()?,
            log_abs_det: isa.log_abs_det_completed()?,
            ranges: isa.subspace_ranges(),
            radials,
        })
    }

    pub fn dim(&self) -> usize {
        self.completed.nrows()
    }

    fn check_rows(&self, data: &Mat) -> anyhow::Result<()> {
        anyhow::ensure!(
            data.nrows() == self.dim(),
            "subspace Gaussianization expects {} rows, got {}",
            self.dim(),
            data.nrows()
        );
        Ok(())
    }

    /// Apply `func` to each subspace's rows of `hidden` and stack the
    /// results back in order
    fn per_subspace<F>(&self, hidden: &Mat, func: F) -> anyhow::Result<Mat>
    where
        F: Fn(&RadialGaussianization, &Mat) -> anyhow::Result<Mat>,
    {
        let parts = self
            .radials
            .iter()
            .zip(self.ranges.iter())
            .map(|(rg, &(lb, ub))| func(rg, &hidden.rows(lb, ub - lb).into_owned()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        vstack(&parts)
    }
}

impl Transform for SubspaceGaussianization {
    fn apply(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.check_rows(data)?;
        let hidden = &self.completed_inverse * data;
        self.per_subspace(&hidden, |rg, block| rg.apply(block))
    }

    fn inverse(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.check_rows(data)?;
        let hidden = self.per_subspace(data, |rg, block| rg.inverse(block))?;
        Ok(&self.completed * hidden)
    }

    fn logjacobian(&self, data: &Mat) -> anyhow::Result<DVec> {
        self.check_rows(data)?;
        let hidden = &self.completed_inverse * data;
        let mut ret = DVec::from_element(data.ncols(), -self.log_abs_det);
        for (rg, &(lb, ub)) in self.radials.iter().zip(self.ranges.iter()) {
            ret += rg.logjacobian(&hidden.rows(lb, ub - lb).into_owned())?;
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::{Gsm, GsmInit};
    use approx::assert_abs_diff_eq;
    use matrix_util::traits::SampleOps;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::f64::consts::PI;

    #[test]
    fn inverse_undoes_apply_with_mixed_subspaces() -> anyhow::Result<()> {
        let mut isa = Isa::new(3, 5)?;
        isa.set_subspaces(vec![Gsm::new(2, 6), Gsm::new(1, 6), Gsm::new(2, 6)])?;
        isa.initialize(None, GsmInit::Student)?;

        let sg = SubspaceGaussianization::new(&isa)?;
        let mut rng = SmallRng::seed_from_u64(6);
        let mut yy = Mat::rnorm_with(5, 12, &mut rng);
        yy.column_mut(0).fill(0.0);

        let gg = sg.apply(&yy)?;
        assert_eq!(gg.column(0), DVec::zeros(5));
        assert_abs_diff_eq!(sg.inverse(&gg)?, yy, epsilon = 1e-7);
        Ok(())
    }

    #[test]
    fn change_of_variables_gives_the_complete_model_density() -> anyhow::Result<()> {
        let mut isa = Isa::new(3, 3)?;
        isa.initialize(None, GsmInit::Laplace)?;
        let mut rng = SmallRng::seed_from_u64(13);
        isa.set_basis(Mat::rnorm_with(3, 3, &mut rng))?;

        let xx = isa.sample(20, &mut rng);
        let sg = SubspaceGaussianization::new(&isa)?;
        let gg = sg.apply(&xx)?;
        let logjac = sg.logjacobian(&xx)?;

        let ss = isa.basis().clone().try_inverse().unwrap() * &xx;
        let log_det = isa.basis().determinant().abs().ln();
        let direct = -isa.prior_energy(&ss)?.add_scalar(log_det);

        for j in 0..20 {
            let log_normal = -0.5 * gg.column(j).norm_squared() - 1.5 * (2.0 * PI).ln();
            assert_abs_diff_eq!(log_normal + logjac[j], direct[j], epsilon = 1e-6);
        }
        Ok(())
    }
}
