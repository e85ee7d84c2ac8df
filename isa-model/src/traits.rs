use crate::{bits_per_dim, DVec, Mat};
use rand::RngCore;

/// A probabilistic model over column vectors
pub trait Distribution {
    /// Dimensionality of a data point
    fn dim(&self) -> usize;

    /// Data-driven starting point before training
    fn initialize(&mut self, data: &Mat) -> anyhow::Result<()>;

    /// Fit the parameters to `data` with the model's stored settings
    fn train(&mut self, data: &Mat) -> anyhow::Result<()>;

    /// Draw `num_samples` columns
    fn sample(&self, num_samples: usize, rng: &mut dyn RngCore) -> anyhow::Result<Mat>;

    /// Log-density (in nats) of every column
    fn loglikelihood(&self, data: &Mat, rng: &mut dyn RngCore) -> anyhow::Result<DVec>;

    /// Average negative log-likelihood in bits per dimension
    fn evaluate(&self, data: &Mat, rng: &mut dyn RngCore) -> anyhow::Result<f64> {
        let ll = self.loglikelihood(data, rng)?;
        Ok(bits_per_dim(&ll, self.dim()))
    }
}

/// An invertible map applied to every column
pub trait Transform {
    fn apply(&self, data: &Mat) -> anyhow::Result<Mat>;

    fn inverse(&self, data: &Mat) -> anyhow::Result<Mat>;

    /// `log|det J|` of `apply`, evaluated at every column of `data`
    fn logjacobian(&self, data: &Mat) -> anyhow::Result<DVec>;
}
