//! A chain of transforms ending in a terminal model.
//!
//! Data goes through the transforms in order before it reaches the
//! model; samples come back through their inverses in reverse order.
//! The log-likelihood picks up every transform's log-Jacobian.

use crate::traits::{Distribution, Transform};
use crate::transforms::AnyTransform;
use crate::{DVec, Mat};
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackedModel<M> {
    pub transforms: Vec<AnyTransform>,
    pub model: M,
}

impl<M: Distribution> StackedModel<M> {
    pub fn new(transforms: Vec<AnyTransform>, model: M) -> Self {
        Self { transforms, model }
    }

    /// Data as the terminal model sees it, with the summed log-Jacobian
    /// of every column
    pub fn transform_data(&self, data: &Mat) -> anyhow::Result<(Mat, DVec)> {
        let mut data = data.clone();
        let mut logjac = DVec::zeros(data.ncols());
        for transform in &self.transforms {
            logjac += transform.logjacobian(&data)?;
            data = transform.apply(&data)?;
        }
        Ok((data, logjac))
    }
}

impl<M: Distribution> Distribution for StackedModel<M> {
    fn dim(&self) -> usize {
        self.model.dim()
    }

    fn initialize(&mut self, data: &Mat) -> anyhow::Result<()> {
        let (data, _) = self.transform_data(data)?;
        self.model.initialize(&data)
    }

    fn train(&mut self, data: &Mat) -> anyhow::Result<()> {
        let (data, _) = self.transform_data(data)?;
        self.model.train(&data)
    }

    fn sample(&self, num_samples: usize, rng: &mut dyn RngCore) -> anyhow::Result<Mat> {
        let mut ret = self.model.sample(num_samples, rng)?;
        for transform in self.transforms.iter().rev() {
            ret = transform.inverse(&ret)?;
        }
        Ok(ret)
    }

    fn loglikelihood(&self, data: &Mat, rng: &mut dyn RngCore) -> anyhow::Result<DVec> {
        let (data, logjac) = self.transform_data(data)?;
        Ok(logjac + self.model.loglikelihood(&data, rng)?)
    }
}
