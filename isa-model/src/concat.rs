//! Models over disjoint groups of rows.

use crate::gsm::Gsm;
use crate::isa::Isa;
use crate::mog::MoGaussian;
use crate::stacked::StackedModel;
use crate::traits::Distribution;
use crate::{DVec, Mat};
use matrix_util::dmatrix_util::vstack;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Any model of this crate. Concatenated and stacked models nest, so a
/// whole tree of them can be stored and reloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnyModel {
    Gsm(Gsm),
    MoGaussian(MoGaussian),
    Isa(Box<Isa>),
    Concat(ConcatModel),
    Stacked(Box<StackedModel<AnyModel>>),
}

impl AnyModel {
    fn inner(&self) -> &dyn Distribution {
        match self {
            AnyModel::Gsm(m) => m,
            AnyModel::MoGaussian(m) => m,
            AnyModel::Isa(m) => m.as_ref(),
            AnyModel::Concat(m) => m,
            AnyModel::Stacked(m) => m.as_ref(),
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Distribution {
        match self {
            AnyModel::Gsm(m) => m,
            AnyModel::MoGaussian(m) => m,
            AnyModel::Isa(m) => m.as_mut(),
            AnyModel::Concat(m) => m,
            AnyModel::Stacked(m) => m.as_mut(),
        }
    }

    /// Visit every ISA model in the tree, depth first
    pub fn for_each_isa_mut(&mut self, func: &mut dyn FnMut(&mut Isa)) {
        match self {
            AnyModel::Isa(m) => func(m.as_mut()),
            AnyModel::Concat(m) => m
                .models
                .iter_mut()
                .for_each(|sub| sub.for_each_isa_mut(&mut *func)),
            AnyModel::Stacked(m) => m.model.for_each_isa_mut(func),
            AnyModel::Gsm(_) | AnyModel::MoGaussian(_) => {}
        }
    }

    /// Log importance weights of the whole tree, one row per annealing
    /// run and one column per data point. Terms without sampling (other
    /// leaves, log-Jacobians) are added to every run, so a tree without
    /// any ISA yields a single row. `logmeanexp` over the rows gives the
    /// log-likelihood.
    pub fn log_weights(&self, data: &Mat, rng: &mut dyn RngCore) -> anyhow::Result<Mat> {
        match self {
            AnyModel::Isa(m) => m.ais_weights(data, &m.eval_options),
            AnyModel::Concat(m) => {
                let blocks = m.row_blocks(data)?;
                let mut ret = Mat::zeros(1, data.ncols());
                for (sub, block) in m.models.iter().zip(blocks.iter()) {
                    ret = add_runs(&ret, &sub.log_weights(block, rng)?)?;
                }
                Ok(ret)
            }
            AnyModel::Stacked(m) => {
                let (inner, logjac) = m.transform_data(data)?;
                add_runs(&m.model.log_weights(&inner, rng)?, &single_run(&logjac))
            }
            AnyModel::Gsm(_) | AnyModel::MoGaussian(_) => {
                Ok(single_run(&self.loglikelihood(data, rng)?))
            }
        }
    }
}

fn single_run(values: &DVec) -> Mat {
    Mat::from_row_slice(1, values.len(), values.as_slice())
}

/// Sum of two weight matrices where a single row stands for every run
fn add_runs(aa: &Mat, bb: &Mat) -> anyhow::Result<Mat> {
    anyhow::ensure!(
        aa.ncols() == bb.ncols(),
        "weights over {} and {} data points",
        aa.ncols(),
        bb.ncols()
    );
    match (aa.nrows(), bb.nrows()) {
        (n, m) if n == m => Ok(aa + bb),
        (1, _) => Ok(Mat::from_fn(bb.nrows(), bb.ncols(), |i, j| bb[(i, j)] + aa[(0, j)])),
        (_, 1) => Ok(Mat::from_fn(aa.nrows(), aa.ncols(), |i, j| aa[(i, j)] + bb[(0, j)])),
        (n, m) => anyhow::bail!("cannot combine {} and {} annealing runs", n, m),
    }
}

impl From<Gsm> for AnyModel {
    fn from(m: Gsm) -> Self {
        AnyModel::Gsm(m)
    }
}

impl From<MoGaussian> for AnyModel {
    fn from(m: MoGaussian) -> Self {
        AnyModel::MoGaussian(m)
    }
}

impl From<Isa> for AnyModel {
    fn from(m: Isa) -> Self {
        AnyModel::Isa(Box::new(m))
    }
}

impl From<ConcatModel> for AnyModel {
    fn from(m: ConcatModel) -> Self {
        AnyModel::Concat(m)
    }
}

impl From<StackedModel<AnyModel>> for AnyModel {
    fn from(m: StackedModel<AnyModel>) -> Self {
        AnyModel::Stacked(Box::new(m))
    }
}

impl Distribution for AnyModel {
    fn dim(&self) -> usize {
        self.inner().dim()
    }

    fn initialize(&mut self, data: &Mat) -> anyhow::Result<()> {
        self.inner_mut().initialize(data)
    }

    fn train(&mut self, data: &Mat) -> anyhow::Result<()> {
        self.inner_mut().train(data)
    }

    fn sample(&self, num_samples: usize, rng: &mut dyn RngCore) -> anyhow::Result<Mat> {
        self.inner().sample(num_samples, rng)
    }

    fn loglikelihood(&self, data: &Mat, rng: &mut dyn RngCore) -> anyhow::Result<DVec> {
        self.inner().loglikelihood(data, rng)
    }
}

/// The first `dim` rows go to the first model, the next rows to the
/// second, and so on. The joint density is the product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcatModel {
    models: Vec<AnyModel>,
}

impl ConcatModel {
    pub fn new(models: Vec<AnyModel>) -> anyhow::Result<Self> {
        anyhow::ensure!(!models.is_empty(), "concatenation of zero models");
        Ok(Self { models })
    }

    pub fn models(&self) -> &[AnyModel] {
        &self.models
    }

    fn row_blocks(&self, data: &Mat) -> anyhow::Result<Vec<Mat>> {
        anyhow::ensure!(
            data.nrows() == self.dim(),
            "concatenated model of dimension {} got {} rows",
            self.dim(),
            data.nrows()
        );
        let mut lb = 0;
        Ok(self
            .models
            .iter()
            .map(|m| {
                let block = data.rows(lb, m.dim()).into_owned();
                lb += m.dim();
                block
            })
            .collect())
    }
}

impl Distribution for ConcatModel {
    fn dim(&self) -> usize {
        self.models.iter().map(|m| m.dim()).sum()
    }

    fn initialize(&mut self, data: &Mat) -> anyhow::Result<()> {
        let blocks = self.row_blocks(data)?;
        for (m, block) in self.models.iter_mut().zip(blocks.iter()) {
            m.initialize(block)?;
        }
        Ok(())
    }

    fn train(&mut self, data: &Mat) -> anyhow::Result<()> {
        let blocks = self.row_blocks(data)?;
        for (m, block) in self.models.iter_mut().zip(blocks.iter()) {
            m.train(block)?;
        }
        Ok(())
    }

    fn sample(&self, num_samples: usize, rng: &mut dyn RngCore) -> anyhow::Result<Mat> {
        let parts = self
            .models
            .iter()
            .map(|m| m.sample(num_samples, &mut *rng))
            .collect::<anyhow::Result<Vec<_>>>()?;
        vstack(&parts)
    }

    fn loglikelihood(&self, data: &Mat, rng: &mut dyn RngCore) -> anyhow::Result<DVec> {
        let blocks = self.row_blocks(data)?;
        let mut ret = DVec::zeros(data.ncols());
        for (m, block) in self.models.iter().zip(blocks.iter()) {
            ret += m.loglikelihood(block, rng)?;
        }
        Ok(ret)
    }
}
