//! Overcomplete Independent Subspace Analysis.
//!
//! Data points are stored in columns. The model explains `x = A s`
//! where the hidden causes `s` fall into independent subspaces, each
//! with a radially symmetric Gaussian scale mixture prior.

pub mod concat;
pub mod experiment;
pub mod gsm;
pub mod isa;
pub mod mog;
pub mod optim;
pub mod preprocess;
pub mod stacked;
pub mod traits;
pub mod transforms;

pub use concat::{AnyModel, ConcatModel};
pub use experiment::ExperimentRecord;
pub use gsm::{Gsm, GsmInit};
pub use isa::{Isa, IsaConfig, IsaOptions, Phase};
pub use mog::MoGaussian;
pub use stacked::StackedModel;
pub use traits::{Distribution, Transform};
pub use transforms::AnyTransform;

pub use matrix_util::{DVec, Mat};

/// Bits per dimension from natural-log likelihoods
pub fn bits_per_dim(loglik: &DVec, dim: usize) -> f64 {
    -loglik.mean() / std::f64::consts::LN_2 / dim as f64
}
