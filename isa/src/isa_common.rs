pub use clap::{Args, Parser, Subcommand, ValueEnum};
pub use isa_model::isa::{
    GibbsOptions, LbfgsParams, LikelihoodOptions, OfParams, TrainMethod, TrainMethodKind,
    TrainingSession,
};
pub use isa_model::transforms::{LinearTransform, WhiteningKind, WhiteningTransform};
pub use isa_model::*;
pub use log::info;
pub use matrix_util::parallel::init_thread_pool;
pub use matrix_util::traits::IoOps;

pub const DEFAULT_SEED: u64 = 42;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum PriorInit {
    Laplace,
    Student,
    Gaussian,
}

impl From<PriorInit> for GsmInit {
    fn from(init: PriorInit) -> Self {
        match init {
            PriorInit::Laplace => GsmInit::Laplace,
            PriorInit::Student => GsmInit::Student,
            PriorInit::Gaussian => GsmInit::Gaussian,
        }
    }
}

pub fn init_logger(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}

/// Columns `[lb, ub)` of `data`, with `ub` clipped to the number of columns
pub fn column_range(data: &Mat, lb: usize, ub: usize) -> anyhow::Result<Mat> {
    let ub = ub.min(data.ncols());
    anyhow::ensure!(
        lb < ub,
        "empty column range [{}, {}) of {} columns",
        lb,
        ub,
        data.ncols()
    );
    Ok(data.columns(lb, ub - lb).into_owned())
}

/// Side length of square patches flattened into `dim` pixels
pub fn square_patch_size(dim: usize) -> Option<usize> {
    let side = (dim as f64).sqrt().round() as usize;
    (side > 1 && side * side == dim).then_some(side)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_range_is_clipped() -> anyhow::Result<()> {
        let data = Mat::from_fn(2, 5, |i, j| (i * 10 + j) as f64);
        let sub = column_range(&data, 3, 100)?;
        assert_eq!(sub.shape(), (2, 2));
        assert_eq!(sub[(1, 0)], 13.0);
        assert!(column_range(&data, 5, 8).is_err());
        Ok(())
    }

    #[test]
    fn only_square_dimensions_are_patches() {
        assert_eq!(square_patch_size(64), Some(8));
        assert_eq!(square_patch_size(63), None);
        assert_eq!(square_patch_size(1), None);
    }
}
