//! Column-block data parallelism.
//!
//! Independent column blocks of a matrix are dispatched to the rayon
//! pool of the calling thread; the results are concatenated back in
//! the original column order no matter which worker finishes first.
//! Workers only ever see an immutable view of their block.
//!
//! Binaries size the global pool once with
//! [`init_thread_pool`]; nothing here builds a pool per call.

use crate::dmatrix_util::hstack;
use crate::utils::generate_block_intervals;
use crate::Mat;
use log::debug;
use rayon::prelude::*;

/// Number of worker threads to use given a requested maximum
pub fn effective_threads(max_threads: usize) -> usize {
    if max_threads == 0 {
        num_cpus::get()
    } else {
        num_cpus::get().min(max_threads)
    }
}

/// Size the global rayon pool (0 = all logical CPUs). Only the first
/// call has an effect.
pub fn init_thread_pool(max_threads: usize) -> anyhow::Result<()> {
    let num_threads = effective_threads(max_threads);
    if rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
        .is_err()
    {
        debug!("global thread pool already initialized");
    }
    Ok(())
}

/// Apply `func` to contiguous column blocks of `data` and concatenate
/// the returned matrices horizontally.
///
/// * `data` - data points stored in columns
/// * `max_threads` - upper bound on the number of blocks (0 = one per
///   logical CPU)
/// * `func` - `(first_column, block) -> block_result`; `first_column`
///   is the index of the block's first column in `data`, and every
///   result must have the same number of rows
///
/// Random draws inside `func` should be seeded by the global column
/// index (`first_column + j`) so that results do not depend on how the
/// columns were split. The first failing block aborts the whole
/// computation.
pub fn map_over_columns<F>(data: &Mat, max_threads: usize, func: F) -> anyhow::Result<Mat>
where
    F: Fn(usize, &Mat) -> anyhow::Result<Mat> + Sync + Send,
{
    let num_blocks = if max_threads == 0 {
        num_cpus::get()
    } else {
        max_threads
    };
    let blocks = generate_block_intervals(data.ncols(), num_blocks);

    debug!(
        "dispatching {} columns in {} blocks",
        data.ncols(),
        blocks.len()
    );

    let fit_block_fn = |&(lb, ub): &(usize, usize)| -> anyhow::Result<Mat> {
        let block = data.columns(lb, ub - lb).into_owned();
        func(lb, &block)
    };

    let results: Vec<anyhow::Result<Mat>> = if blocks.len() <= 1 {
        blocks.iter().map(fit_block_fn).collect()
    } else {
        blocks.par_iter().map(fit_block_fn).collect()
    };

    let results = results.into_iter().collect::<anyhow::Result<Vec<_>>>()?;
    hstack(&results)
}

/// Seed for the random draws of column `column` under a base `seed`
pub fn column_seed(seed: u64, column: usize) -> u64 {
    seed.wrapping_add(column as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::SampleOps;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn column_order_is_preserved() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(17);
        let xx = Mat::rnorm_with(3, 101, &mut rng);

        let yy = map_over_columns(&xx, 4, |_, block| Ok(block * 2.0))?;
        assert_eq!(yy, &xx * 2.0);
        Ok(())
    }

    #[test]
    fn first_error_propagates() {
        let xx = Mat::zeros(2, 40);
        let ret = map_over_columns(&xx, 4, |lb, block| {
            if lb > 0 {
                anyhow::bail!("block at column {} failed", lb)
            }
            Ok(block.clone())
        });
        assert!(ret.is_err());
    }

    #[test]
    fn column_seeded_draws_ignore_the_split() -> anyhow::Result<()> {
        use rand::Rng;
        let xx = Mat::zeros(2, 37);
        let draw = |lb: usize, block: &Mat| -> anyhow::Result<Mat> {
            Ok(Mat::from_fn(1, block.ncols(), |_, j| {
                let mut rng = SmallRng::seed_from_u64(column_seed(9, lb + j));
                rng.random::<f64>()
            }))
        };
        let one = map_over_columns(&xx, 1, draw)?;
        let many = map_over_columns(&xx, 8, draw)?;
        assert_eq!(one, many);
        Ok(())
    }

    #[test]
    fn global_pool_is_sized_once() -> anyhow::Result<()> {
        init_thread_pool(2)?;
        init_thread_pool(3)?;
        let xx = Mat::zeros(1, 10);
        let yy = map_over_columns(&xx, 5, |lb, block| Ok(block.add_scalar(lb as f64)))?;
        assert_eq!(yy[(0, 9)], 8.0);
        Ok(())
    }
}
