use crate::{DVec, Mat};
use matrix_util::dmatrix_linalg::symmetric_eigen_sorted;
use matrix_util::traits::MatOps;
use matrix_util::{check_finite, checked_ln};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;

/// Log-transform, centre and symmetrically whiten raw intensities.
///
/// * `data` - non-negative intensities, one data point per column;
///   exact zeros are replaced by one before taking logs
/// * `noise_level` - standard deviation of Gaussian noise added after
///   the log-transform
/// * `shuffle` - randomly permute the columns
///
/// Directions of zero variance are dropped from the whitening matrix,
/// so the output keeps the input dimension but may be rank deficient.
pub fn preprocess<R: Rng + ?Sized>(
    data: &Mat,
    noise_level: Option<f64>,
    shuffle: bool,
    rng: &mut R,
) -> anyhow::Result<Mat> {
    anyhow::ensure!(data.ncols() > 1, "preprocessing needs at least two data points");

    let mut xx = data.clone();
    for x in xx.iter_mut() {
        let v = if *x == 0.0 { 1.0 } else { *x };
        *x = checked_ln(v, "log-transform of the data")?;
    }

    if let Some(sd) = noise_level.filter(|&sd| sd > 0.0) {
        for x in xx.iter_mut() {
            *x += sd * rng.sample::<f64, _>(StandardNormal);
        }
    }

    xx.centre_rows_inplace();

    if shuffle {
        let mut order: Vec<usize> = (0..xx.ncols()).collect();
        order.shuffle(rng);
        xx = xx.select_columns(order.iter());
    }

    let (values, vectors) = symmetric_eigen_sorted(&xx.row_covariance());
    let keep: Vec<usize> = (0..values.len()).filter(|&k| values[k] > 0.0).collect();
    anyhow::ensure!(!keep.is_empty(), "data has no variance");

    let uu = vectors.select_columns(keep.iter());
    let inv_sqrt = DVec::from_iterator(keep.len(), keep.iter().map(|&k| 1.0 / values[k].sqrt()));
    let whitening = &uu * Mat::from_diagonal(&inv_sqrt) * uu.transpose();

    let ret = whitening * xx;
    check_finite(&ret, "preprocessed data")?;
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use matrix_util::traits::SampleOps;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn output_is_centred_and_white() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(30);
        let mut raw = Mat::runif_with(4, 500, &mut rng).map(|x| 1.0 + 100.0 * x);
        raw[(0, 0)] = 0.0;

        let yy = preprocess(&raw, Some(0.01), true, &mut rng)?;
        assert_eq!(yy.shape(), (4, 500));
        assert_abs_diff_eq!(yy.column_mean(), DVec::zeros(4), epsilon = 1e-10);
        assert_abs_diff_eq!(yy.row_covariance(), Mat::identity(4, 4), epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn negative_intensities_are_an_error() {
        let mut rng = SmallRng::seed_from_u64(1);
        let raw = Mat::from_element(2, 3, -1.0);
        assert!(preprocess(&raw, None, false, &mut rng).is_err());
    }
}
