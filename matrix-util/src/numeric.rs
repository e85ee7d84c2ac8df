use nalgebra::{Dim, Matrix, RawStorage};

/// A non-finite value (NaN or ±Inf) surfaced in a numerical routine.
///
/// Downstream likelihood numbers are only meaningful if every
/// intermediate is finite, so this is always propagated, never
/// recovered from.
#[derive(Debug, Clone)]
pub struct NonFinite {
    pub context: String,
}

impl std::fmt::Display for NonFinite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "non-finite value encountered in {}", self.context)
    }
}

impl std::error::Error for NonFinite {}

/// Fail if any element of `xx` is NaN or infinite
/// * `xx` - matrix, vector or view to check
/// * `context` - name of the operation that produced `xx`
pub fn check_finite<R, C, S>(xx: &Matrix<f64, R, C, S>, context: &str) -> anyhow::Result<()>
where
    R: Dim,
    C: Dim,
    S: RawStorage<f64, R, C>,
{
    if xx.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(NonFinite {
            context: context.to_string(),
        }
        .into())
    }
}

/// Fail if `x` is NaN or infinite, otherwise hand it back
pub fn check_finite_scalar(x: f64, context: &str) -> anyhow::Result<f64> {
    if x.is_finite() {
        Ok(x)
    } else {
        Err(NonFinite {
            context: context.to_string(),
        }
        .into())
    }
}

/// Checked natural log; non-positive arguments are domain errors
pub fn checked_ln(x: f64, context: &str) -> anyhow::Result<f64> {
    if x > 0.0 && x.is_finite() {
        Ok(x.ln())
    } else {
        anyhow::bail!("log of non-positive value {} in {}", x, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DVec, Mat};

    #[test]
    fn detects_nan_and_inf() {
        let mut xx = Mat::zeros(3, 3);
        assert!(check_finite(&xx, "zeros").is_ok());

        xx[(1, 2)] = f64::NAN;
        let err = check_finite(&xx, "nan test").unwrap_err();
        assert!(err.downcast_ref::<NonFinite>().is_some());

        assert!(check_finite(&DVec::from_vec(vec![1.0, f64::NEG_INFINITY]), "vec").is_err());
        assert!(check_finite_scalar(f64::INFINITY, "inf").is_err());
        assert!(checked_ln(0.0, "zero").is_err());
        assert!(checked_ln(-1.0, "negative").is_err());
        assert_eq!(checked_ln(1.0, "one").unwrap(), 0.0);
    }
}
