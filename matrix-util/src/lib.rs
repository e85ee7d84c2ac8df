pub mod common_io;
pub mod dmatrix_io;
pub mod dmatrix_linalg;
pub mod dmatrix_util;
pub mod numeric;
pub mod parallel;
pub mod traits;
pub mod utils;

pub use numeric::{check_finite, check_finite_scalar, checked_ln, NonFinite};

/// Dense column-major matrix; data points are stored in columns
pub type Mat = nalgebra::DMatrix<f64>;

/// Dense column vector
pub type DVec = nalgebra::DVector<f64>;
