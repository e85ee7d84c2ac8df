use rand::Rng;

/// Operations to sample random matrices
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif(dd: usize, nn: usize) -> Self::Mat;

    /// Same as `runif` but driven by a caller-owned generator, so
    /// results are reproducible under a fixed seed
    fn runif_with<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat;

    /// Sample a matrix from `N(0,1)` with a caller-owned generator
    fn rnorm_with<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat;
}

/// Centre rows and summarize their covariance
pub trait MatOps {
    type Mat;
    type Scalar;

    fn centre_rows_inplace(&mut self);
    fn centre_rows(&self) -> Self::Mat;
    fn row_covariance(&self) -> Self::Mat;
}

/// Dense linear algebra needed by (over)complete linear models
pub trait LinalgOps {
    type Mat;
    type Scalar;

    /// Rows spanning the null space of `self` (`(ncols - rank) x ncols`)
    fn nullspace_rows(&self) -> anyhow::Result<Self::Mat>;

    /// `log|det(self)|` for a square matrix
    fn log_abs_det(&self) -> anyhow::Result<Self::Scalar>;

    /// Inverse of a square matrix; singular matrices are an error
    fn checked_inverse(&self) -> anyhow::Result<Self::Mat>;

    /// Symmetric orthogonalization of the rows, `(M M')^{-1/2} M`
    fn orthogonalize_rows(&self) -> anyhow::Result<Self::Mat>;

    /// Moore-Penrose pseudo-inverse of a full row rank matrix
    fn right_pseudo_inverse(&self) -> anyhow::Result<Self::Mat>;
}

/// Read and write matrices from and to files
pub trait IoOps {
    type Scalar;
    type Mat;

    /// `skip` header lines are dropped after comment lines
    fn read_file_delim(file: &str, delim: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat>;

    fn from_tsv(tsv_file: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, "\t", skip)
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, "\t")
    }
}
