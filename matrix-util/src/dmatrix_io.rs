use crate::common_io::{read_numeric_rows, write_lines};
use crate::traits::*;
use crate::Mat;

impl IoOps for Mat {
    type Scalar = f64;
    type Mat = Self;

    fn read_file_delim(file: &str, delim: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat> {
        let rows = read_numeric_rows(file, delim, skip)?;

        let nrows = rows.len();
        let ncols = rows.first().map_or(0, |r| r.len());
        if let Some(i) = rows.iter().position(|r| r.len() != ncols) {
            anyhow::bail!(
                "{}: row {} has {} fields, expected {}",
                file,
                i + 1,
                rows[i].len(),
                ncols
            );
        }

        Ok(Mat::from_row_iterator(
            nrows,
            ncols,
            rows.into_iter().flatten(),
        ))
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()> {
        // rows stay in order, so no parallel formatting here
        let lines: Vec<String> = self
            .row_iter()
            .map(|row| {
                row.iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(delim)
            })
            .collect();

        write_lines(&lines, file)
    }
}
