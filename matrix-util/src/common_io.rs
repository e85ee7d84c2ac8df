use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

fn is_gzipped(file: &str) -> bool {
    Path::new(file)
        .extension()
        .and_then(|x| x.to_str())
        .is_some_and(|x| x.eq_ignore_ascii_case("gz"))
}

/// Comment lines start with `#` or `%`; blank lines are skipped too
fn is_data_line(line: &str) -> bool {
    let line = line.trim_start();
    !(line.is_empty() || line.starts_with('#') || line.starts_with('%'))
}

///
/// Open a file for reading; `.gz` files are decompressed on the fly
///
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("cannot open {}: {}", input_file, e))?;
    if is_gzipped(input_file) {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

///
/// Open a file for writing; `.gz` files are compressed on the fly and
/// `stdout` writes to the standard output
///
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    let file = File::create(output_file)
        .map_err(|e| anyhow::anyhow!("cannot create {}: {}", output_file, e))?;
    if is_gzipped(output_file) {
        let encoder = GzEncoder::new(file, flate2::Compression::default());
        Ok(Box::new(BufWriter::new(encoder)))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

///
/// Write one line per item
///
/// * `lines` - anything printable
/// * `output_file` - file name, gzipped if it ends with `.gz`
///
pub fn write_lines<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        match writeln!(buf, "{}", line) {
            Ok(()) => {}
            // a closed pipe (e.g. `| head`) is not a failure
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    buf.flush()?;
    Ok(())
}

///
/// Read a delimited file of numbers into rows
///
/// * `input_file` - file name, gzipped if it ends with `.gz`
/// * `delim` - field separator
/// * `skip` - number of header lines after comments are dropped
///
pub fn read_numeric_rows(
    input_file: &str,
    delim: &str,
    skip: Option<usize>,
) -> anyhow::Result<Vec<Vec<f64>>> {
    let lines: Vec<(usize, String)> = open_buf_reader(input_file)?
        .lines()
        .enumerate()
        .map(|(i, line)| line.map(|l| (i + 1, l)))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(_, l)| is_data_line(l))
        .collect();

    let skip = skip.unwrap_or(0);
    anyhow::ensure!(
        lines.len() > skip,
        "{}: no data after {} header line(s)",
        input_file,
        skip
    );

    lines[skip..]
        .par_iter()
        .map(|(lineno, line)| -> anyhow::Result<Vec<f64>> {
            line.trim_end()
                .split(delim)
                .map(|word| {
                    word.trim().parse::<f64>().map_err(|e| {
                        anyhow::anyhow!("{}:{}: bad number `{}`: {}", input_file, lineno, word, e)
                    })
                })
                .collect()
        })
        .collect()
}

///
/// Create the parent directory of `file` if needed
///
pub fn mkdir_parent(file: &str) -> anyhow::Result<()> {
    match Path::new(file).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(std::fs::create_dir_all(dir)?),
        _ => Ok(()),
    }
}

///
/// A fresh file name in the system temp directory, ending with `suffix`
///
pub fn temp_file_path(suffix: &str) -> anyhow::Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("matrix-util-")
        .suffix(suffix)
        .tempfile()?;
    let (_, path) = file.keep()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_not_data() {
        assert!(!is_data_line("# header"));
        assert!(!is_data_line("  % matlab style"));
        assert!(!is_data_line("   "));
        assert!(is_data_line("1\t2"));
    }

    #[test]
    fn gzip_is_chosen_by_extension() {
        assert!(is_gzipped("patches.tsv.gz"));
        assert!(is_gzipped("PATCHES.GZ"));
        assert!(!is_gzipped("patches.tsv"));
    }
}
