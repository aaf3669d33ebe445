use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    match ext {
        Some("gz") => {
            let output_file = File::create(output_file)?;
            let encoder =
                flate2::write::GzEncoder::new(output_file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => {
            let output_file = File::create(output_file)?;
            Ok(Box::new(BufWriter::new(output_file)))
        }
    }
}

///
/// Write every line into the output_file
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        if let Err(e) = writeln!(buf, "{}", line) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            } else {
                return Err(anyhow::anyhow!("unexpected error: {}", e));
            }
        }
    }
    buf.flush()?;
    Ok(())
}

///
/// Write a tab-separated table with a header line
///
/// * `header` - column names
/// * `columns` - one vector per column, all of equal length
/// * `output_file` - file name--either gzipped or not
///
pub fn write_columns_tsv(
    header: &[&str],
    columns: &[&[f64]],
    output_file: &str,
) -> anyhow::Result<()> {
    if header.len() != columns.len() {
        anyhow::bail!("{} names for {} columns", header.len(), columns.len());
    }
    let nrows = columns.first().map(|c| c.len()).unwrap_or(0);
    if columns.iter().any(|c| c.len() != nrows) {
        anyhow::bail!("columns must have equal length");
    }

    let mut lines: Vec<String> = Vec::with_capacity(nrows + 1);
    lines.push(header.join("\t"));
    for i in 0..nrows {
        let row: Vec<String> = columns.iter().map(|c| c[i].to_string()).collect();
        lines.push(row.join("\t"));
    }
    write_lines(&lines, output_file)
}

///
/// Create a directory if needed
/// * `file` - a file name inside the directory
///
pub fn mkdir(file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    let dir = path.parent().ok_or(anyhow::anyhow!("no parent"))?;
    std::fs::create_dir_all(dir)?;
    Ok(())
}
