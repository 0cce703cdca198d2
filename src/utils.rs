//! Utility functions that may be helpful for feeding and
//! testing MapReduce.
//!

use std::fs::File;
use std::io::Read;
use std::num::NonZeroUsize;
use std::thread;

use anyhow::{anyhow, Context, Result};
use glob::glob;

/// Number of workers a stage uses when nothing else is configured.
pub fn available_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Split a byte buffer into line records.
///
/// A line that is not valid UTF-8 becomes an error record rather than
/// failing the whole buffer, so the engine can report exactly which record
/// was malformed. `source` is only used to label those errors.
pub fn lines_from_bytes(buf: &[u8], source: &str) -> Vec<Result<String>> {
    if buf.is_empty() {
        return Vec::new();
    }
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.split(|byte| *byte == b'\n')
        .enumerate()
        .map(|(line_no, line)| {
            String::from_utf8(line.to_vec())
                .with_context(|| format!("{}:{}: line is not valid UTF-8", source, line_no + 1))
        })
        .collect()
}

/// Read every file matched by `pattern` and return its lines as records,
/// in path order.
///
/// Returns an error if the pattern is invalid, matches nothing, or a matched
/// file cannot be read.
pub fn read_records(pattern: &str) -> Result<Vec<Result<String>>> {
    let mut paths = glob(pattern)
        .with_context(|| format!("invalid input glob `{}`", pattern))?
        .collect::<Result<Vec<_>, _>>()?;
    if paths.is_empty() {
        return Err(anyhow!("no input files match `{}`", pattern));
    }
    paths.sort();

    let mut records = Vec::new();
    for pathspec in paths {
        let mut buf = Vec::new();
        {
            // a scope so that the file is closed right after reading
            let mut file = File::open(&pathspec)
                .with_context(|| format!("failed to open {}", pathspec.display()))?;
            file.read_to_end(&mut buf)?;
        }
        let filename = pathspec.to_str().unwrap_or("unknown");
        records.extend(lines_from_bytes(&buf, filename));
    }
    Ok(records)
}
