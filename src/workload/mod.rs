//! Converts MapReduce application names to actual application code.
//!
//! # Example
//!
//! To get the word count application:
//! ```
//! # use anyhow::Result;
//! use mrlocal::workload::{self, Workload};
//! # fn main() -> Result<()> {
//! let wc = workload::named("wc")?;
//! assert_eq!(wc, Workload::WordCount);
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Result};

pub mod wc;

/// A MapReduce application known by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    WordCount,
}

impl Workload {
    pub fn name(self) -> &'static str {
        match self {
            Workload::WordCount => "wc",
        }
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no application with the given name was found.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" | "word-count" => Some(Workload::WordCount),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no application with the given name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => bail!("No app named `{}` found.", name),
    }
}
