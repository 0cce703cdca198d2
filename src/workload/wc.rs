//! A MapReduce-compatible implementation of word count.
//!

use crate::*;
use anyhow::Result;

/// Counts how often each word occurs across all records.
///
/// Words are case-insensitive and made of the letters `a` to `z` only; any
/// other character (digits and punctuation included) separates words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCount;

impl Mapper for WordCount {
    type Record = String;
    type Key = String;
    type Value = u64;

    fn map(&self, record: String) -> MapOutput<String, u64> {
        let pairs = record
            .to_lowercase()
            .split(|c: char| !c.is_ascii_lowercase())
            .filter(|word| !word.is_empty())
            .map(|word| KeyValue::new(word.to_string(), 1))
            .collect();
        Ok(pairs)
    }
}

impl Reducer<String, u64> for WordCount {
    type Output = u64;

    fn reduce(&self, _key: &String, values: Vec<u64>) -> Result<u64> {
        Ok(values.into_iter().sum())
    }
}
