//! Known-bad historical messages to skip on durable replay.

use crate::error::{Result, StreamError};
use crate::types::Sequence;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Immutable set of `(domain, sequence)` pairs a durable stream drops.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct DiscardList {
    entries: HashMap<String, HashSet<u64>>,
}

impl DiscardList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from explicit pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, Sequence)>) -> Self {
        let mut entries: HashMap<String, HashSet<u64>> = HashMap::new();
        for (domain, seq) in pairs {
            entries.entry(domain.to_string()).or_default().insert(seq.0);
        }
        Self { entries }
    }

    /// Parse lines of the form `domain:<label>:<sequence>`.
    ///
    /// Blank lines are ignored; the middle field is free text.
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut entries: HashMap<String, HashSet<u64>> = HashMap::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() < 3 || parts[0].is_empty() {
                return Err(StreamError::InvalidDiscardEntry {
                    line: index + 1,
                    reason: format!("expected 'domain:label:sequence', got {:?}", line),
                });
            }
            let sequence: u64 = parts[2].parse().map_err(|e| StreamError::InvalidDiscardEntry {
                line: index + 1,
                reason: format!("bad sequence {:?}: {}", parts[2], e),
            })?;
            entries.entry(parts[0].to_string()).or_default().insert(sequence);
        }
        Ok(Self { entries })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn contains(&self, domain: &str, sequence: Sequence) -> bool {
        self.entries
            .get(domain)
            .map_or(false, |seqs| seqs.contains(&sequence.0))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
