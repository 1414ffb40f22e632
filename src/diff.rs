//! Change detection against the ledger's recorded fingerprints.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::FileDescriptor;

/// Which discovered files a run should process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    /// Every discovered file.
    Full,
    /// Only files that are new or whose fingerprint changed.
    #[default]
    Incremental,
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexMode::Full => write!(f, "full"),
            IndexMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for IndexMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(IndexMode::Full),
            "incremental" => Ok(IndexMode::Incremental),
            other => anyhow::bail!("unknown index mode '{}': expected full or incremental", other),
        }
    }
}

/// Selects the descriptors that need re-processing, preserving input order.
///
/// `known` maps path to the fingerprint stored at the last commit.
pub fn select_changed(
    files: &[FileDescriptor],
    known: &HashMap<String, String>,
    mode: IndexMode,
    force_reembed: bool,
) -> Vec<FileDescriptor> {
    if force_reembed || mode == IndexMode::Full {
        return files.to_vec();
    }
    files
        .iter()
        .filter(|f| known.get(&f.path) != Some(&f.fingerprint))
        .cloned()
        .collect()
}
