//! Crash-safe filesystem persistence.
//!
//! One pretty-printed JSON document per market plus a shared liquidation
//! ledger. Every write goes to a sibling temp file, is fsynced, and is
//! renamed over the target so a crash never leaves a torn document.

mod fill_store;
mod liquidations;

pub use fill_store::{FillStore, InitialCostBasis, InitialPosition, MarketState, StoreStats};
pub use liquidations::{LiquidationRecord, LiquidationStage, LiquidationStore};

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Errors surfaced by the stores. Callers classify corruption separately
/// because it means operator attention, not a retry.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
    /// The document on disk does not belong to the requested market. A
    /// key-prefix collision or a hand-edited file; either way the data
    /// cannot be trusted.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "store I/O error: {}", e),
            Self::Serde(e) => write!(f, "store serialization error: {}", e),
            Self::Corrupt(msg) => write!(f, "store corruption: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}

/// Write `bytes` to `path` atomically: temp sibling, fsync, rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Corrupt(format!("path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
