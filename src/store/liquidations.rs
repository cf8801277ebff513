//! Ledger of markets currently being unwound.
//!
//! A single `liquidations.json` shared across markets. The orchestrator
//! consults it at startup so discovery does not re-select a market that is
//! still being exited.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::{write_atomic, StoreError};

/// Escalation stage of a liquidation. Later stages cross more of the spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidationStage {
    Passive,
    Skewed,
    Aggressive,
    Market,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationRecord {
    pub condition_id: String,
    pub started_at_ms: i64,
    pub stage: LiquidationStage,
}

#[derive(Debug, Clone)]
pub struct LiquidationStore {
    path: PathBuf,
}

impl LiquidationStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("liquidations.json"),
        }
    }

    pub fn load_all(&self) -> Result<Vec<LiquidationRecord>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn is_liquidating(&self, condition_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .load_all()?
            .iter()
            .any(|r| r.condition_id == condition_id))
    }

    /// Insert or advance the record for a market.
    pub fn upsert(&self, condition_id: &str, stage: LiquidationStage) -> Result<(), StoreError> {
        let mut records = self.load_all()?;
        match records.iter_mut().find(|r| r.condition_id == condition_id) {
            Some(existing) => existing.stage = stage,
            None => records.push(LiquidationRecord {
                condition_id: condition_id.to_string(),
                started_at_ms: Utc::now().timestamp_millis(),
                stage,
            }),
        }
        self.write(&records)
    }

    pub fn remove(&self, condition_id: &str) -> Result<(), StoreError> {
        let mut records = self.load_all()?;
        records.retain(|r| r.condition_id != condition_id);
        self.write(&records)
    }

    fn write(&self, records: &[LiquidationRecord]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        write_atomic(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn upsert_then_remove_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = LiquidationStore::new(dir.path());

        assert!(store.load_all().expect("load").is_empty());
        store
            .upsert("0xaaa", LiquidationStage::Passive)
            .expect("upsert");
        assert!(store.is_liquidating("0xaaa").expect("check"));

        // Advancing the stage keeps one record.
        store
            .upsert("0xaaa", LiquidationStage::Aggressive)
            .expect("advance");
        let all = store.load_all().expect("load");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].stage, LiquidationStage::Aggressive);

        store.remove("0xaaa").expect("remove");
        assert!(!store.is_liquidating("0xaaa").expect("check"));
    }

    #[test]
    fn stage_serializes_lowercase() {
        let json = serde_json::to_string(&LiquidationStage::Skewed).expect("serialize");
        assert_eq!(json, "\"skewed\"");
    }
}
