//! Per-market fill history on disk.
//!
//! Layout: `{data_dir}/fills-{condition_id[2..20]}.json`. The 18-character
//! key prefix keeps filenames readable; the full condition id inside the
//! document guards against prefix collisions, which are treated as
//! corruption rather than silently merged.
//!
//! Schema history:
//! - v1: condition id, token ids, fills, initial position
//! - v2: adds cumulative economics and operator-seeded initial cost basis
//!
//! Loading a v1 document leaves the v2 fields absent; economics are
//! recomputed from fills by the position tracker and persisted on the next
//! write.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{write_atomic, StoreError};
use crate::models::{Fill, FillEconomics};

pub const SCHEMA_VERSION: u32 = 2;

/// On-chain balance snapshot taken when tracking began.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialPosition {
    pub yes_tokens: f64,
    pub no_tokens: f64,
    pub timestamp_ms: i64,
}

/// Operator-provided average cost of pre-existing inventory. Seeds the
/// economics so realized P&L is meaningful from the first round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialCostBasis {
    pub yes_avg_price: f64,
    pub no_avg_price: f64,
}

/// The whole persisted document for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub schema_version: u32,
    pub condition_id: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub fills: Vec<Fill>,
    pub last_updated_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_position: Option<InitialPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub economics: Option<FillEconomics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_cost_basis: Option<InitialCostBasis>,
}

impl MarketState {
    pub fn new(condition_id: &str, yes_token_id: &str, no_token_id: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            condition_id: condition_id.to_string(),
            yes_token_id: yes_token_id.to_string(),
            no_token_id: no_token_id.to_string(),
            fills: Vec::new(),
            last_updated_ms: Utc::now().timestamp_millis(),
            initial_position: None,
            economics: None,
            initial_cost_basis: None,
        }
    }
}

/// Summary counters for operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub condition_id: String,
    pub fill_count: usize,
    pub first_fill_ms: Option<i64>,
    pub last_fill_ms: Option<i64>,
    pub last_updated_ms: i64,
    pub has_initial_position: bool,
    pub realized_pnl: Option<f64>,
}

/// Handle over the data directory. File handles are scoped per operation;
/// the handle itself is cheap to clone.
#[derive(Debug, Clone)]
pub struct FillStore {
    data_dir: PathBuf,
}

impl FillStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Deterministic 18-character filename key: condition id with the 0x
    /// prefix stripped, truncated.
    fn file_key(condition_id: &str) -> &str {
        let start = 2.min(condition_id.len());
        let end = 20.min(condition_id.len());
        &condition_id[start..end]
    }

    pub fn path_for(&self, condition_id: &str) -> PathBuf {
        self.data_dir
            .join(format!("fills-{}.json", Self::file_key(condition_id)))
    }

    /// Load the persisted state for a market, if any. A document whose
    /// condition id disagrees with the requested one is a prefix collision
    /// and is surfaced rather than used.
    pub fn load(&self, condition_id: &str) -> Result<Option<MarketState>, StoreError> {
        let path = self.path_for(condition_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut state: MarketState = serde_json::from_str(&raw)?;

        if state.condition_id != condition_id {
            return Err(StoreError::Corrupt(format!(
                "{} holds state for {} but {} was requested",
                path.display(),
                state.condition_id,
                condition_id
            )));
        }

        if state.schema_version < SCHEMA_VERSION {
            debug!(
                condition_id = %condition_id,
                from = state.schema_version,
                to = SCHEMA_VERSION,
                "migrating fill store schema"
            );
            // v1 -> v2: the added fields deserialize as absent. The version
            // stamp moves forward on the next save.
            state.schema_version = SCHEMA_VERSION;
        } else if state.schema_version > SCHEMA_VERSION {
            warn!(
                condition_id = %condition_id,
                version = state.schema_version,
                "fill store written by a newer schema, loading best-effort"
            );
        }

        Ok(Some(state))
    }

    /// Persist the whole document atomically.
    pub fn save(&self, state: &MarketState) -> Result<(), StoreError> {
        let mut state = state.clone();
        state.schema_version = SCHEMA_VERSION;
        state.last_updated_ms = Utc::now().timestamp_millis();

        let path = self.path_for(&state.condition_id);
        let bytes = serde_json::to_vec_pretty(&state)?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }

    /// Append a fill, or replace an existing record with the same id when
    /// the new status is strictly later in the progression. List order is
    /// preserved either way.
    pub fn append_fill(
        &self,
        condition_id: &str,
        yes_token_id: &str,
        no_token_id: &str,
        fill: &Fill,
    ) -> Result<(), StoreError> {
        let mut state = self
            .load(condition_id)?
            .unwrap_or_else(|| MarketState::new(condition_id, yes_token_id, no_token_id));

        match state.fills.iter_mut().find(|f| f.id == fill.id) {
            Some(existing) => {
                if fill.status.rank() > existing.status.rank() {
                    debug!(
                        fill_id = %fill.id,
                        from = existing.status.as_str(),
                        to = fill.status.as_str(),
                        "fill status progressed"
                    );
                    *existing = fill.clone();
                } else {
                    debug!(fill_id = %fill.id, status = fill.status.as_str(), "duplicate fill ignored");
                }
            }
            None => state.fills.push(fill.clone()),
        }

        self.save(&state)
    }

    /// Record the on-chain snapshot tracking starts from, optionally with an
    /// operator-provided cost basis for the pre-existing inventory.
    pub fn set_initial_position(
        &self,
        condition_id: &str,
        yes_token_id: &str,
        no_token_id: &str,
        yes_tokens: f64,
        no_tokens: f64,
        cost_basis: Option<InitialCostBasis>,
    ) -> Result<(), StoreError> {
        let mut state = self
            .load(condition_id)?
            .unwrap_or_else(|| MarketState::new(condition_id, yes_token_id, no_token_id));

        state.initial_position = Some(InitialPosition {
            yes_tokens,
            no_tokens,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
        if cost_basis.is_some() {
            state.initial_cost_basis = cost_basis;
        }
        self.save(&state)?;

        info!(
            condition_id = %condition_id,
            yes = yes_tokens,
            no = no_tokens,
            "initial position recorded"
        );
        Ok(())
    }

    /// Remove the market's document entirely.
    pub fn clear(&self, condition_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(condition_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self, condition_id: &str) -> Result<Option<StoreStats>, StoreError> {
        let Some(state) = self.load(condition_id)? else {
            return Ok(None);
        };
        Ok(Some(StoreStats {
            condition_id: state.condition_id.clone(),
            fill_count: state.fills.len(),
            first_fill_ms: state.fills.first().map(|f| f.timestamp_ms),
            last_fill_ms: state.fills.last().map(|f| f.timestamp_ms),
            last_updated_ms: state.last_updated_ms,
            has_initial_position: state.initial_position.is_some(),
            realized_pnl: state.economics.as_ref().map(|e| e.realized_pnl),
        }))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FillStatus, Side};
    use tempfile::TempDir;

    const COND: &str = "0x1234567890abcdef1234567890abcdef12345678";

    fn store() -> (TempDir, FillStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = FillStore::new(dir.path());
        (dir, store)
    }

    fn fill(id: &str, status: FillStatus) -> Fill {
        Fill {
            id: id.to_string(),
            token_id: "yes-token".into(),
            condition_id: COND.into(),
            side: Side::Buy,
            price: 0.49,
            size: 10.0,
            timestamp_ms: 1_700_000_000_000,
            order_id: Some("ord-1".into()),
            status,
        }
    }

    #[test]
    fn file_key_strips_prefix_and_truncates() {
        assert_eq!(FillStore::file_key(COND), "1234567890abcdef12");
        assert_eq!(FillStore::file_key("0xab"), "ab");
    }

    #[test]
    fn load_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.load(COND).expect("load").is_none());
    }

    #[test]
    fn save_load_round_trip() {
        let (_dir, store) = store();
        let mut state = MarketState::new(COND, "yes-token", "no-token");
        state.fills.push(fill("t1", FillStatus::Matched));
        store.save(&state).expect("save");

        let loaded = store.load(COND).expect("load").expect("present");
        assert_eq!(loaded.condition_id, state.condition_id);
        assert_eq!(loaded.fills.len(), 1);
        assert_eq!(loaded.fills[0].id, "t1");
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn append_fill_is_idempotent_by_id() {
        let (_dir, store) = store();
        store
            .append_fill(COND, "yes-token", "no-token", &fill("t1", FillStatus::Matched))
            .expect("append");
        store
            .append_fill(COND, "yes-token", "no-token", &fill("t1", FillStatus::Matched))
            .expect("append again");

        let state = store.load(COND).expect("load").expect("present");
        assert_eq!(state.fills.len(), 1);
    }

    #[test]
    fn append_fill_replaces_on_later_status_only() {
        let (_dir, store) = store();
        store
            .append_fill(COND, "yes-token", "no-token", &fill("t1", FillStatus::Mined))
            .expect("append");
        // Earlier status must not regress the record.
        store
            .append_fill(COND, "yes-token", "no-token", &fill("t1", FillStatus::Matched))
            .expect("stale append");
        let state = store.load(COND).expect("load").expect("present");
        assert_eq!(state.fills[0].status, FillStatus::Mined);

        store
            .append_fill(COND, "yes-token", "no-token", &fill("t1", FillStatus::Confirmed))
            .expect("progress");
        let state = store.load(COND).expect("load").expect("present");
        assert_eq!(state.fills.len(), 1);
        assert_eq!(state.fills[0].status, FillStatus::Confirmed);
    }

    #[test]
    fn prefix_collision_is_corruption() {
        let (_dir, store) = store();
        // Two ids sharing the first 20 chars map to the same file.
        let other = format!("{}ffff", &COND[..COND.len() - 4]);
        assert_eq!(store.path_for(COND), store.path_for(&other));

        store
            .append_fill(COND, "yes-token", "no-token", &fill("t1", FillStatus::Matched))
            .expect("append");
        let err = store.load(&other).expect_err("collision must surface");
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn v1_document_loads_with_v2_fields_absent() {
        let (_dir, store) = store();
        let v1 = serde_json::json!({
            "schema_version": 1,
            "condition_id": COND,
            "yes_token_id": "yes-token",
            "no_token_id": "no-token",
            "fills": [],
            "last_updated_ms": 0
        });
        let path = store.path_for(COND);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_vec_pretty(&v1).unwrap()).unwrap();

        let state = store.load(COND).expect("load").expect("present");
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert!(state.economics.is_none());
        assert!(state.initial_cost_basis.is_none());
    }

    #[test]
    fn clear_removes_the_document() {
        let (_dir, store) = store();
        store
            .append_fill(COND, "yes-token", "no-token", &fill("t1", FillStatus::Matched))
            .expect("append");
        store.clear(COND).expect("clear");
        assert!(store.load(COND).expect("load").is_none());
        // Clearing again is fine.
        store.clear(COND).expect("clear twice");
    }

    #[test]
    fn stats_summarize_the_document() {
        let (_dir, store) = store();
        assert!(store.stats(COND).expect("stats").is_none());

        store
            .append_fill(COND, "yes-token", "no-token", &fill("t1", FillStatus::Matched))
            .expect("append");
        let stats = store.stats(COND).expect("stats").expect("present");
        assert_eq!(stats.fill_count, 1);
        assert_eq!(stats.first_fill_ms, Some(1_700_000_000_000));
        assert!(!stats.has_initial_position);
    }
}
