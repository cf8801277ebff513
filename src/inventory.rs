//! Collateral and outcome-token inventory.
//!
//! Converts collateral to outcome tokens through the conditional-token
//! contract's split, and back through merge. Both go through the
//! multi-owner wallet as a single atomic batch (approval included when the
//! standing allowance is short), because a partially-executed conversion
//! would desync position and collateral.

use anyhow::{bail, Result};
use num_bigint::BigUint;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clients::chain::{
    max_u256, to_base_units, BatchWallet, ChainClient, WalletCall, COLLATERAL_DECIMALS,
};
use crate::config::InventoryConfig;
use crate::models::MarketParams;

/// What the pre-flight saw and decided.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub required_per_side: f64,
    pub yes_balance: f64,
    pub no_balance: f64,
    pub collateral_balance: f64,
    pub gas_balance: f64,
    /// Collateral to split to cover the worse side's deficit, when any.
    pub split_needed: Option<f64>,
    pub ok: bool,
    pub reason: Option<String>,
}

pub struct InventoryManager {
    chain: Arc<ChainClient>,
    wallet: Arc<dyn BatchWallet>,
    params: MarketParams,
    cfg: InventoryConfig,
    /// Account holding funds and positions (the multi-owner wallet).
    owner: String,
}

impl InventoryManager {
    pub fn new(
        chain: Arc<ChainClient>,
        wallet: Arc<dyn BatchWallet>,
        params: MarketParams,
        cfg: InventoryConfig,
        owner: String,
    ) -> Self {
        Self {
            chain,
            wallet,
            params,
            cfg,
            owner,
        }
    }

    /// Check balances against what quoting needs. Reads run in parallel.
    pub async fn preflight(&self, order_size: f64) -> Result<Preflight> {
        let required_per_side = self.cfg.min_tokens_per_side.max(self.params.rewards_min_size);

        let (yes, no, collateral, gas) = tokio::try_join!(
            self.chain.outcome_balance(&self.owner, &self.params.yes_token_id),
            self.chain.outcome_balance(&self.owner, &self.params.no_token_id),
            self.chain.collateral_balance(&self.owner),
            self.chain.native_balance(&self.owner),
        )?;

        let mut report = Preflight {
            required_per_side,
            yes_balance: yes,
            no_balance: no,
            collateral_balance: collateral,
            gas_balance: gas,
            split_needed: None,
            ok: true,
            reason: None,
        };

        if gas < self.cfg.min_gas_balance {
            report.ok = false;
            report.reason = Some(format!(
                "gas balance {:.4} below required {:.4}",
                gas, self.cfg.min_gas_balance
            ));
            return Ok(report);
        }

        // Splitting mints both legs, so one split covers the worse deficit.
        let deficit = (required_per_side - yes)
            .max(required_per_side - no)
            .max(0.0);
        let buy_side_reserve = self.cfg.collateral_reserve_multiplier * order_size;
        let collateral_needed = deficit + buy_side_reserve;

        if deficit > 0.0 {
            if !self.cfg.auto_split {
                report.ok = false;
                report.reason = Some(format!(
                    "holding {:.2}/{:.2} tokens, need {:.2} per side and auto split is off",
                    yes, no, required_per_side
                ));
                return Ok(report);
            }
            report.split_needed = Some(deficit);
        }

        if collateral < collateral_needed {
            report.ok = false;
            report.reason = Some(format!(
                "collateral {:.2} below required {:.2} (deficit {:.2} + reserve {:.2})",
                collateral, collateral_needed, deficit, buy_side_reserve
            ));
            return Ok(report);
        }

        Ok(report)
    }

    /// Run pre-flight and, when allowed, split once to cover the deficit,
    /// then check again. The final report decides whether quoting starts.
    pub async fn ensure_inventory(&self, order_size: f64) -> Result<Preflight> {
        let report = self.preflight(order_size).await?;
        if !report.ok {
            return Ok(report);
        }
        let Some(amount) = report.split_needed else {
            return Ok(report);
        };

        info!(amount, "splitting collateral to cover inventory deficit");
        self.split(amount).await?;
        self.preflight(order_size).await
    }

    /// Split `amount` collateral into `amount` of each outcome token.
    pub async fn split(&self, amount: f64) -> Result<f64> {
        if amount <= 0.0 {
            bail!("split amount {} must be positive", amount);
        }
        let units = to_base_units(amount, COLLATERAL_DECIMALS);
        let mut calls = self.approval_calls_if_needed(&units).await?;
        calls.push(self.chain.split_call(&self.params.condition_id, &units)?);

        let receipt = self.wallet.submit_batch(calls).await?;
        if !receipt.success {
            let reason = receipt.reason.unwrap_or_else(|| "unknown revert".into());
            warn!(amount, reason = %reason, "split reverted");
            bail!("split of {} reverted: {}", amount, reason);
        }
        info!(amount, tx_hash = %receipt.tx_hash, "split executed");
        Ok(amount)
    }

    /// Merge `amount` of each outcome token back into collateral.
    pub async fn merge(&self, amount: f64) -> Result<f64> {
        if amount <= 0.0 {
            bail!("merge amount {} must be positive", amount);
        }
        let units = to_base_units(amount, COLLATERAL_DECIMALS);
        let calls = vec![self.chain.merge_call(&self.params.condition_id, &units)?];

        let receipt = self.wallet.submit_batch(calls).await?;
        if !receipt.success {
            let reason = receipt.reason.unwrap_or_else(|| "unknown revert".into());
            warn!(amount, reason = %reason, "merge reverted");
            bail!("merge of {} reverted: {}", amount, reason);
        }
        info!(amount, tx_hash = %receipt.tx_hash, "merge executed");
        Ok(amount)
    }

    /// Unlimited approval once; re-approve only when the standing
    /// allowance no longer covers the operation.
    async fn approval_calls_if_needed(&self, needed: &BigUint) -> Result<Vec<WalletCall>> {
        let allowance = self
            .chain
            .collateral_allowance(&self.owner, &self.chain.config().conditional_tokens_address)
            .await?;
        if allowance >= *needed {
            return Ok(Vec::new());
        }
        info!("collateral allowance below needed amount, approving unlimited");
        Ok(vec![self.chain.approval_call(&max_u256())?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::chain::{selectors, BatchReceipt};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Wallet double that records batches and answers from a script.
    struct ScriptedWallet {
        batches: Mutex<Vec<Vec<WalletCall>>>,
        fail_with: Option<String>,
    }

    impl ScriptedWallet {
        fn ok() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail_with: None,
            }
        }

        fn reverting(reason: &str) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail_with: Some(reason.to_string()),
            }
        }
    }

    #[async_trait]
    impl BatchWallet for ScriptedWallet {
        async fn submit_batch(&self, calls: Vec<WalletCall>) -> Result<BatchReceipt> {
            self.batches.lock().push(calls);
            match &self.fail_with {
                Some(reason) => Ok(BatchReceipt {
                    tx_hash: String::new(),
                    success: false,
                    reason: Some(reason.clone()),
                }),
                None => Ok(BatchReceipt {
                    tx_hash: "0xdead".into(),
                    success: true,
                    reason: None,
                }),
            }
        }
    }

    fn manager(wallet: Arc<ScriptedWallet>) -> InventoryManager {
        let chain_cfg = crate::config::ChainConfig {
            rpc_url: "http://localhost:0".into(),
            collateral_address: "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".into(),
            conditional_tokens_address: "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".into(),
            safe_address: "0x00000000000000000000000000000000deadbeef".into(),
        };
        InventoryManager::new(
            Arc::new(ChainClient::new(chain_cfg)),
            wallet,
            MarketParams {
                condition_id:
                    "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef".into(),
                yes_token_id: "111".into(),
                no_token_id: "222".into(),
                tick_size: 0.01,
                neg_risk: false,
                rewards_min_size: 10.0,
                rewards_max_spread: 4.0,
                rewards_daily_rate: None,
            },
            InventoryConfig {
                auto_split: true,
                min_tokens_per_side: 0.0,
                collateral_reserve_multiplier: 1.0,
                min_gas_balance: 0.1,
                merge_on_exit: false,
            },
            "0x00000000000000000000000000000000deadbeef".into(),
        )
    }

    #[tokio::test]
    async fn merge_submits_one_atomic_batch() {
        let wallet = Arc::new(ScriptedWallet::ok());
        let mgr = manager(wallet.clone());

        let merged = mgr.merge(25.0).await.expect("merge");
        assert_eq!(merged, 25.0);

        let batches = wallet.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert!(batches[0][0].data.starts_with(selectors::MERGE_POSITIONS));
        // 25 collateral in 6-decimal base units.
        assert!(batches[0][0]
            .data
            .contains(&format!("{:0>64}", format!("{:x}", 25_000_000u64))));
    }

    #[tokio::test]
    async fn reverted_merge_surfaces_the_reason() {
        let wallet = Arc::new(ScriptedWallet::reverting("not enough outcome tokens"));
        let mgr = manager(wallet);
        let err = mgr.merge(25.0).await.expect_err("must fail");
        assert!(err.to_string().contains("not enough outcome tokens"));
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let wallet = Arc::new(ScriptedWallet::ok());
        let mgr = manager(wallet.clone());
        assert!(mgr.split(0.0).await.is_err());
        assert!(mgr.merge(-5.0).await.is_err());
        assert!(wallet.batches.lock().is_empty());
    }
}
