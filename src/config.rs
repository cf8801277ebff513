//! Engine configuration.
//!
//! Loaded from the environment (a `.env` file is honored) with defaults for
//! everything that is tunable and hard failures for everything that is not.
//! Validation runs once at startup; an invalid configuration is fatal.

use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// CLOB API credentials for the authenticated user channel and order
/// endpoints.
#[derive(Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
    /// Funder / proxy wallet address associated with the API key.
    pub address: String,
}

impl std::fmt::Debug for ClobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobCredentials")
            .field("api_key", &"[REDACTED]")
            .field("address", &self.address)
            .finish()
    }
}

impl ClobCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("CLOB_API_KEY").ok()?;
        let secret = env::var("CLOB_SECRET").ok()?;
        let passphrase = env::var("CLOB_PASSPHRASE").ok()?;
        let address = env::var("WALLET_ADDRESS").ok()?;

        if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() || address.is_empty() {
            return None;
        }

        Some(Self {
            api_key,
            secret,
            passphrase,
            address,
        })
    }
}

/// On-chain endpoints and contract addresses for the inventory manager.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// ERC20 collateral (USDC on the venue's chain).
    pub collateral_address: String,
    /// Conditional tokens contract exposing splitPosition / mergePositions.
    pub conditional_tokens_address: String,
    /// Multi-owner wallet that submits atomic batches.
    pub safe_address: String,
}

impl ChainConfig {
    pub fn from_env() -> Option<Self> {
        let rpc_url = env::var("RPC_URL").ok()?;
        if rpc_url.is_empty() {
            return None;
        }
        Some(Self {
            rpc_url,
            collateral_address: env_string(
                "COLLATERAL_ADDRESS",
                "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174",
            ),
            conditional_tokens_address: env_string(
                "CONDITIONAL_TOKENS_ADDRESS",
                "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045",
            ),
            safe_address: env_string("SAFE_ADDRESS", ""),
        })
    }
}

/// Quoting parameters.
#[derive(Debug, Clone)]
pub struct QuotingConfig {
    /// Order size in shares per side.
    pub order_size: f64,
    /// Fraction of the reward max-spread at which to quote, in (0, 1].
    pub spread_percent: f64,
    /// Midpoint move that triggers a rebalance, in price units.
    pub rebalance_threshold: f64,
    /// Trailing debounce applied to rebalance triggers.
    pub debounce_ms: u64,
    /// Periodic safety tick that re-evaluates quotes regardless of triggers.
    pub refresh_interval_ms: u64,
    /// Quote BUY YES / BUY NO instead of a BUY/SELL pair, requiring only
    /// collateral.
    pub collateral_only: bool,
}

/// Position limit parameters.
#[derive(Debug, Clone)]
pub struct LimitConfig {
    /// Maximum |yes - no| exposure in shares before a side is blocked.
    pub max_net_exposure: f64,
    /// Fraction of the limit at which the warning flag raises.
    pub warn_threshold: f64,
}

/// Market stream tuning.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub max_spread_for_midpoint: f64,
    pub ping_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub fallback_polling_ms: u64,
    /// Last-trade price is usable as a midpoint fallback for this long.
    pub last_trade_max_age_ms: i64,
}

/// Inventory manager tuning.
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    pub auto_split: bool,
    /// Operator floor on tokens held per side, in shares.
    pub min_tokens_per_side: f64,
    /// Extra collateral kept available for the buy side, as a multiple of
    /// order size.
    pub collateral_reserve_multiplier: f64,
    /// Minimum native gas-asset balance required before on-chain writes.
    pub min_gas_balance: f64,
    /// Merge the neutral part of the position back into collateral when
    /// the session ends.
    pub merge_on_exit: bool,
}

/// Discovery and volatility-filter tuning.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Collateral the operator intends to commit, used for earning estimates.
    pub liquidity_commitment: f64,
    /// Number of top-ranked candidates to volatility-check before giving up.
    pub max_candidates: usize,
    /// Aggregate 1h price change above which a market is rejected.
    pub max_hourly_change: f64,
    /// Lookback window for the max-consecutive-move check, minutes.
    pub volatility_lookback_min: i64,
}

/// Everything the engine needs, assembled once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Market slug to resolve at startup. Empty means run discovery.
    pub market_slug: Option<String>,
    pub quoting: QuotingConfig,
    pub limits: LimitConfig,
    pub feed: FeedConfig,
    pub inventory: InventoryConfig,
    pub discovery: DiscoveryConfig,
    pub data_dir: PathBuf,
    pub dry_run: bool,
    /// Wind the market down: quote nothing new after the session, record
    /// the market as in liquidation so discovery skips it.
    pub liquidate: bool,
    pub gamma_base: String,
    pub clob_base: String,
    pub market_ws_url: String,
    pub user_ws_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            market_slug: env::var("MARKET_SLUG").ok().filter(|s| !s.is_empty()),
            quoting: QuotingConfig {
                order_size: env_f64("ORDER_SIZE", 25.0),
                spread_percent: env_f64("SPREAD_PERCENT", 0.5),
                rebalance_threshold: env_f64("REBALANCE_THRESHOLD", 0.002),
                debounce_ms: env_u64("DEBOUNCE_MS", 500),
                refresh_interval_ms: env_u64("REFRESH_INTERVAL_MS", 30_000),
                collateral_only: env_bool("COLLATERAL_ONLY", false),
            },
            limits: LimitConfig {
                max_net_exposure: env_f64("MAX_NET_EXPOSURE", 100.0),
                warn_threshold: env_f64("EXPOSURE_WARN_THRESHOLD", 0.8),
            },
            feed: FeedConfig {
                max_spread_for_midpoint: env_f64("MAX_SPREAD_FOR_MIDPOINT", 0.10),
                ping_interval_ms: env_u64("PING_INTERVAL_MS", 5_000),
                reconnect_delay_ms: env_u64("RECONNECT_DELAY_MS", 1_000),
                max_reconnect_delay_ms: env_u64("MAX_RECONNECT_DELAY_MS", 30_000),
                fallback_polling_ms: env_u64("FALLBACK_POLLING_MS", 2_000),
                last_trade_max_age_ms: env_u64("LAST_TRADE_MAX_AGE_MS", 60_000) as i64,
            },
            inventory: InventoryConfig {
                auto_split: env_bool("AUTO_SPLIT", true),
                min_tokens_per_side: env_f64("MIN_TOKENS_PER_SIDE", 0.0),
                collateral_reserve_multiplier: env_f64("COLLATERAL_RESERVE_MULTIPLIER", 1.0),
                min_gas_balance: env_f64("MIN_GAS_BALANCE", 0.1),
                merge_on_exit: env_bool("MERGE_ON_EXIT", false),
            },
            discovery: DiscoveryConfig {
                liquidity_commitment: env_f64("LIQUIDITY_COMMITMENT", 100.0),
                max_candidates: env_u64("DISCOVERY_MAX_CANDIDATES", 10) as usize,
                max_hourly_change: env_f64("MAX_HOURLY_CHANGE", 0.05),
                volatility_lookback_min: env_u64("VOLATILITY_LOOKBACK_MIN", 10) as i64,
            },
            data_dir: PathBuf::from(env_string("DATA_DIR", "./data")),
            dry_run: env_bool("DRY_RUN", false),
            liquidate: env_bool("LIQUIDATE", false),
            gamma_base: env_string("GAMMA_API_BASE", "https://gamma-api.polymarket.com"),
            clob_base: env_string("CLOB_API_BASE", "https://clob.polymarket.com"),
            market_ws_url: env_string(
                "MARKET_WS_URL",
                "wss://ws-subscriptions-clob.polymarket.com/ws/market",
            ),
            user_ws_url: env_string(
                "USER_WS_URL",
                "wss://ws-subscriptions-clob.polymarket.com/ws/user",
            ),
        }
    }

    /// Startup validation. Everything here is fatal per the error design.
    pub fn validate(&self) -> Result<()> {
        if !(self.quoting.spread_percent > 0.0 && self.quoting.spread_percent <= 1.0) {
            bail!(
                "SPREAD_PERCENT must be in (0, 1], got {}",
                self.quoting.spread_percent
            );
        }
        if self.quoting.order_size <= 0.0 {
            bail!("ORDER_SIZE must be positive, got {}", self.quoting.order_size);
        }
        if self.limits.max_net_exposure <= 0.0 {
            bail!(
                "MAX_NET_EXPOSURE must be positive, got {}",
                self.limits.max_net_exposure
            );
        }
        if !(self.limits.warn_threshold > 0.0 && self.limits.warn_threshold <= 1.0) {
            bail!(
                "EXPOSURE_WARN_THRESHOLD must be in (0, 1], got {}",
                self.limits.warn_threshold
            );
        }
        if self.quoting.rebalance_threshold < 0.0 {
            bail!("REBALANCE_THRESHOLD must not be negative");
        }
        Ok(())
    }

    /// Validation that needs the resolved market: the venue rejects reward
    /// credit for orders below the market minimum, so quoting below it is a
    /// configuration error.
    pub fn validate_against_market(&self, params: &crate::models::MarketParams) -> Result<()> {
        if params.yes_token_id.is_empty() || params.no_token_id.is_empty() {
            bail!(
                "market {} is missing outcome token ids",
                params.condition_id
            );
        }
        if self.quoting.order_size < params.rewards_min_size {
            bail!(
                "ORDER_SIZE {} is below the market reward minimum {}",
                self.quoting.order_size,
                params.rewards_min_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MarketParams;

    fn base_config() -> Config {
        // Build from defaults without touching process env for the fields
        // under test.
        let mut cfg = Config::from_env();
        cfg.quoting.order_size = 25.0;
        cfg.quoting.spread_percent = 0.5;
        cfg.limits.max_net_exposure = 100.0;
        cfg.limits.warn_threshold = 0.8;
        cfg
    }

    fn params() -> MarketParams {
        MarketParams {
            condition_id: "0xabc".into(),
            yes_token_id: "1".into(),
            no_token_id: "2".into(),
            tick_size: 0.01,
            neg_risk: false,
            rewards_min_size: 10.0,
            rewards_max_spread: 4.0,
            rewards_daily_rate: Some(100.0),
        }
    }

    #[test]
    fn valid_config_passes() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_against_market(&params()).is_ok());
    }

    #[test]
    fn spread_percent_outside_unit_interval_is_fatal() {
        let mut cfg = base_config();
        cfg.quoting.spread_percent = 0.0;
        assert!(cfg.validate().is_err());
        cfg.quoting.spread_percent = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn order_size_below_market_minimum_is_fatal() {
        let mut cfg = base_config();
        cfg.quoting.order_size = 5.0;
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_against_market(&params()).is_err());
    }

    #[test]
    fn missing_token_ids_are_fatal() {
        let cfg = base_config();
        let mut p = params();
        p.yes_token_id.clear();
        assert!(cfg.validate_against_market(&p).is_err());
    }
}
