//! Core domain types shared across the engine.
//!
//! Prices are carried as integer ticks (1/10000 of a unit of collateral)
//! inside the quoting arithmetic and converted to f64 only at the serde
//! boundary, so the price ladder never accumulates binary-float drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point scale for prices: 1 unit of collateral = 10_000 price units.
/// Fine enough for the venue's smallest tick (0.001).
pub const PRICE_SCALE: i64 = 10_000;

/// A price on the integer grid, in units of 1/10000 collateral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TickPrice(pub i64);

impl TickPrice {
    pub const MIN: TickPrice = TickPrice(100); // 0.01
    pub const MAX: TickPrice = TickPrice(9_900); // 0.99

    /// Convert from a float price, rounding to the nearest grid unit.
    pub fn from_f64(price: f64) -> Self {
        TickPrice((price * PRICE_SCALE as f64).round() as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }

    /// Round to the nearest multiple of `tick` (also in grid units).
    pub fn round_to_tick(self, tick: TickPrice) -> Self {
        if tick.0 <= 0 {
            return self;
        }
        let rem = self.0.rem_euclid(tick.0);
        if rem * 2 >= tick.0 {
            TickPrice(self.0 - rem + tick.0)
        } else {
            TickPrice(self.0 - rem)
        }
    }

    pub fn clamp_tradable(self) -> Self {
        TickPrice(self.0.clamp(Self::MIN.0, Self::MAX.0))
    }

    pub fn is_on_grid(self, tick: TickPrice) -> bool {
        tick.0 > 0 && self.0 % tick.0 == 0
    }
}

impl fmt::Display for TickPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.to_f64())
    }
}

/// Order side from our own perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn invert(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which outcome leg of the binary market a token id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenRole {
    Yes,
    No,
}

impl TokenRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRole::Yes => "YES",
            TokenRole::No => "NO",
        }
    }
}

impl fmt::Display for TokenRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of the market being quoted. Immutable for the session and
/// cloned by value into each subsystem that needs them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketParams {
    pub condition_id: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    /// Minimum price increment, e.g. 0.01 or 0.001.
    pub tick_size: f64,
    pub neg_risk: bool,
    /// Minimum resting order size in shares for reward eligibility.
    pub rewards_min_size: f64,
    /// Maximum distance from midpoint in cents for reward eligibility.
    pub rewards_max_spread: f64,
    /// Daily reward pool in collateral units, when the venue publishes one.
    pub rewards_daily_rate: Option<f64>,
}

impl MarketParams {
    pub fn tick(&self) -> TickPrice {
        TickPrice::from_f64(self.tick_size)
    }

    /// Resolve a token id to its outcome leg, if it belongs to this market.
    pub fn role_of(&self, token_id: &str) -> Option<TokenRole> {
        if token_id == self.yes_token_id {
            Some(TokenRole::Yes)
        } else if token_id == self.no_token_id {
            Some(TokenRole::No)
        } else {
            None
        }
    }

    pub fn token_id(&self, role: TokenRole) -> &str {
        match role {
            TokenRole::Yes => &self.yes_token_id,
            TokenRole::No => &self.no_token_id,
        }
    }
}

/// One target quote: a limit order we intend to have resting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub side: Side,
    pub price: TickPrice,
    pub size: f64,
}

/// The two-sided output of the quote generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotePair {
    pub bid: Quote,
    pub ask: Quote,
}

impl QuotePair {
    /// Express the pair in USDC-only form: a BUY on the YES token at the bid
    /// and a BUY on the NO token at the complement of the ask. Economically
    /// equivalent but requires only collateral, never pre-held tokens.
    pub fn as_collateral_only(&self) -> (Quote, Quote) {
        let yes_buy = Quote {
            side: Side::Buy,
            price: self.bid.price,
            size: self.bid.size,
        };
        let no_buy = Quote {
            side: Side::Buy,
            price: TickPrice(PRICE_SCALE - self.ask.price.0),
            size: self.ask.size,
        };
        (yes_buy, no_buy)
    }
}

/// Lifecycle status of a fill as reported by the venue. Progression is
/// monotone toward Confirmed or Failed; Retrying counts like Matched when
/// applied to position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillStatus {
    Matched,
    Mined,
    Confirmed,
    Retrying,
    Failed,
}

impl FillStatus {
    /// Rank in the status progression. A stored fill is only replaced by a
    /// record whose status ranks strictly later.
    pub fn rank(&self) -> u8 {
        match self {
            FillStatus::Matched => 0,
            FillStatus::Retrying => 1,
            FillStatus::Mined => 2,
            FillStatus::Confirmed => 3,
            FillStatus::Failed => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FillStatus::Matched => "MATCHED",
            FillStatus::Mined => "MINED",
            FillStatus::Confirmed => "CONFIRMED",
            FillStatus::Retrying => "RETRYING",
            FillStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MATCHED" => Some(FillStatus::Matched),
            "MINED" => Some(FillStatus::Mined),
            "CONFIRMED" => Some(FillStatus::Confirmed),
            "RETRYING" => Some(FillStatus::Retrying),
            "FAILED" => Some(FillStatus::Failed),
            _ => None,
        }
    }
}

/// A trade against one of our orders, normalized to our perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Venue trade id, unique per fill.
    pub id: String,
    pub token_id: String,
    pub condition_id: String,
    /// Side from our perspective (feed delivers the taker's side).
    pub side: Side,
    pub price: f64,
    pub size: f64,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
    /// Our order that was hit, when the venue reports it.
    #[serde(default)]
    pub order_id: Option<String>,
    pub status: FillStatus,
}

impl Fill {
    /// Signed share delta this fill applies to its token's balance.
    pub fn signed_size(&self) -> f64 {
        match self.side {
            Side::Buy => self.size,
            Side::Sell => -self.size,
        }
    }
}

/// An order we placed and still consider outstanding.
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order_id: String,
    pub token_id: String,
    pub role: TokenRole,
    pub side: Side,
    pub price: TickPrice,
    pub size: f64,
    pub placed_at: DateTime<Utc>,
}

/// Derived view of current holdings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionState {
    pub yes_tokens: f64,
    pub no_tokens: f64,
    /// yes - no; positive means long YES.
    pub net_exposure: f64,
    /// min(yes, no); mergeable back into collateral at any time.
    pub neutral_position: f64,
}

impl PositionState {
    pub fn new(yes_tokens: f64, no_tokens: f64) -> Self {
        Self {
            yes_tokens,
            no_tokens,
            net_exposure: yes_tokens - no_tokens,
            neutral_position: yes_tokens.min(no_tokens),
        }
    }
}

/// Cumulative trade economics for one outcome token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenEconomics {
    pub bought: f64,
    pub sold: f64,
    pub cost: f64,
    pub proceeds: f64,
}

impl TokenEconomics {
    pub fn avg_cost(&self) -> Option<f64> {
        if self.bought > 0.0 {
            Some(self.cost / self.bought)
        } else {
            None
        }
    }
}

/// Per-market cumulative economics with realized P&L on round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FillEconomics {
    pub yes: TokenEconomics,
    pub no: TokenEconomics,
    /// Weighted-average-cost realized P&L across both tokens.
    pub realized_pnl: f64,
    /// False when pre-existing inventory has no seeded cost basis, meaning
    /// realized figures understate reality.
    pub complete: bool,
}

/// Result of a quote-side gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Snapshot of exposure relative to the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimitStatus {
    pub net_exposure: f64,
    pub max_net_exposure: f64,
    pub utilization: f64,
    pub warning: bool,
    pub buy_blocked: bool,
    pub sell_blocked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_price_round_trip() {
        let p = TickPrice::from_f64(0.57);
        assert_eq!(p.0, 5_700);
        assert!((p.to_f64() - 0.57).abs() < 1e-9);
    }

    #[test]
    fn round_to_tick_nearest() {
        let tick = TickPrice(100); // 0.01
        assert_eq!(TickPrice(5_449).round_to_tick(tick), TickPrice(5_400));
        assert_eq!(TickPrice(5_450).round_to_tick(tick), TickPrice(5_500));
        assert_eq!(TickPrice(5_500).round_to_tick(tick), TickPrice(5_500));
    }

    #[test]
    fn clamp_stays_inside_tradable_band() {
        assert_eq!(TickPrice(5).clamp_tradable(), TickPrice::MIN);
        assert_eq!(TickPrice(9_999).clamp_tradable(), TickPrice::MAX);
    }

    #[test]
    fn collateral_only_form_complements_the_ask() {
        let pair = QuotePair {
            bid: Quote {
                side: Side::Buy,
                price: TickPrice(4_900),
                size: 25.0,
            },
            ask: Quote {
                side: Side::Sell,
                price: TickPrice(5_100),
                size: 25.0,
            },
        };
        let (yes_buy, no_buy) = pair.as_collateral_only();
        assert_eq!(yes_buy.side, Side::Buy);
        assert_eq!(yes_buy.price, TickPrice(4_900));
        assert_eq!(no_buy.side, Side::Buy);
        assert_eq!(no_buy.price, TickPrice(4_900)); // 1 - 0.51
    }

    #[test]
    fn fill_status_progression_ranks() {
        assert!(FillStatus::Confirmed.rank() > FillStatus::Mined.rank());
        assert!(FillStatus::Mined.rank() > FillStatus::Retrying.rank());
        assert!(FillStatus::Retrying.rank() > FillStatus::Matched.rank());
    }

    #[test]
    fn signed_size_follows_side() {
        let mut fill = Fill {
            id: "t1".into(),
            token_id: "tok".into(),
            condition_id: "cond".into(),
            side: Side::Buy,
            price: 0.5,
            size: 10.0,
            timestamp_ms: 0,
            order_id: None,
            status: FillStatus::Matched,
        };
        assert_eq!(fill.signed_size(), 10.0);
        fill.side = Side::Sell;
        assert_eq!(fill.signed_size(), -10.0);
    }
}
