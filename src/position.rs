//! Position tracking and exposure gating.
//!
//! The tracker owns the in-memory mirror of the persisted fill history and
//! is the sole writer to it. Balances are always `initial position + the
//! signed sum of applied fills`; the initialization protocol reconciles
//! that identity against the chain and resets to ground truth when they
//! disagree, because a discrepancy means untracked off-bot activity and
//! stale economics would be worse than none.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::LimitConfig;
use crate::models::{
    Fill, FillEconomics, FillStatus, GateDecision, LimitStatus, MarketParams, PositionState, Side,
    TokenRole,
};
use crate::store::{FillStore, InitialCostBasis, MarketState};

/// Per-side tolerance when comparing a replayed position against the chain.
pub const RECONCILE_TOLERANCE: f64 = 1e-3;

/// Outcome of the initialization protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// No history existed; the on-chain balance seeded a fresh document.
    Seeded { yes: f64, no: f64 },
    /// Replayed history matched the chain within tolerance.
    Consistent { yes: f64, no: f64, fills_replayed: usize },
    /// Replayed history disagreed with the chain. The store was rewritten
    /// to the on-chain balance and the fill list cleared.
    Reset {
        expected_yes: f64,
        expected_no: f64,
        actual_yes: f64,
        actual_no: f64,
    },
}

pub struct PositionTracker {
    params: MarketParams,
    store: FillStore,
    limits: LimitConfig,
    yes_tokens: f64,
    no_tokens: f64,
    /// Fill id -> last status applied or observed.
    seen: HashMap<String, FillStatus>,
    economics: FillEconomics,
    initialized: bool,
}

impl PositionTracker {
    pub fn new(params: MarketParams, store: FillStore, limits: LimitConfig) -> Self {
        Self {
            params,
            store,
            limits,
            yes_tokens: 0.0,
            no_tokens: 0.0,
            seen: HashMap::new(),
            economics: FillEconomics::default(),
            initialized: false,
        }
    }

    /// Run the initialization protocol against the current on-chain
    /// balances. Optionally seeds the economics with an operator-provided
    /// cost basis for pre-existing inventory.
    pub fn initialize(
        &mut self,
        onchain_yes: f64,
        onchain_no: f64,
        cost_basis: Option<InitialCostBasis>,
    ) -> Result<Reconciliation> {
        let outcome = match self.store.load(&self.params.condition_id)? {
            None => {
                self.store.set_initial_position(
                    &self.params.condition_id,
                    &self.params.yes_token_id,
                    &self.params.no_token_id,
                    onchain_yes,
                    onchain_no,
                    cost_basis,
                )?;
                self.yes_tokens = onchain_yes;
                self.no_tokens = onchain_no;
                self.economics = seed_economics(onchain_yes, onchain_no, cost_basis);
                Reconciliation::Seeded {
                    yes: onchain_yes,
                    no: onchain_no,
                }
            }
            Some(state) => self.reconcile(state, onchain_yes, onchain_no, cost_basis)?,
        };

        self.initialized = true;
        info!(
            condition_id = %self.params.condition_id,
            yes = self.yes_tokens,
            no = self.no_tokens,
            net = self.yes_tokens - self.no_tokens,
            "position tracker initialized"
        );
        Ok(outcome)
    }

    fn reconcile(
        &mut self,
        state: MarketState,
        onchain_yes: f64,
        onchain_no: f64,
        cost_basis: Option<InitialCostBasis>,
    ) -> Result<Reconciliation> {
        let initial = state.initial_position.map(|p| (p.yes_tokens, p.no_tokens));
        let (init_yes, init_no) = initial.unwrap_or((0.0, 0.0));

        let mut expected_yes = init_yes;
        let mut expected_no = init_no;
        let mut replayed = 0usize;
        for fill in &state.fills {
            if fill.status == FillStatus::Failed {
                continue;
            }
            match self.params.role_of(&fill.token_id) {
                Some(TokenRole::Yes) => expected_yes += fill.signed_size(),
                Some(TokenRole::No) => expected_no += fill.signed_size(),
                None => {
                    warn!(fill_id = %fill.id, token_id = %fill.token_id, "stored fill for unknown token, skipping");
                    continue;
                }
            }
            replayed += 1;
        }

        let yes_diff = (expected_yes - onchain_yes).abs();
        let no_diff = (expected_no - onchain_no).abs();

        if yes_diff <= RECONCILE_TOLERANCE && no_diff <= RECONCILE_TOLERANCE {
            self.yes_tokens = onchain_yes;
            self.no_tokens = onchain_no;
            for fill in &state.fills {
                self.seen.insert(fill.id.clone(), fill.status);
            }
            // v1 documents carry no economics; rebuild from history so the
            // next write persists them.
            match state.economics {
                Some(e) => self.economics = e,
                None => {
                    let basis = state.initial_cost_basis.or(cost_basis);
                    self.economics =
                        recompute_economics(&self.params, init_yes, init_no, basis, &state.fills);
                    self.persist_economics()?;
                }
            }
            return Ok(Reconciliation::Consistent {
                yes: onchain_yes,
                no: onchain_no,
                fills_replayed: replayed,
            });
        }

        warn!(
            condition_id = %self.params.condition_id,
            expected_yes,
            expected_no,
            onchain_yes,
            onchain_no,
            "position discrepancy, resetting to on-chain balance"
        );

        // Ground truth wins: rewrite the initial position and drop history.
        self.store.clear(&self.params.condition_id)?;
        self.store.set_initial_position(
            &self.params.condition_id,
            &self.params.yes_token_id,
            &self.params.no_token_id,
            onchain_yes,
            onchain_no,
            cost_basis,
        )?;
        self.yes_tokens = onchain_yes;
        self.no_tokens = onchain_no;
        self.seen.clear();
        self.economics = seed_economics(onchain_yes, onchain_no, cost_basis);
        self.persist_economics()?;

        Ok(Reconciliation::Reset {
            expected_yes,
            expected_no,
            actual_yes: onchain_yes,
            actual_no: onchain_no,
        })
    }

    /// Apply a fill. Returns true when the fill was new and moved the
    /// balance; a known id only progresses its status. New FAILED fills are
    /// ignored entirely. Never suspends.
    pub fn process_fill(&mut self, fill: &Fill) -> Result<bool> {
        let Some(role) = self.params.role_of(&fill.token_id) else {
            warn!(fill_id = %fill.id, token_id = %fill.token_id, "fill for unknown token ignored");
            return Ok(false);
        };

        if let Some(prev_status) = self.seen.get(&fill.id).copied() {
            if fill.status.rank() > prev_status.rank() {
                self.seen.insert(fill.id.clone(), fill.status);
                self.store.append_fill(
                    &self.params.condition_id,
                    &self.params.yes_token_id,
                    &self.params.no_token_id,
                    fill,
                )?;
            }
            return Ok(false);
        }

        if fill.status == FillStatus::Failed {
            self.seen.insert(fill.id.clone(), fill.status);
            return Ok(false);
        }

        match role {
            TokenRole::Yes => self.yes_tokens += fill.signed_size(),
            TokenRole::No => self.no_tokens += fill.signed_size(),
        }
        self.apply_economics(role, fill);
        self.seen.insert(fill.id.clone(), fill.status);

        self.store.append_fill(
            &self.params.condition_id,
            &self.params.yes_token_id,
            &self.params.no_token_id,
            fill,
        )?;
        self.persist_economics()?;

        let state = self.position_state();
        info!(
            fill_id = %fill.id,
            role = %role,
            side = %fill.side,
            size = fill.size,
            price = fill.price,
            net = state.net_exposure,
            "fill applied"
        );
        if state.net_exposure.abs() > self.limits.max_net_exposure {
            // Limits gate placements, not fills; a breach is reported and
            // the position stands.
            warn!(
                net = state.net_exposure,
                limit = self.limits.max_net_exposure,
                "net exposure beyond limit after fill"
            );
        }
        Ok(true)
    }

    fn apply_economics(&mut self, role: TokenRole, fill: &Fill) {
        let econ = match role {
            TokenRole::Yes => &mut self.economics.yes,
            TokenRole::No => &mut self.economics.no,
        };
        match fill.side {
            Side::Buy => {
                econ.bought += fill.size;
                econ.cost += fill.size * fill.price;
            }
            Side::Sell => {
                econ.sold += fill.size;
                econ.proceeds += fill.size * fill.price;
                match econ.avg_cost() {
                    Some(avg) => {
                        self.economics.realized_pnl += fill.size * (fill.price - avg);
                    }
                    None => {
                        // Selling inventory we never bought under tracking
                        // and whose basis was not seeded.
                        self.economics.complete = false;
                    }
                }
            }
        }
    }

    fn persist_economics(&mut self) -> Result<()> {
        if let Some(mut state) = self.store.load(&self.params.condition_id)? {
            state.economics = Some(self.economics.clone());
            self.store.save(&state)?;
        }
        Ok(())
    }

    pub fn position_state(&self) -> PositionState {
        PositionState::new(self.yes_tokens, self.no_tokens)
    }

    pub fn economics(&self) -> &FillEconomics {
        &self.economics
    }

    /// Gate for quoting the buy side. Buying YES raises net exposure.
    pub fn can_quote_buy(&self) -> GateDecision {
        let net = self.yes_tokens - self.no_tokens;
        if net < self.limits.max_net_exposure {
            GateDecision::allow()
        } else {
            GateDecision::block(format!(
                "net exposure {:.2} at or above +{:.2}",
                net, self.limits.max_net_exposure
            ))
        }
    }

    /// Gate for quoting the sell side. Selling YES lowers net exposure.
    pub fn can_quote_sell(&self) -> GateDecision {
        let net = self.yes_tokens - self.no_tokens;
        if net > -self.limits.max_net_exposure {
            GateDecision::allow()
        } else {
            GateDecision::block(format!(
                "net exposure {:.2} at or below -{:.2}",
                net, self.limits.max_net_exposure
            ))
        }
    }

    pub fn limit_status(&self) -> LimitStatus {
        let net = self.yes_tokens - self.no_tokens;
        let max = self.limits.max_net_exposure;
        LimitStatus {
            net_exposure: net,
            max_net_exposure: max,
            utilization: if max > 0.0 { net.abs() / max } else { 0.0 },
            warning: net.abs() >= self.limits.warn_threshold * max,
            buy_blocked: !self.can_quote_buy().allowed,
            sell_blocked: !self.can_quote_sell().allowed,
        }
    }

    /// Shift balances directly, outside the fill path. Used after a split
    /// or merge settles.
    pub fn adjust_position(&mut self, yes_delta: f64, no_delta: f64) {
        self.yes_tokens += yes_delta;
        self.no_tokens += no_delta;
        info!(
            yes_delta,
            no_delta,
            yes = self.yes_tokens,
            no = self.no_tokens,
            "position adjusted"
        );
    }

    pub fn update_limits(&mut self, limits: LimitConfig) {
        self.limits = limits;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

fn seed_economics(yes: f64, no: f64, basis: Option<InitialCostBasis>) -> FillEconomics {
    match basis {
        Some(b) => FillEconomics {
            yes: crate::models::TokenEconomics {
                bought: yes,
                cost: yes * b.yes_avg_price,
                ..Default::default()
            },
            no: crate::models::TokenEconomics {
                bought: no,
                cost: no * b.no_avg_price,
                ..Default::default()
            },
            realized_pnl: 0.0,
            complete: true,
        },
        None => FillEconomics {
            // Pre-existing inventory without a basis leaves P&L incomplete.
            complete: yes == 0.0 && no == 0.0,
            ..Default::default()
        },
    }
}

/// Rebuild cumulative economics from a stored fill list, used when loading
/// documents written before economics were persisted.
fn recompute_economics(
    params: &MarketParams,
    initial_yes: f64,
    initial_no: f64,
    basis: Option<InitialCostBasis>,
    fills: &[Fill],
) -> FillEconomics {
    let mut economics = seed_economics(initial_yes, initial_no, basis);
    for fill in fills {
        if fill.status == FillStatus::Failed {
            continue;
        }
        let Some(role) = params.role_of(&fill.token_id) else {
            continue;
        };
        let econ = match role {
            TokenRole::Yes => &mut economics.yes,
            TokenRole::No => &mut economics.no,
        };
        match fill.side {
            Side::Buy => {
                econ.bought += fill.size;
                econ.cost += fill.size * fill.price;
            }
            Side::Sell => {
                econ.sold += fill.size;
                econ.proceeds += fill.size * fill.price;
                match econ.avg_cost() {
                    Some(avg) => economics.realized_pnl += fill.size * (fill.price - avg),
                    None => economics.complete = false,
                }
            }
        }
    }
    economics
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const COND: &str = "0x1234567890abcdef1234567890abcdef12345678";

    fn params() -> MarketParams {
        MarketParams {
            condition_id: COND.into(),
            yes_token_id: "yes-token".into(),
            no_token_id: "no-token".into(),
            tick_size: 0.01,
            neg_risk: false,
            rewards_min_size: 10.0,
            rewards_max_spread: 4.0,
            rewards_daily_rate: Some(100.0),
        }
    }

    fn limits(max: f64) -> LimitConfig {
        LimitConfig {
            max_net_exposure: max,
            warn_threshold: 0.8,
        }
    }

    fn tracker(max: f64) -> (TempDir, PositionTracker) {
        let dir = TempDir::new().expect("tempdir");
        let store = FillStore::new(dir.path());
        (dir, PositionTracker::new(params(), store, limits(max)))
    }

    fn fill(id: &str, token: &str, side: Side, size: f64, status: FillStatus) -> Fill {
        Fill {
            id: id.into(),
            token_id: token.into(),
            condition_id: COND.into(),
            side,
            price: 0.5,
            size,
            timestamp_ms: 1_700_000_000_000,
            order_id: None,
            status,
        }
    }

    #[test]
    fn fresh_start_seeds_the_store() {
        let (_dir, mut t) = tracker(100.0);
        let outcome = t.initialize(10.0, 5.0, None).expect("init");
        assert_eq!(outcome, Reconciliation::Seeded { yes: 10.0, no: 5.0 });
        let state = t.position_state();
        assert_eq!(state.yes_tokens, 10.0);
        assert_eq!(state.no_tokens, 5.0);
        assert_eq!(state.net_exposure, 5.0);
        assert_eq!(state.neutral_position, 5.0);
    }

    #[test]
    fn position_equals_initial_plus_signed_fills() {
        let (_dir, mut t) = tracker(1_000.0);
        t.initialize(0.0, 0.0, None).expect("init");
        t.process_fill(&fill("t1", "yes-token", Side::Buy, 10.0, FillStatus::Matched))
            .expect("fill");
        t.process_fill(&fill("t2", "no-token", Side::Buy, 4.0, FillStatus::Matched))
            .expect("fill");
        t.process_fill(&fill("t3", "yes-token", Side::Sell, 3.0, FillStatus::Matched))
            .expect("fill");
        let state = t.position_state();
        assert_eq!(state.yes_tokens, 7.0);
        assert_eq!(state.no_tokens, 4.0);
        assert_eq!(state.net_exposure, 3.0);
    }

    #[test]
    fn duplicate_fill_applies_once_and_progresses_status() {
        // Scenario: same trade id delivered MATCHED then CONFIRMED.
        let (_dir, mut t) = tracker(1_000.0);
        t.initialize(0.0, 0.0, None).expect("init");

        let first = fill("t1", "yes-token", Side::Buy, 10.0, FillStatus::Matched);
        let second = fill("t1", "yes-token", Side::Buy, 10.0, FillStatus::Confirmed);
        assert!(t.process_fill(&first).expect("first"));
        assert!(!t.process_fill(&second).expect("second"));
        assert_eq!(t.position_state().yes_tokens, 10.0);

        let stored = t.store.load(COND).expect("load").expect("present");
        assert_eq!(stored.fills.len(), 1);
        assert_eq!(stored.fills[0].status, FillStatus::Confirmed);
    }

    #[test]
    fn new_failed_fill_is_ignored() {
        let (_dir, mut t) = tracker(1_000.0);
        t.initialize(0.0, 0.0, None).expect("init");
        assert!(!t
            .process_fill(&fill("t1", "yes-token", Side::Buy, 10.0, FillStatus::Failed))
            .expect("fill"));
        assert_eq!(t.position_state().yes_tokens, 0.0);
    }

    #[test]
    fn retrying_applies_like_matched() {
        let (_dir, mut t) = tracker(1_000.0);
        t.initialize(0.0, 0.0, None).expect("init");
        assert!(t
            .process_fill(&fill("t1", "yes-token", Side::Buy, 10.0, FillStatus::Retrying))
            .expect("fill"));
        assert_eq!(t.position_state().yes_tokens, 10.0);
    }

    #[test]
    fn gates_follow_net_exposure() {
        // Scenario: limit 100, initial YES=150 NO=50, net +100.
        let (_dir, mut t) = tracker(100.0);
        t.initialize(150.0, 50.0, None).expect("init");
        assert!(!t.can_quote_buy().allowed);
        assert!(t.can_quote_sell().allowed);

        // A SELL YES fill of 5 brings net to +95 and reopens the buy side.
        t.process_fill(&fill("t1", "yes-token", Side::Sell, 5.0, FillStatus::Matched))
            .expect("fill");
        assert!(t.can_quote_buy().allowed);
        assert!(t.can_quote_sell().allowed);
    }

    #[test]
    fn gates_are_never_both_blocked() {
        for (yes, no) in [(0.0, 0.0), (200.0, 0.0), (0.0, 200.0), (150.0, 50.0)] {
            let (_dir, mut t) = tracker(100.0);
            t.initialize(yes, no, None).expect("init");
            let buy = t.can_quote_buy().allowed;
            let sell = t.can_quote_sell().allowed;
            assert!(buy || sell, "both sides blocked at yes={} no={}", yes, no);
        }
    }

    #[test]
    fn limit_breach_by_fill_is_recorded_not_reversed() {
        let (_dir, mut t) = tracker(10.0);
        t.initialize(0.0, 0.0, None).expect("init");
        t.process_fill(&fill("t1", "yes-token", Side::Buy, 25.0, FillStatus::Matched))
            .expect("fill");
        assert_eq!(t.position_state().net_exposure, 25.0);
        assert!(!t.can_quote_buy().allowed);
    }

    #[test]
    fn consistent_history_replays_cleanly() {
        let dir = TempDir::new().expect("tempdir");
        let store = FillStore::new(dir.path());

        let mut first = PositionTracker::new(params(), store.clone(), limits(1_000.0));
        first.initialize(50.0, 50.0, None).expect("init");
        first
            .process_fill(&fill("t1", "yes-token", Side::Buy, 20.0, FillStatus::Matched))
            .expect("fill");

        // Restart: replay arrives at 70/50 which matches the chain.
        let mut second = PositionTracker::new(params(), store, limits(1_000.0));
        let outcome = second.initialize(70.0, 50.0, None).expect("init");
        assert_eq!(
            outcome,
            Reconciliation::Consistent {
                yes: 70.0,
                no: 50.0,
                fills_replayed: 1
            }
        );
        // Dedup set survives the restart.
        assert!(!second
            .process_fill(&fill("t1", "yes-token", Side::Buy, 20.0, FillStatus::Matched))
            .expect("replayed fill"));
    }

    #[test]
    fn discrepancy_resets_to_ground_truth() {
        // Scenario: stored initial (50, 50), fills net +20 YES, expected
        // (70, 50), but the chain says (100, 50).
        let dir = TempDir::new().expect("tempdir");
        let store = FillStore::new(dir.path());

        let mut first = PositionTracker::new(params(), store.clone(), limits(1_000.0));
        first.initialize(50.0, 50.0, None).expect("init");
        first
            .process_fill(&fill("t1", "yes-token", Side::Buy, 20.0, FillStatus::Matched))
            .expect("fill");

        let mut second = PositionTracker::new(params(), store.clone(), limits(1_000.0));
        let outcome = second.initialize(100.0, 50.0, None).expect("init");
        assert_eq!(
            outcome,
            Reconciliation::Reset {
                expected_yes: 70.0,
                expected_no: 50.0,
                actual_yes: 100.0,
                actual_no: 50.0,
            }
        );
        assert_eq!(second.position_state().yes_tokens, 100.0);

        let stored = store.load(COND).expect("load").expect("present");
        assert!(stored.fills.is_empty());
        let initial = stored.initial_position.expect("initial");
        assert_eq!(initial.yes_tokens, 100.0);
        assert_eq!(initial.no_tokens, 50.0);
    }

    #[test]
    fn realized_pnl_uses_weighted_average_cost() {
        let (_dir, mut t) = tracker(1_000.0);
        t.initialize(0.0, 0.0, None).expect("init");

        let mut buy_low = fill("t1", "yes-token", Side::Buy, 10.0, FillStatus::Matched);
        buy_low.price = 0.40;
        let mut buy_high = fill("t2", "yes-token", Side::Buy, 10.0, FillStatus::Matched);
        buy_high.price = 0.60;
        let mut sell = fill("t3", "yes-token", Side::Sell, 10.0, FillStatus::Matched);
        sell.price = 0.55;

        t.process_fill(&buy_low).expect("buy low");
        t.process_fill(&buy_high).expect("buy high");
        t.process_fill(&sell).expect("sell");

        // Average cost 0.50, so selling 10 at 0.55 realizes +0.50.
        assert!((t.economics().realized_pnl - 0.5).abs() < 1e-9);
        assert!(t.economics().complete);
    }

    #[test]
    fn selling_unseeded_inventory_marks_pnl_incomplete() {
        let (_dir, mut t) = tracker(1_000.0);
        t.initialize(50.0, 0.0, None).expect("init");
        t.process_fill(&fill("t1", "yes-token", Side::Sell, 5.0, FillStatus::Matched))
            .expect("sell");
        assert!(!t.economics().complete);
    }

    #[test]
    fn seeded_cost_basis_keeps_pnl_complete() {
        let (_dir, mut t) = tracker(1_000.0);
        t.initialize(
            50.0,
            0.0,
            Some(InitialCostBasis {
                yes_avg_price: 0.40,
                no_avg_price: 0.0,
            }),
        )
        .expect("init");

        let mut sell = fill("t1", "yes-token", Side::Sell, 10.0, FillStatus::Matched);
        sell.price = 0.50;
        t.process_fill(&sell).expect("sell");
        assert!(t.economics().complete);
        assert!((t.economics().realized_pnl - 1.0).abs() < 1e-9);
    }

    #[test]
    fn warning_raises_at_threshold() {
        let (_dir, mut t) = tracker(100.0);
        t.initialize(80.0, 0.0, None).expect("init");
        let status = t.limit_status();
        assert!(status.warning);
        assert!(!status.buy_blocked);
    }

    #[test]
    fn adjust_position_moves_both_legs() {
        let (_dir, mut t) = tracker(100.0);
        t.initialize(10.0, 10.0, None).expect("init");
        t.adjust_position(5.0, 5.0);
        let state = t.position_state();
        assert_eq!(state.yes_tokens, 15.0);
        assert_eq!(state.no_tokens, 15.0);
        assert_eq!(state.net_exposure, 0.0);
    }
}
