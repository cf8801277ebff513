//! The quote lifecycle state machine.
//!
//! Decides what orders should exist at each instant and reconciles the
//! venue toward that decision, one side at a time. Rebalances are
//! coalesced through a trailing debounce: every trigger pushes the timer
//! out, and when it finally fires the newest midpoint wins. Cancellation
//! always precedes placement so exposure never doubles transiently.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::clients::clob::{ClobClient, OrderApiError, PlaceOrder};
use crate::config::QuotingConfig;
use crate::models::{
    GateDecision, MarketParams, Quote, Side, TickPrice, TokenRole, TrackedOrder,
};
use crate::orders::OrderTracker;
use crate::position::PositionTracker;
use crate::quoting::generate_quotes;

const PLACE_RETRIES: u32 = 3;
const PLACE_BACKOFF_MS: [u64; 3] = [250, 500, 1_000];

/// Venue order operations, as the controller needs them. The live
/// implementation is the CLOB client; tests script one.
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn place(&self, order: &PlaceOrder) -> Result<String, OrderApiError>;
    async fn cancel(&self, order_id: &str) -> Result<()>;
    async fn cancel_token(&self, token_id: &str) -> Result<()>;
}

#[async_trait]
impl OrderApi for ClobClient {
    async fn place(&self, order: &PlaceOrder) -> Result<String, OrderApiError> {
        self.place_order(order).await
    }

    async fn cancel(&self, order_id: &str) -> Result<()> {
        self.cancel_order(order_id).await
    }

    async fn cancel_token(&self, token_id: &str) -> Result<()> {
        self.cancel_token_orders(token_id).await
    }
}

/// Per-side lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideState {
    None,
    Placing,
    Live { order_id: String, price: TickPrice },
    /// A cancel failed and escalation is pending; placements stay
    /// suppressed until a cancel succeeds.
    Cancelling { order_id: String },
}

/// The two quoting sides. `Bid` rests below the midpoint, `Ask` above;
/// in collateral-only mode the ask is expressed as a BUY on the NO token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSide {
    Bid,
    Ask,
}

/// Why a rebalance was asked for.
#[derive(Debug, Clone)]
pub enum RebalanceTrigger {
    /// A fill or order event changed what is resting or what gates allow.
    FillActivity { order_id: Option<String> },
    /// A side's order left the book entirely.
    OrderGone { order_id: String },
    /// Position limits may have flipped a gate.
    GateChange,
}

/// What reconciliation decided for one side before touching the venue.
#[derive(Debug, Clone, PartialEq)]
enum SideAction {
    Nothing,
    Cancel,
    Place(TickPrice),
    CancelThenPlace(TickPrice),
}

/// Decide the action for one side. Pure; the whole per-side policy lives
/// here.
fn desired_action(
    state: &SideState,
    gate: &GateDecision,
    target: TickPrice,
    tick: TickPrice,
) -> SideAction {
    if !gate.allowed {
        return match state {
            SideState::Live { .. } | SideState::Cancelling { .. } => SideAction::Cancel,
            _ => SideAction::Nothing,
        };
    }
    match state {
        SideState::None => SideAction::Place(target),
        SideState::Placing => SideAction::Nothing,
        SideState::Cancelling { .. } => SideAction::Cancel,
        SideState::Live { price, .. } => {
            if (price.0 - target.0).abs() <= tick.0 {
                SideAction::Nothing
            } else {
                SideAction::CancelThenPlace(target)
            }
        }
    }
}

/// Cloneable sender the rest of the engine uses to poke the controller.
#[derive(Clone)]
pub struct ControllerHandle {
    trigger_tx: mpsc::Sender<RebalanceTrigger>,
}

impl ControllerHandle {
    pub fn notify(&self, trigger: RebalanceTrigger) {
        if let Err(e) = self.trigger_tx.try_send(trigger) {
            warn!(error = %e, "controller trigger dropped");
        }
    }
}

pub struct QuoteController {
    params: MarketParams,
    cfg: QuotingConfig,
    api: Arc<dyn OrderApi>,
    position: Arc<Mutex<PositionTracker>>,
    orders: Arc<Mutex<OrderTracker>>,
    dry_run: bool,
    bid: SideState,
    ask: SideState,
    latest_midpoint: Option<f64>,
    last_quoted_midpoint: Option<f64>,
    // Receivers live in Options so run() can move them into the select
    // loop while the rest of self stays borrowable.
    midpoint_rx: Option<mpsc::Receiver<crate::feeds::MidpointUpdate>>,
    trigger_rx: Option<mpsc::Receiver<RebalanceTrigger>>,
    trigger_tx: mpsc::Sender<RebalanceTrigger>,
    shutdown: watch::Receiver<bool>,
    dry_run_seq: u64,
}

impl QuoteController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: MarketParams,
        cfg: QuotingConfig,
        api: Arc<dyn OrderApi>,
        position: Arc<Mutex<PositionTracker>>,
        orders: Arc<Mutex<OrderTracker>>,
        dry_run: bool,
        midpoint_rx: mpsc::Receiver<crate::feeds::MidpointUpdate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(256);
        Self {
            params,
            cfg,
            api,
            position,
            orders,
            dry_run,
            bid: SideState::None,
            ask: SideState::None,
            latest_midpoint: None,
            last_quoted_midpoint: None,
            midpoint_rx: Some(midpoint_rx),
            trigger_rx: Some(trigger_rx),
            trigger_tx,
            shutdown,
            dry_run_seq: 0,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            trigger_tx: self.trigger_tx.clone(),
        }
    }

    /// Event loop. Returns after shutdown cleanup.
    pub async fn run(mut self) -> Result<()> {
        let mut midpoint_rx = self.midpoint_rx.take().expect("controller run twice");
        let mut trigger_rx = self.trigger_rx.take().expect("controller run twice");
        let mut shutdown = self.shutdown.clone();

        let debounce = Duration::from_millis(self.cfg.debounce_ms);
        let mut pending: Option<Instant> = None;

        let mut refresh = interval(Duration::from_millis(self.cfg.refresh_interval_ms.max(1)));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; consume it
        // so startup reconciliation waits for a midpoint instead.
        refresh.tick().await;

        info!(dry_run = self.dry_run, "quote controller started");

        loop {
            // A pending debounce deadline turns into a sleep; otherwise
            // the arm stays dormant.
            let deadline = pending.unwrap_or_else(|| Instant::now() + Duration::from_secs(3_600));

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                update = midpoint_rx.recv() => {
                    let Some(update) = update else { break };
                    self.latest_midpoint = Some(update.midpoint);
                    if self.midpoint_moved(update.midpoint) {
                        pending = Some(Instant::now() + debounce);
                    }
                }
                trigger = trigger_rx.recv() => {
                    let Some(trigger) = trigger else { break };
                    self.absorb_trigger(&trigger);
                    pending = Some(Instant::now() + debounce);
                }
                _ = refresh.tick() => {
                    // The periodic safety net re-evaluates regardless of
                    // the debounce.
                    pending = None;
                    self.reconcile().await;
                }
                _ = sleep_until(deadline), if pending.is_some() => {
                    pending = None;
                    self.reconcile().await;
                }
            }
        }

        info!("quote controller draining for shutdown");
        self.cancel_everything().await;
        Ok(())
    }

    fn midpoint_moved(&self, midpoint: f64) -> bool {
        match self.last_quoted_midpoint {
            None => true,
            Some(last) => (midpoint - last).abs() > self.cfg.rebalance_threshold,
        }
    }

    fn absorb_trigger(&mut self, trigger: &RebalanceTrigger) {
        match trigger {
            RebalanceTrigger::OrderGone { order_id } => {
                if matches!(&self.bid, SideState::Live { order_id: id, .. } if id == order_id) {
                    debug!(order_id = %order_id, "bid side cleared");
                    self.bid = SideState::None;
                }
                if matches!(&self.ask, SideState::Live { order_id: id, .. } if id == order_id) {
                    debug!(order_id = %order_id, "ask side cleared");
                    self.ask = SideState::None;
                }
            }
            RebalanceTrigger::FillActivity { order_id } => {
                debug!(order_id = ?order_id, "fill activity trigger");
            }
            RebalanceTrigger::GateChange => debug!("gate change trigger"),
        }
    }

    /// One reconciliation pass over both sides, using the midpoint as of
    /// now.
    async fn reconcile(&mut self) {
        let Some(midpoint) = self.latest_midpoint else {
            debug!("no midpoint yet, skipping reconcile");
            return;
        };

        let pair = match generate_quotes(
            midpoint,
            &self.params,
            self.cfg.spread_percent,
            self.cfg.order_size,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(midpoint, error = %e, "quote generation failed");
                return;
            }
        };

        let (buy_gate, sell_gate) = {
            let position = self.position.lock();
            (position.can_quote_buy(), position.can_quote_sell())
        };

        self.reconcile_side(QuoteSide::Bid, &pair.bid, &buy_gate).await;
        let ask_quote = if self.cfg.collateral_only {
            // BUY the NO token at the complement instead of selling YES.
            let (_, no_buy) = pair.as_collateral_only();
            no_buy
        } else {
            pair.ask
        };
        self.reconcile_side(QuoteSide::Ask, &ask_quote, &sell_gate).await;

        self.last_quoted_midpoint = Some(midpoint);
    }

    async fn reconcile_side(&mut self, side: QuoteSide, quote: &Quote, gate: &GateDecision) {
        let state = match side {
            QuoteSide::Bid => self.bid.clone(),
            QuoteSide::Ask => self.ask.clone(),
        };
        let action = desired_action(&state, gate, quote.price, self.params.tick());

        if let Some(reason) = gate.reason.as_deref() {
            if !matches!(action, SideAction::Nothing) || matches!(state, SideState::Live { .. }) {
                info!(side = ?side, reason, "side gated");
            }
        }

        let new_state = match action {
            SideAction::Nothing => state,
            SideAction::Cancel => self.do_cancel(side, state).await,
            SideAction::Place(price) => {
                self.set_side(side, SideState::Placing);
                self.do_place(side, quote, price).await
            }
            SideAction::CancelThenPlace(price) => {
                let after_cancel = self.do_cancel(side, state).await;
                if matches!(after_cancel, SideState::None) {
                    self.set_side(side, SideState::Placing);
                    self.do_place(side, quote, price).await
                } else {
                    // The cancel did not land; placement stays suppressed
                    // until it does.
                    after_cancel
                }
            }
        };
        self.set_side(side, new_state);
    }

    fn set_side(&mut self, side: QuoteSide, state: SideState) {
        match side {
            QuoteSide::Bid => self.bid = state,
            QuoteSide::Ask => self.ask = state,
        }
    }

    fn side_token(&self, side: QuoteSide) -> (&str, TokenRole) {
        match side {
            QuoteSide::Bid => (&self.params.yes_token_id, TokenRole::Yes),
            QuoteSide::Ask => {
                if self.cfg.collateral_only {
                    (&self.params.no_token_id, TokenRole::No)
                } else {
                    (&self.params.yes_token_id, TokenRole::Yes)
                }
            }
        }
    }

    async fn do_cancel(&mut self, side: QuoteSide, state: SideState) -> SideState {
        let order_id = match &state {
            SideState::Live { order_id, .. } | SideState::Cancelling { order_id } => {
                order_id.clone()
            }
            _ => return state,
        };
        let (token_id, _) = self.side_token(side);
        let token_id = token_id.to_string();

        if self.dry_run {
            info!(side = ?side, order_id = %order_id, "[dry run] cancel order");
            self.orders.lock().remove(&order_id);
            return SideState::None;
        }

        match self.api.cancel(&order_id).await {
            Ok(()) => {
                debug!(side = ?side, order_id = %order_id, "order cancelled");
                self.orders.lock().remove(&order_id);
                SideState::None
            }
            Err(e) => {
                // Escalate to a token-wide cancel before giving up.
                warn!(side = ?side, order_id = %order_id, error = %e, "cancel failed, escalating to cancel-all for token");
                match self.api.cancel_token(&token_id).await {
                    Ok(()) => {
                        self.orders.lock().remove(&order_id);
                        SideState::None
                    }
                    Err(e2) => {
                        warn!(side = ?side, error = %e2, "token-wide cancel failed, suppressing side");
                        SideState::Cancelling { order_id }
                    }
                }
            }
        }
    }

    async fn do_place(&mut self, side: QuoteSide, quote: &Quote, price: TickPrice) -> SideState {
        let (token_id, role) = self.side_token(side);
        let token_id = token_id.to_string();
        let order_side = match side {
            QuoteSide::Bid => Side::Buy,
            QuoteSide::Ask => {
                if self.cfg.collateral_only {
                    Side::Buy
                } else {
                    Side::Sell
                }
            }
        };

        if self.dry_run {
            self.dry_run_seq += 1;
            let order_id = format!("dry-run-{}", self.dry_run_seq);
            info!(
                side = ?side,
                order_id = %order_id,
                token_id = %token_id,
                price = %price,
                size = quote.size,
                "[dry run] place order"
            );
            self.track(order_id.clone(), token_id, role, order_side, price, quote.size);
            return SideState::Live { order_id, price };
        }

        let request = PlaceOrder {
            token_id: token_id.clone(),
            side: order_side,
            price,
            size: quote.size,
            tick_size: self.params.tick_size,
            neg_risk: self.params.neg_risk,
        };

        for attempt in 0..PLACE_RETRIES {
            match self.api.place(&request).await {
                Ok(order_id) => {
                    info!(
                        side = ?side,
                        order_id = %order_id,
                        price = %price,
                        size = quote.size,
                        "order placed"
                    );
                    self.track(order_id.clone(), token_id, role, order_side, price, quote.size);
                    return SideState::Live { order_id, price };
                }
                Err(OrderApiError::Permanent(msg)) => {
                    warn!(side = ?side, price = %price, reason = %msg, "placement rejected permanently");
                    return SideState::None;
                }
                Err(OrderApiError::Transient(msg)) => {
                    warn!(
                        side = ?side,
                        attempt = attempt + 1,
                        reason = %msg,
                        "placement failed, will retry"
                    );
                    if attempt + 1 < PLACE_RETRIES {
                        tokio::time::sleep(Duration::from_millis(
                            PLACE_BACKOFF_MS[attempt as usize],
                        ))
                        .await;
                    }
                }
            }
        }
        warn!(side = ?side, "placement retries exhausted, side left empty until next rebalance");
        SideState::None
    }

    fn track(
        &self,
        order_id: String,
        token_id: String,
        role: TokenRole,
        side: Side,
        price: TickPrice,
        size: f64,
    ) {
        self.orders.lock().insert(TrackedOrder {
            order_id,
            token_id,
            role,
            side,
            price,
            size,
            placed_at: chrono::Utc::now(),
        });
    }

    /// Shutdown path: cancel whatever is live on both tokens.
    async fn cancel_everything(&mut self) {
        if self.dry_run {
            info!("[dry run] cancel all orders on both tokens");
            self.bid = SideState::None;
            self.ask = SideState::None;
            return;
        }
        for token_id in [
            self.params.yes_token_id.clone(),
            self.params.no_token_id.clone(),
        ] {
            if let Err(e) = self.api.cancel_token(&token_id).await {
                warn!(token_id = %token_id, error = %e, "shutdown cancel failed");
            }
        }
        self.bid = SideState::None;
        self.ask = SideState::None;
    }

    /// Test and introspection view of the side states.
    pub fn side_states(&self) -> (SideState, SideState) {
        (self.bid.clone(), self.ask.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitConfig;
    use crate::feeds::MidpointUpdate;
    use crate::store::FillStore;
    use parking_lot::Mutex as PlMutex;
    use tempfile::TempDir;

    fn params() -> MarketParams {
        MarketParams {
            condition_id: "0x1234567890abcdef1234567890abcdef12345678".into(),
            yes_token_id: "yes-token".into(),
            no_token_id: "no-token".into(),
            tick_size: 0.01,
            neg_risk: false,
            rewards_min_size: 10.0,
            rewards_max_spread: 4.0,
            rewards_daily_rate: None,
        }
    }

    #[test]
    fn desired_action_policy() {
        let tick = TickPrice(100);
        let target = TickPrice(4_900);
        let live = SideState::Live {
            order_id: "a".into(),
            price: TickPrice(4_900),
        };

        // Gated: live orders come down, empty sides stay empty.
        let blocked = GateDecision::block("limit");
        assert_eq!(desired_action(&live, &blocked, target, tick), SideAction::Cancel);
        assert_eq!(
            desired_action(&SideState::None, &blocked, target, tick),
            SideAction::Nothing
        );

        // Within one tick of target: leave it alone.
        let open = GateDecision::allow();
        assert_eq!(desired_action(&live, &open, TickPrice(5_000), tick), SideAction::Nothing);
        assert_eq!(desired_action(&live, &open, TickPrice(4_800), tick), SideAction::Nothing);

        // Further than a tick: replace.
        assert_eq!(
            desired_action(&live, &open, TickPrice(5_200), tick),
            SideAction::CancelThenPlace(TickPrice(5_200))
        );

        // Nothing resting: place.
        assert_eq!(
            desired_action(&SideState::None, &open, target, tick),
            SideAction::Place(target)
        );

        // A failed cancel keeps suppressing placement.
        let cancelling = SideState::Cancelling {
            order_id: "a".into(),
        };
        assert_eq!(desired_action(&cancelling, &open, target, tick), SideAction::Cancel);
    }

    /// Order API double: records every call with its (paused) timestamp.
    struct ScriptedApi {
        calls: PlMutex<Vec<(Instant, String)>>,
        seq: PlMutex<u64>,
    }

    impl ScriptedApi {
        fn new() -> Self {
            Self {
                calls: PlMutex::new(Vec::new()),
                seq: PlMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl OrderApi for ScriptedApi {
        async fn place(&self, order: &PlaceOrder) -> Result<String, OrderApiError> {
            let mut seq = self.seq.lock();
            *seq += 1;
            let id = format!("ord-{}", *seq);
            self.calls.lock().push((
                Instant::now(),
                format!("place {} {} @{}", order.side, order.token_id, order.price),
            ));
            Ok(id)
        }

        async fn cancel(&self, order_id: &str) -> Result<()> {
            self.calls
                .lock()
                .push((Instant::now(), format!("cancel {}", order_id)));
            Ok(())
        }

        async fn cancel_token(&self, token_id: &str) -> Result<()> {
            self.calls
                .lock()
                .push((Instant::now(), format!("cancel-token {}", token_id)));
            Ok(())
        }
    }

    fn tracker() -> (TempDir, Arc<PlMutex<PositionTracker>>) {
        let dir = TempDir::new().expect("tempdir");
        let store = FillStore::new(dir.path());
        let mut tracker = PositionTracker::new(
            params(),
            store,
            LimitConfig {
                max_net_exposure: 1_000.0,
                warn_threshold: 0.8,
            },
        );
        tracker.initialize(0.0, 0.0, None).expect("init");
        (dir, Arc::new(PlMutex::new(tracker)))
    }

    fn quoting_cfg() -> QuotingConfig {
        QuotingConfig {
            order_size: 25.0,
            spread_percent: 0.5,
            rebalance_threshold: 0.001,
            debounce_ms: 50,
            refresh_interval_ms: 600_000,
            collateral_only: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_to_one_rebalance_with_last_midpoint() {
        // Scenario: midpoints at t=0 (0.500), t=20ms (0.502), t=40ms
        // (0.504) with a 50ms debounce collapse into exactly one
        // reconciliation at t>=90ms using 0.504.
        let (_dir, position) = tracker();
        let api = Arc::new(ScriptedApi::new());
        let orders = Arc::new(PlMutex::new(OrderTracker::default()));
        let (midpoint_tx, midpoint_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let controller = QuoteController::new(
            params(),
            quoting_cfg(),
            api.clone(),
            position,
            orders,
            false,
            midpoint_rx,
            shutdown_rx,
        );
        let task = tokio::spawn(controller.run());

        let start = Instant::now();
        for (offset_ms, mid) in [(0u64, 0.500), (20, 0.502), (40, 0.504)] {
            tokio::time::advance(Duration::from_millis(offset_ms.saturating_sub(
                start.elapsed().as_millis() as u64,
            )))
            .await;
            midpoint_tx
                .send(MidpointUpdate {
                    midpoint: mid,
                    at_ms: offset_ms as i64,
                })
                .await
                .expect("send midpoint");
            tokio::task::yield_now().await;
        }

        // Run well past the debounce deadline.
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        {
            let calls = api.calls.lock();
            let placements: Vec<&(Instant, String)> =
                calls.iter().filter(|(_, c)| c.starts_with("place")).collect();
            // One reconciliation placed exactly one order per side.
            assert_eq!(placements.len(), 2, "calls: {:?}", calls);
            // Fired no earlier than last trigger + debounce.
            for (at, _) in &placements {
                assert!(at.duration_since(start) >= Duration::from_millis(90));
            }
            // Quotes derive from the final midpoint 0.504: the 1-cent band
            // around it rounds to 0.49/0.51.
            assert!(placements.iter().any(|(_, c)| c.contains("BUY") && c.contains("0.4900")));
            assert!(placements.iter().any(|(_, c)| c.contains("SELL") && c.contains("0.5100")));
        }

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::advance(Duration::from_millis(10)).await;
        task.await.expect("join").expect("controller run");
    }

    #[tokio::test(start_paused = true)]
    async fn small_midpoint_moves_do_not_replace_orders() {
        let (_dir, position) = tracker();
        let api = Arc::new(ScriptedApi::new());
        let orders = Arc::new(PlMutex::new(OrderTracker::default()));
        let (midpoint_tx, midpoint_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let controller = QuoteController::new(
            params(),
            quoting_cfg(),
            api.clone(),
            position,
            orders,
            false,
            midpoint_rx,
            shutdown_rx,
        );
        let task = tokio::spawn(controller.run());

        midpoint_tx
            .send(MidpointUpdate { midpoint: 0.500, at_ms: 0 })
            .await
            .expect("send");
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        // A midpoint one tenth of a tick away retargets to prices within
        // one tick, so nothing is replaced.
        midpoint_tx
            .send(MidpointUpdate { midpoint: 0.504, at_ms: 100 })
            .await
            .expect("send");
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        {
            let calls = api.calls.lock();
            let cancels = calls.iter().filter(|(_, c)| c.starts_with("cancel")).count();
            let places = calls.iter().filter(|(_, c)| c.starts_with("place")).count();
            assert_eq!(places, 2, "calls: {:?}", calls);
            assert_eq!(cancels, 0, "calls: {:?}", calls);
        }

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::advance(Duration::from_millis(10)).await;
        task.await.expect("join").expect("controller run");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_both_tokens() {
        let (_dir, position) = tracker();
        let api = Arc::new(ScriptedApi::new());
        let orders = Arc::new(PlMutex::new(OrderTracker::default()));
        let (_midpoint_tx, midpoint_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let controller = QuoteController::new(
            params(),
            quoting_cfg(),
            api.clone(),
            position,
            orders,
            false,
            midpoint_rx,
            shutdown_rx,
        );
        let task = tokio::spawn(controller.run());
        tokio::task::yield_now().await;

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::advance(Duration::from_millis(10)).await;
        task.await.expect("join").expect("controller run");

        let calls = api.calls.lock();
        assert!(calls.iter().any(|(_, c)| c == "cancel-token yes-token"));
        assert!(calls.iter().any(|(_, c)| c == "cancel-token no-token"));
    }
}
