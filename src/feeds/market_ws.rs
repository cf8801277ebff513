//! Public market-channel feed.
//!
//! Keeps a per-token top-of-book plus last trade, derives the canonical
//! midpoint, and pushes every midpoint change to the consumer channel.
//! A single connection covers both outcome tokens. On disconnect the
//! feed reconnects with jittered exponential backoff and, until the
//! stream is back, polls the midpoint endpoint over HTTP so the quoting
//! loop is never flying blind.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::events::{parse_market_frame, BookSnapshot, MarketEvent, PriceChangeLevel};
use crate::clients::clob::ClobClient;
use crate::config::FeedConfig;
use crate::models::TickPrice;

/// A midpoint change for one token, delivered to the quote controller.
#[derive(Debug, Clone, Copy)]
pub struct MidpointUpdate {
    pub midpoint: f64,
    pub at_ms: i64,
}

/// Top-of-book view exposed to the rest of the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenTop {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub last_trade: Option<f64>,
    pub midpoint: Option<f64>,
    pub updated_at_ms: i64,
}

/// Book state for one token. Levels are keyed on the integer price grid
/// so deltas never drift.
#[derive(Debug, Default)]
struct TokenBook {
    bids: BTreeMap<i64, f64>,
    asks: BTreeMap<i64, f64>,
    /// Top-of-book as last reported, which may be finer than the levels we
    /// hold (best_bid_ask frames carry no depth).
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    last_trade: Option<(f64, i64)>,
    updated_at_ms: i64,
}

impl TokenBook {
    fn apply_snapshot(&mut self, snap: &BookSnapshot, now_ms: i64) {
        self.bids.clear();
        self.asks.clear();
        for level in &snap.bids {
            if level.size > 0.0 {
                self.bids.insert(TickPrice::from_f64(level.price).0, level.size);
            }
        }
        for level in &snap.asks {
            if level.size > 0.0 {
                self.asks.insert(TickPrice::from_f64(level.price).0, level.size);
            }
        }
        self.refresh_top();
        self.updated_at_ms = now_ms;
    }

    fn apply_change(&mut self, change: &PriceChangeLevel, now_ms: i64) {
        let key = TickPrice::from_f64(change.price).0;
        let levels = if change.side.eq_ignore_ascii_case("BUY") {
            &mut self.bids
        } else {
            &mut self.asks
        };
        if change.size > 0.0 {
            levels.insert(key, change.size);
        } else {
            levels.remove(&key);
        }
        self.refresh_top();
        self.updated_at_ms = now_ms;
    }

    fn apply_best(&mut self, best_bid: Option<f64>, best_ask: Option<f64>, now_ms: i64) {
        if best_bid.is_some() {
            self.best_bid = best_bid;
        }
        if best_ask.is_some() {
            self.best_ask = best_ask;
        }
        self.updated_at_ms = now_ms;
    }

    fn apply_last_trade(&mut self, price: f64, now_ms: i64) {
        self.last_trade = Some((price, now_ms));
        self.updated_at_ms = now_ms;
    }

    fn refresh_top(&mut self) {
        self.best_bid = self
            .bids
            .last_key_value()
            .map(|(p, _)| TickPrice(*p).to_f64());
        self.best_ask = self
            .asks
            .first_key_value()
            .map(|(p, _)| TickPrice(*p).to_f64());
    }

    /// Midpoint with spread fallback: a tight book averages top-of-book, a
    /// wide one falls back to a recent trade, anything else yields nothing.
    fn derive_midpoint(&self, max_spread: f64, last_trade_max_age_ms: i64, now_ms: i64) -> Option<f64> {
        if let (Some(bid), Some(ask)) = (self.best_bid, self.best_ask) {
            if ask - bid <= max_spread {
                return Some((bid + ask) / 2.0);
            }
        }
        match self.last_trade {
            Some((price, at_ms)) if now_ms - at_ms <= last_trade_max_age_ms => Some(price),
            _ => None,
        }
    }

    fn top(&self, max_spread: f64, last_trade_max_age_ms: i64, now_ms: i64) -> TokenTop {
        TokenTop {
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            last_trade: self.last_trade.map(|(p, _)| p),
            midpoint: self.derive_midpoint(max_spread, last_trade_max_age_ms, now_ms),
            updated_at_ms: self.updated_at_ms,
        }
    }
}

/// The feed worker plus its shared read-side.
pub struct MarketFeed {
    cfg: FeedConfig,
    ws_url: String,
    asset_ids: Vec<String>,
    /// The token whose midpoint is canonical for quoting (the YES token).
    primary_token: String,
    books: Arc<RwLock<HashMap<String, TokenBook>>>,
    connected: Arc<AtomicBool>,
    midpoint_tx: mpsc::Sender<MidpointUpdate>,
    clob: Arc<ClobClient>,
    shutdown: watch::Receiver<bool>,
}

/// Cloneable read-side handle for other subsystems.
#[derive(Clone)]
pub struct MarketFeedHandle {
    cfg: FeedConfig,
    books: Arc<RwLock<HashMap<String, TokenBook>>>,
    connected: Arc<AtomicBool>,
}

impl MarketFeedHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn top(&self, token_id: &str) -> Option<TokenTop> {
        let now_ms = Utc::now().timestamp_millis();
        let books = self.books.read();
        books.get(token_id).map(|b| {
            b.top(
                self.cfg.max_spread_for_midpoint,
                self.cfg.last_trade_max_age_ms,
                now_ms,
            )
        })
    }
}

impl MarketFeed {
    pub fn new(
        cfg: FeedConfig,
        ws_url: String,
        asset_ids: Vec<String>,
        primary_token: String,
        clob: Arc<ClobClient>,
        midpoint_tx: mpsc::Sender<MidpointUpdate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            ws_url,
            asset_ids,
            primary_token,
            books: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            midpoint_tx,
            clob,
            shutdown,
        }
    }

    pub fn handle(&self) -> MarketFeedHandle {
        MarketFeedHandle {
            cfg: self.cfg.clone(),
            books: self.books.clone(),
            connected: self.connected.clone(),
        }
    }

    /// Reconnect loop. Runs until shutdown.
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let mut reconnect_delay = Duration::from_millis(self.cfg.reconnect_delay_ms);
        let max_delay = Duration::from_millis(self.cfg.max_reconnect_delay_ms);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect_and_stream(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.connected.store(false, Ordering::Relaxed);
                    let delay = with_jitter(reconnect_delay);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "market stream disconnected, reconnecting");
                    self.poll_fallback_for(delay, &mut shutdown).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_delay);
                }
            }
        }
    }

    async fn connect_and_stream(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        info!(url = %self.ws_url, assets = self.asset_ids.len(), "connecting market stream");
        let (ws_stream, resp) = connect_async(&self.ws_url)
            .await
            .context("market stream connect")?;
        debug!(status = %resp.status(), "market stream connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({
            "assets_ids": self.asset_ids,
            "type": "market",
            "custom_feature_enabled": true,
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("market subscription send")?;

        self.connected.store(true, Ordering::Relaxed);

        let mut ping = interval(Duration::from_millis(self.cfg.ping_interval_ms));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write
                        .send(Message::Text("PING".to_string()))
                        .await
                        .context("market ping send")?;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("market stream shutting down");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow!("market stream ended"));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => self.handle_text(&text),
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            return Err(anyhow!("market stream closed: {:?}", frame));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("market stream error: {e}")),
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let now_ms = Utc::now().timestamp_millis();
        for event in parse_market_frame(text) {
            let token_id = match &event {
                MarketEvent::Book(b) => b.asset_id.clone(),
                MarketEvent::PriceChange(c) => c.asset_id.clone(),
                MarketEvent::BestBidAsk(b) => b.asset_id.clone(),
                MarketEvent::LastTrade(t) => t.asset_id.clone(),
            };
            if !self.asset_ids.iter().any(|a| a == &token_id) {
                continue;
            }

            let (before, after) = {
                let mut books = self.books.write();
                let book = books.entry(token_id.clone()).or_default();
                let before = book.derive_midpoint(
                    self.cfg.max_spread_for_midpoint,
                    self.cfg.last_trade_max_age_ms,
                    now_ms,
                );
                match &event {
                    MarketEvent::Book(snap) => book.apply_snapshot(snap, now_ms),
                    MarketEvent::PriceChange(change) => {
                        for level in &change.changes {
                            book.apply_change(level, now_ms);
                        }
                    }
                    MarketEvent::BestBidAsk(b) => book.apply_best(b.best_bid, b.best_ask, now_ms),
                    MarketEvent::LastTrade(t) => book.apply_last_trade(t.price, now_ms),
                }
                let after = book.derive_midpoint(
                    self.cfg.max_spread_for_midpoint,
                    self.cfg.last_trade_max_age_ms,
                    now_ms,
                );
                (before, after)
            };

            if token_id == self.primary_token {
                if let Some(mid) = after {
                    if before != after {
                        self.emit_midpoint(mid, now_ms);
                    }
                }
            }
        }
    }

    fn emit_midpoint(&self, midpoint: f64, at_ms: i64) {
        if let Err(e) = self.midpoint_tx.try_send(MidpointUpdate { midpoint, at_ms }) {
            debug!(error = %e, "midpoint channel full, update dropped");
        }
    }

    /// HTTP midpoint polling while the stream is down. Runs for roughly
    /// the reconnect delay, then returns so the caller can retry the
    /// stream.
    async fn poll_fallback_for(&self, total: Duration, shutdown: &mut watch::Receiver<bool>) {
        let deadline = Instant::now() + total;
        let poll_every = Duration::from_millis(self.cfg.fallback_polling_ms);

        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.clob.get_midpoint(&self.primary_token).await {
                Ok(mid) => {
                    let now_ms = Utc::now().timestamp_millis();
                    debug!(midpoint = mid, "fallback midpoint poll");
                    self.emit_midpoint(mid, now_ms);
                }
                Err(e) => debug!(error = %e, "fallback midpoint poll failed"),
            }

            let now = Instant::now();
            if now + poll_every >= deadline {
                sleep(deadline.saturating_duration_since(now)).await;
                return;
            }
            tokio::select! {
                _ = sleep(poll_every) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Apply a ±10% jitter so synchronized restarts do not reconnect in step.
fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    delay.mul_f64(factor)
}
