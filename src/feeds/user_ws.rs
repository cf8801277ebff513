//! Authenticated user-channel feed.
//!
//! Delivers canonical fill records to the engine and keeps the order
//! tracker current. Trade events arrive with the taker's side; when our
//! key was the maker the side is inverted so every fill is expressed from
//! our own perspective. Delivery is at-least-once, so everything emitted
//! here is safe to replay against an idempotent consumer.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::events::{parse_user_frame, UserEvent, UserOrderEvent, UserTradeEvent};
use crate::config::{ClobCredentials, FeedConfig};
use crate::models::{Fill, FillStatus, MarketParams, Side};
use crate::orders::OrderTracker;

/// What the engine receives from this feed.
#[derive(Debug, Clone)]
pub enum UserFeedEvent {
    /// A normalized fill, ready for the position tracker.
    Fill(Fill),
    /// One of our orders left the book without a fill on this event.
    OrderGone { order_id: String },
}

pub struct UserFeed {
    cfg: FeedConfig,
    ws_url: String,
    creds: ClobCredentials,
    params: MarketParams,
    order_tracker: Arc<Mutex<OrderTracker>>,
    event_tx: mpsc::Sender<UserFeedEvent>,
    shutdown: watch::Receiver<bool>,
}

impl UserFeed {
    pub fn new(
        cfg: FeedConfig,
        ws_url: String,
        creds: ClobCredentials,
        params: MarketParams,
        order_tracker: Arc<Mutex<OrderTracker>>,
        event_tx: mpsc::Sender<UserFeedEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            ws_url,
            creds,
            params,
            order_tracker,
            event_tx,
            shutdown,
        }
    }

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
                    warn!(error = %e, delay_ms = reconnect_delay.as_millis() as u64, "user stream disconnected, reconnecting");
                    tokio::select! {
                        _ = sleep(reconnect_delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                    }
                    reconnect_delay = (reconnect_delay * 2).min(max_delay);
                }
            }
        }
    }

    async fn connect_and_stream(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        info!(url = %self.ws_url, "connecting user stream");
        let (ws_stream, resp) = connect_async(&self.ws_url)
            .await
            .context("user stream connect")?;
        debug!(status = %resp.status(), "user stream connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({
            "auth": {
                "apiKey": self.creds.api_key,
                "secret": self.creds.secret,
                "passphrase": self.creds.passphrase,
            },
            "type": "user",
            "markets": [self.params.condition_id],
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("user subscription send")?;

        let mut ping = interval(Duration::from_millis(self.cfg.ping_interval_ms));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write
                        .send(Message::Text("PING".to_string()))
                        .await
                        .context("user ping send")?;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("user stream shutting down");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow!("user stream ended"));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => self.handle_text(&text).await,
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            return Err(anyhow!("user stream closed: {:?}", frame));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("user stream error: {e}")),
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        for event in parse_user_frame(text) {
            match event {
                UserEvent::Trade(trade) => {
                    let fill = {
                        let tracker = self.order_tracker.lock();
                        normalize_trade(&trade, &self.params, &tracker)
                    };
                    if let Some(fill) = fill {
                        if self.event_tx.send(UserFeedEvent::Fill(fill)).await.is_err() {
                            warn!("user feed consumer dropped");
                            return;
                        }
                    }
                }
                UserEvent::Order(order) => self.handle_order_event(&order).await,
            }
        }
    }

    /// Order lifecycle notices keep the tracker honest but never move
    /// position.
    async fn handle_order_event(&self, order: &UserOrderEvent) {
        match order.kind.as_str() {
            "PLACEMENT" => {
                // The controller already registered this order when it
                // placed it; a placement notice confirms, nothing to do.
                debug!(order_id = %order.id, "order placement confirmed");
            }
            "UPDATE" => {
                let fully_matched = matches!(
                    (order.size_matched, order.original_size),
                    (Some(matched), Some(original)) if matched >= original && original > 0.0
                );
                if fully_matched {
                    self.order_tracker.lock().remove(&order.id);
                    let _ = self
                        .event_tx
                        .send(UserFeedEvent::OrderGone {
                            order_id: order.id.clone(),
                        })
                        .await;
                }
            }
            "CANCELLATION" => {
                self.order_tracker.lock().remove(&order.id);
                let _ = self
                    .event_tx
                    .send(UserFeedEvent::OrderGone {
                        order_id: order.id.clone(),
                    })
                    .await;
            }
            other => warn!(order_id = %order.id, kind = %other, "unknown order event kind"),
        }
    }
}

/// Convert a taker-perspective trade event into a fill from our
/// perspective.
///
/// When `trade_owner` equals the channel owner we were the taker and the
/// reported side already is ours. Otherwise one of the maker orders is
/// ours: the side inverts and the fill executes at our maker order's
/// price. The owner comparison rests on the venue emitting stable account
/// ids; an event owned by us on an asset we never subscribed to is logged
/// as an anomaly and dropped rather than acted on.
pub fn normalize_trade(
    trade: &UserTradeEvent,
    params: &MarketParams,
    tracker: &OrderTracker,
) -> Option<Fill> {
    let taker_side = match trade.side.to_ascii_uppercase().as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => {
            warn!(trade_id = %trade.id, side = %other, "unparseable trade side");
            return None;
        }
    };

    let we_are_taker = trade.trade_owner == trade.owner;

    if we_are_taker && params.role_of(&trade.asset_id).is_none() {
        warn!(
            trade_id = %trade.id,
            asset_id = %trade.asset_id,
            "own trade on unsubscribed asset, treating as anomaly"
        );
        return None;
    }

    let status = FillStatus::parse(&trade.status).unwrap_or(FillStatus::Matched);
    let timestamp_ms = parse_event_time(trade)
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    if we_are_taker {
        return Some(Fill {
            id: trade.id.clone(),
            token_id: trade.asset_id.clone(),
            condition_id: trade.market.clone(),
            side: taker_side,
            price: trade.price,
            size: trade.size,
            timestamp_ms,
            order_id: trade.taker_order_id.clone(),
            status,
        });
    }

    // Maker case: find which of the maker orders is ours, preferring the
    // order tracker over the owner string.
    let ours = trade
        .maker_orders
        .iter()
        .find(|m| tracker.get(&m.order_id).is_some())
        .or_else(|| {
            trade
                .maker_orders
                .iter()
                .find(|m| !trade.owner.is_empty() && m.owner == trade.owner)
        })?;

    let token_id = ours
        .asset_id
        .clone()
        .or_else(|| tracker.get(&ours.order_id).map(|o| o.token_id.clone()))
        .unwrap_or_else(|| trade.asset_id.clone());

    Some(Fill {
        id: trade.id.clone(),
        token_id,
        condition_id: trade.market.clone(),
        side: taker_side.invert(),
        price: ours.price.unwrap_or(trade.price),
        size: ours.matched_amount.unwrap_or(trade.size),
        timestamp_ms,
        order_id: Some(ours.order_id.clone()),
        status,
    })
}

/// Event times arrive as stringified seconds or milliseconds.
fn parse_event_time(trade: &UserTradeEvent) -> Option<i64> {
    let raw = trade
        .match_time
        .as_deref()
        .or(trade.timestamp.as_deref())?;
    let value = raw.parse::<i64>().ok()?;
    if value < 1_000_000_000_000 {
        Some(value * 1_000)
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::events::MakerOrder;
    use crate::models::{TickPrice, TokenRole, TrackedOrder};

    fn params() -> MarketParams {
        MarketParams {
            condition_id: "0xcond".into(),
            yes_token_id: "yes-token".into(),
            no_token_id: "no-token".into(),
            tick_size: 0.01,
            neg_risk: false,
            rewards_min_size: 10.0,
            rewards_max_spread: 4.0,
            rewards_daily_rate: None,
        }
    }

    fn trade() -> UserTradeEvent {
        UserTradeEvent {
            id: "trade-1".into(),
            asset_id: "yes-token".into(),
            market: "0xcond".into(),
            side: "BUY".into(),
            price: 0.49,
            size: 25.0,
            status: "MATCHED".into(),
            taker_order_id: Some("taker-ord".into()),
            maker_orders: Vec::new(),
            owner: "us".into(),
            trade_owner: "us".into(),
            match_time: Some("1700000000".into()),
            timestamp: None,
        }
    }

    #[test]
    fn taker_trade_keeps_reported_side() {
        let fill = normalize_trade(&trade(), &params(), &OrderTracker::default()).expect("fill");
        assert_eq!(fill.side, Side::Buy);
        assert_eq!(fill.order_id.as_deref(), Some("taker-ord"));
        assert_eq!(fill.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn maker_trade_inverts_side_and_uses_our_order() {
        let mut tracker = OrderTracker::default();
        tracker.insert(TrackedOrder {
            order_id: "our-maker".into(),
            token_id: "yes-token".into(),
            role: TokenRole::Yes,
            side: Side::Sell,
            price: TickPrice(5_100),
            size: 25.0,
            placed_at: Utc::now(),
        });

        let mut t = trade();
        t.trade_owner = "them".into();
        t.maker_orders = vec![
            MakerOrder {
                order_id: "someone-else".into(),
                owner: "other".into(),
                matched_amount: Some(5.0),
                price: Some(0.52),
                asset_id: Some("yes-token".into()),
            },
            MakerOrder {
                order_id: "our-maker".into(),
                owner: "us".into(),
                matched_amount: Some(10.0),
                price: Some(0.51),
                asset_id: Some("yes-token".into()),
            },
        ];

        let fill = normalize_trade(&t, &params(), &tracker).expect("fill");
        // Taker bought, so as maker we sold.
        assert_eq!(fill.side, Side::Sell);
        assert_eq!(fill.order_id.as_deref(), Some("our-maker"));
        assert_eq!(fill.price, 0.51);
        assert_eq!(fill.size, 10.0);
    }

    #[test]
    fn maker_trade_without_our_order_is_dropped() {
        let mut t = trade();
        t.trade_owner = "them".into();
        t.owner = String::new();
        t.maker_orders = vec![MakerOrder {
            order_id: "not-ours".into(),
            owner: "other".into(),
            matched_amount: None,
            price: None,
            asset_id: None,
        }];
        assert!(normalize_trade(&t, &params(), &OrderTracker::default()).is_none());
    }

    #[test]
    fn own_trade_on_unknown_asset_is_an_anomaly() {
        let mut t = trade();
        t.asset_id = "mystery-token".into();
        assert!(normalize_trade(&t, &params(), &OrderTracker::default()).is_none());
    }

    #[test]
    fn millisecond_timestamps_pass_through() {
        let mut t = trade();
        t.match_time = Some("1700000000123".into());
        let fill = normalize_trade(&t, &params(), &OrderTracker::default()).expect("fill");
        assert_eq!(fill.timestamp_ms, 1_700_000_000_123);
    }

    #[test]
    fn unknown_status_defaults_to_matched() {
        let mut t = trade();
        t.status = "SOMETHING".into();
        let fill = normalize_trade(&t, &params(), &OrderTracker::default()).expect("fill");
        assert_eq!(fill.status, FillStatus::Matched);
    }
}
