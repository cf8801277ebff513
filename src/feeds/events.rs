//! Wire types for the venue's WebSocket channels.
//!
//! Every frame is a JSON object (or array of objects) discriminated by a
//! stable `event_type` string. Parsing goes through `serde_json::Value`
//! first so an unknown discriminator is surfaced as a warning instead of a
//! dropped frame, and numeric fields tolerate the venue's habit of
//! stringifying numbers.

use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

/// One resting level, price and size as the venue sends them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceLevel {
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
}

/// Full book snapshot. Bids arrive ascending by price, asks descending;
/// consumers must not rely on either order.
#[derive(Debug, Clone, Deserialize)]
pub struct BookSnapshot {
    pub asset_id: String,
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// One level-2 delta inside a `price_change` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeLevel {
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
    pub side: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChange {
    pub asset_id: String,
    #[serde(default)]
    pub changes: Vec<PriceChangeLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BestBidAsk {
    pub asset_id: String,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub best_bid: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub best_ask: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastTradePrice {
    pub asset_id: String,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Market-channel event families we act on. The remaining kinds in the
/// taxonomy are observed and logged but carry no book state.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Book(BookSnapshot),
    PriceChange(PriceChange),
    BestBidAsk(BestBidAsk),
    LastTrade(LastTradePrice),
}

/// Parse one market-channel text frame. A frame may hold a single event or
/// an array of events. Returns the events we consume; unknown kinds warn.
pub fn parse_market_frame(text: &str) -> Vec<MarketEvent> {
    if text.eq_ignore_ascii_case("PONG") {
        return Vec::new();
    }
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let items: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(arr) => arr,
        v => vec![v],
    };

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        let event_type = item
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let parsed = match event_type.as_str() {
            "book" => serde_json::from_value(item).map(MarketEvent::Book),
            "price_change" => serde_json::from_value(item).map(MarketEvent::PriceChange),
            "best_bid_ask" => serde_json::from_value(item).map(MarketEvent::BestBidAsk),
            "last_trade_price" => serde_json::from_value(item).map(MarketEvent::LastTrade),
            "tick_size_change" | "market_resolved" | "new_market" => {
                warn!(event_type = %event_type, "market event observed but not consumed");
                continue;
            }
            "" => continue,
            other => {
                warn!(event_type = %other, "unknown market event kind");
                continue;
            }
        };
        match parsed {
            Ok(e) => events.push(e),
            Err(e) => debug!(event_type = %event_type, error = %e, "market frame parse failed"),
        }
    }
    events
}

/// A trade on the authenticated user channel. The `side` is the taker's.
#[derive(Debug, Clone, Deserialize)]
pub struct UserTradeEvent {
    pub id: String,
    pub asset_id: String,
    /// Condition id of the market.
    pub market: String,
    pub side: String,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
    pub status: String,
    #[serde(default)]
    pub taker_order_id: Option<String>,
    #[serde(default)]
    pub maker_orders: Vec<MakerOrder>,
    /// The channel owner's account id.
    #[serde(default)]
    pub owner: String,
    /// The taker's account id.
    #[serde(default)]
    pub trade_owner: String,
    #[serde(default)]
    pub match_time: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakerOrder {
    pub order_id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub matched_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub price: Option<f64>,
    #[serde(default)]
    pub asset_id: Option<String>,
}

/// Order lifecycle notice on the user channel. Book-keeping only; fills
/// drive position, these do not.
#[derive(Debug, Clone, Deserialize)]
pub struct UserOrderEvent {
    pub id: String,
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    /// PLACEMENT, UPDATE or CANCELLATION.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub original_size: Option<f64>,
    #[serde(default, deserialize_with = "de_f64_opt")]
    pub size_matched: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum UserEvent {
    Trade(UserTradeEvent),
    Order(UserOrderEvent),
}

/// Parse one user-channel text frame.
pub fn parse_user_frame(text: &str) -> Vec<UserEvent> {
    if text.eq_ignore_ascii_case("PONG") {
        return Vec::new();
    }
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let items: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(arr) => arr,
        v => vec![v],
    };

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        let event_type = item
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let parsed = match event_type.as_str() {
            "trade" => serde_json::from_value(item).map(UserEvent::Trade),
            "order" => serde_json::from_value(item).map(UserEvent::Order),
            "" => continue,
            other => {
                warn!(event_type = %other, "unknown user event kind");
                continue;
            }
        };
        match parsed {
            Ok(e) => events.push(e),
            Err(e) => debug!(event_type = %event_type, error = %e, "user frame parse failed"),
        }
    }
    events
}

fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom("invalid float string")),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

fn de_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => Ok(n.as_f64()),
        serde_json::Value::String(s) => {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_frame_parses_with_string_numbers() {
        let frame = r#"{
            "event_type": "book",
            "asset_id": "123",
            "bids": [{"price": "0.48", "size": "100"}, {"price": "0.49", "size": "50"}],
            "asks": [{"price": "0.52", "size": "80"}, {"price": "0.51", "size": "20"}],
            "timestamp": "1700000000000"
        }"#;
        let events = parse_market_frame(frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::Book(book) => {
                assert_eq!(book.asset_id, "123");
                assert_eq!(book.bids.len(), 2);
                assert_eq!(book.bids[1].price, 0.49);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn array_frames_yield_multiple_events() {
        let frame = r#"[
            {"event_type": "best_bid_ask", "asset_id": "123", "best_bid": "0.49", "best_ask": "0.51"},
            {"event_type": "last_trade_price", "asset_id": "123", "price": "0.50"}
        ]"#;
        let events = parse_market_frame(frame);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let frame = r#"{"event_type": "market_resolved", "asset_id": "123"}"#;
        assert!(parse_market_frame(frame).is_empty());
        let frame = r#"{"event_type": "something_new", "asset_id": "123"}"#;
        assert!(parse_market_frame(frame).is_empty());
    }

    #[test]
    fn pong_frames_are_silent() {
        assert!(parse_market_frame("PONG").is_empty());
        assert!(parse_user_frame("PONG").is_empty());
    }

    #[test]
    fn trade_frame_parses() {
        let frame = r#"{
            "event_type": "trade",
            "id": "trade-1",
            "asset_id": "123",
            "market": "0xcond",
            "side": "BUY",
            "price": "0.49",
            "size": "25",
            "status": "MATCHED",
            "owner": "us",
            "trade_owner": "them",
            "maker_orders": [{"order_id": "ord-9", "owner": "us", "matched_amount": "25", "price": "0.49"}]
        }"#;
        let events = parse_user_frame(frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UserEvent::Trade(t) => {
                assert_eq!(t.id, "trade-1");
                assert_eq!(t.maker_orders.len(), 1);
                assert_eq!(t.maker_orders[0].order_id, "ord-9");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn order_frame_parses() {
        let frame = r#"{
            "event_type": "order",
            "id": "ord-1",
            "asset_id": "123",
            "market": "0xcond",
            "type": "CANCELLATION",
            "price": "0.49",
            "original_size": "25",
            "size_matched": "0"
        }"#;
        let events = parse_user_frame(frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UserEvent::Order(o) => {
                assert_eq!(o.kind, "CANCELLATION");
                assert_eq!(o.size_matched, Some(0.0));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
