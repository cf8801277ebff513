//! Streaming market data and user-channel plumbing.

pub mod events;
mod market_ws;
mod user_ws;

pub use market_ws::{MarketFeed, MarketFeedHandle, MidpointUpdate, TokenTop};
pub use user_ws::{normalize_trade, UserFeed, UserFeedEvent};
