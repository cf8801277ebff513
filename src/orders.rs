//! In-memory book-keeping of our outstanding orders.
//!
//! The user channel reports fills from the taker's perspective only; this
//! map is what lets the fill handler answer "which of my orders was hit,
//! and on which outcome token" deterministically instead of guessing from
//! the asset id alone.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::TrackedOrder;

pub const DEFAULT_CAPACITY: usize = 1_000;
pub const DEFAULT_MAX_AGE_HOURS: i64 = 24;

/// Bounded map from order id to intent. When full, entries older than the
/// max age are pruned first; if the map is still full the oldest entry is
/// evicted.
#[derive(Debug)]
pub struct OrderTracker {
    orders: HashMap<String, TrackedOrder>,
    capacity: usize,
    max_age: Duration,
}

impl Default for OrderTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Duration::hours(DEFAULT_MAX_AGE_HOURS))
    }
}

impl OrderTracker {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            orders: HashMap::with_capacity(capacity),
            capacity,
            max_age,
        }
    }

    pub fn insert(&mut self, order: TrackedOrder) {
        if self.orders.len() >= self.capacity && !self.orders.contains_key(&order.order_id) {
            self.prune(Utc::now());
            if self.orders.len() >= self.capacity {
                self.evict_oldest();
            }
        }
        debug!(
            order_id = %order.order_id,
            role = %order.role,
            side = %order.side,
            price = %order.price,
            "tracking order"
        );
        self.orders.insert(order.order_id.clone(), order);
    }

    pub fn get(&self, order_id: &str) -> Option<&TrackedOrder> {
        self.orders.get(order_id)
    }

    pub fn remove(&mut self, order_id: &str) -> Option<TrackedOrder> {
        self.orders.remove(order_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Drop every entry older than the max age.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.max_age;
        let before = self.orders.len();
        self.orders.retain(|_, o| o.placed_at >= cutoff);
        let pruned = before - self.orders.len();
        if pruned > 0 {
            debug!(pruned, remaining = self.orders.len(), "pruned aged orders");
        }
        pruned
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .orders
            .values()
            .min_by_key(|o| o.placed_at)
            .map(|o| o.order_id.clone());
        if let Some(order_id) = oldest {
            warn!(order_id = %order_id, "order tracker at capacity, evicting oldest");
            self.orders.remove(&order_id);
        }
    }
}
