//! Metadata service client.
//!
//! The service stringifies numbers freely and returns JSON arrays as
//! strings (`"[\"Yes\",\"No\"]"`), so every field that matters goes
//! through a tolerant deserializer.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// One market as the metadata service reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GammaMarket {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub slug: String,
    #[serde(rename = "conditionId", default)]
    pub condition_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default, deserialize_with = "de_string_vec")]
    pub outcomes: Vec<String>,
    #[serde(rename = "clobTokenIds", default, deserialize_with = "de_string_vec")]
    pub clob_token_ids: Vec<String>,
    #[serde(rename = "rewardsMinSize", default, deserialize_with = "de_string_f64_opt")]
    pub rewards_min_size: Option<f64>,
    #[serde(rename = "rewardsMaxSpread", default, deserialize_with = "de_string_f64_opt")]
    pub rewards_max_spread: Option<f64>,
    #[serde(rename = "rewardsDailyRate", default, deserialize_with = "de_string_f64_opt")]
    pub rewards_daily_rate: Option<f64>,
    #[serde(rename = "volume24hr", default, deserialize_with = "de_string_f64_opt")]
    pub volume_24hr: Option<f64>,
    #[serde(default, deserialize_with = "de_string_f64_opt")]
    pub liquidity: Option<f64>,
    #[serde(default, deserialize_with = "de_string_f64_opt")]
    pub competitive: Option<f64>,
    #[serde(
        rename = "orderPriceMinTickSize",
        default,
        deserialize_with = "de_string_f64_opt"
    )]
    pub order_price_min_tick_size: Option<f64>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(rename = "negRisk", default)]
    pub neg_risk: Option<bool>,
}

impl GammaMarket {
    /// A market is quotable when it is open and exposes a sane binary
    /// token pair.
    pub fn is_open_binary(&self) -> bool {
        self.active.unwrap_or(false)
            && !self.closed.unwrap_or(true)
            && self.clob_token_ids.len() == 2
            && self
                .clob_token_ids
                .iter()
                .all(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
    }
}

/// An event groups one or more markets under a slug.
#[derive(Debug, Clone, Deserialize)]
pub struct GammaEvent {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

pub struct GammaClient {
    client: reqwest::Client,
    base: String,
}

impl GammaClient {
    pub fn new(base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("quotebot/0.1")
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base: base.into(),
        }
    }

    /// Resolve an event and its markets by slug.
    pub async fn event_by_slug(&self, slug: &str) -> Result<Option<GammaEvent>> {
        let url = format!("{}/events/slug/{}", self.base, slug);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("gamma event request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().context("gamma event status")?;
        let body = response.text().await.context("gamma event body")?;
        debug!(slug = %slug, body_len = body.len(), "gamma event response");

        let event: GammaEvent = serde_json::from_str(&body)
            .map_err(|e| {
                warn!(slug = %slug, error = %e, "gamma event parse failed");
                e
            })
            .context("gamma event json parse")?;
        Ok(Some(event))
    }

    /// Resolve a single market by its own slug.
    pub async fn market_by_slug(&self, slug: &str) -> Result<Option<GammaMarket>> {
        let url = format!("{}/markets", self.base);
        let response = self
            .client
            .get(&url)
            .query(&[("slug", slug), ("limit", "1")])
            .send()
            .await
            .context("gamma markets request failed")?
            .error_for_status()
            .context("gamma markets status")?;

        let markets: Vec<GammaMarket> = response.json().await.context("gamma markets parse")?;
        Ok(markets.into_iter().next())
    }

    /// Page through active reward-bearing markets for discovery. `min_size_cap`
    /// drops markets whose reward minimum exceeds what the operator can rest.
    pub async fn reward_markets(&self, min_size_cap: f64, max_pages: usize) -> Result<Vec<GammaMarket>> {
        const PAGE: usize = 100;
        let mut all = Vec::new();

        for page in 0..max_pages {
            let offset = (page * PAGE).to_string();
            let limit = PAGE.to_string();
            let url = format!("{}/markets", self.base);
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("active", "true"),
                    ("closed", "false"),
                    ("rewardsMinSize.gt", "0"),
                    ("limit", limit.as_str()),
                    ("offset", offset.as_str()),
                ])
                .send()
                .await
                .context("gamma reward markets request failed")?
                .error_for_status()
                .context("gamma reward markets status")?;

            let markets: Vec<GammaMarket> =
                response.json().await.context("gamma reward markets parse")?;
            let page_len = markets.len();

            all.extend(markets.into_iter().filter(|m| {
                m.is_open_binary()
                    && m.rewards_min_size.unwrap_or(f64::INFINITY) <= min_size_cap
            }));

            if page_len < PAGE {
                break;
            }
        }

        debug!(count = all.len(), "reward markets fetched");
        Ok(all)
    }
}

fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => {
            // JSON arrays sometimes arrive as a string.
            serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom)
        }
        _ => Ok(Vec::new()),
    }
}

fn de_string_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        _ => Ok(None),
    }
}
