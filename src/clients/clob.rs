//! Order-book service and authenticated order endpoints.
//!
//! Public reads retry with exponential backoff. Authenticated requests
//! carry the venue's L2 HMAC headers: the signature is HMAC-SHA256 over
//! `timestamp + method + path + body` with the base64 secret, URL-safe
//! base64 encoded.

use anyhow::{anyhow, bail, Context, Result};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ClobCredentials;
use crate::models::{Side, TickPrice};

type HmacSha256 = Hmac<Sha256>;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

/// Placement failures split into what is worth retrying and what is not.
#[derive(Debug)]
pub enum OrderApiError {
    /// Network trouble, timeouts, rate limits, 5xx. The next attempt may
    /// succeed.
    Transient(String),
    /// The venue rejected the order itself; retrying the same request
    /// cannot help.
    Permanent(String),
}

impl std::fmt::Display for OrderApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient order error: {}", msg),
            Self::Permanent(msg) => write!(f, "order rejected: {}", msg),
        }
    }
}

impl std::error::Error for OrderApiError {}

/// One side of a book snapshot over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpLevel {
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpBook {
    #[serde(default)]
    pub market: String,
    pub asset_id: String,
    #[serde(default)]
    pub bids: Vec<HttpLevel>,
    #[serde(default)]
    pub asks: Vec<HttpLevel>,
}

/// One sample of the price history endpoint, seconds and price.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PricePoint {
    pub t: i64,
    pub p: f64,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<PricePoint>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id")]
    order_id: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(rename = "errorMsg", alias = "error", default)]
    error_msg: Option<String>,
}

/// Request to rest a GTC limit order.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub token_id: String,
    pub side: Side,
    pub price: TickPrice,
    pub size: f64,
    pub tick_size: f64,
    pub neg_risk: bool,
}

pub struct ClobClient {
    client: Client,
    base: String,
    creds: Option<ClobCredentials>,
}

impl std::fmt::Debug for ClobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobClient")
            .field("base", &self.base)
            .field("authenticated", &self.creds.is_some())
            .finish()
    }
}

impl ClobClient {
    pub fn new(base: impl Into<String>, creds: Option<ClobCredentials>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("quotebot/0.1")
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base: base.into(),
            creds,
        }
    }

    // ------------------------------------------------------------------
    // Public book reads
    // ------------------------------------------------------------------

    pub async fn get_midpoint(&self, token_id: &str) -> Result<f64> {
        let value: serde_json::Value = self
            .get_with_retry("/midpoint", &[("token_id", token_id)])
            .await?;
        parse_f64_field(&value, "mid").context("midpoint response")
    }

    pub async fn get_price(&self, token_id: &str, side: Side) -> Result<f64> {
        let value: serde_json::Value = self
            .get_with_retry("/price", &[("token_id", token_id), ("side", side.as_str())])
            .await?;
        parse_f64_field(&value, "price").context("price response")
    }

    pub async fn get_spread(&self, token_id: &str) -> Result<f64> {
        let value: serde_json::Value = self
            .get_with_retry("/spread", &[("token_id", token_id)])
            .await?;
        parse_f64_field(&value, "spread").context("spread response")
    }

    pub async fn get_book(&self, token_id: &str) -> Result<HttpBook> {
        self.get_with_retry("/book", &[("token_id", token_id)]).await
    }

    /// Batched book fetch used by discovery.
    pub async fn get_books(&self, token_ids: &[String]) -> Result<Vec<HttpBook>> {
        let joined = token_ids.join(",");
        self.get_with_retry("/books", &[("token_ids", joined.as_str())])
            .await
    }

    /// `interval` is one of 1h, 6h, 1d, 1w, max.
    pub async fn prices_history(&self, token_id: &str, interval: &str) -> Result<Vec<PricePoint>> {
        let resp: HistoryResponse = self
            .get_with_retry(
                "/prices-history",
                &[("market", token_id), ("interval", interval)],
            )
            .await?;
        Ok(resp.history)
    }

    async fn get_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let request = self.client.get(&url).query(params);
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<T>()
                        .await
                        .with_context(|| format!("parse {} response", path));
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!(path, attempt = attempt + 1, "rate limited, backing off");
                    sleep(Duration::from_millis(backoff * 10)).await;
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    bail!("{} returned {}: {}", path, status, text);
                }
                Err(e) => {
                    warn!(path, attempt = attempt + 1, error = %e, "request failed");
                }
            }
            if attempt < MAX_RETRIES - 1 {
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(30_000);
            }
        }
        bail!("max retries exceeded for {}", path)
    }

    // ------------------------------------------------------------------
    // Authenticated order endpoints
    // ------------------------------------------------------------------

    fn creds(&self) -> Result<&ClobCredentials> {
        self.creds
            .as_ref()
            .ok_or_else(|| anyhow!("order endpoint requires CLOB credentials"))
    }

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let creds = self.creds()?;
        let message = format!("{}{}{}{}", timestamp, method, path, body);

        let secret_bytes = URL_SAFE
            .decode(&creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&creds.secret))
            .or_else(|_| BASE64.decode(&creds.secret))
            .context("failed to decode CLOB secret")?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| anyhow!("HMAC key error: {}", e))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let creds = self.creds()?;
        // Timestamp in seconds, not milliseconds.
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;

        Ok(vec![
            ("POLY_ADDRESS".to_string(), creds.address.clone()),
            ("POLY_API_KEY".to_string(), creds.api_key.clone()),
            ("POLY_SIGNATURE".to_string(), signature),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), creds.passphrase.clone()),
        ])
    }

    async fn send_authed(
        &self,
        method: reqwest::Method,
        path: &str,
        body: String,
    ) -> Result<(StatusCode, String)> {
        let headers = self.auth_headers(method.as_str(), path, &body)?;
        let url = format!("{}{}", self.base, path);

        let mut request = self
            .client
            .request(method, &url)
            .header("Content-Type", "application/json");
        for (key, value) in headers {
            request = request.header(&key, &value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.context("authenticated request failed")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }

    /// Place a GTC limit order. Returns the venue order id.
    pub async fn place_order(&self, order: &PlaceOrder) -> Result<String, OrderApiError> {
        // Price decimals follow the market tick so 0.001-tick markets do
        // not get truncated to cents.
        let decimals = if order.tick_size < 0.01 { 3 } else { 2 };
        let payload = serde_json::json!({
            "tokenID": order.token_id,
            "price": format!("{:.*}", decimals, order.price.to_f64()),
            "size": format!("{:.2}", order.size),
            "side": order.side.as_str(),
            "orderType": "GTC",
            "tickSize": format!("{}", order.tick_size),
            "negRisk": order.neg_risk,
        });
        let body = serde_json::to_string(&payload)
            .map_err(|e| OrderApiError::Permanent(format!("serialize order: {e}")))?;

        debug!(
            token_id = %order.token_id,
            side = %order.side,
            price = %order.price,
            size = order.size,
            "placing order"
        );

        let (status, text) = self
            .send_authed(reqwest::Method::POST, "/order", body)
            .await
            .map_err(|e| OrderApiError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_rejection(status, &text));
        }

        let resp: OrderResponse = serde_json::from_str(&text)
            .map_err(|e| OrderApiError::Transient(format!("parse order response: {e}")))?;

        if let Some(msg) = resp.error_msg.filter(|m| !m.is_empty()) {
            return Err(classify_message(&msg));
        }
        if !resp.success && resp.order_id.is_none() {
            return Err(OrderApiError::Permanent(format!(
                "placement unsuccessful: {}",
                text
            )));
        }
        resp.order_id
            .ok_or_else(|| OrderApiError::Transient("placement response without orderID".into()))
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let body = serde_json::json!({ "orderID": order_id }).to_string();
        let (status, text) = self
            .send_authed(reqwest::Method::DELETE, "/order", body)
            .await?;
        if !status.is_success() {
            bail!("cancel {} returned {}: {}", order_id, status, text);
        }
        Ok(())
    }

    /// Cancel every resting order on one token.
    pub async fn cancel_token_orders(&self, token_id: &str) -> Result<()> {
        let body = serde_json::json!({ "asset_id": token_id }).to_string();
        let (status, text) = self
            .send_authed(reqwest::Method::DELETE, "/cancel-market-orders", body)
            .await?;
        if !status.is_success() {
            bail!("cancel-market-orders returned {}: {}", status, text);
        }
        Ok(())
    }

    pub async fn cancel_all(&self) -> Result<()> {
        let (status, text) = self
            .send_authed(reqwest::Method::DELETE, "/cancel-all", String::new())
            .await?;
        if !status.is_success() {
            bail!("cancel-all returned {}: {}", status, text);
        }
        Ok(())
    }

    /// Collateral balance and spender allowance as seen by the venue.
    pub async fn balance_allowance(&self) -> Result<(f64, f64)> {
        let path = "/balance-allowance?signature_type=2";
        let (status, text) = self
            .send_authed(reqwest::Method::GET, path, String::new())
            .await?;
        if !status.is_success() {
            bail!("balance-allowance returned {}: {}", status, text);
        }
        let value: serde_json::Value =
            serde_json::from_str(&text).context("parse balance-allowance")?;
        // Balances come back in USDC base units (6 decimals).
        let balance = parse_f64_field(&value, "balance").unwrap_or(0.0) / 1_000_000.0;
        let allowance = parse_f64_field(&value, "allowance").unwrap_or(0.0) / 1_000_000.0;
        Ok((balance, allowance))
    }
}

/// HTTP-status level classification for rejected placements.
fn classify_rejection(status: StatusCode, body: &str) -> OrderApiError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        OrderApiError::Transient(format!("{}: {}", status, body))
    } else {
        classify_message(body)
    }
}

/// Message-level classification: anything about the order's own shape is
/// permanent, the rest is worth a retry.
fn classify_message(msg: &str) -> OrderApiError {
    let lower = msg.to_ascii_lowercase();
    const PERMANENT_MARKERS: &[&str] = &[
        "invalid price",
        "tick",
        "min size",
        "minimum",
        "not tradable",
        "closed",
        "neg risk",
        "invalid amount",
    ];
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        OrderApiError::Permanent(msg.to_string())
    } else {
        OrderApiError::Transient(msg.to_string())
    }
}

fn parse_f64_field(value: &serde_json::Value, field: &str) -> Result<f64> {
    let v = value
        .get(field)
        .ok_or_else(|| anyhow!("missing field {}", field))?;
    match v {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("bad number in {}", field)),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("bad float string in {}", field)),
        _ => Err(anyhow!("unexpected type for {}", field)),
    }
}

fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
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
