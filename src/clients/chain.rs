//! On-chain reads and the host-wallet submission boundary.
//!
//! Reads go straight over JSON-RPC `eth_call` with hand-encoded calldata;
//! the handful of selectors this engine needs does not justify an ABI
//! machinery dependency. Writes are forwarded to an operator-controlled
//! multi-owner wallet as one atomic batch; key custody stays with the
//! host signer.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use num_bigint::BigUint;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ChainConfig;

/// Function selectors (first four bytes of the keccak of the signature).
pub mod selectors {
    /// balanceOf(address)
    pub const ERC20_BALANCE_OF: &str = "70a08231";
    /// allowance(address,address)
    pub const ERC20_ALLOWANCE: &str = "dd62ed3e";
    /// approve(address,uint256)
    pub const ERC20_APPROVE: &str = "095ea7b3";
    /// balanceOf(address,uint256)
    pub const ERC1155_BALANCE_OF: &str = "00fdd58e";
    /// splitPosition(address,bytes32,bytes32,uint256[],uint256)
    pub const SPLIT_POSITION: &str = "72ce4275";
    /// mergePositions(address,bytes32,bytes32,uint256[],uint256)
    pub const MERGE_POSITIONS: &str = "9e7212ad";
}

/// Collateral uses 6 decimals; outcome tokens mirror it.
pub const COLLATERAL_DECIMALS: u32 = 6;
/// The gas asset uses 18.
pub const NATIVE_DECIMALS: u32 = 18;

/// One call inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletCall {
    pub to: String,
    /// ABI-encoded calldata, hex without the 0x prefix.
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct BatchReceipt {
    pub tx_hash: String,
    pub success: bool,
    pub reason: Option<String>,
}

/// The multi-owner wallet capable of executing several calls atomically.
/// Either every call in the batch lands or none does.
#[async_trait]
pub trait BatchWallet: Send + Sync {
    async fn submit_batch(&self, calls: Vec<WalletCall>) -> Result<BatchReceipt>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<serde_json::Value>,
}

/// Thin JSON-RPC reader.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            url: url.into(),
        }
    }

    pub async fn eth_call(&self, to: &str, data: &str) -> Result<String> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{"to": to, "data": format!("0x{}", data)}, "latest"],
            "id": 1
        });
        self.send(payload).await
    }

    pub async fn eth_get_balance(&self, address: &str) -> Result<String> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_getBalance",
            "params": [address, "latest"],
            "id": 1
        });
        self.send(payload).await
    }

    async fn send(&self, payload: serde_json::Value) -> Result<String> {
        let response: JsonRpcResponse = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("RPC request failed")?
            .json()
            .await
            .context("failed to parse RPC response")?;

        if let Some(err) = response.error {
            bail!("RPC error: {:?}", err);
        }
        response.result.ok_or_else(|| anyhow!("RPC result missing"))
    }
}

/// Balance and allowance reads plus calldata builders, bound to the
/// session's contract addresses.
pub struct ChainClient {
    rpc: RpcClient,
    cfg: ChainConfig,
}

impl ChainClient {
    pub fn new(cfg: ChainConfig) -> Self {
        Self {
            rpc: RpcClient::new(cfg.rpc_url.clone()),
            cfg,
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.cfg
    }

    pub async fn collateral_balance(&self, owner: &str) -> Result<f64> {
        let data = format!("{}{}", selectors::ERC20_BALANCE_OF, encode_address(owner)?);
        let result = self.rpc.eth_call(&self.cfg.collateral_address, &data).await?;
        Ok(from_base_units(&decode_u256(&result)?, COLLATERAL_DECIMALS))
    }

    pub async fn collateral_allowance(&self, owner: &str, spender: &str) -> Result<BigUint> {
        let data = format!(
            "{}{}{}",
            selectors::ERC20_ALLOWANCE,
            encode_address(owner)?,
            encode_address(spender)?
        );
        let result = self.rpc.eth_call(&self.cfg.collateral_address, &data).await?;
        decode_u256(&result)
    }

    /// Outcome-token balance. Token ids are the venue's decimal strings.
    pub async fn outcome_balance(&self, owner: &str, token_id: &str) -> Result<f64> {
        let id = BigUint::parse_bytes(token_id.as_bytes(), 10)
            .ok_or_else(|| anyhow!("malformed token id {}", token_id))?;
        let data = format!(
            "{}{}{}",
            selectors::ERC1155_BALANCE_OF,
            encode_address(owner)?,
            encode_u256(&id)
        );
        let result = self
            .rpc
            .eth_call(&self.cfg.conditional_tokens_address, &data)
            .await?;
        Ok(from_base_units(&decode_u256(&result)?, COLLATERAL_DECIMALS))
    }

    pub async fn native_balance(&self, owner: &str) -> Result<f64> {
        let result = self.rpc.eth_get_balance(owner).await?;
        Ok(from_base_units(&decode_u256(&result)?, NATIVE_DECIMALS))
    }

    /// approve(conditional_tokens, amount) on the collateral token.
    pub fn approval_call(&self, amount: &BigUint) -> Result<WalletCall> {
        let data = format!(
            "{}{}{}",
            selectors::ERC20_APPROVE,
            encode_address(&self.cfg.conditional_tokens_address)?,
            encode_u256(amount)
        );
        Ok(WalletCall {
            to: self.cfg.collateral_address.clone(),
            data,
        })
    }

    /// splitPosition with the binary partition [1, 2].
    pub fn split_call(&self, condition_id: &str, amount: &BigUint) -> Result<WalletCall> {
        Ok(WalletCall {
            to: self.cfg.conditional_tokens_address.clone(),
            data: encode_split_merge(
                selectors::SPLIT_POSITION,
                &self.cfg.collateral_address,
                condition_id,
                amount,
            )?,
        })
    }

    /// mergePositions with the binary partition [1, 2].
    pub fn merge_call(&self, condition_id: &str, amount: &BigUint) -> Result<WalletCall> {
        Ok(WalletCall {
            to: self.cfg.conditional_tokens_address.clone(),
            data: encode_split_merge(
                selectors::MERGE_POSITIONS,
                &self.cfg.collateral_address,
                condition_id,
                amount,
            )?,
        })
    }
}

/// Forwards batches to the host signer service, which holds the keys and
/// executes the calls through the multi-owner wallet in one transaction.
pub struct HttpSignerWallet {
    client: reqwest::Client,
    url: String,
    safe_address: String,
}

impl HttpSignerWallet {
    pub fn new(url: impl Into<String>, safe_address: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            url: url.into(),
            safe_address: safe_address.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SIGNER_URL").ok()?;
        let safe = std::env::var("SAFE_ADDRESS").ok()?;
        if url.is_empty() || safe.is_empty() {
            return None;
        }
        Some(Self::new(url, safe))
    }
}

#[derive(Debug, Deserialize)]
struct SignerResponse {
    #[serde(rename = "txHash", default)]
    tx_hash: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl BatchWallet for HttpSignerWallet {
    async fn submit_batch(&self, calls: Vec<WalletCall>) -> Result<BatchReceipt> {
        let payload = serde_json::json!({
            "safe": self.safe_address,
            "transactions": calls
                .iter()
                .map(|c| serde_json::json!({
                    "to": c.to,
                    "data": format!("0x{}", c.data),
                    "value": "0",
                }))
                .collect::<Vec<_>>(),
        });

        debug!(calls = calls.len(), "submitting wallet batch");
        let response: SignerResponse = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("signer request failed")?
            .error_for_status()
            .context("signer status")?
            .json()
            .await
            .context("signer response parse")?;

        let receipt = BatchReceipt {
            tx_hash: response.tx_hash.unwrap_or_default(),
            success: response.success,
            reason: response.reason,
        };
        if receipt.success {
            info!(tx_hash = %receipt.tx_hash, "wallet batch mined");
        }
        Ok(receipt)
    }
}

// ----------------------------------------------------------------------
// ABI encoding helpers
// ----------------------------------------------------------------------

pub fn encode_address(address: &str) -> Result<String> {
    let stripped = address.trim_start_matches("0x");
    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("malformed address {}", address);
    }
    Ok(format!("{:0>64}", stripped.to_ascii_lowercase()))
}

pub fn encode_bytes32(value: &str) -> Result<String> {
    let stripped = value.trim_start_matches("0x");
    if stripped.len() != 64 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("malformed bytes32 {}", value);
    }
    Ok(stripped.to_ascii_lowercase())
}

pub fn encode_u256(value: &BigUint) -> String {
    format!("{:0>64}", value.to_str_radix(16))
}

/// Shared layout of splitPosition and mergePositions:
/// (collateral, parentCollection = 0, conditionId, partition = [1, 2], amount).
/// The partition is the only dynamic argument; its data sits after the
/// five head words.
fn encode_split_merge(
    selector: &str,
    collateral: &str,
    condition_id: &str,
    amount: &BigUint,
) -> Result<String> {
    let mut data = String::with_capacity(8 + 64 * 8);
    data.push_str(selector);
    data.push_str(&encode_address(collateral)?);
    data.push_str(&"0".repeat(64)); // parentCollectionId
    data.push_str(&encode_bytes32(condition_id)?);
    data.push_str(&encode_u256(&BigUint::from(0xa0u32))); // partition offset
    data.push_str(&encode_u256(amount));
    data.push_str(&encode_u256(&BigUint::from(2u32))); // partition length
    data.push_str(&encode_u256(&BigUint::from(1u32)));
    data.push_str(&encode_u256(&BigUint::from(2u32)));
    Ok(data)
}

pub fn decode_u256(result: &str) -> Result<BigUint> {
    let stripped = result.trim_start_matches("0x");
    if stripped.is_empty() {
        return Ok(BigUint::from(0u32));
    }
    BigUint::parse_bytes(stripped.as_bytes(), 16)
        .ok_or_else(|| anyhow!("malformed uint256 result {}", result))
}

pub fn to_base_units(amount: f64, decimals: u32) -> BigUint {
    let scaled = (amount * 10f64.powi(decimals as i32)).round();
    if scaled <= 0.0 {
        return BigUint::from(0u32);
    }
    BigUint::from(scaled as u128)
}

pub fn from_base_units(value: &BigUint, decimals: u32) -> f64 {
    // Balances in this system are far below the f64 integer limit once
    // scaled down; convert through a decimal string to stay exact on the
    // integer part.
    let s = value.to_str_radix(10);
    s.parse::<f64>().unwrap_or(0.0) / 10f64.powi(decimals as i32)
}

/// 2^256 - 1, the unlimited approval amount.
pub fn max_u256() -> BigUint {
    (BigUint::from(1u32) << 256u32) - BigUint::from(1u32)
}
