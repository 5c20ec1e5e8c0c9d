//! JSON-RPC ledger client over HTTP

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AccountObject, LedgerClient, LedgerTransaction, ObjectType, SubmitOutcome};
use crate::{error::EscrowError, EscrowResult};

/// Result prefixes for transactions that can never make it into a ledger
const REJECTED_PREFIXES: [&str; 3] = ["tem", "tef", "tel"];

/// Configuration for the ledger client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerClientConfig {
    /// JSON-RPC endpoint of a ledger server
    pub endpoint: String,
    /// Upper bound for a single request
    pub request_timeout_secs: u64,
    /// Delay between `tx` polls while waiting for validation
    pub submit_poll_interval_ms: u64,
    /// Give up waiting for validation after this long
    pub submit_max_wait_secs: u64,
}

impl Default for LedgerClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://s.altnet.rippletest.net:51234".to_string(),
            request_timeout_secs: 10,
            submit_poll_interval_ms: 1_000,
            submit_max_wait_secs: 30,
        }
    }
}

/// Ledger client speaking the server's JSON-RPC API
pub struct JsonRpcLedgerClient {
    config: LedgerClientConfig,
    http: Client,
    connected: AtomicBool,
}

impl JsonRpcLedgerClient {
    pub fn new(config: LedgerClientConfig) -> EscrowResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EscrowError::config(format!("ledger http client: {e}")))?;

        Ok(Self {
            config,
            http,
            connected: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LedgerClientConfig {
        &self.config
    }

    async fn call(&self, method: &str, params: Value) -> EscrowResult<Value> {
        let payload = json!({
            "method": method,
            "params": [params],
        });

        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(method, e))?;

        let body: RpcResponse = response.json().await.map_err(|e| transport_error(method, e))?;
        let result = body
            .result
            .ok_or_else(|| EscrowError::ledger_io(format!("{method}: no result in response")))?;

        if result.get("status").and_then(Value::as_str) == Some("error") {
            let code = result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let message = result
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or(code);

            return Err(match code {
                "txnNotFound" | "actNotFound" | "entryNotFound" => {
                    EscrowError::not_found(format!("{method}: {message}"))
                }
                "invalidParams" | "actMalformed" | "invalidTransaction" => {
                    EscrowError::invalid_parameter(format!("{method}: {message}"))
                }
                _ => EscrowError::ledger(format!("{method}: {message}")),
            });
        }

        Ok(result)
    }

    fn ensure_connected(&self) -> EscrowResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EscrowError::ledger_io(
                "ledger client not connected, call connect() first",
            ))
        }
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn connect(&self) -> EscrowResult<()> {
        if self.is_connected() {
            warn!("Ledger client already connected");
            return Ok(());
        }

        let info = self.call("server_info", json!({})).await?;
        let state = info
            .pointer("/info/server_state")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to ledger at {} (server state: {})", self.config.endpoint, state);
        Ok(())
    }

    async fn disconnect(&self) -> EscrowResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Disconnected from ledger at {}", self.config.endpoint);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn submit_and_wait(&self, signed_tx_blob: &str) -> EscrowResult<SubmitOutcome> {
        self.ensure_connected()?;

        let submitted = self.call("submit", json!({ "tx_blob": signed_tx_blob })).await?;
        let engine_result = submitted
            .get("engine_result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let hash = submitted
            .pointer("/tx_json/hash")
            .and_then(Value::as_str)
            .ok_or_else(|| EscrowError::ledger_io("submit response without transaction hash"))?
            .to_string();

        if REJECTED_PREFIXES.iter().any(|p| engine_result.starts_with(p)) {
            return Err(EscrowError::ledger(format!(
                "transaction {hash} rejected: {engine_result}"
            )));
        }

        info!("Submitted transaction {} (preliminary result {})", hash, engine_result);

        let poll = Duration::from_millis(self.config.submit_poll_interval_ms);
        let deadline = Instant::now() + Duration::from_secs(self.config.submit_max_wait_secs);

        loop {
            match self.get_transaction(&hash).await {
                Ok(tx) if tx.validated => {
                    let result_code = tx.result_code.unwrap_or(engine_result);
                    info!("Transaction {} validated with {}", hash, result_code);
                    return Ok(SubmitOutcome {
                        hash,
                        result_code,
                        validated: true,
                        ledger_index: tx.ledger_index,
                    });
                }
                Ok(_) | Err(EscrowError::NotFound(_)) => {
                    debug!("Transaction {} not yet validated", hash);
                }
                Err(e) => return Err(e),
            }

            if Instant::now() + poll > deadline {
                return Err(EscrowError::timeout(format!(
                    "transaction {hash} not validated within {}s",
                    self.config.submit_max_wait_secs
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn get_transaction(&self, hash: &str) -> EscrowResult<LedgerTransaction> {
        self.ensure_connected()?;
        let result = self
            .call("tx", json!({ "transaction": hash, "binary": false }))
            .await?;
        LedgerTransaction::from_json(&result)
    }

    async fn get_account_objects(
        &self,
        address: &str,
        object_type: ObjectType,
    ) -> EscrowResult<Vec<AccountObject>> {
        self.ensure_connected()?;

        let mut objects = Vec::new();
        let mut marker: Option<Value> = None;

        loop {
            let mut params = json!({
                "account": address,
                "type": object_type.as_str(),
                "ledger_index": "validated",
            });
            if let Some(m) = marker.take() {
                params["marker"] = m;
            }

            let result = self.call("account_objects", params).await?;
            if let Some(page) = result.get("account_objects").and_then(Value::as_array) {
                for raw in page {
                    objects.push(AccountObject::from_json(raw.clone())?);
                }
            }

            match result.get("marker") {
                Some(m) if !m.is_null() => marker = Some(m.clone()),
                _ => break,
            }
        }

        debug!(
            "Found {} {} objects for {}",
            objects.len(),
            object_type.as_str(),
            address
        );
        Ok(objects)
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
}

fn transport_error(method: &str, e: reqwest::Error) -> EscrowError {
    if e.is_timeout() {
        EscrowError::timeout(format!("{method}: {e}"))
    } else {
        EscrowError::ledger_io(format!("{method}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_require_connect() {
        let client = JsonRpcLedgerClient::new(LedgerClientConfig::default()).unwrap();
        assert!(!client.is_connected());

        let err = client.get_transaction("ABC").await.unwrap_err();
        assert!(matches!(err, EscrowError::LedgerIo(_)));
        assert!(err.is_transient());

        let err = client
            .get_account_objects("rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh", ObjectType::Escrow)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::LedgerIo(_)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = JsonRpcLedgerClient::new(LedgerClientConfig::default()).unwrap();
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
    }

    #[test]
    fn test_config_defaults() {
        let config = LedgerClientConfig::default();
        assert_eq!(config.request_timeout_secs, 10);
        assert!(config.submit_max_wait_secs * 1_000 > config.submit_poll_interval_ms);
    }
}
