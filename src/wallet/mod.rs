//! Client for the remote wallet/transaction API.
//!
//! Executors receive the client as an explicit `Arc<dyn WalletApi>`; there
//! is no process-wide client. Retries for transient failures happen here,
//! not in the engine.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::WalletConfig;
use crate::logging::{self, obj, ts_epoch_ms, v_str, Domain};
use crate::retry::{is_retryable_http_error, is_retryable_network_error, retry_async, Permanent};

pub mod signing;

pub use signing::{Ed25519Signer, RequestSigner};

pub const CONTRACT_CALL_PATH: &str = "transactions/contract_call";
pub const TRANSFER_PATH: &str = "transactions/transfer";

/// What the API hands back for a created transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub status: String,
}

#[async_trait]
pub trait WalletApi: Send + Sync {
    async fn create_contract_call_transaction(&self, params: &Map<String, Value>) -> Result<TransactionReceipt>;

    async fn create_transfer_transaction(&self, params: &Map<String, Value>) -> Result<TransactionReceipt>;
}

pub struct WalletClient {
    cfg: WalletConfig,
    http: Client,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl WalletClient {
    pub fn new(cfg: WalletConfig) -> Result<Self> {
        let http = Client::builder().timeout(cfg.timeout).build()?;
        let signer = match &cfg.api_secret {
            Some(secret) => Some(Arc::new(Ed25519Signer::from_hex(secret)?) as Arc<dyn RequestSigner>),
            None => None,
        };
        Ok(Self { cfg, http, signer })
    }

    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    async fn submit(&self, path: &str, params: &Map<String, Value>) -> Result<TransactionReceipt> {
        let url = self.cfg.endpoint(path)?;
        let mut params = params.clone();
        let request_id = ensure_request_id(&mut params);
        let body = Value::Object(params).to_string();

        logging::info(
            Domain::Wallet,
            "wallet.submit",
            obj(&[
                ("path", v_str(url.path())),
                ("request_id", v_str(&request_id)),
                ("body_sha256", v_str(&signing::body_digest(&body))),
            ]),
        );

        let receipt = retry_async(&self.cfg.retry, path, || {
            let url = url.clone();
            let body = body.clone();
            async move {
                let req = self.authorize(
                    self.http
                        .request(Method::POST, url.clone())
                        .header("content-type", "application/json"),
                    &url,
                    &body,
                )?;
                let resp = match req.body(body).send().await {
                    Ok(resp) => resp,
                    Err(e) if is_retryable_network_error(&e) => return Err(e.into()),
                    Err(e) => return Err(Permanent(e.to_string()).into()),
                };
                let status = resp.status();
                if status.is_success() {
                    // The transaction may already exist; a retry could submit it twice.
                    let text = resp.text().await.map_err(|e| {
                        Permanent(format!("wallet api {} {}: unreadable response: {}", url.path(), status, e))
                    })?;
                    return Ok(parse_receipt(&text));
                }
                let text = resp.text().await.unwrap_or_default();
                let msg = format!("wallet api {} {}: {}", url.path(), status, text);
                if is_retryable_http_error(status.as_u16()) {
                    Err(anyhow!(msg))
                } else {
                    Err(Permanent(msg).into())
                }
            }
        })
        .await?;

        let receipt = TransactionReceipt {
            request_id: if receipt.request_id.is_empty() { request_id } else { receipt.request_id },
            ..receipt
        };
        logging::info(
            Domain::Wallet,
            "wallet.submitted",
            obj(&[
                ("request_id", v_str(&receipt.request_id)),
                ("transaction_id", v_str(&receipt.transaction_id)),
                ("status", v_str(&receipt.status)),
            ]),
        );
        Ok(receipt)
    }

    fn authorize(
        &self,
        req: reqwest::RequestBuilder,
        url: &url::Url,
        body: &str,
    ) -> Result<reqwest::RequestBuilder> {
        if let Some(token) = &self.cfg.access_token {
            return Ok(req.bearer_auth(token));
        }
        if let Some(signer) = &self.signer {
            let nonce = ts_epoch_ms().to_string();
            let query = url.query().unwrap_or("");
            let signature = signer.sign("POST", url.path(), &nonce, query, body)?;
            return Ok(req
                .header("Biz-Api-Key", signer.api_key())
                .header("Biz-Api-Nonce", nonce)
                .header("Biz-Api-Signature", signature));
        }
        match &self.cfg.api_key {
            Some(key) => Ok(req.header("Biz-Api-Key", key)),
            None => Ok(req),
        }
    }
}

#[async_trait]
impl WalletApi for WalletClient {
    async fn create_contract_call_transaction(&self, params: &Map<String, Value>) -> Result<TransactionReceipt> {
        self.submit(CONTRACT_CALL_PATH, params).await
    }

    async fn create_transfer_transaction(&self, params: &Map<String, Value>) -> Result<TransactionReceipt> {
        self.submit(TRANSFER_PATH, params).await
    }
}

/// Fills in a UUIDv4 `request_id` when the caller did not supply one.
fn ensure_request_id(params: &mut Map<String, Value>) -> String {
    match params.get("request_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            params.insert("request_id".to_string(), Value::String(id.clone()));
            id
        }
    }
}

// Responses are either the receipt itself or wrapped as {"data": {...}}.
fn parse_receipt(text: &str) -> TransactionReceipt {
    let value: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    if let Some(data @ Value::Object(_)) = value.get("data") {
        return serde_json::from_value(data.clone()).unwrap_or_default();
    }
    serde_json::from_value(value).unwrap_or_default()
}
