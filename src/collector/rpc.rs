use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{poll_stream, Collector, EventStream, StopSignal};
use crate::events::Event;
use crate::logging::{self, obj, v_str, Domain};

static RPC_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// One JSON-RPC 2.0 request/response round trip.
pub async fn rpc_call(client: &Client, url: &Url, method: &str, params: &Value) -> Result<Value> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": RPC_ID.fetch_add(1, Ordering::Relaxed),
        "method": method,
        "params": params,
    });
    let resp = client.post(url.clone()).json(&body).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("rpc {} http {}: {}", method, status, text));
    }
    let parsed: RpcResponse = resp.json().await.context("rpc response decode")?;
    if let Some(err) = parsed.error {
        return Err(anyhow!("rpc {} error {}: {}", method, err.code, err.message));
    }
    parsed.result.ok_or_else(|| anyhow!("rpc {} returned no result", method))
}

/// Reads the 32-byte ABI word at `index` from an `eth_call` hex result.
/// Returns `None` when the word is missing or does not fit in a u128.
pub fn abi_word(result: &str, index: usize) -> Option<u128> {
    let hex = result.strip_prefix("0x").unwrap_or(result);
    let start = index.checked_mul(64)?;
    let word = hex.get(start..start.checked_add(64)?)?;
    let (high, low) = word.split_at(32);
    if high.chars().any(|c| c != '0') {
        return None;
    }
    u128::from_str_radix(low, 16).ok()
}

struct RpcTarget {
    client: Client,
    url: Url,
    method: String,
    params: Value,
    event_type: String,
}

impl RpcTarget {
    async fn poll(&self) -> Result<Vec<Event>> {
        let result = rpc_call(&self.client, &self.url, &self.method, &self.params).await?;
        let mut data = Map::new();
        data.insert("result".to_string(), result);
        Ok(vec![Event::new(self.event_type.clone(), data)])
    }
}

/// Polls a JSON-RPC endpoint (e.g. an `eth_call` against a node) and emits
/// each result as an event `{type: event_type, data: {"result": ...}}`.
pub struct RpcCollector {
    name: String,
    period: Duration,
    target: Arc<RpcTarget>,
    started: AtomicBool,
    stop: StopSignal,
}

impl RpcCollector {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        method: impl Into<String>,
        params: Value,
        event_type: impl Into<String>,
        period: Duration,
    ) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid rpc url {}", url))?;
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            name: name.into(),
            period,
            target: Arc::new(RpcTarget {
                client,
                url,
                method: method.into(),
                params,
                event_type: event_type.into(),
            }),
            started: AtomicBool::new(false),
            stop: StopSignal::new(),
        })
    }
}

#[async_trait]
impl Collector for RpcCollector {
    fn name(&self) -> &str {
        &self.name
    }

    /// Issues the configured call once so an unreachable node fails the
    /// start instead of the first poll.
    async fn start(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.target
            .poll()
            .await
            .with_context(|| format!("rpc collector {} initial call", self.name))?;
        self.started.store(true, Ordering::SeqCst);
        logging::info(
            Domain::Collector,
            "collector.rpc_ready",
            obj(&[
                ("collector", v_str(&self.name)),
                ("method", v_str(&self.target.method)),
            ]),
        );
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        let target = self.target.clone();
        let poll = Arc::new(move || {
            let target = target.clone();
            async move { target.poll().await }
        });
        Ok(poll_stream(self.name.clone(), self.period, poll, &self.stop))
    }

    async fn stop(&self) {
        self.stop.stop();
    }
}
