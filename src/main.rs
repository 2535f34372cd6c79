//! Demo runner.
//!
//! `DEMO=tick` (default): a tick event every second, logged by the logger
//! executor. `DEMO=reward`: polls a rewarder contract over JSON-RPC and, once
//! the pending reward reaches `THRESHOLD`, submits a claim through the wallet
//! API.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use defi_automation::collector::{abi_word, rpc_call, IntervalCollector};
use defi_automation::logging::{self, obj, v_str, Domain};
use defi_automation::{
    Action, AutomationEngine, EngineConfig, Event, FunctionStrategy, LoggerExecutor, ThresholdStrategy,
    TransactionExecutor, WalletClient, WalletConfig,
};

fn env_req(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("{} must be set", key))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn tick_demo(engine: &mut AutomationEngine) -> Result<()> {
    let counter = Arc::new(AtomicU64::new(0));
    engine.add_collector(IntervalCollector::new("ticker", Duration::from_secs(1), move || {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        async move {
            Ok::<_, anyhow::Error>(vec![Event::from_json(
                "tick",
                json!({"count": n, "timestamp": Utc::now().to_rfc3339()}),
            )])
        }
    }))?;
    engine.add_strategy(FunctionStrategy::new("tick_logger", |event: Event| async move {
        if !event.is("tick") {
            return Ok(Vec::new());
        }
        let count = event.get("count").cloned().unwrap_or(Value::Null);
        Ok(vec![Action::from_json("log", json!({"message": format!("tick {}", count)}))])
    }))?;
    engine.add_executor(LoggerExecutor)?;
    Ok(())
}

fn reward_demo(engine: &mut AutomationEngine) -> Result<()> {
    let rpc_url = Url::parse(&env_req("RPC_URL")?).context("RPC_URL")?;
    let rewarder = env_req("REWARDER_ADDRESS")?;
    let calldata = env_req("CALLDATA")?;
    let word: usize = env_or("REWARD_WORD_INDEX", "5").parse().context("REWARD_WORD_INDEX")?;
    let threshold: u128 = env_or("THRESHOLD", "1000000000000000000")
        .parse()
        .context("THRESHOLD")?;
    let period = Duration::from_secs(env_or("POLL_SECS", "60").parse().context("POLL_SECS")?);

    let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
    let params = json!([{"to": rewarder, "data": calldata}, "latest"]);
    engine.add_collector(IntervalCollector::new("rewarder", period, move || {
        let client = client.clone();
        let url = rpc_url.clone();
        let params = params.clone();
        async move {
            let result = rpc_call(&client, &url, "eth_call", &params).await?;
            let hex = result.as_str().ok_or_else(|| anyhow!("eth_call returned {}", result))?;
            let amount = abi_word(hex, word).ok_or_else(|| anyhow!("no reward word {} in {}", word, hex))?;
            Ok::<_, anyhow::Error>(vec![Event::from_json("reward", json!({"amount": amount.to_string()}))])
        }
    }))?;

    let mut claim = Map::new();
    claim.insert("chain_id".to_string(), v_str(&env_or("CHAIN_ID", "BASE_ETH")));
    claim.insert(
        "source".to_string(),
        json!({
            "source_type": "Org-Controlled",
            "wallet_id": env_req("WALLET_ID")?,
            "address": env_req("WALLET_ADDRESS")?,
        }),
    );
    claim.insert(
        "destination".to_string(),
        json!({
            "destination_type": "EVM_Contract",
            "address": env_req("CLAIM_CONTRACT")?,
            "calldata": env_req("CLAIM_CALLDATA")?,
        }),
    );
    engine.add_strategy(ThresholdStrategy::new(
        "reward_claim",
        "reward",
        "amount",
        threshold,
        move |_event: &Event, amount: u128| {
            logging::info(
                Domain::Strategy,
                "strategy.claim",
                obj(&[("amount", v_str(&amount.to_string()))]),
            );
            Ok(vec![Action::transaction(claim.clone())])
        },
    ))?;

    let wallet = WalletClient::new(WalletConfig::from_env())?;
    engine.add_executor(TransactionExecutor::new(Arc::new(wallet)))?;
    engine.add_executor(LoggerExecutor)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let demo = env_or("DEMO", "tick");
    let mut engine = AutomationEngine::new(EngineConfig::from_env());
    match demo.as_str() {
        "tick" => tick_demo(&mut engine)?,
        "reward" => reward_demo(&mut engine)?,
        other => return Err(anyhow!("unknown DEMO {:?} (tick | reward)", other)),
    }

    logging::info(Domain::System, "demo.start", obj(&[("demo", v_str(&demo))]));
    engine.start().await?;
    tokio::select! {
        res = engine.join() => res?,
        _ = tokio::signal::ctrl_c() => {
            logging::info(Domain::System, "demo.interrupted", obj(&[]));
        }
    }
    engine.stop().await;
    Ok(())
}
