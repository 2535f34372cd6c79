//! End-to-end runs of the engine with in-memory collectors, strategies and
//! executors.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::stream;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use defi_automation::collector::{from_events, EventStream, FunctionCollector};
use defi_automation::{
    Action, AutomationEngine, Collector, EngineConfig, EngineState, Event, Executor, FunctionExecutor,
    FunctionStrategy, IntervalCollector, ThresholdStrategy, TransactionExecutor, TransactionReceipt, WalletApi,
};

type Log = Arc<Mutex<Vec<String>>>;

fn engine() -> AutomationEngine {
    AutomationEngine::new(EngineConfig {
        name: "it".to_string(),
        stats_log_secs: 0,
    })
}

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Executor that records `<tag>:<action.data.message>`.
fn recorder(tag: &'static str, log: Log) -> impl Executor {
    FunctionExecutor::new(tag, move |action: Action| {
        let log = log.clone();
        async move {
            let msg = action.get("message").and_then(Value::as_str).unwrap_or("").to_string();
            log.lock().unwrap().push(format!("{}:{}", tag, msg));
            Ok(())
        }
    })
}

/// Strategy that turns every event into one log action carrying `data.id`.
fn echo() -> FunctionStrategy<impl Fn(Event) -> futures_util::future::Ready<Result<Vec<Action>>> + Send + Sync> {
    FunctionStrategy::new("echo", |event: Event| {
        let id = event.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
        futures_util::future::ready(Ok(vec![Action::from_json("log", json!({"message": id}))]))
    })
}

fn numbered(source: &str, n: usize) -> Vec<Event> {
    (1..=n)
        .map(|i| Event::from_json("e", json!({"id": format!("{}-{}", source, i)})))
        .collect()
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn events_from_one_collector_stay_in_order() {
    let log = new_log();
    let mut engine = engine();
    engine.add_collector(from_events("a", numbered("a", 30))).unwrap();
    engine.add_collector(from_events("b", numbered("b", 30))).unwrap();
    engine.add_strategy(echo()).unwrap();
    engine.add_executor(recorder("x", log.clone())).unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    let seen = entries(&log);
    assert_eq!(seen.len(), 60);
    for source in ["a", "b"] {
        let prefix = format!("x:{}-", source);
        let order: Vec<usize> = seen
            .iter()
            .filter_map(|s| s.strip_prefix(&prefix))
            .map(|n| n.parse().unwrap())
            .collect();
        assert_eq!(order, (1..=30).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn every_executor_sees_every_action_once_in_order() {
    let first = new_log();
    let second = new_log();
    let mut engine = engine();
    engine
        .add_collector(from_events("c", vec![Event::from_json("go", json!({}))]))
        .unwrap();
    engine
        .add_strategy(FunctionStrategy::new("pair", |_e: Event| async {
            Ok(vec![
                Action::from_json("log", json!({"message": "A1"})),
                Action::from_json("log", json!({"message": "A2"})),
            ])
        }))
        .unwrap();
    engine.add_executor(recorder("one", first.clone())).unwrap();
    engine.add_executor(recorder("two", second.clone())).unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    assert_eq!(entries(&first), vec!["one:A1", "one:A2"]);
    assert_eq!(entries(&second), vec!["two:A1", "two:A2"]);
}

#[tokio::test]
async fn no_strategies_means_no_actions() {
    let log = new_log();
    let mut engine = engine();
    engine.add_collector(from_events("c", numbered("c", 5))).unwrap();
    engine.add_executor(recorder("x", log.clone())).unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    assert!(entries(&log).is_empty());
    let m = engine.metrics();
    assert_eq!((m.events, m.actions, m.executions), (5, 0, 0));
}

#[tokio::test]
async fn executors_may_ignore_actions() {
    let mut engine = engine();
    engine.add_collector(from_events("c", numbered("c", 3))).unwrap();
    engine.add_strategy(echo()).unwrap();
    engine
        .add_executor(FunctionExecutor::new("noop", |_a: Action| async { Ok(()) }))
        .unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    let m = engine.metrics();
    assert_eq!((m.executions, m.failures()), (3, 0));
}

#[tokio::test]
async fn tick_events_become_log_lines() {
    let log = new_log();
    let ticks = vec![
        Event::from_json("tick", json!({"count": 1})),
        Event::from_json("tick", json!({"count": 2})),
    ];
    let mut engine = engine();
    engine.add_collector(from_events("ticker", ticks)).unwrap();
    engine
        .add_strategy(FunctionStrategy::new("tick_logger", |event: Event| async move {
            if !event.is("tick") {
                return Ok(Vec::new());
            }
            let count = event.get("count").cloned().unwrap_or(Value::Null);
            Ok(vec![Action::from_json("log", json!({"message": format!("tick {}", count)}))])
        }))
        .unwrap();
    let sink = log.clone();
    engine
        .add_executor(FunctionExecutor::new("logger", move |action: Action| {
            let sink = sink.clone();
            async move {
                if let Some(Value::String(msg)) = action.get("message") {
                    sink.lock().unwrap().push(msg.clone());
                }
                Ok(())
            }
        }))
        .unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    assert_eq!(entries(&log), vec!["tick 1", "tick 2"]);
}

#[derive(Default)]
struct RecordingWallet {
    calls: Mutex<Vec<Map<String, Value>>>,
}

#[async_trait]
impl WalletApi for RecordingWallet {
    async fn create_contract_call_transaction(&self, params: &Map<String, Value>) -> Result<TransactionReceipt> {
        self.calls.lock().unwrap().push(params.clone());
        Ok(TransactionReceipt {
            request_id: "req".to_string(),
            transaction_id: "tx".to_string(),
            status: "Submitted".to_string(),
        })
    }

    async fn create_transfer_transaction(&self, _params: &Map<String, Value>) -> Result<TransactionReceipt> {
        bail!("transfers are not used here")
    }
}

#[tokio::test]
async fn reward_over_threshold_submits_one_claim() {
    let params: Map<String, Value> = json!({
        "chain_id": "BASE_ETH",
        "source": {"source_type": "Org-Controlled", "wallet_id": "w-1", "address": "0xabc"},
        "destination": {"destination_type": "EVM_Contract", "address": "0xdef", "calldata": "0x4e71d92d"},
    })
    .as_object()
    .cloned()
    .unwrap();

    let wallet = Arc::new(RecordingWallet::default());
    let mut engine = engine();
    engine
        .add_collector(from_events(
            "rewarder",
            vec![Event::from_json("reward", json!({"amount": "2000000000000000000"}))],
        ))
        .unwrap();
    let claim = params.clone();
    engine
        .add_strategy(ThresholdStrategy::new(
            "claim",
            "reward",
            "amount",
            1_000_000_000_000_000_000,
            move |_e: &Event, _amount: u128| Ok(vec![Action::transaction(claim.clone())]),
        ))
        .unwrap();
    engine.add_executor(TransactionExecutor::new(wallet.clone())).unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    let calls = wallet.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], params);
}

#[tokio::test]
async fn reward_below_threshold_submits_nothing() {
    let wallet = Arc::new(RecordingWallet::default());
    let mut engine = engine();
    engine
        .add_collector(from_events(
            "rewarder",
            vec![Event::from_json("reward", json!({"amount": "999999999999999999"}))],
        ))
        .unwrap();
    engine
        .add_strategy(ThresholdStrategy::new(
            "claim",
            "reward",
            "amount",
            1_000_000_000_000_000_000,
            |_e: &Event, _amount: u128| Ok(vec![Action::transaction(Map::new())]),
        ))
        .unwrap();
    engine.add_executor(TransactionExecutor::new(wallet.clone())).unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    assert!(wallet.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failing_strategy_skips_only_that_event() {
    let log = new_log();
    let mut engine = engine();
    engine.add_collector(from_events("c", numbered("c", 3))).unwrap();
    engine
        .add_strategy(FunctionStrategy::new("picky", |event: Event| async move {
            let id = event.get("id").and_then(Value::as_str).unwrap_or("").to_string();
            if id == "c-2" {
                bail!("cannot handle {}", id);
            }
            Ok(vec![Action::from_json("log", json!({"message": id}))])
        }))
        .unwrap();
    engine.add_executor(recorder("x", log.clone())).unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    assert_eq!(entries(&log), vec!["x:c-1", "x:c-3"]);
    let m = engine.metrics();
    assert_eq!((m.events, m.strategy_failures), (3, 1));
}

#[tokio::test]
async fn failing_executor_does_not_stop_the_run() {
    let log = new_log();
    let mut engine = engine();
    engine.add_collector(from_events("c", numbered("c", 2))).unwrap();
    engine.add_strategy(echo()).unwrap();
    engine
        .add_executor(FunctionExecutor::new("broken", |_a: Action| async { bail!("remote down") }))
        .unwrap();
    engine.add_executor(recorder("ok", log.clone())).unwrap();

    engine.start().await.unwrap();
    engine.join().await.unwrap();
    engine.stop().await;

    assert_eq!(entries(&log), vec!["ok:c-1", "ok:c-2"]);
    assert_eq!(engine.metrics().executor_failures, 2);
}

struct Unreachable;

#[async_trait]
impl Collector for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn start(&self) -> Result<()> {
        bail!("connection refused")
    }

    async fn events(&self) -> Result<EventStream> {
        bail!("never started")
    }

    async fn stop(&self) {}
}

#[tokio::test]
async fn collector_that_fails_to_start_is_left_out() {
    let log = new_log();
    let mut engine = engine();
    engine.add_collector(Unreachable).unwrap();
    engine.add_collector(from_events("c", numbered("c", 2))).unwrap();
    engine.add_strategy(echo()).unwrap();
    engine.add_executor(recorder("x", log.clone())).unwrap();

    engine.start().await.unwrap();
    assert_eq!(engine.state(), EngineState::Running);
    engine.join().await.unwrap();
    engine.stop().await;

    assert_eq!(entries(&log), vec!["x:c-1", "x:c-2"]);
    assert_eq!(engine.metrics().collector_failures, 1);
}

#[tokio::test]
async fn silent_collector_does_not_hold_up_others() {
    let log = new_log();
    let mut engine = engine();
    engine
        .add_collector(FunctionCollector::new("silent", || stream::pending::<Event>()))
        .unwrap();
    engine.add_collector(from_events("c", numbered("c", 3))).unwrap();
    engine.add_strategy(echo()).unwrap();
    engine.add_executor(recorder("x", log.clone())).unwrap();

    engine.start().await.unwrap();
    wait_for(|| entries(&log).len() == 3).await;
    engine.stop().await;

    assert_eq!(entries(&log), vec!["x:c-1", "x:c-2", "x:c-3"]);
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn nothing_is_delivered_after_stop() {
    let log = new_log();
    let counter = Arc::new(AtomicU64::new(0));
    let mut engine = engine();
    engine
        .add_collector(IntervalCollector::new("fast", Duration::from_millis(2), move || {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            async move { Ok(vec![Event::from_json("e", json!({"id": n.to_string()}))]) }
        }))
        .unwrap();
    engine.add_strategy(echo()).unwrap();
    engine.add_executor(recorder("x", log.clone())).unwrap();

    engine.start().await.unwrap();
    wait_for(|| entries(&log).len() >= 3).await;
    engine.stop().await;
    let at_stop = entries(&log).len();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(entries(&log).len(), at_stop);
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn stop_is_idempotent_and_join_returns_after_it() {
    let mut engine = engine();
    engine
        .add_collector(FunctionCollector::new("silent", || stream::pending::<Event>()))
        .unwrap();
    engine.start().await.unwrap();

    let (_, _, joined) = tokio::join!(engine.stop(), engine.stop(), engine.join());
    joined.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Stopped);
}

/// Executor that signals once it has begun, then takes `work` before
/// recording the action.
fn slow_recorder(log: Log, began: Arc<Notify>, work: Duration) -> impl Executor {
    FunctionExecutor::new("slow", move |_action: Action| {
        let log = log.clone();
        let began = began.clone();
        async move {
            began.notify_one();
            tokio::time::sleep(work).await;
            log.lock().unwrap().push("done".to_string());
            Ok(())
        }
    })
}

#[tokio::test]
async fn stop_lets_running_actions_finish() {
    let log = new_log();
    let began = Arc::new(Notify::new());
    let mut engine = engine();
    engine.add_collector(from_events("c", numbered("c", 1))).unwrap();
    engine.add_strategy(echo()).unwrap();
    engine
        .add_executor(slow_recorder(log.clone(), began.clone(), Duration::from_millis(100)))
        .unwrap();

    engine.start().await.unwrap();
    began.notified().await;
    engine.stop().await;

    assert_eq!(entries(&log), vec!["done"]);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.metrics().executions, 1);
}

#[tokio::test]
async fn abandoned_stop_can_be_finished_later() {
    let log = new_log();
    let began = Arc::new(Notify::new());
    let mut engine = engine();
    engine.add_collector(from_events("c", numbered("c", 1))).unwrap();
    engine.add_strategy(echo()).unwrap();
    engine
        .add_executor(slow_recorder(log.clone(), began.clone(), Duration::from_millis(300)))
        .unwrap();

    engine.start().await.unwrap();
    began.notified().await;
    let first = tokio::time::timeout(Duration::from_millis(50), engine.stop()).await;
    assert!(first.is_err(), "first stop should still be draining");
    assert_eq!(engine.state(), EngineState::Stopping);

    tokio::time::timeout(Duration::from_secs(2), engine.stop())
        .await
        .expect("second stop must finish the teardown");
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(entries(&log), vec!["done"]);

    tokio::time::timeout(Duration::from_secs(1), engine.stop())
        .await
        .expect("stop on a stopped engine returns at once");
    engine.join().await.unwrap();
}

/// Collector whose `start` takes `delay`; records when it starts and stops.
struct SlowStart {
    delay: Duration,
    log: Log,
}

#[async_trait]
impl Collector for SlowStart {
    fn name(&self) -> &str {
        "slow-start"
    }

    async fn start(&self) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push("started".to_string());
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        Ok(Box::pin(stream::pending::<Event>()))
    }

    async fn stop(&self) {
        self.log.lock().unwrap().push("stopped".to_string());
    }
}

#[tokio::test]
async fn stop_during_start_waits_for_every_lane() {
    let log = new_log();
    let mut engine = engine();
    engine
        .add_collector(SlowStart {
            delay: Duration::from_millis(100),
            log: log.clone(),
        })
        .unwrap();

    let (started, ()) = tokio::join!(engine.start(), async {
        wait_for(|| engine.state() == EngineState::Running).await;
        engine.stop().await;
    });
    started.unwrap();

    assert_eq!(entries(&log), vec!["started", "stopped"]);
    assert_eq!(engine.state(), EngineState::Stopped);
    engine.join().await.unwrap();
}
