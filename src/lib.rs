//! Event-driven automation engine.
//!
//! Collectors produce [`Event`]s, strategies turn events into [`Action`]s,
//! executors carry actions out. [`AutomationEngine`] wires the three
//! together and owns the run lifecycle.

pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod strategy;
pub mod wallet;

pub use collector::{Collector, EventStream, FunctionCollector, IntervalCollector, RpcCollector, WsCollector};
pub use config::{EngineConfig, WalletConfig};
pub use engine::{AutomationEngine, EngineState};
pub use error::EngineError;
pub use events::{Action, ActionKind, Event};
pub use executor::{Executor, FunctionExecutor, LoggerExecutor, TransactionExecutor};
pub use metrics::MetricsSnapshot;
pub use strategy::{FunctionStrategy, Strategy, ThresholdStrategy};
pub use wallet::{TransactionReceipt, WalletApi, WalletClient};
