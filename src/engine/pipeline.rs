//! Per-event dispatch: every strategy, then every action to every executor.

use anyhow::Result;
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::events::{Action, Event};
use crate::executor::Executor;
use crate::logging::{self, obj, v_str, v_u64, Domain};
use crate::metrics::RunMetrics;
use crate::strategy::Strategy;

/// Read-only view of the registries shared by all collector lanes.
pub(crate) struct Pipeline {
    pub strategies: Vec<Arc<dyn Strategy>>,
    pub executors: Vec<Arc<dyn Executor>>,
    pub metrics: Arc<RunMetrics>,
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `fut`, turning a panic into an error string.
async fn isolated<T, F>(fut: F) -> Result<T, String>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload))),
    }
}

impl Pipeline {
    /// Handles one event to completion. Never fails: every per-item failure
    /// is logged and counted here.
    pub async fn handle(&self, source: &str, event: Event) {
        self.metrics.event_received();
        logging::debug(
            Domain::Engine,
            "engine.event",
            obj(&[("collector", v_str(source)), ("event_type", v_str(&event.kind))]),
        );

        let actions = self.decide(source, &event).await;
        for action in &actions {
            self.dispatch(action).await;
        }
    }

    /// Consults every strategy concurrently and concatenates their actions in
    /// registration order.
    async fn decide(&self, source: &str, event: &Event) -> Vec<Action> {
        let results = join_all(
            self.strategies
                .iter()
                .map(|s| isolated(s.process_event(event))),
        )
        .await;

        let mut actions = Vec::new();
        for (strategy, result) in self.strategies.iter().zip(results) {
            match result {
                Ok(batch) => actions.extend(batch),
                Err(err) => {
                    self.metrics.strategy_failed();
                    logging::log_failure(
                        Domain::Strategy,
                        "strategy.failed",
                        strategy.name(),
                        &err,
                        &[("collector", v_str(source)), ("event_type", v_str(&event.kind))],
                    );
                }
            }
        }
        self.metrics.actions_emitted(actions.len());
        actions
    }

    /// Sends one action to every executor concurrently and waits for all.
    async fn dispatch(&self, action: &Action) {
        let results = join_all(self.executors.iter().map(|x| isolated(x.execute(action)))).await;
        for (executor, result) in self.executors.iter().zip(results) {
            match result {
                Ok(()) => self.metrics.execution_done(),
                Err(err) => {
                    self.metrics.executor_failed();
                    logging::log_failure(
                        Domain::Executor,
                        "executor.failed",
                        executor.name(),
                        &err,
                        &[
                            ("action_type", v_str(&action.kind)),
                            ("transaction", Value::Bool(action.is_transaction())),
                        ],
                    );
                }
            }
        }
        logging::debug(
            Domain::Engine,
            "engine.action_dispatched",
            obj(&[
                ("action_type", v_str(&action.kind)),
                ("executors", v_u64(self.executors.len() as u64)),
            ]),
        );
    }
}
