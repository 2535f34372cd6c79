//! Orchestrator: wires collectors to strategies to executors and owns the
//! run lifecycle.
//!
//! ```text
//! ┌────────────┐  lane per collector  ┌────────────┐  actions   ┌────────────┐
//! │ Collectors │─────────────────────►│ Strategies │───────────►│ Executors  │
//! │ (streams)  │   events, in order   │ (all, conc)│  in order  │ (all, conc)│
//! └────────────┘                      └────────────┘            └────────────┘
//! ```
//!
//! Lifecycle is `Created -> Running -> Stopping -> Stopped`, single use.
//! Each collector gets its own lane task, so events from one collector are
//! handled strictly in emission order while a slow or hung collector never
//! holds up the others. Failures inside a lane are logged and counted; they
//! never end the run.

use anyhow::Result;
use futures_util::future::join_all;
use futures_util::{FutureExt, StreamExt};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::collector::{Collector, EventStream, StopSignal};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::logging::{self, obj, v_str, v_u64, Domain};
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::strategy::Strategy;

mod pipeline;

use pipeline::{panic_message, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "created",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts live lanes; the count drops even if the lane unwinds.
struct LaneGuard(Arc<watch::Sender<usize>>);

impl LaneGuard {
    fn enter(live: &Arc<watch::Sender<usize>>) -> Self {
        live.send_modify(|n| *n += 1);
        Self(live.clone())
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Default)]
struct RunHandles {
    active: Vec<Arc<dyn Collector>>,
    lanes: Vec<JoinHandle<()>>,
    stats: Option<JoinHandle<()>>,
}

async fn wait_until<T>(rx: &mut watch::Receiver<T>, pred: impl Fn(&T) -> bool) {
    loop {
        let done = pred(&*rx.borrow_and_update());
        if done || rx.changed().await.is_err() {
            return;
        }
    }
}

pub struct AutomationEngine {
    cfg: EngineConfig,
    collectors: Vec<Arc<dyn Collector>>,
    strategies: Vec<Arc<dyn Strategy>>,
    executors: Vec<Arc<dyn Executor>>,
    state: watch::Sender<EngineState>,
    shutdown: StopSignal,
    live_lanes: Arc<watch::Sender<usize>>,
    run: Mutex<RunHandles>,
    metrics: Arc<RunMetrics>,
}

impl Default for AutomationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl AutomationEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        let (state, _) = watch::channel(EngineState::Created);
        let (live, _) = watch::channel(0usize);
        Self {
            cfg,
            collectors: Vec::new(),
            strategies: Vec::new(),
            executors: Vec::new(),
            state,
            shutdown: StopSignal::new(),
            live_lanes: Arc::new(live),
            run: Mutex::new(RunHandles::default()),
            metrics: Arc::new(RunMetrics::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn ensure_configurable(&self, op: &'static str) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Created => Ok(()),
            state => Err(EngineError::InvalidState { op, state }),
        }
    }

    pub fn add_collector(&mut self, collector: impl Collector + 'static) -> Result<(), EngineError> {
        self.add_shared_collector(Arc::new(collector))
    }

    pub fn add_shared_collector(&mut self, collector: Arc<dyn Collector>) -> Result<(), EngineError> {
        self.ensure_configurable("add_collector")?;
        self.collectors.push(collector);
        Ok(())
    }

    pub fn add_strategy(&mut self, strategy: impl Strategy + 'static) -> Result<(), EngineError> {
        self.add_shared_strategy(Arc::new(strategy))
    }

    pub fn add_shared_strategy(&mut self, strategy: Arc<dyn Strategy>) -> Result<(), EngineError> {
        self.ensure_configurable("add_strategy")?;
        self.strategies.push(strategy);
        Ok(())
    }

    pub fn add_executor(&mut self, executor: impl Executor + 'static) -> Result<(), EngineError> {
        self.add_shared_executor(Arc::new(executor))
    }

    pub fn add_shared_executor(&mut self, executor: Arc<dyn Executor>) -> Result<(), EngineError> {
        self.ensure_configurable("add_executor")?;
        self.executors.push(executor);
        Ok(())
    }

    /// Starts every collector concurrently and spawns one lane per collector
    /// that came up. A collector whose `start` or `events` fails is logged
    /// and left out of the run; the rest proceed.
    pub async fn start(&self) -> Result<(), EngineError> {
        // Taken before leaving `Created` and held until every lane is
        // spawned: a `stop` that observes `Running` always waits for the
        // full set of handles, and `join` never sees zero live lanes mid-start.
        let mut run = self.run.lock().await;

        let mut from = EngineState::Created;
        let began = self.state.send_if_modified(|s| {
            from = *s;
            if *s == EngineState::Created {
                *s = EngineState::Running;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(EngineError::InvalidState { op: "start", state: from });
        }

        let _starting = LaneGuard::enter(&self.live_lanes);

        logging::info(
            Domain::Engine,
            "engine.starting",
            obj(&[
                ("engine", v_str(&self.cfg.name)),
                ("collectors", v_u64(self.collectors.len() as u64)),
                ("strategies", v_u64(self.strategies.len() as u64)),
                ("executors", v_u64(self.executors.len() as u64)),
            ]),
        );

        let pipeline = Arc::new(Pipeline {
            strategies: self.strategies.clone(),
            executors: self.executors.clone(),
            metrics: self.metrics.clone(),
        });

        let started = join_all(self.collectors.iter().map(|c| {
            let c = c.clone();
            async move {
                let opened: Result<EventStream> = async {
                    c.start().await?;
                    c.events().await
                }
                .await;
                (c, opened)
            }
        }))
        .await;

        for (collector, opened) in started {
            match opened {
                Ok(events) => {
                    run.lanes.push(self.spawn_lane(collector.clone(), events, pipeline.clone()));
                    run.active.push(collector);
                }
                Err(e) => {
                    self.metrics.collector_failed();
                    logging::log_failure(
                        Domain::Collector,
                        "collector.start_failed",
                        collector.name(),
                        &format!("{:#}", e),
                        &[("engine", v_str(&self.cfg.name))],
                    );
                    collector.stop().await;
                }
            }
        }

        if self.cfg.stats_log_secs > 0 {
            run.stats = Some(self.spawn_stats(Duration::from_secs(self.cfg.stats_log_secs)));
        }

        logging::info(
            Domain::Engine,
            "engine.started",
            obj(&[
                ("engine", v_str(&self.cfg.name)),
                ("lanes", v_u64(run.lanes.len() as u64)),
            ]),
        );
        Ok(())
    }

    fn spawn_lane(
        &self,
        collector: Arc<dyn Collector>,
        events: EventStream,
        pipeline: Arc<Pipeline>,
    ) -> JoinHandle<()> {
        let guard = LaneGuard::enter(&self.live_lanes);
        let shutdown = self.shutdown.clone();
        let metrics = self.metrics.clone();
        let source = collector.name().to_string();
        tokio::spawn(async move {
            let _guard = guard;
            let lane = run_lane(&source, events, &pipeline, &shutdown);
            if let Err(payload) = AssertUnwindSafe(lane).catch_unwind().await {
                metrics.lane_failed();
                logging::log_fatal(
                    "engine.lane_failed",
                    &panic_message(payload),
                    &[("collector", v_str(&source))],
                );
            }
        })
    }

    fn spawn_stats(&self, every: Duration) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        let name = self.cfg.name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            let stopped = shutdown.stopped();
            tokio::pin!(stopped);
            loop {
                tokio::select! {
                    _ = &mut stopped => return,
                    _ = ticker.tick() => {
                        let mut fields = metrics.snapshot().to_fields();
                        fields.insert("engine".to_string(), v_str(&name));
                        logging::info(Domain::Engine, "engine.stats", fields);
                    }
                }
            }
        })
    }

    /// Waits until every lane has finished (all collectors exhausted) or the
    /// engine has been stopped.
    pub async fn join(&self) -> Result<(), EngineError> {
        if self.state() == EngineState::Created {
            return Err(EngineError::NotStarted);
        }
        let mut lanes = self.live_lanes.subscribe();
        let mut state = self.state.subscribe();
        tokio::select! {
            _ = wait_until(&mut lanes, |n| *n == 0) => {}
            _ = wait_until(&mut state, |s| *s == EngineState::Stopped) => {}
        }
        Ok(())
    }

    /// Stops the run: no further events are delivered, collectors are told to
    /// stop, in-flight events drain, then the engine is `Stopped`.
    ///
    /// Idempotent. Stopping an engine that never started moves it straight
    /// to `Stopped`. Cancel safe: if a call is dropped mid-teardown, the next
    /// call picks up where it left off. Concurrent callers all return once
    /// the run is down.
    pub async fn stop(&self) {
        let mut from = EngineState::Created;
        self.state.send_modify(|s| {
            from = *s;
            match *s {
                EngineState::Created => *s = EngineState::Stopped,
                EngineState::Running => *s = EngineState::Stopping,
                EngineState::Stopping | EngineState::Stopped => {}
            }
        });

        match from {
            EngineState::Created => {
                logging::info(
                    Domain::Engine,
                    "engine.stopped",
                    obj(&[("engine", v_str(&self.cfg.name)), ("started", serde_json::Value::Bool(false))]),
                );
                return;
            }
            EngineState::Stopped => return,
            EngineState::Running => {
                logging::info(Domain::Engine, "engine.stopping", obj(&[("engine", v_str(&self.cfg.name))]));
                self.shutdown.stop();
            }
            EngineState::Stopping => {}
        }

        self.teardown().await;
    }

    /// Drains the run. Every handle stays in `run` until it has completed, so
    /// dropping this future part way leaves nothing detached.
    async fn teardown(&self) {
        let mut run = self.run.lock().await;
        join_all(run.active.iter().map(|c| c.stop())).await;
        while let Some(lane) = run.lanes.last_mut() {
            let joined = lane.await;
            run.lanes.pop();
            if let Err(e) = joined {
                self.metrics.lane_failed();
                logging::log_fatal("engine.lane_join_failed", &e.to_string(), &[]);
            }
        }
        if let Some(stats) = run.stats.as_mut() {
            let _ = stats.await;
            run.stats = None;
        }
        run.active.clear();
        drop(run);

        let finished = self.state.send_if_modified(|s| {
            let moved = *s != EngineState::Stopped;
            *s = EngineState::Stopped;
            moved
        });
        if finished {
            let mut fields = self.metrics.snapshot().to_fields();
            fields.insert("engine".to_string(), v_str(&self.cfg.name));
            logging::info(Domain::Engine, "engine.stopped", fields);
        }
    }
}

/// Drives one collector's stream through the pipeline, one event at a time.
async fn run_lane(source: &str, mut events: EventStream, pipeline: &Pipeline, shutdown: &StopSignal) {
    let stopped = shutdown.stopped();
    tokio::pin!(stopped);
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stopped => None,
            evt = events.next() => evt,
        };
        let event = match next {
            Some(event) if !shutdown.is_stopped() => event,
            Some(_) => break,
            None => {
                if !shutdown.is_stopped() {
                    logging::info(Domain::Collector, "collector.exhausted", obj(&[("collector", v_str(source))]));
                }
                break;
            }
        };
        pipeline.handle(source, event).await;
    }
}
