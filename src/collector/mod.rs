//! Event sources.
//!
//! A collector is started once, hands out one lazy event stream, and is
//! stopped once. The engine drains each stream on its own task, so a
//! collector waiting on I/O never holds up the others.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::Stream;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::events::Event;
use crate::logging::{self, v_str, Domain};

mod interval;
mod rpc;
mod ws;

pub use interval::IntervalCollector;
pub use rpc::{abi_word, rpc_call, RpcCollector};
pub use ws::WsCollector;

/// Lazy, unbounded sequence of events.
pub type EventStream = BoxStream<'static, Event>;

#[async_trait]
pub trait Collector: Send + Sync {
    /// Name used in logs and stats.
    fn name(&self) -> &str;

    /// Prepares the source. Calling it again after success is a no-op.
    /// Must not block indefinitely.
    async fn start(&self) -> Result<()>;

    /// Hands out the event stream. The stream ends once [`Collector::stop`]
    /// has been called or the source fails for good.
    async fn events(&self) -> Result<EventStream>;

    /// Ends event production and releases resources. Idempotent.
    async fn stop(&self);
}

/// Shared "stop requested" flag for collector loops.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `stop` has been called.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            loop {
                let stopped = *rx.borrow_and_update();
                if stopped || rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// Cuts `events` off as soon as `stop` is called, dropping anything buffered.
    pub fn guard<S>(&self, events: S) -> EventStream
    where
        S: Stream<Item = Event> + Send + 'static,
    {
        events.take_until(self.stopped()).boxed()
    }
}

/// Turns any zero-argument function returning an event stream into a collector.
pub struct FunctionCollector<F> {
    name: String,
    make_events: F,
    stop: StopSignal,
}

impl<F, S> FunctionCollector<F>
where
    F: Fn() -> S + Send + Sync,
    S: Stream<Item = Event> + Send + 'static,
{
    pub fn new(name: impl Into<String>, make_events: F) -> Self {
        Self {
            name: name.into(),
            make_events,
            stop: StopSignal::new(),
        }
    }
}

#[async_trait]
impl<F, S> Collector for FunctionCollector<F>
where
    F: Fn() -> S + Send + Sync,
    S: Stream<Item = Event> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        Ok(self.stop.guard((self.make_events)()))
    }

    async fn stop(&self) {
        self.stop.stop();
    }
}

/// Collector over a fixed list of events; handy for replays and tests.
pub fn from_events(name: impl Into<String>, events: Vec<Event>) -> impl Collector {
    FunctionCollector::new(name, move || stream::iter(events.clone()))
}

/// Polls `poll` every `period` (sleeping first) and yields whatever it returns.
/// Poll errors are logged and the loop carries on.
pub(crate) fn poll_stream<F, Fut>(
    name: String,
    period: Duration,
    poll: Arc<F>,
    stop: &StopSignal,
) -> EventStream
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Event>>> + Send + 'static,
{
    let failing = Arc::new(AtomicBool::new(false));
    let batches = stream::unfold((), move |_| {
        let poll = poll.clone();
        let name = name.clone();
        let failing = failing.clone();
        async move {
            sleep(period).await;
            let batch = match (poll.as_ref())().await {
                Ok(events) => {
                    if failing.swap(false, Ordering::Relaxed) {
                        logging::info(
                            Domain::Collector,
                            "collector.poll_recovered",
                            logging::obj(&[("collector", v_str(&name))]),
                        );
                    }
                    events
                }
                Err(e) => {
                    failing.store(true, Ordering::Relaxed);
                    logging::log_failure(Domain::Collector, "collector.poll_failed", &name, &e.to_string(), &[]);
                    Vec::new()
                }
            };
            Some((stream::iter(batch), ()))
        }
    });
    stop.guard(batches.flatten())
}
