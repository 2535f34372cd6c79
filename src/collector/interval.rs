use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{poll_stream, Collector, EventStream, StopSignal};
use crate::events::Event;

/// Calls an async poll function on a fixed period and emits what it returns.
///
/// This is the shape of most on-chain watchers: sleep, read some state,
/// turn it into zero or more events.
pub struct IntervalCollector<F> {
    name: String,
    period: Duration,
    poll: Arc<F>,
    stop: StopSignal,
}

impl<F, Fut> IntervalCollector<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Event>>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, period: Duration, poll: F) -> Self {
        Self {
            name: name.into(),
            period,
            poll: Arc::new(poll),
            stop: StopSignal::new(),
        }
    }
}

#[async_trait]
impl<F, Fut> Collector for IntervalCollector<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Event>>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        Ok(poll_stream(self.name.clone(), self.period, self.poll.clone(), &self.stop))
    }

    async fn stop(&self) {
        self.stop.stop();
    }
}
