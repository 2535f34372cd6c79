//! Decision logic: one event in, zero or more actions out.
//!
//! Strategies take `&self` because the engine may consult the same strategy
//! from several collector lanes at once. Any state a strategy keeps
//! (counters, cooldowns) lives behind its own lock.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::future::Future;

use crate::events::{amount_of, Action, Event};
use crate::logging::{self, obj, v_str, Domain};

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the actions this event calls for, in the order they should be
    /// executed. Uninteresting events yield an empty list, never an error.
    async fn process_event(&self, event: &Event) -> Result<Vec<Action>>;
}

/// Wraps an async function `Event -> Result<Vec<Action>>`.
pub struct FunctionStrategy<F> {
    name: String,
    process: F,
}

impl<F, Fut> FunctionStrategy<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Action>>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, process: F) -> Self {
        Self {
            name: name.into(),
            process,
        }
    }
}

#[async_trait]
impl<F, Fut> Strategy for FunctionStrategy<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Action>>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_event(&self, event: &Event) -> Result<Vec<Action>> {
        (self.process)(event.clone()).await
    }
}

/// Fires when a numeric field of a given event type reaches a threshold.
///
/// The amount may be a JSON number or a decimal/hex string and is compared as
/// a u128, so 18-decimal token amounts are exact. What to do on a hit is up
/// to `build`, which receives the event and the parsed amount.
pub struct ThresholdStrategy<B> {
    name: String,
    event_type: String,
    field: String,
    threshold: u128,
    build: B,
}

impl<B> ThresholdStrategy<B>
where
    B: Fn(&Event, u128) -> Result<Vec<Action>> + Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        field: impl Into<String>,
        threshold: u128,
        build: B,
    ) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            field: field.into(),
            threshold,
            build,
        }
    }
}

#[async_trait]
impl<B> Strategy for ThresholdStrategy<B>
where
    B: Fn(&Event, u128) -> Result<Vec<Action>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_event(&self, event: &Event) -> Result<Vec<Action>> {
        if !event.is(&self.event_type) {
            return Ok(Vec::new());
        }
        let amount = event
            .get(&self.field)
            .and_then(amount_of)
            .ok_or_else(|| anyhow!("event {} has no numeric {:?}", event.kind, self.field))?;
        if amount < self.threshold {
            logging::debug(
                Domain::Strategy,
                "strategy.below_threshold",
                obj(&[
                    ("strategy", v_str(&self.name)),
                    ("amount", v_str(&amount.to_string())),
                    ("threshold", v_str(&self.threshold.to_string())),
                ]),
            );
            return Ok(Vec::new());
        }
        (self.build)(event, amount)
    }
}
