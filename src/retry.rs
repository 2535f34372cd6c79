//! Backoff for calls to remote services.
//!
//! Only the wallet client retries. The engine itself never re-runs a
//! strategy or executor.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};

use crate::logging::{self, obj, v_str, v_u64, Domain};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let exp = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let capped = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms) as f64;
        let spread = capped * self.jitter_factor.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + offset).max(0.0) as u64)
    }
}

/// Wrap an error in this to stop [`retry_async`] from trying again.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Permanent(pub String);

/// Runs `op` until it succeeds, fails with a [`Permanent`] error, or the
/// retry budget is spent. The last error is returned.
pub async fn retry_async<F, Fut, T>(cfg: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if err.downcast_ref::<Permanent>().is_some() || retry >= cfg.max_retries {
            return Err(err);
        }
        let wait = cfg.backoff(retry);
        retry += 1;
        logging::warn(
            Domain::Wallet,
            "wallet.retry",
            obj(&[
                ("operation", v_str(what)),
                ("retry", v_u64(retry as u64)),
                ("max_retries", v_u64(cfg.max_retries as u64)),
                ("delay_ms", v_u64(wait.as_millis() as u64)),
                ("error", v_str(&format!("{:#}", err))),
            ]),
        );
        sleep(wait).await;
    }
}

/// 408, 429 and any 5xx are worth another try.
pub fn is_retryable_http_error(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

pub fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
