//! Side effects: one action in, one effect out (or nothing).
//!
//! Every executor sees every action. Executors that do not recognise an
//! action must return `Ok(())` without doing anything.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::events::Action;
use crate::logging::{self, obj, v_str, Domain};
use crate::wallet::WalletApi;

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, action: &Action) -> Result<()>;
}

/// Wraps an async function `Action -> Result<()>`.
pub struct FunctionExecutor<F> {
    name: String,
    execute: F,
}

impl<F, Fut> FunctionExecutor<F>
where
    F: Fn(Action) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, execute: F) -> Self {
        Self {
            name: name.into(),
            execute,
        }
    }
}

#[async_trait]
impl<F, Fut> Executor for FunctionExecutor<F>
where
    F: Fn(Action) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, action: &Action) -> Result<()> {
        (self.execute)(action.clone()).await
    }
}

/// Writes every action it receives to the structured log.
#[derive(Debug, Default)]
pub struct LoggerExecutor;

#[async_trait]
impl Executor for LoggerExecutor {
    fn name(&self) -> &str {
        "logger"
    }

    async fn execute(&self, action: &Action) -> Result<()> {
        let mut fields = obj(&[
            ("executor", v_str(self.name())),
            ("action_type", v_str(&action.kind)),
            ("data", Value::Object(action.data.clone())),
        ]);
        if let Some(Value::String(msg)) = action.get("message") {
            fields.insert("msg".to_string(), v_str(msg));
        }
        logging::info(Domain::Executor, "executor.action", fields);
        Ok(())
    }
}

/// Submits transaction actions to the wallet API as contract calls.
///
/// Only actions tagged [`ActionKind::Transaction`](crate::events::ActionKind)
/// reach the API; everything else is logged and ignored.
pub struct TransactionExecutor {
    wallet: Arc<dyn WalletApi>,
}

impl TransactionExecutor {
    pub fn new(wallet: Arc<dyn WalletApi>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Executor for TransactionExecutor {
    fn name(&self) -> &str {
        "devapi"
    }

    async fn execute(&self, action: &Action) -> Result<()> {
        logging::info(
            Domain::Executor,
            "executor.action",
            obj(&[
                ("executor", v_str(self.name())),
                ("action_type", v_str(&action.kind)),
                ("transaction", Value::Bool(action.is_transaction())),
            ]),
        );
        if !action.is_transaction() {
            return Ok(());
        }
        let receipt = self.wallet.create_contract_call_transaction(&action.data).await?;
        logging::info(
            Domain::Executor,
            "executor.transaction_submitted",
            obj(&[
                ("executor", v_str(self.name())),
                ("request_id", v_str(&receipt.request_id)),
                ("transaction_id", v_str(&receipt.transaction_id)),
            ]),
        );
        Ok(())
    }
}
