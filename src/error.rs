use thiserror::Error;

use crate::engine::EngineState;

/// Misuse of the engine lifecycle. Pipeline failures (collectors, strategies,
/// executors) are never surfaced here; they are logged and counted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("cannot {op} while the engine is {state}")]
    InvalidState { op: &'static str, state: EngineState },
    #[error("engine has not been started")]
    NotStarted,
}
