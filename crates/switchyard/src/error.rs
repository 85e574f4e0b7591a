//! Error types for the circuit engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type SimResult<T> = Result<T, CircuitError>;

/// Errors that can occur while building or simulating a circuit.
///
/// Only `UnknownEvent` is recoverable at the dispatch level; every other
/// failure raised from a handler, an evaluation or an init routine aborts
/// the simulation.
#[derive(Debug, Clone, Error)]
pub enum CircuitError {
    /// An operation was attempted at the wrong lifecycle point.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A block referenced by name is not registered in the circuit.
    #[error("block {0:?} not found")]
    NotFound(String),

    /// A name resolved to a block of the wrong kind.
    #[error("block {name:?} is a {actual} block, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A block received an event type it has no handler for.
    #[error("block {block:?}: unknown event type {etype:?}")]
    UnknownEvent { block: String, etype: String },

    /// An event was delivered to a block that is still handling another one.
    #[error("block {block:?}: forbidden recursive event delivery")]
    RecursiveEvent { block: String },

    /// A propagation wave failed to converge.
    #[error("circuit instability: block {block:?} re-evaluated more than {limit} times in one wave")]
    Instability { block: String, limit: usize },

    /// A block finished the init sequence with an undefined output.
    #[error("block {0:?}: not initialized")]
    InitializationFailed(String),

    /// Structured cancellation. A normal termination signal, not an error
    /// unless it arrives where work was still expected.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A block name is already taken in this circuit.
    #[error("duplicate block name {0:?}")]
    DuplicateName(String),

    /// Invalid declarative configuration (transition tables, connections,
    /// builder arguments).
    #[error("configuration error: {0}")]
    Config(String),

    /// A failure attributed to a specific block (handler, evaluation or
    /// init/stop routine).
    #[error("block {block:?}: {message}")]
    Block { block: String, message: String },
}

impl CircuitError {
    /// Attach the failing block's name to an error that does not carry one yet.
    pub(crate) fn in_block(self, block: &str) -> Self {
        match self {
            CircuitError::Block { .. }
            | CircuitError::UnknownEvent { .. }
            | CircuitError::RecursiveEvent { .. }
            | CircuitError::Instability { .. }
            | CircuitError::InitializationFailed(_)
            | CircuitError::Cancelled(_) => self,
            other => CircuitError::Block {
                block: block.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// True for the cancellation variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CircuitError::Cancelled(_))
    }

    /// True for the only dispatch-level error that is not fatal.
    pub fn is_unknown_event(&self) -> bool {
        matches!(self, CircuitError::UnknownEvent { .. })
    }
}
