//! Error types for circuit breaker operations

use crate::state::CircuitState;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while running an operation through a circuit breaker
///
/// Only `Open` and `Timeout` are introduced by the breaker itself. The wrapped
/// operation's own error always comes back untouched inside `Execution`.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Call rejected without running the operation
    #[error("circuit '{circuit}' is {state}, call not permitted (retry in {retry_after:?})")]
    Open {
        circuit: String,
        state: CircuitState,
        retry_after: Duration,
    },
    /// The operation did not finish within the configured call timeout
    #[error("circuit '{circuit}' call timed out after {timeout:?}")]
    Timeout { circuit: String, timeout: Duration },
    /// The wrapped operation failed
    #[error("{0}")]
    Execution(E),
}

impl<E> CircuitError<E> {
    /// True when the call was short-circuited by an open breaker
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// True when the call was abandoned after the call timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, CircuitError::Timeout { .. })
    }

    /// The operation's own error, if that is what this is
    pub fn into_execution(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// Admission denied by an open (or saturated half-open) breaker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{circuit}' is {state}, call not permitted (retry in {retry_after:?})")]
pub struct CallNotPermitted {
    pub circuit: String,
    pub state: CircuitState,
    pub retry_after: Duration,
}

impl<E> From<CallNotPermitted> for CircuitError<E> {
    fn from(rejected: CallNotPermitted) -> Self {
        CircuitError::Open {
            circuit: rejected.circuit,
            state: rejected.state,
            retry_after: rejected.retry_after,
        }
    }
}

/// Invalid circuit breaker configuration. Values are never clamped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be within [0, 100], got {value}")]
    ThresholdOutOfRange { field: &'static str, value: f64 },

    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error(
        "minimum_number_of_calls ({minimum}) exceeds the count window size ({window}), the circuit could never open"
    )]
    MinimumCallsExceedWindow { minimum: usize, window: usize },

    #[error("jitter_factor must be within [0, 1], got {0}")]
    JitterOutOfRange(f64),

    #[error("invalid breaker settings: {0}")]
    Parse(String),
}
