//! Public state tag and transition events

use serde::Serialize;
use std::fmt;

/// Observable circuit state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Map the state machine's state name onto the public tag
    pub(crate) fn from_machine(name: &str) -> Self {
        match name {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change of one breaker, emitted to listeners and manager subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Monotonic milliseconds since the breaker was created
    pub at_millis: u64,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.circuit, self.from, self.to)
    }
}
