//! Read-only metrics snapshots

use crate::state::CircuitState;
use crate::window::WindowSnapshot;
use serde::Serialize;
use std::time::Duration;

/// Point-in-time view of one breaker, computed on demand
///
/// Taking a snapshot never changes the breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitMetrics {
    pub circuit: String,
    pub state: CircuitState,
    pub total_calls: usize,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    /// Percentage (0-100) of failed calls in the window
    pub failure_rate: f64,
    /// Percentage (0-100) of slow calls in the window
    pub slow_call_rate: f64,
    /// Calls rejected without running since the breaker was created or reset
    pub not_permitted_calls: u64,
    /// Trial permits left while HALF_OPEN, zero otherwise
    pub half_open_permits: usize,
    pub forced_open: bool,
    pub time_in_state: Duration,
}

impl CircuitMetrics {
    pub(crate) fn from_window(
        circuit: &str,
        state: CircuitState,
        window: WindowSnapshot,
        time_in_state: Duration,
    ) -> Self {
        Self {
            circuit: circuit.to_string(),
            state,
            total_calls: window.total,
            successful_calls: window.successes,
            failed_calls: window.failures,
            slow_calls: window.slow,
            failure_rate: window.failure_rate(),
            slow_call_rate: window.slow_call_rate(),
            not_permitted_calls: 0,
            half_open_permits: 0,
            forced_open: false,
            time_in_state,
        }
    }

    /// Snapshot for a service that has no breaker yet
    pub fn untouched(circuit: &str) -> Self {
        Self::from_window(
            circuit,
            CircuitState::Closed,
            WindowSnapshot::default(),
            Duration::ZERO,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_come_from_window() {
        let window = WindowSnapshot {
            total: 8,
            successes: 6,
            failures: 2,
            slow: 4,
        };

        let metrics = CircuitMetrics::from_window(
            "quotes",
            CircuitState::Closed,
            window,
            Duration::from_secs(3),
        );

        assert_eq!(metrics.total_calls, 8);
        assert_eq!(metrics.failure_rate, 25.0);
        assert_eq!(metrics.slow_call_rate, 50.0);
        assert_eq!(metrics.time_in_state, Duration::from_secs(3));
    }

    #[test]
    fn test_untouched_is_closed_and_empty() {
        let metrics = CircuitMetrics::untouched("fresh");

        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.total_calls, 0);
        assert_eq!(metrics.failure_rate, 0.0);
        assert!(!metrics.forced_open);
    }
}
