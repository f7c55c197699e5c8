//! service-breaker - Per-service circuit breakers
//!
//! This crate provides a circuit breaker manager for calls to remote services:
//! - One independent breaker per service name, created lazily
//! - State machine for the breaker lifecycle (Closed → Open → HalfOpen)
//! - Count-based or time-based sliding windows with failure and slow-call rates
//! - Bounded trial calls while half-open, call timeouts for async operations
//! - Monotonic time tracking to prevent NTP clock skew issues
//!
//! # Example
//!
//! ```rust
//! use service_breaker::{CircuitBreakerManager, CircuitState, Config};
//! use std::time::Duration;
//!
//! let config = Config::builder()
//!     .failure_rate_threshold(50.0)
//!     .minimum_number_of_calls(4)
//!     .count_window(4)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//!
//! let manager = CircuitBreakerManager::builder()
//!     .default_config(config)
//!     .build();
//!
//! // Execute with circuit protection
//! let result = manager.call_guarded("inventory", || {
//!     // Your service call here
//!     Ok::<_, String>("in stock")
//! });
//! assert!(result.is_ok());
//!
//! // Check circuit state
//! assert_eq!(manager.state("inventory"), CircuitState::Closed);
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod manager;
pub mod metrics;
pub mod settings;
pub mod state;
pub mod window;

pub use builder::CircuitBuilder;
pub use callbacks::{Callbacks, StateHook, TransitionListener};
pub use circuit::{CircuitBreaker, Permit};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use config::{Config, ConfigBuilder, SlidingWindowType};
pub use errors::{CallNotPermitted, CircuitError, ConfigError};
pub use manager::{CircuitBreakerManager, ManagerBuilder};
pub use metrics::CircuitMetrics;
pub use settings::{BreakerSettings, ManagerSettings, ServiceSettings};
pub use state::{CircuitState, StateTransition};
pub use window::{Clock, CountWindow, SlidingWindow, TimeWindow, WindowSnapshot};

/// The recorded result of one completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub duration_millis: u64,
    /// Completion time on the breaker's monotonic clock
    pub timestamp_millis: u64,
    /// Abandoned after the call timeout; always a failure and always slow
    pub timed_out: bool,
}

impl CallOutcome {
    pub fn success(duration_millis: u64, timestamp_millis: u64) -> Self {
        Self {
            success: true,
            duration_millis,
            timestamp_millis,
            timed_out: false,
        }
    }

    pub fn failure(duration_millis: u64, timestamp_millis: u64) -> Self {
        Self {
            success: false,
            duration_millis,
            timestamp_millis,
            timed_out: false,
        }
    }

    pub fn timeout(duration_millis: u64, timestamp_millis: u64) -> Self {
        Self {
            success: false,
            duration_millis,
            timestamp_millis,
            timed_out: true,
        }
    }

    /// Slow when it timed out or ran longer than the threshold
    pub fn is_slow(&self, threshold_millis: u64) -> bool {
        self.timed_out || self.duration_millis > threshold_millis
    }
}
