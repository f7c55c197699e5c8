//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitContext},
    classifier::FailureClassifier,
    config::{Config, ConfigBuilder},
    errors::ConfigError,
    state::StateTransition,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: ConfigBuilder,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ConfigBuilder::new(),
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Start from a complete configuration; later setters adjust it
    pub fn config(mut self, config: &Config) -> Self {
        self.config = ConfigBuilder::from_config(config);
        self
    }

    /// Failure percentage (0-100) at which the circuit opens
    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.config = self.config.failure_rate_threshold(percent);
        self
    }

    /// Calls the window must hold before rates are evaluated
    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config = self.config.minimum_number_of_calls(calls);
        self
    }

    /// Keep the last `size` outcomes
    pub fn count_window(mut self, size: usize) -> Self {
        self.config = self.config.count_window(size);
        self
    }

    /// Keep the outcomes of the last `seconds` seconds
    pub fn time_window(mut self, seconds: usize) -> Self {
        self.config = self.config.time_window(seconds);
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config = self.config.wait_duration_in_open_state(wait);
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.config = self.config.permitted_number_of_calls_in_half_open_state(calls);
        self
    }

    pub fn max_wait_duration_in_half_open_state(mut self, max_wait: Duration) -> Self {
        self.config = self.config.max_wait_duration_in_half_open_state(max_wait);
        self
    }

    /// Deadline enforced on `execute`
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.call_timeout(timeout);
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config = self.config.slow_call_duration_threshold(threshold);
        self
    }

    pub fn slow_call_rate_threshold(mut self, percent: f64) -> Self {
        self.config = self.config.slow_call_rate_threshold(percent);
        self
    }

    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config = self.config.automatic_transition_from_open_to_half_open(enabled);
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config = self.config.jitter_factor(factor);
        self
    }

    /// Set a failure classifier to filter which errors count as failures
    ///
    /// Ignored errors are still returned to the caller; they just never enter
    /// the sliding window.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use service_breaker::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // 4xx are the caller's fault
    ///         ctx.error
    ///             .downcast_ref::<u16>()
    ///             .map(|status| *status >= 500)
    ///             .unwrap_or(true)
    ///     })))
    ///     .build()
    ///     .unwrap();
    ///
    /// assert!(circuit.is_closed());
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Add a listener that sees every transition
    pub fn on_state_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.add_listener(Arc::new(f));
        self
    }

    /// Validate the configuration and build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        let config = Arc::new(self.config.build()?);
        let context = CircuitContext::new(self.name, config);

        Ok(CircuitBreaker::with_context_and_callbacks(
            context,
            self.callbacks,
            self.failure_classifier,
        ))
    }
}
