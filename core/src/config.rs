//! Immutable, validated circuit breaker configuration

use crate::errors::ConfigError;
use crate::window::{Clock, CountWindow, SlidingWindow, TimeWindow};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How the sliding window bounds its contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlidingWindowType {
    /// `sliding_window_size` is a number of calls
    #[default]
    CountBased,
    /// `sliding_window_size` is a number of seconds
    TimeBased,
}

/// Circuit breaker configuration
///
/// Built once through [`ConfigBuilder`] and shared by `Arc`. Every value is
/// validated at construction; nothing can change afterwards. Reconfiguring a
/// service means building a new `Config` and a new breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    failure_rate_threshold: f64,
    minimum_number_of_calls: usize,
    sliding_window_type: SlidingWindowType,
    sliding_window_size: usize,
    wait_duration_in_open_state: Duration,
    permitted_number_of_calls_in_half_open_state: usize,
    max_wait_duration_in_half_open_state: Option<Duration>,
    call_timeout: Option<Duration>,
    slow_call_duration_threshold: Duration,
    slow_call_rate_threshold: f64,
    automatic_transition_from_open_to_half_open: bool,
    jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            minimum_number_of_calls: 10,
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 10,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_number_of_calls_in_half_open_state: 10,
            max_wait_duration_in_half_open_state: None,
            call_timeout: None,
            slow_call_duration_threshold: Duration::from_secs(60),
            slow_call_rate_threshold: 100.0,
            automatic_transition_from_open_to_half_open: false,
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Failure percentage (0-100) at which the circuit opens
    pub fn failure_rate_threshold(&self) -> f64 {
        self.failure_rate_threshold
    }

    /// Calls that must be in the window before rates are trusted
    pub fn minimum_number_of_calls(&self) -> usize {
        self.minimum_number_of_calls
    }

    pub fn sliding_window_type(&self) -> SlidingWindowType {
        self.sliding_window_type
    }

    pub fn sliding_window_size(&self) -> usize {
        self.sliding_window_size
    }

    pub fn wait_duration_in_open_state(&self) -> Duration {
        self.wait_duration_in_open_state
    }

    pub fn permitted_number_of_calls_in_half_open_state(&self) -> usize {
        self.permitted_number_of_calls_in_half_open_state
    }

    /// `None` keeps HALF_OPEN until the trial calls decide
    pub fn max_wait_duration_in_half_open_state(&self) -> Option<Duration> {
        self.max_wait_duration_in_half_open_state
    }

    /// `None` lets guarded operations run unbounded
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub fn slow_call_duration_threshold(&self) -> Duration {
        self.slow_call_duration_threshold
    }

    pub fn slow_call_rate_threshold(&self) -> f64 {
        self.slow_call_rate_threshold
    }

    pub fn automatic_transition_from_open_to_half_open(&self) -> bool {
        self.automatic_transition_from_open_to_half_open
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// True if either rate of `snapshot` reaches its threshold
    pub(crate) fn rates_breached(&self, snapshot: &crate::WindowSnapshot) -> bool {
        snapshot.failure_rate() >= self.failure_rate_threshold
            || snapshot.slow_call_rate() >= self.slow_call_rate_threshold
    }

    /// Build the window this configuration describes
    pub fn create_window(&self, clock: Clock) -> Arc<dyn SlidingWindow> {
        let slow_threshold_millis = self.slow_call_duration_threshold.as_millis() as u64;
        match self.sliding_window_type {
            SlidingWindowType::CountBased => Arc::new(CountWindow::new(
                self.sliding_window_size,
                slow_threshold_millis,
            )),
            SlidingWindowType::TimeBased => Arc::new(TimeWindow::new(
                (self.sliding_window_size as u64).saturating_mul(1000),
                slow_threshold_millis,
                clock,
            )),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_percentage("failure_rate_threshold", self.failure_rate_threshold)?;
        check_percentage("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        check_count("minimum_number_of_calls", self.minimum_number_of_calls)?;
        check_count("sliding_window_size", self.sliding_window_size)?;
        check_count(
            "permitted_number_of_calls_in_half_open_state",
            self.permitted_number_of_calls_in_half_open_state,
        )?;
        check_duration(
            "wait_duration_in_open_state",
            self.wait_duration_in_open_state,
        )?;
        check_duration(
            "slow_call_duration_threshold",
            self.slow_call_duration_threshold,
        )?;
        if self.sliding_window_type == SlidingWindowType::CountBased
            && self.minimum_number_of_calls > self.sliding_window_size
        {
            return Err(ConfigError::MinimumCallsExceedWindow {
                minimum: self.minimum_number_of_calls,
                window: self.sliding_window_size,
            });
        }
        if let Some(max_wait) = self.max_wait_duration_in_half_open_state {
            check_duration("max_wait_duration_in_half_open_state", max_wait)?;
        }
        if let Some(timeout) = self.call_timeout {
            check_duration("call_timeout", timeout)?;
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::JitterOutOfRange(self.jitter_factor));
        }
        Ok(())
    }
}

fn check_percentage(field: &'static str, value: f64) -> Result<(), ConfigError> {
    // NaN fails the range check too
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange { field, value })
    }
}

fn check_count(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NonPositive { field });
    }
    Ok(())
}

fn check_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::NonPositive { field });
    }
    Ok(())
}

/// Fluent builder for [`Config`]
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Failure percentage (0-100) that opens the circuit
    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    /// Count-based window holding the last `size` calls
    pub fn count_window(mut self, size: usize) -> Self {
        self.config.sliding_window_type = SlidingWindowType::CountBased;
        self.config.sliding_window_size = size;
        self
    }

    /// Time-based window holding the calls of the last `seconds`
    pub fn time_window(mut self, seconds: usize) -> Self {
        self.config.sliding_window_type = SlidingWindowType::TimeBased;
        self.config.sliding_window_size = seconds;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    pub fn max_wait_duration_in_half_open_state(mut self, max_wait: Duration) -> Self {
        self.config.max_wait_duration_in_half_open_state = Some(max_wait);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Slow-call percentage (0-100) that opens the circuit
    pub fn slow_call_rate_threshold(mut self, percent: f64) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open = enabled;
        self
    }

    /// Randomise the OPEN wait: `wait * (1 - jitter + rand * jitter)`
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub(crate) fn set_sliding_window(mut self, kind: SlidingWindowType, size: usize) -> Self {
        self.config.sliding_window_type = kind;
        self.config.sliding_window_size = size;
        self
    }

    pub(crate) fn set_max_wait_duration_in_half_open_state(
        mut self,
        max_wait: Option<Duration>,
    ) -> Self {
        self.config.max_wait_duration_in_half_open_state = max_wait;
        self
    }

    pub(crate) fn set_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.call_timeout = timeout;
        self
    }
}
