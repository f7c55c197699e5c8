//! Breaker settings as read from configuration files.
//!
//! All types derive Serde traits so a config loader can hand over a TOML
//! table directly. Keys are kebab-case; durations are milliseconds. A
//! `[services.<name>]` table only lists what differs from `[defaults]`.
//!
//! ```toml
//! [defaults]
//! failure-rate-threshold = 50.0
//! minimum-number-of-calls = 10
//! wait-duration-in-open-state-ms = 30000
//!
//! [services.payments]
//! failure-rate-threshold = 25.0
//! call-timeout-ms = 2000
//! ```

use crate::config::{Config, ConfigBuilder, SlidingWindowType};
use crate::errors::ConfigError;
use crate::manager::CircuitBreakerManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Raw, unvalidated settings for one breaker
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_rate_threshold: f64,
    pub minimum_number_of_calls: usize,
    pub sliding_window_type: SlidingWindowType,
    pub sliding_window_size: usize,
    pub wait_duration_in_open_state_ms: u64,
    pub permitted_number_of_calls_in_half_open_state: usize,
    pub max_wait_duration_in_half_open_state_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
    pub slow_call_duration_threshold_ms: u64,
    pub slow_call_rate_threshold: f64,
    pub automatic_transition_from_open_to_half_open: bool,
    pub jitter_factor: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            failure_rate_threshold: config.failure_rate_threshold(),
            minimum_number_of_calls: config.minimum_number_of_calls(),
            sliding_window_type: config.sliding_window_type(),
            sliding_window_size: config.sliding_window_size(),
            wait_duration_in_open_state_ms: config.wait_duration_in_open_state().as_millis()
                as u64,
            permitted_number_of_calls_in_half_open_state: config
                .permitted_number_of_calls_in_half_open_state(),
            max_wait_duration_in_half_open_state_ms: None,
            call_timeout_ms: None,
            slow_call_duration_threshold_ms: config.slow_call_duration_threshold().as_millis()
                as u64,
            slow_call_rate_threshold: config.slow_call_rate_threshold(),
            automatic_transition_from_open_to_half_open: config
                .automatic_transition_from_open_to_half_open(),
            jitter_factor: config.jitter_factor(),
        }
    }
}

impl BreakerSettings {
    /// Validate into an immutable [`Config`]
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        ConfigBuilder::new()
            .failure_rate_threshold(self.failure_rate_threshold)
            .minimum_number_of_calls(self.minimum_number_of_calls)
            .set_sliding_window(self.sliding_window_type, self.sliding_window_size)
            .wait_duration_in_open_state(Duration::from_millis(self.wait_duration_in_open_state_ms))
            .permitted_number_of_calls_in_half_open_state(
                self.permitted_number_of_calls_in_half_open_state,
            )
            .set_max_wait_duration_in_half_open_state(
                self.max_wait_duration_in_half_open_state_ms
                    .map(Duration::from_millis),
            )
            .set_call_timeout(self.call_timeout_ms.map(Duration::from_millis))
            .slow_call_duration_threshold(Duration::from_millis(
                self.slow_call_duration_threshold_ms,
            ))
            .slow_call_rate_threshold(self.slow_call_rate_threshold)
            .automatic_transition_from_open_to_half_open(
                self.automatic_transition_from_open_to_half_open,
            )
            .jitter_factor(self.jitter_factor)
            .build()
    }
}

/// One `[services.<name>]` table; unset keys inherit from `[defaults]`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServiceSettings {
    pub failure_rate_threshold: Option<f64>,
    pub minimum_number_of_calls: Option<usize>,
    pub sliding_window_type: Option<SlidingWindowType>,
    pub sliding_window_size: Option<usize>,
    pub wait_duration_in_open_state_ms: Option<u64>,
    pub permitted_number_of_calls_in_half_open_state: Option<usize>,
    pub max_wait_duration_in_half_open_state_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
    pub slow_call_duration_threshold_ms: Option<u64>,
    pub slow_call_rate_threshold: Option<f64>,
    pub automatic_transition_from_open_to_half_open: Option<bool>,
    pub jitter_factor: Option<f64>,
}

impl ServiceSettings {
    /// Overlay the keys this table sets on `defaults`
    pub fn merged_over(&self, defaults: &BreakerSettings) -> BreakerSettings {
        BreakerSettings {
            failure_rate_threshold: self
                .failure_rate_threshold
                .unwrap_or(defaults.failure_rate_threshold),
            minimum_number_of_calls: self
                .minimum_number_of_calls
                .unwrap_or(defaults.minimum_number_of_calls),
            sliding_window_type: self
                .sliding_window_type
                .unwrap_or(defaults.sliding_window_type),
            sliding_window_size: self
                .sliding_window_size
                .unwrap_or(defaults.sliding_window_size),
            wait_duration_in_open_state_ms: self
                .wait_duration_in_open_state_ms
                .unwrap_or(defaults.wait_duration_in_open_state_ms),
            permitted_number_of_calls_in_half_open_state: self
                .permitted_number_of_calls_in_half_open_state
                .unwrap_or(defaults.permitted_number_of_calls_in_half_open_state),
            max_wait_duration_in_half_open_state_ms: self
                .max_wait_duration_in_half_open_state_ms
                .or(defaults.max_wait_duration_in_half_open_state_ms),
            call_timeout_ms: self.call_timeout_ms.or(defaults.call_timeout_ms),
            slow_call_duration_threshold_ms: self
                .slow_call_duration_threshold_ms
                .unwrap_or(defaults.slow_call_duration_threshold_ms),
            slow_call_rate_threshold: self
                .slow_call_rate_threshold
                .unwrap_or(defaults.slow_call_rate_threshold),
            automatic_transition_from_open_to_half_open: self
                .automatic_transition_from_open_to_half_open
                .unwrap_or(defaults.automatic_transition_from_open_to_half_open),
            jitter_factor: self.jitter_factor.unwrap_or(defaults.jitter_factor),
        }
    }
}

/// Settings for a whole manager: defaults plus per-service overrides
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub defaults: BreakerSettings,
    pub services: HashMap<String, ServiceSettings>,
}

impl ManagerSettings {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Effective settings of `service`, `[defaults]` included
    pub fn service(&self, service: &str) -> Option<BreakerSettings> {
        self.services
            .get(service)
            .map(|overrides| overrides.merged_over(&self.defaults))
    }

    /// Validate every table and build the manager
    pub fn into_manager(self) -> Result<CircuitBreakerManager, ConfigError> {
        let mut builder = CircuitBreakerManager::builder().default_config(self.defaults.to_config()?);
        for (service, overrides) in &self.services {
            let config = overrides.merged_over(&self.defaults).to_config()?;
            builder = builder.service_config(service.clone(), config);
        }
        Ok(builder.build())
    }
}
