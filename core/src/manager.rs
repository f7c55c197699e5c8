//! Registry of per-service circuit breakers
//!
//! Breakers are created lazily on first use. Each service has its own state
//! and window, so a slow `orders` backend never affects calls to `billing`.
//! The map lock is only held to find or insert a breaker; all call handling
//! happens on the breaker itself.

use crate::{
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitContext},
    classifier::FailureClassifier,
    config::Config,
    errors::CircuitError,
    metrics::CircuitMetrics,
    state::{CircuitState, StateTransition},
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const DEFAULT_EVENT_CAPACITY: usize = 64;

pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: Arc<Config>,
    overrides: DashMap<String, Arc<Config>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    events: broadcast::Sender<StateTransition>,
}

impl CircuitBreakerManager {
    /// Manager with default configuration for every service
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    /// The breaker for `service`, created from its configuration if missing
    ///
    /// Concurrent first calls for the same service all get the same breaker.
    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(service) {
            return Arc::clone(breaker.value());
        }

        let entry = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(self.create(service)));
        Arc::clone(entry.value())
    }

    /// The breaker for `service`, if one exists
    pub fn breaker(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(service)
            .map(|breaker| Arc::clone(breaker.value()))
    }

    /// Run an async operation through the breaker of `service`
    pub async fn execute_guarded<T, E, F, Fut>(
        &self,
        service: &str,
        f: F,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let breaker = self.get_or_create(service);
        breaker.execute(f).await
    }

    /// Run a blocking operation through the breaker of `service`
    pub fn call_guarded<T, E, F>(&self, service: &str, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: 'static,
    {
        self.get_or_create(service).call(f)
    }

    /// State of `service`; a service never called is CLOSED
    pub fn state(&self, service: &str) -> CircuitState {
        self.breaker(service)
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn metrics(&self, service: &str) -> CircuitMetrics {
        self.breaker(service)
            .map(|breaker| breaker.metrics())
            .unwrap_or_else(|| CircuitMetrics::untouched(service))
    }

    /// Metrics of every known service, ordered by name
    pub fn all_metrics(&self) -> Vec<CircuitMetrics> {
        let mut metrics: Vec<_> = self.snapshot().iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.circuit.cmp(&b.circuit));
        metrics
    }

    /// Force `service` open, creating its breaker if needed
    pub fn force_open(&self, service: &str) {
        self.get_or_create(service).force_open();
    }

    /// Reset `service` to CLOSED; unknown services are left alone
    pub fn reset(&self, service: &str) {
        if let Some(breaker) = self.breaker(service) {
            breaker.reset();
        }
    }

    /// Reset every known service
    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
    }

    /// Forget a service; its next call starts from a fresh breaker
    pub fn remove(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(service).map(|(_, breaker)| breaker)
    }

    /// Replace the configuration of `service`
    ///
    /// An existing breaker is dropped from the registry; holders of the old
    /// `Arc` keep using it until they ask the manager again.
    pub fn configure(&self, service: &str, config: Config) {
        self.overrides
            .insert(service.to_string(), Arc::new(config));
        if self.breakers.remove(service).is_some() {
            info!(circuit = %service, "circuit breaker reconfigured");
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Receive every state transition of every breaker
    ///
    /// Slow receivers lose the oldest events (`RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    /// Apply time-driven transitions on breakers that opted into
    /// `automatic_transition_from_open_to_half_open`
    pub fn check_transitions(&self) {
        for breaker in self.snapshot() {
            if breaker
                .config()
                .automatic_transition_from_open_to_half_open()
            {
                breaker.check_transition();
            }
        }
    }

    /// Run `check_transitions` every `period` until the manager is dropped
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn spawn_transition_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        assert!(!period.is_zero(), "sweeper period must be non-zero");
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.check_transitions();
            }
            debug!("transition sweeper stopped");
        })
    }

    /// Clone the breakers out so no shard lock is held while they run
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn config_for(&self, service: &str) -> Arc<Config> {
        self.overrides
            .get(service)
            .map(|config| Arc::clone(config.value()))
            .unwrap_or_else(|| Arc::clone(&self.default_config))
    }

    fn create(&self, service: &str) -> CircuitBreaker {
        let mut callbacks = self.callbacks.clone();
        let sender = self.events.clone();
        callbacks.add_listener(Arc::new(move |transition: &StateTransition| {
            // no subscribers is fine
            let _ = sender.send(transition.clone());
        }));

        debug!(circuit = %service, "creating circuit breaker");
        CircuitBreaker::with_context_and_callbacks(
            CircuitContext::new(service, self.config_for(service)),
            callbacks,
            self.failure_classifier.clone(),
        )
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("services", &self.service_names())
            .field("default_config", &self.default_config)
            .finish()
    }
}

/// Builder for [`CircuitBreakerManager`]
pub struct ManagerBuilder {
    default_config: Config,
    overrides: HashMap<String, Config>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    event_capacity: usize,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self {
            default_config: Config::default(),
            overrides: HashMap::new(),
            failure_classifier: None,
            callbacks: Callbacks::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ManagerBuilder {
    /// Configuration for services without an override
    pub fn default_config(mut self, config: Config) -> Self {
        self.default_config = config;
        self
    }

    pub fn service_config(mut self, service: impl Into<String>, config: Config) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    /// Classifier shared by every breaker
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Listener attached to every breaker
    pub fn on_state_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.add_listener(Arc::new(f));
        self
    }

    /// Buffered transitions per subscriber
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> CircuitBreakerManager {
        let (events, _) = broadcast::channel(self.event_capacity);

        CircuitBreakerManager {
            breakers: DashMap::new(),
            default_config: Arc::new(self.default_config),
            overrides: self
                .overrides
                .into_iter()
                .map(|(service, config)| (service, Arc::new(config)))
                .collect(),
            failure_classifier: self.failure_classifier,
            callbacks: self.callbacks,
            events,
        }
    }
}
