//! Circuit breaker implementation using state machines
//!
//! One `CircuitBreaker` guards one service. Permission acquisition, outcome
//! recording and transition evaluation all happen under a single mutex per
//! breaker, so a HALF_OPEN permit decrement and the CLOSED/OPEN decision it
//! leads to can never race.

use crate::{
    CallOutcome,
    callbacks::Callbacks,
    classifier::{FailureClassifier, FailureContext},
    config::Config,
    errors::{CallNotPermitted, CircuitError},
    metrics::CircuitMetrics,
    state::{CircuitState, StateTransition},
    window::{Clock, SlidingWindow, WindowSnapshot},
};
use state_machines::state_machine;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Arc<Config>,
    pub window: Arc<dyn SlidingWindow>,
    pub clock: Clock,
}

impl CircuitContext {
    pub fn new(name: impl Into<String>, config: Arc<Config>) -> Self {
        let clock = Clock::new();
        let window = config.create_window(clock);
        Self {
            name: name.into(),
            config,
            window,
            clock,
        }
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self::new(String::new(), Arc::new(Config::default()))
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("window", &self.window)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: u64,
    /// Wait before probing, jitter already applied
    pub wait_millis: u64,
    /// Set by `force_open`; only `reset` leaves a forced circuit
    pub forced: bool,
}

/// Data specific to the HalfOpen state
///
/// Trial outcomes are tallied here, independent of the sliding window, so the
/// verdict covers every trial call even when the window holds fewer.
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub entered_at: u64,
    pub permits_remaining: usize,
    pub completed: usize,
    pub failures: usize,
    pub slow: usize,
}

impl HalfOpenData {
    fn tally(&self) -> WindowSnapshot {
        WindowSnapshot {
            total: self.completed,
            successes: self.completed - self.failures,
            failures: self.failures,
            slow: self.slow,
        }
    }
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [rates_breached],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [trial_passed],
            transition: { from: HalfOpen, to: Closed }
        }
        expire {
            guards: [trial_expired],
            transition: { from: HalfOpen, to: Open }
        }
        force_open {
            transition: { from: [Closed, HalfOpen], to: Open }
        }
    }
}

impl Circuit<Closed> {
    /// Enough calls in the window and a rate at its threshold
    fn rates_breached(&self, ctx: &CircuitContext) -> bool {
        let snapshot = ctx.window.snapshot();
        snapshot.total >= ctx.config.minimum_number_of_calls() && ctx.config.rates_breached(&snapshot)
    }
}

impl Circuit<HalfOpen> {
    /// Every trial call completed and a rate reached its threshold
    fn rates_breached(&self, ctx: &CircuitContext) -> bool {
        self.finished_trial(ctx)
            .is_some_and(|trial| ctx.config.rates_breached(&trial))
    }

    /// Every trial call completed and both rates stayed below threshold
    fn trial_passed(&self, ctx: &CircuitContext) -> bool {
        self.finished_trial(ctx)
            .is_some_and(|trial| !ctx.config.rates_breached(&trial))
    }

    fn trial_expired(&self, ctx: &CircuitContext) -> bool {
        let Some(max_wait) = ctx.config.max_wait_duration_in_half_open_state() else {
            return false;
        };
        self.state_data_half_open().is_some_and(|data| {
            ctx.clock.now_millis().saturating_sub(data.entered_at) >= max_wait.as_millis() as u64
        })
    }

    /// Trial tallies once all permitted calls completed
    fn finished_trial(&self, ctx: &CircuitContext) -> Option<WindowSnapshot> {
        self.state_data_half_open()
            .filter(|data| {
                data.completed >= ctx.config.permitted_number_of_calls_in_half_open_state()
            })
            .map(HalfOpenData::tally)
    }
}

impl Circuit<Open> {
    /// Wait elapsed for Open -> HalfOpen, never for a forced circuit
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open().is_some_and(|data| {
            !data.forced && ctx.clock.now_millis().saturating_sub(data.opened_at) >= data.wait_millis
        })
    }
}

/// Mutable runtime state guarded by the breaker mutex
struct Inner {
    machine: DynamicCircuit,
    /// Bumped on every state change; permits from older generations are stale
    generation: u64,
    state_changed_at: u64,
}

impl Inner {
    fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.current_state())
    }
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    context: CircuitContext,
    inner: Mutex<Inner>,
    callbacks: Callbacks,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    not_permitted: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: impl Into<String>, config: Arc<Config>) -> Self {
        Self::with_context_and_callbacks(CircuitContext::new(name, config), Callbacks::new(), None)
    }

    /// Create a circuit breaker with custom context and callbacks (used by builders)
    pub(crate) fn with_context_and_callbacks(
        context: CircuitContext,
        callbacks: Callbacks,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
    ) -> Self {
        let inner = Inner {
            machine: DynamicCircuit::new(context.clone()),
            generation: 0,
            state_changed_at: context.clock.now_millis(),
        };

        Self {
            context,
            inner: Mutex::new(inner),
            callbacks,
            failure_classifier,
            not_permitted: AtomicU64::new(0),
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.context.config
    }

    /// Ask to run one call
    ///
    /// CLOSED always permits. OPEN first checks whether the wait elapsed and
    /// moves to HALF_OPEN if so; otherwise the call is rejected. HALF_OPEN
    /// hands out one of its trial permits, decremented here, before the call
    /// runs. Rejections are counted but never recorded in the window.
    pub fn try_acquire_permission(&self) -> Result<Permit<'_>, CallNotPermitted> {
        let mut transitions = Vec::new();
        let decision = {
            let mut inner = self.lock();
            self.advance(&mut inner, &mut transitions);

            match inner.state() {
                CircuitState::Closed => Ok(inner.generation),
                CircuitState::Open => Err(self.open_retry_after(&inner)),
                CircuitState::HalfOpen => {
                    let granted = inner.machine.half_open_data_mut().is_some_and(|data| {
                        let available = data.permits_remaining > 0;
                        if available {
                            data.permits_remaining -= 1;
                        }
                        available
                    });
                    if granted {
                        Ok(inner.generation)
                    } else {
                        Err(self.half_open_retry_after(&inner))
                    }
                }
            }
        };
        self.announce(transitions);

        match decision {
            Ok(generation) => Ok(Permit {
                breaker: self,
                generation,
                started: Instant::now(),
                settled: false,
            }),
            Err((state, retry_after)) => {
                self.not_permitted.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.context.name, %state, ?retry_after, "call not permitted");
                Err(CallNotPermitted {
                    circuit: self.context.name.clone(),
                    state,
                    retry_after,
                })
            }
        }
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Synchronous calls cannot be pre-empted, so the call timeout is not
    /// enforced here; slowness is still measured and recorded.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: 'static,
    {
        let permit = self.try_acquire_permission()?;

        match f() {
            Ok(value) => {
                permit.on_success();
                Ok(value)
            }
            Err(e) => {
                self.settle_error(permit, &e);
                Err(CircuitError::Execution(e))
            }
        }
    }

    /// Execute an asynchronous operation with circuit breaker protection
    ///
    /// With a call timeout configured the operation is raced against it. On
    /// timeout the future is dropped, the call is recorded once as a slow
    /// failure, and `CircuitError::Timeout` is returned.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let permit = self.try_acquire_permission()?;

        let result = match self.context.config.call_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, f()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(circuit = %self.context.name, ?timeout, "call timed out");
                    permit.on_timeout();
                    return Err(CircuitError::Timeout {
                        circuit: self.context.name.clone(),
                        timeout,
                    });
                }
            },
            None => f().await,
        };

        match result {
            Ok(value) => {
                permit.on_success();
                Ok(value)
            }
            Err(e) => {
                self.settle_error(permit, &e);
                Err(CircuitError::Execution(e))
            }
        }
    }

    /// Current state; never triggers a transition
    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Snapshot of counters and rates; never triggers a transition
    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.lock();
        let state = inner.state();
        let time_in_state = Duration::from_millis(
            self.context
                .clock
                .now_millis()
                .saturating_sub(inner.state_changed_at),
        );

        let mut metrics = CircuitMetrics::from_window(
            &self.context.name,
            state,
            self.context.window.snapshot(),
            time_in_state,
        );
        metrics.not_permitted_calls = self.not_permitted.load(Ordering::Relaxed);
        metrics.half_open_permits = inner
            .machine
            .half_open_data()
            .map(|data| data.permits_remaining)
            .unwrap_or(0);
        metrics.forced_open = inner.machine.open_data().is_some_and(|data| data.forced);
        metrics
    }

    /// Outcomes currently in the sliding window, oldest first
    pub fn outcomes(&self) -> Vec<CallOutcome> {
        self.context.window.outcomes()
    }

    /// Open the circuit regardless of metrics; it stays open until `reset`
    pub fn force_open(&self) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            if inner.state() != CircuitState::Open {
                transitions.extend(self.fire(&mut inner, CircuitEvent::ForceOpen));
            }
            if let Some(data) = inner.machine.open_data_mut() {
                if !data.forced {
                    warn!(circuit = %self.context.name, "circuit forced open");
                }
                data.forced = true;
            }
        }
        self.announce(transitions);
    }

    /// Back to CLOSED with an empty window; clears a forced open
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            let from = inner.state();
            let now = self.context.clock.now_millis();

            self.context.window.reset();
            self.not_permitted.store(0, Ordering::Relaxed);
            inner.machine = DynamicCircuit::new(self.context.clone());
            inner.generation += 1;
            inner.state_changed_at = now;

            (from != CircuitState::Closed).then(|| StateTransition {
                circuit: self.context.name.clone(),
                from,
                to: CircuitState::Closed,
                at_millis: now,
            })
        };
        info!(circuit = %self.context.name, "circuit reset");
        self.announce(transition);
    }

    /// Apply the time-driven transitions (OPEN wait elapsed, HALF_OPEN expired)
    /// without a call attempt; returns the state afterwards
    pub fn check_transition(&self) -> CircuitState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.lock();
            self.advance(&mut inner, &mut transitions);
            inner.state()
        };
        self.announce(transitions);
        state
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time-driven transitions; caller holds the lock
    fn advance(&self, inner: &mut Inner, transitions: &mut Vec<StateTransition>) {
        let event = match inner.state() {
            CircuitState::Open => CircuitEvent::AttemptReset,
            CircuitState::HalfOpen => CircuitEvent::Expire,
            CircuitState::Closed => return,
        };
        if let Some(transition) = self.fire(inner, event) {
            transitions.push(transition);
        }
    }

    /// Run one event through the machine and do the entry bookkeeping of the new state
    fn fire(&self, inner: &mut Inner, event: CircuitEvent) -> Option<StateTransition> {
        let from = inner.state();
        if inner.machine.handle(event).is_err() {
            return None;
        }
        let to = inner.state();
        let now = self.context.clock.now_millis();

        inner.generation += 1;
        inner.state_changed_at = now;

        match to {
            CircuitState::Open => {
                let wait_millis = self.open_wait_millis();
                if let Some(data) = inner.machine.open_data_mut() {
                    data.opened_at = now;
                    data.wait_millis = wait_millis;
                }
            }
            CircuitState::HalfOpen => {
                self.context.window.reset();
                let permits = self
                    .context
                    .config
                    .permitted_number_of_calls_in_half_open_state();
                if let Some(data) = inner.machine.half_open_data_mut() {
                    data.entered_at = now;
                    data.permits_remaining = permits;
                    data.completed = 0;
                    data.failures = 0;
                    data.slow = 0;
                }
            }
            CircuitState::Closed => self.context.window.reset(),
        }

        Some(StateTransition {
            circuit: self.context.name.clone(),
            from,
            to,
            at_millis: now,
        })
    }

    /// OPEN wait, jittered with chrono-machines when configured
    fn open_wait_millis(&self) -> u64 {
        let base_ms = self.context.config.wait_duration_in_open_state().as_millis() as u64;
        let jitter = self.context.config.jitter_factor();
        if jitter > 0.0 {
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: base_ms,
                multiplier: 1.0,
                max_delay_ms: base_ms,
            };
            policy.calculate_delay(1, jitter) as u64
        } else {
            base_ms
        }
    }

    fn open_retry_after(&self, inner: &Inner) -> (CircuitState, Duration) {
        let retry_after = match inner.machine.open_data() {
            Some(data) if data.forced => Duration::MAX,
            Some(data) => {
                let elapsed = self.context.clock.now_millis().saturating_sub(data.opened_at);
                Duration::from_millis(data.wait_millis.saturating_sub(elapsed))
            }
            None => Duration::ZERO,
        };
        (CircuitState::Open, retry_after)
    }

    fn half_open_retry_after(&self, inner: &Inner) -> (CircuitState, Duration) {
        let retry_after = match (
            self.context.config.max_wait_duration_in_half_open_state(),
            inner.machine.half_open_data(),
        ) {
            (Some(max_wait), Some(data)) => {
                let elapsed = self.context.clock.now_millis().saturating_sub(data.entered_at);
                Duration::from_millis((max_wait.as_millis() as u64).saturating_sub(elapsed))
            }
            _ => Duration::ZERO,
        };
        (CircuitState::HalfOpen, retry_after)
    }

    /// Record a completed call and evaluate transitions
    fn complete(&self, generation: u64, success: bool, timed_out: bool, elapsed: Duration) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(
                    circuit = %self.context.name,
                    "discarding outcome of a call admitted before the last state change"
                );
                return;
            }

            let outcome = CallOutcome {
                success,
                duration_millis: elapsed.as_millis() as u64,
                timestamp_millis: self.context.clock.now_millis(),
                timed_out,
            };
            let slow_threshold_millis =
                self.context.config.slow_call_duration_threshold().as_millis() as u64;
            self.context.window.record(outcome);

            match inner.state() {
                CircuitState::Closed => {
                    if let Some(transition) = self.fire(&mut inner, CircuitEvent::Trip) {
                        transitions.push(transition);
                    }
                }
                CircuitState::HalfOpen => {
                    if let Some(data) = inner.machine.half_open_data_mut() {
                        data.completed += 1;
                        data.failures += usize::from(!outcome.success);
                        data.slow += usize::from(outcome.is_slow(slow_threshold_millis));
                    }
                    for event in [CircuitEvent::Trip, CircuitEvent::Close, CircuitEvent::Expire] {
                        if let Some(transition) = self.fire(&mut inner, event) {
                            transitions.push(transition);
                            break;
                        }
                    }
                }
                // a live permit always belongs to Closed or HalfOpen
                CircuitState::Open => {}
            }
        }
        self.announce(transitions);
    }

    /// Hand an unused HALF_OPEN permit back
    fn release(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if let Some(data) = inner.machine.half_open_data_mut() {
            data.permits_remaining += 1;
        }
    }

    fn settle_error<E: 'static>(&self, permit: Permit<'_>, error: &E) {
        let record = match &self.failure_classifier {
            Some(classifier) => classifier.should_record(&FailureContext {
                circuit_name: &self.context.name,
                error: error as &dyn std::any::Any,
                elapsed: permit.elapsed(),
            }),
            None => true,
        };

        if record {
            permit.on_error();
        } else {
            debug!(circuit = %self.context.name, "error ignored by failure classifier");
            permit.release();
        }
    }

    /// Log and fan out transitions; called with the lock released
    fn announce(&self, transitions: impl IntoIterator<Item = StateTransition>) {
        for transition in transitions {
            match transition.to {
                CircuitState::Open => warn!(
                    circuit = %transition.circuit,
                    from = %transition.from,
                    "circuit opened, rejecting calls"
                ),
                CircuitState::HalfOpen => info!(
                    circuit = %transition.circuit,
                    from = %transition.from,
                    "circuit half-open, probing"
                ),
                CircuitState::Closed => info!(
                    circuit = %transition.circuit,
                    from = %transition.from,
                    "circuit closed"
                ),
            }
            self.callbacks.notify(&transition);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// Admission token for one call
///
/// Complete it with `on_success`, `on_error` or `on_timeout`. Dropping it
/// unsettled (cancelled future, ignored error) hands a HALF_OPEN trial permit
/// back instead of leaking it.
#[must_use = "a permit should be completed with on_success, on_error or on_timeout"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    started: Instant,
    settled: bool,
}

impl Permit<'_> {
    /// Time since the permit was granted
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn on_success(mut self) {
        self.settle(true, false);
    }

    pub fn on_error(mut self) {
        self.settle(false, false);
    }

    /// Record a failure that also counts as slow
    pub fn on_timeout(mut self) {
        self.settle(false, true);
    }

    /// Give the permit back without recording anything
    pub fn release(self) {}

    fn settle(&mut self, success: bool, timed_out: bool) {
        self.settled = true;
        self.breaker
            .complete(self.generation, success, timed_out, self.started.elapsed());
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

impl std::fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("circuit", &self.breaker.name())
            .field("generation", &self.generation)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn breaker(config: Config) -> CircuitBreaker {
        CircuitBreaker::new("test", Arc::new(config))
    }

    fn small_config() -> Config {
        Config::builder()
            .failure_rate_threshold(50.0)
            .minimum_number_of_calls(4)
            .count_window(4)
            .build()
            .unwrap()
    }

    fn half_open_config(permitted: usize) -> Config {
        Config::builder()
            .failure_rate_threshold(50.0)
            .minimum_number_of_calls(2)
            .count_window(4)
            .wait_duration_in_open_state(Duration::from_millis(100))
            .permitted_number_of_calls_in_half_open_state(permitted)
            .build()
            .unwrap()
    }

    fn fail(circuit: &CircuitBreaker) {
        let _ = circuit.call(|| Err::<(), _>("error"));
    }

    fn succeed(circuit: &CircuitBreaker) {
        let _ = circuit.call(|| Ok::<_, &str>(()));
    }

    fn open_then_wait(circuit: &CircuitBreaker) {
        fail(circuit);
        fail(circuit);
        assert!(circuit.is_open());
        thread::sleep(Duration::from_millis(150));
    }

    #[test]
    fn test_circuit_breaker_creation() {
        let circuit = breaker(Config::default());

        assert!(circuit.is_closed());
        assert!(!circuit.is_open());
        assert_eq!(circuit.name(), "test");
    }

    #[test]
    fn test_half_failures_at_minimum_calls_opens() {
        let circuit = breaker(small_config());

        fail(&circuit);
        fail(&circuit);
        succeed(&circuit);
        assert!(circuit.is_closed());
        succeed(&circuit);

        assert!(circuit.is_open());
    }

    #[test]
    fn test_quarter_failures_stays_closed() {
        let circuit = breaker(small_config());

        fail(&circuit);
        succeed(&circuit);
        succeed(&circuit);
        succeed(&circuit);

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().failure_rate, 25.0);
    }

    #[test]
    fn test_minimum_calls_prevents_premature_trip() {
        let config = Config::builder()
            .minimum_number_of_calls(5)
            .count_window(10)
            .build()
            .unwrap();
        let circuit = breaker(config);

        for _ in 0..4 {
            fail(&circuit);
        }

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().failure_rate, 100.0);

        fail(&circuit);
        assert!(circuit.is_open());
    }

    #[test]
    fn test_open_rejects_without_invoking() {
        let circuit = breaker(small_config());
        for _ in 0..4 {
            fail(&circuit);
        }
        assert!(circuit.is_open());

        let invoked = AtomicUsize::new(0);
        for _ in 0..5 {
            let result = circuit.call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            });
            match result {
                Err(CircuitError::Open {
                    circuit: name,
                    state,
                    retry_after,
                }) => {
                    assert_eq!(name, "test");
                    assert_eq!(state, CircuitState::Open);
                    assert!(retry_after <= Duration::from_secs(60));
                    assert!(retry_after > Duration::from_secs(50));
                }
                other => panic!("expected Open, got {:?}", other),
            }
        }

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 4, "rejections must not be recorded");
        assert_eq!(metrics.not_permitted_calls, 5);
    }

    #[test]
    fn test_operation_error_passes_through_unchanged() {
        #[derive(Debug, PartialEq)]
        struct Fault {
            code: u32,
        }

        let circuit = breaker(Config::default());
        let result = circuit.call(|| Err::<(), _>(Fault { code: 7 }));

        assert_eq!(result.unwrap_err().into_execution(), Some(Fault { code: 7 }));
    }

    #[test]
    fn test_half_open_two_successes_close() {
        let circuit = breaker(half_open_config(2));
        open_then_wait(&circuit);

        succeed(&circuit);
        assert!(circuit.is_half_open());
        succeed(&circuit);

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().total_calls, 0, "closing clears the window");
    }

    #[test]
    fn test_half_open_two_failures_reopen() {
        let circuit = breaker(half_open_config(2));
        open_then_wait(&circuit);

        fail(&circuit);
        assert!(circuit.is_half_open());
        fail(&circuit);

        assert!(circuit.is_open());
    }

    #[test]
    fn test_half_open_single_failure_at_threshold_reopens() {
        let circuit = breaker(half_open_config(2));
        open_then_wait(&circuit);

        succeed(&circuit);
        fail(&circuit);

        // 1 of 2 trial calls failed = 50%, which reaches the threshold
        assert!(circuit.is_open());
    }

    #[test]
    fn test_half_open_verdict_covers_trials_evicted_from_window() {
        let config = Config::builder()
            .failure_rate_threshold(50.0)
            .minimum_number_of_calls(2)
            .count_window(2)
            .wait_duration_in_open_state(Duration::from_millis(100))
            .permitted_number_of_calls_in_half_open_state(4)
            .build()
            .unwrap();
        let circuit = breaker(config);
        open_then_wait(&circuit);

        fail(&circuit);
        fail(&circuit);
        succeed(&circuit);
        assert!(circuit.is_half_open());
        succeed(&circuit);

        // the window only holds the two successes; 2 of 4 trials failed
        assert_eq!(circuit.metrics().failed_calls, 0);
        assert!(circuit.is_open());
    }

    #[test]
    fn test_half_open_slow_trials_reopen() {
        let config = Config::builder()
            .minimum_number_of_calls(1)
            .count_window(1)
            .wait_duration_in_open_state(Duration::from_millis(50))
            .permitted_number_of_calls_in_half_open_state(2)
            .slow_call_duration_threshold(Duration::from_millis(10))
            .slow_call_rate_threshold(50.0)
            .build()
            .unwrap();
        let circuit = breaker(config);

        fail(&circuit);
        assert!(circuit.is_open());
        thread::sleep(Duration::from_millis(70));

        let _ = circuit.call(|| {
            thread::sleep(Duration::from_millis(25));
            Ok::<_, &str>(())
        });
        succeed(&circuit);

        assert!(circuit.is_open());
    }

    #[test]
    fn test_half_open_admits_exactly_permitted_calls() {
        let circuit = breaker(half_open_config(2));
        open_then_wait(&circuit);

        let first = circuit.try_acquire_permission().expect("first trial");
        assert!(circuit.is_half_open());
        let second = circuit.try_acquire_permission().expect("second trial");

        let third = circuit.try_acquire_permission().unwrap_err();
        assert_eq!(third.state, CircuitState::HalfOpen);
        assert_eq!(circuit.metrics().half_open_permits, 0);

        first.on_success();
        assert!(circuit.try_acquire_permission().is_err());
        second.on_success();

        assert!(circuit.is_closed());
    }

    #[test]
    fn test_dropped_permit_is_released() {
        let circuit = breaker(half_open_config(1));
        open_then_wait(&circuit);

        {
            let _permit = circuit.try_acquire_permission().expect("trial permit");
            assert_eq!(circuit.metrics().half_open_permits, 0);
        }

        assert_eq!(circuit.metrics().half_open_permits, 1);
        succeed(&circuit);
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_half_open_max_wait_expires_back_to_open() {
        let config = Config::builder()
            .minimum_number_of_calls(1)
            .wait_duration_in_open_state(Duration::from_millis(50))
            .permitted_number_of_calls_in_half_open_state(3)
            .max_wait_duration_in_half_open_state(Duration::from_millis(50))
            .build()
            .unwrap();
        let circuit = breaker(config);

        fail(&circuit);
        assert!(circuit.is_open());
        thread::sleep(Duration::from_millis(70));

        succeed(&circuit);
        assert!(circuit.is_half_open());
        thread::sleep(Duration::from_millis(70));

        assert_eq!(circuit.check_transition(), CircuitState::Open);
    }

    #[test]
    fn test_force_open_denies_healthy_circuit_until_reset() {
        let config = Config::builder()
            .wait_duration_in_open_state(Duration::from_millis(20))
            .build()
            .unwrap();
        let circuit = breaker(config);
        succeed(&circuit);

        circuit.force_open();
        circuit.force_open();
        assert!(circuit.is_open());
        assert!(circuit.metrics().forced_open);

        thread::sleep(Duration::from_millis(40));
        let rejected = circuit.try_acquire_permission().unwrap_err();
        assert_eq!(rejected.retry_after, Duration::MAX);
        assert!(circuit.is_open());

        circuit.reset();
        assert!(circuit.is_closed());
        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 0);
        assert!(!metrics.forced_open);
        assert_eq!(metrics.not_permitted_calls, 0);

        circuit.reset();
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_observers_do_not_transition() {
        let circuit = breaker(half_open_config(2));
        open_then_wait(&circuit);

        let before = circuit.metrics();
        for _ in 0..3 {
            assert_eq!(circuit.state(), CircuitState::Open);
        }
        let after = circuit.metrics();

        assert_eq!(before.state, after.state);
        assert_eq!(before.total_calls, after.total_calls);
        assert_eq!(before.not_permitted_calls, after.not_permitted_calls);
    }

    #[test]
    fn test_check_transition_promotes_after_wait() {
        let circuit = breaker(half_open_config(2));
        fail(&circuit);
        fail(&circuit);

        assert_eq!(circuit.check_transition(), CircuitState::Open);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(circuit.check_transition(), CircuitState::HalfOpen);
        assert_eq!(circuit.metrics().half_open_permits, 2);
    }

    #[test]
    fn test_slow_calls_trip_the_circuit() {
        let config = Config::builder()
            .minimum_number_of_calls(2)
            .count_window(2)
            .slow_call_duration_threshold(Duration::from_millis(10))
            .slow_call_rate_threshold(50.0)
            .build()
            .unwrap();
        let circuit = breaker(config);

        succeed(&circuit);
        let _ = circuit.call(|| {
            thread::sleep(Duration::from_millis(25));
            Ok::<_, &str>(())
        });

        let metrics = circuit.metrics();
        assert_eq!(metrics.failed_calls, 0);
        assert_eq!(metrics.slow_calls, 1);
        assert_eq!(metrics.state, CircuitState::Open);
    }

    #[test]
    fn test_stale_outcome_is_discarded() {
        let circuit = breaker(small_config());

        let permit = circuit.try_acquire_permission().expect("closed permits");
        circuit.force_open();
        circuit.reset();
        permit.on_error();

        assert_eq!(circuit.metrics().total_calls, 0);
    }

    #[test]
    fn test_classifier_ignored_errors_are_not_recorded() {
        use crate::classifier::PredicateClassifier;

        let classifier = Arc::new(PredicateClassifier::new(|ctx| {
            ctx.error
                .downcast_ref::<&str>()
                .map(|e| e.starts_with("server"))
                .unwrap_or(true)
        }));

        let circuit = CircuitBreaker::builder("test")
            .minimum_number_of_calls(2)
            .count_window(2)
            .failure_classifier(classifier)
            .build()
            .unwrap();

        for _ in 0..5 {
            let result = circuit.call(|| Err::<(), _>("client_error"));
            assert!(matches!(result, Err(CircuitError::Execution("client_error"))));
        }
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().total_calls, 0);

        let _ = circuit.call(|| Err::<(), _>("server_error_1"));
        let _ = circuit.call(|| Err::<(), _>("server_error_2"));
        assert!(circuit.is_open());
    }

    #[test]
    fn test_callbacks_fire_per_transition() {
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let opened_clone = Arc::clone(&opened);
        let closed_clone = Arc::clone(&closed);
        let seen_clone = Arc::clone(&seen);

        let circuit = CircuitBreaker::builder("test")
            .minimum_number_of_calls(2)
            .count_window(4)
            .wait_duration_in_open_state(Duration::from_millis(30))
            .permitted_number_of_calls_in_half_open_state(1)
            .on_open(move |_name| {
                opened_clone.fetch_add(1, Ordering::SeqCst);
            })
            .on_close(move |_name| {
                closed_clone.fetch_add(1, Ordering::SeqCst);
            })
            .on_state_transition(move |t| {
                seen_clone.lock().unwrap().push((t.from, t.to));
            })
            .build()
            .unwrap();

        fail(&circuit);
        fail(&circuit);
        fail(&circuit);
        thread::sleep(Duration::from_millis(50));
        succeed(&circuit);

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_callback_may_reenter_breaker() {
        use std::sync::{OnceLock, Weak};

        let slot: Arc<OnceLock<Weak<CircuitBreaker>>> = Arc::new(OnceLock::new());
        let observed = Arc::new(Mutex::new(None));

        let handle = Arc::clone(&slot);
        let sink = Arc::clone(&observed);
        let circuit = Arc::new(
            CircuitBreaker::builder("test")
                .minimum_number_of_calls(1)
                .on_state_transition(move |_| {
                    if let Some(circuit) = handle.get().and_then(Weak::upgrade) {
                        *sink.lock().unwrap() = Some(circuit.metrics().state);
                    }
                })
                .build()
                .unwrap(),
        );
        slot.set(Arc::downgrade(&circuit)).unwrap();

        fail(&circuit);

        assert!(circuit.is_open());
        assert_eq!(*observed.lock().unwrap(), Some(CircuitState::Open));
    }

    #[test]
    fn test_jitter_shortens_wait_within_bounds() {
        let config = Config::builder()
            .minimum_number_of_calls(1)
            .wait_duration_in_open_state(Duration::from_millis(1000))
            .jitter_factor(0.25)
            .build()
            .unwrap();

        for _ in 0..20 {
            let circuit = breaker(config.clone());
            fail(&circuit);

            let wait = circuit.lock().machine.open_data().map(|d| d.wait_millis);
            let wait = wait.expect("open data");
            assert!((740..=1010).contains(&wait), "wait {} out of range", wait);
        }
    }

    #[test]
    fn test_concurrent_successes_never_open() {
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&transitions);

        let circuit = Arc::new(
            CircuitBreaker::builder("test")
                .minimum_number_of_calls(5)
                .count_window(20)
                .on_state_transition(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap(),
        );

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let circuit = Arc::clone(&circuit);
                thread::spawn(move || circuit.call(|| Ok::<_, &str>(())).is_ok())
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(transitions.load(Ordering::SeqCst), 0);
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().total_calls, 20);
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);

        let circuit = Arc::new(
            CircuitBreaker::builder("test")
                .minimum_number_of_calls(10)
                .count_window(10)
                .on_open(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap(),
        );

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let circuit = Arc::clone(&circuit);
                thread::spawn(move || {
                    let _ = circuit.call(|| Err::<(), _>("down"));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(circuit.is_open());
    }

    #[tokio::test]
    async fn test_execute_success_and_failure() {
        let circuit = breaker(small_config());

        let ok = circuit.execute(|| async { Ok::<_, String>(5) }).await;
        assert_eq!(ok.unwrap(), 5);

        let err = circuit
            .execute(|| async { Err::<u8, _>("refused".to_string()) })
            .await;
        assert_eq!(err.unwrap_err().into_execution(), Some("refused".to_string()));

        let metrics = circuit.metrics();
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.failed_calls, 1);
    }

    #[tokio::test]
    async fn test_execute_timeout_recorded_once_as_slow_failure() {
        let config = Config::builder()
            .call_timeout(Duration::from_millis(30))
            .build()
            .unwrap();
        let circuit = breaker(config);
        let finished = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&finished);
        let result = circuit
            .execute(|| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        match result {
            Err(CircuitError::Timeout { circuit: name, timeout }) => {
                assert_eq!(name, "test");
                assert_eq!(timeout, Duration::from_millis(30));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 0, "abandoned future must not complete");
        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.slow_calls, 1);
        let outcomes = circuit.outcomes();
        assert!(outcomes[0].timed_out);
    }

    #[tokio::test]
    async fn test_execute_rejected_while_open() {
        let circuit = breaker(small_config());
        circuit.force_open();

        let invoked = AtomicUsize::new(0);
        let result = circuit
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }
}
