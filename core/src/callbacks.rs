//! Callback system for circuit breaker state transitions

use crate::state::{CircuitState, StateTransition};
use std::sync::Arc;

pub type StateHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type TransitionListener = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// Callbacks for circuit breaker events
///
/// Invoked after the breaker lock is released, so a callback may safely call
/// back into the breaker.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<StateHook>,
    pub on_close: Option<StateHook>,
    pub on_half_open: Option<StateHook>,
    pub listeners: Vec<TransitionListener>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: TransitionListener) {
        self.listeners.push(listener);
    }

    /// Fan a transition out to every listener, then to the hook of the target state
    pub fn notify(&self, transition: &StateTransition) {
        for listener in &self.listeners {
            listener(transition);
        }

        let hook = match transition.to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = hook {
            callback(&transition.circuit);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
