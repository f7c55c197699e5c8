//! Failure classification
//!
//! Decides which operation errors count against a service. Errors a
//! classifier ignores are still returned to the caller unchanged; they just
//! never reach the sliding window.

use std::any::Any;
use std::time::Duration;

/// What a classifier gets to look at
#[derive(Debug)]
pub struct FailureContext<'a> {
    pub circuit_name: &'a str,
    /// The operation's error (can be downcast to the concrete type)
    pub error: &'a dyn Any,
    pub elapsed: Duration,
}

/// Decides whether an error is recorded as a failure
///
/// # Examples
///
/// ```rust
/// use service_breaker::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct ServerErrorsOnly;
///
/// impl FailureClassifier for ServerErrorsOnly {
///     fn should_record(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error
///             .downcast_ref::<u16>()
///             .map(|status| *status >= 500)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// `true` records the error as a failure, `false` ignores it
    fn should_record(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Records every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_record(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Classifier backed by a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_record(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
