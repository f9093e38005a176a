//! Consumption strategies and their selection.
//!
//! A behavior is the processing strategy behind one queue subscription. It
//! accepts envelopes one at a time, runs the user consumer, and reports every
//! envelope's outcome through the registered completion or error callback
//! exactly once.
//!
//! ## Key components
//!
//! - [`ConsumerBehavior`]: strategy interface the subscription drives
//! - [`DefaultBehavior`]: bounded-concurrency single-message processing
//! - [`BatchBehavior`]: size/time triggered batch processing
//! - [`BehaviorFactory`]: picks the strategy from the provider's capability
//!
//! Selection happens once at subscription setup, never per message.

mod batch;
mod single;

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use tracing_error::SpanTrace;

use crate::{
    consumer::{Capability, ProvideConsumer},
    policy::ResolvedPolicy,
    Envelope,
};

pub use batch::BatchBehavior;
pub use single::DefaultBehavior;

/// Terminal result of processing one envelope.
///
/// Produced exactly once per envelope by a behavior and consumed exactly once
/// by the callback wiring.
#[derive(Debug)]
pub enum Outcome<M> {
    /// The consumer processed the envelope.
    Success(Envelope<M>),
    /// The consumer failed, panicked, or could not be constructed.
    Failure(Envelope<M>),
}

/// Future returned by an outcome callback.
pub type AckFuture = Pin<Box<dyn Future<Output = Result<(), tower::BoxError>> + Send>>;

/// Callback invoked with an envelope once its outcome is known.
///
/// Callback errors are logged by the behaviors and never abort the pipeline.
pub type OutcomeCallback<M> = Arc<dyn Fn(Envelope<M>) -> AckFuture + Send + Sync>;

/// Processing strategy for one queue subscription.
///
/// One behavior instance exists per (consumer type, queue) pair and lives as
/// long as the subscription. Callbacks are registered once, at setup, before
/// the first envelope is admitted.
#[async_trait]
pub trait ConsumerBehavior<M>: Send + Sync {
    /// Admit one envelope into the strategy.
    ///
    /// Returns once the envelope is admitted, not once it is processed;
    /// processing is asynchronous relative to the caller. Admission stalls
    /// while the strategy is at capacity.
    async fn consume(&self, envelope: Envelope<M>);

    /// Register the callback invoked for successful envelopes.
    fn register_completion_callback(&self, callback: OutcomeCallback<M>);

    /// Register the callback invoked for failed envelopes.
    fn register_error_callback(&self, callback: OutcomeCallback<M>);

    /// Advisory bound on unacknowledged deliveries the transport should hand
    /// to this strategy.
    fn prefetch_hint(&self) -> usize;
}

/// Selects and builds the strategy for a consumer provider.
pub struct BehaviorFactory;

impl BehaviorFactory {
    /// Build the behavior matching the provider's advertised capability.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupError`] when the provider advertises no processing
    /// capability. This is a configuration error and fails subscription
    /// setup.
    pub fn create<M>(
        provider: Arc<dyn ProvideConsumer<M>>,
        policy: &ResolvedPolicy,
    ) -> Result<Box<dyn ConsumerBehavior<M>>, SetupError>
    where
        M: Send + 'static,
    {
        match provider.capability() {
            Some(Capability::Single) => Ok(Box::new(DefaultBehavior::new(provider, policy))),
            Some(Capability::Batch) => Ok(Box::new(BatchBehavior::new(provider, policy))),
            None => Err(SetupError::no_capability(provider.name())),
        }
    }
}

/// Error returned when no strategy can be selected for a consumer.
#[derive(Debug)]
pub struct SetupError {
    context: SpanTrace,
    kind: SetupErrorKind,
}

#[derive(Debug)]
enum SetupErrorKind {
    NoCapability { consumer: String },
}

impl SetupError {
    fn no_capability(consumer: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SetupErrorKind::NoCapability {
                consumer: consumer.to_owned(),
            },
        }
    }
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SetupErrorKind::NoCapability { consumer } => writeln!(
                f,
                "Cannot create a behavior for {consumer}: no processing capability advertised"
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SetupError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{BatchConsumer, Consumer, ProvideError};
    use crate::policy::PolicyConfig;

    struct SingleProvider;

    #[async_trait]
    impl ProvideConsumer<u64> for SingleProvider {
        fn name(&self) -> &str {
            "single"
        }

        fn capability(&self) -> Option<Capability> {
            Some(Capability::Single)
        }

        async fn consumer(&self) -> Result<Box<dyn Consumer<u64>>, ProvideError> {
            Ok(Box::new(Noop))
        }
    }

    struct BatchProvider;

    #[async_trait]
    impl ProvideConsumer<u64> for BatchProvider {
        fn name(&self) -> &str {
            "batch"
        }

        fn capability(&self) -> Option<Capability> {
            Some(Capability::Batch)
        }

        async fn batch_consumer(&self) -> Result<Box<dyn BatchConsumer<u64>>, ProvideError> {
            Ok(Box::new(Noop))
        }
    }

    struct UnboundProvider;

    #[async_trait]
    impl ProvideConsumer<u64> for UnboundProvider {
        fn name(&self) -> &str {
            "unbound"
        }
    }

    struct Noop;

    #[async_trait]
    impl Consumer<u64> for Noop {
        async fn consume(&self, _envelope: &Envelope<u64>) -> Result<(), tower::BoxError> {
            Ok(())
        }
    }

    #[async_trait]
    impl BatchConsumer<u64> for Noop {
        async fn consume(&self, _batch: &[Envelope<u64>]) -> Result<(), tower::BoxError> {
            Ok(())
        }
    }

    #[test]
    fn selects_by_advertised_capability() {
        let policy = PolicyConfig::default().resolve("any");

        assert!(BehaviorFactory::create(Arc::new(SingleProvider), &policy).is_ok());
        assert!(BehaviorFactory::create(Arc::new(BatchProvider), &policy).is_ok());
    }

    #[test]
    fn fails_without_a_capability() {
        let policy = PolicyConfig::default().resolve("any");

        let err = BehaviorFactory::create(Arc::new(UnboundProvider), &policy)
            .map(|_| ())
            .unwrap_err();

        assert!(err.to_string().contains("unbound"));
    }

    #[test]
    fn prefetch_hint_is_twice_the_capacity() {
        let config = PolicyConfig {
            default_batch_size: Some(4),
            ..PolicyConfig::default()
        };
        let policy = config.resolve("any");

        let behavior = BehaviorFactory::create(Arc::new(SingleProvider), &policy).unwrap();
        assert_eq!(behavior.prefetch_hint(), 8);

        let behavior = BehaviorFactory::create(Arc::new(BatchProvider), &policy).unwrap();
        assert_eq!(behavior.prefetch_hint(), 8);
    }
}
