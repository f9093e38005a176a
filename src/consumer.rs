//! Consumer capabilities and scoped construction.
//!
//! A consumer type implements one of two processing capabilities:
//!
//! - [`Consumer`]: processes one message at a time
//! - [`BatchConsumer`]: processes a whole batch in a single call
//!
//! Consumers are not long-lived services. The engine asks a
//! [`ProvideConsumer`] for a fresh instance per envelope (single dispatch) or
//! per batch (batched dispatch), so instances are never shared across
//! concurrent invocations. Construction may fail, e.g. when a dependency of
//! the consumer cannot be resolved; the engine degrades instead of crashing
//! the subscription.

use async_trait::async_trait;
use tracing_error::SpanTrace;

use crate::Envelope;

/// Consumer that processes one message at a time.
#[async_trait]
pub trait Consumer<M>: Send + Sync {
    /// Process a single envelope.
    ///
    /// Returning an error marks the envelope as failed and subjects it to the
    /// requeue policy. The handler should observe `envelope.cancel` to abort
    /// cooperatively; the engine never terminates a running handler.
    async fn consume(&self, envelope: &Envelope<M>) -> Result<(), tower::BoxError>;
}

/// Consumer that processes an entire batch in one call.
#[async_trait]
pub trait BatchConsumer<M>: Send + Sync {
    /// Process a full batch of envelopes.
    ///
    /// The outcome applies to the whole batch: on success every envelope is
    /// acknowledged, on error every envelope goes through the requeue policy.
    async fn consume(&self, batch: &[Envelope<M>]) -> Result<(), tower::BoxError>;
}

/// Processing capability a consumer type implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// One message per invocation.
    Single,
    /// An array of messages per invocation.
    Batch,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Single => write!(f, "single-message"),
            Capability::Batch => write!(f, "batch"),
        }
    }
}

/// Scoped constructor for consumer instances.
///
/// This is the seam towards whatever builds handlers and their dependencies
/// (a DI container, a factory closure, a plain constructor). The engine calls
/// it once per unit of work and drops the instance afterwards.
///
/// Implementations override [`capability`](ProvideConsumer::capability) to
/// advertise which processing capability their consumer type implements, and
/// the matching construction method. The defaults advertise nothing, which
/// makes subscription setup fail with a configuration error.
#[async_trait]
pub trait ProvideConsumer<M>: Send + Sync {
    /// Identifier of the consumer type, used for policy lookup and logging.
    fn name(&self) -> &str;

    /// The processing capability the consumer type implements, if any.
    fn capability(&self) -> Option<Capability> {
        None
    }

    /// Build a fresh single-message consumer.
    async fn consumer(&self) -> Result<Box<dyn Consumer<M>>, ProvideError> {
        Err(ProvideError::unsupported(self.name(), Capability::Single))
    }

    /// Build a fresh batch consumer.
    async fn batch_consumer(&self) -> Result<Box<dyn BatchConsumer<M>>, ProvideError> {
        Err(ProvideError::unsupported(self.name(), Capability::Batch))
    }
}

/// Error returned when a consumer instance cannot be built.
#[derive(Debug)]
pub struct ProvideError {
    context: SpanTrace,
    kind: ProvideErrorKind,
}

/// Construction errors kind.
#[derive(Debug)]
pub enum ProvideErrorKind {
    /// The provider failed to resolve or build the consumer.
    Construction(tower::BoxError),
    /// The provider does not support the requested capability.
    Unsupported {
        /// Consumer type identifier.
        consumer: String,
        /// Capability that was requested.
        capability: Capability,
    },
}

impl ProvideError {
    /// Create a construction-related provider error.
    pub fn construction(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ProvideErrorKind::Construction(err),
        }
    }

    /// Create an unsupported-capability provider error.
    pub fn unsupported(consumer: &str, capability: Capability) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ProvideErrorKind::Unsupported {
                consumer: consumer.to_owned(),
                capability,
            },
        }
    }
}

impl std::fmt::Display for ProvideError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ProvideErrorKind::Construction(err) => {
                writeln!(f, "Failed to construct consumer: {err}")
            }
            ProvideErrorKind::Unsupported {
                consumer,
                capability,
            } => writeln!(
                f,
                "Consumer {consumer} does not implement the {capability} capability"
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProvideError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ProvideErrorKind::Construction(err) => Some(err.as_ref()),
            ProvideErrorKind::Unsupported { .. } => None,
        }
    }
}
