//! Transport abstractions and receiver backends.
//!
//! This module defines the broker-facing boundary the consumption engine
//! relies on: a stream of raw deliveries and the primitives to acknowledge or
//! reject each one exactly once.
//!
//! ## Key components
//!
//! - [`Delivery`]: one raw broker delivery before decoding
//! - [`ReceiveDeliveries`]: trait yielding a cancellable delivery stream
//! - [`Acknowledge`]: trait exposing the accept/reject primitives
//! - [`TransportError`]: unified error type with tracing context
//!
//! Concrete backends are provided by submodules such as [`InMemory`] and
//! [`rabbitmq`] (feature-gated).

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::collections::HashMap;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::envelope::DeliveryHandle;

pub use inmemory::InMemory;

/// One raw delivery handed over by the broker.
///
/// The payload is still encoded; the subscription decodes it into an
/// [`Envelope`](crate::Envelope) before dispatching.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Encoded message payload.
    pub payload: Vec<u8>,
    /// Transport metadata as string pairs.
    pub headers: HashMap<String, String>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Handle for the later acknowledgment action.
    pub handle: DeliveryHandle,
}

/// Trait for streaming raw deliveries from a queue subscription.
///
/// The returned stream should:
/// - Yield deliveries in broker order
/// - Respect cancellation via the provided [`CancellationToken`]
///
/// `prefetch` is an advisory bound on how many unacknowledged deliveries the
/// transport should hand out concurrently; backends may ignore it.
#[async_trait]
pub trait ReceiveDeliveries {
    /// Backend-specific error type.
    type Error;

    /// Stream deliveries until exhaustion or cancellation.
    async fn deliveries(
        &self,
        prefetch: usize,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Delivery, Self::Error>>, Self::Error>;
}

/// Trait exposing the broker acknowledgment primitives.
///
/// The broker does not guarantee idempotency: callers must issue exactly one
/// action per delivery handle. The consumption engine upholds this by
/// construction.
#[async_trait]
pub trait Acknowledge {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Acknowledge a delivery as successfully processed.
    async fn accept(&self, handle: &DeliveryHandle) -> Result<(), Self::Error>;

    /// Negatively acknowledge a delivery, optionally asking the broker to
    /// redeliver it.
    async fn reject(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), Self::Error>;
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the broker connection or channel.
    Broker(tower::BoxError),
    /// An acknowledgment action was attempted on a handle that carries no
    /// delivery tag.
    MissingHandle,
}

impl TransportError {
    /// Create a broker-related transport error.
    pub fn broker(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Broker(err),
        }
    }

    /// Create a missing-handle transport error.
    pub fn missing_handle() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::MissingHandle,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
            TransportErrorKind::MissingHandle => {
                writeln!(f, "No delivery tag available to acknowledge")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Broker(err) => Some(err.as_ref()),
            TransportErrorKind::MissingHandle => None,
        }
    }
}
