//! Subscription coordinator for one queue.
//!
//! This module wires a consumption strategy to a broker transport:
//!
//! - Selects the strategy from the consumer provider's capability
//! - Registers the acknowledgment callbacks, including the requeue policy
//! - Decodes raw deliveries into [`Envelope`]s and feeds the strategy
//! - Exposes lifecycle hooks for observability and customization
//!
//! The subscription runs until:
//! - The delivery stream ends
//! - A fatal transport error occurs
//! - A [`CancellationToken`] is triggered
//!
//! ## Acknowledgment policy
//!
//! Successful envelopes are acknowledged. Failed envelopes go through a
//! requeue state machine: first-delivery failures are requeued (unless
//! `requeue_on_error` is off), redelivered failures are discarded, and with
//! `never_discard` a non-requeueable failure is left unacknowledged at the
//! broker instead of being dropped. An envelope without a delivery handle
//! never reaches the broker primitives at all.

use std::sync::Arc;

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    behavior::{AckFuture, BehaviorFactory, ConsumerBehavior, OutcomeCallback, SetupError},
    consumer::ProvideConsumer,
    envelope::{DeliveryHandle, Envelope},
    policy::{PolicyConfig, ResolvedPolicy},
    transport::{Acknowledge, Delivery, ReceiveDeliveries},
};

/// Consumption coordinator for one queue subscription.
///
/// Generic parameters:
/// - `M`: decoded message type
/// - `T`: transport implementing [`ReceiveDeliveries`] and [`Acknowledge`]
/// - `D`: payload decoder, JSON by default
/// - `HK`: hook implementation for lifecycle events
pub struct Subscription<M, T, D = JsonDecoder, HK = DefaultSubscriptionHook> {
    queue: String,
    transport: T,
    behavior: Box<dyn ConsumerBehavior<M>>,
    decoder: D,
    hook: HK,
}

impl<M, T> Subscription<M, T, JsonDecoder, DefaultSubscriptionHook>
where
    M: Send + 'static,
    T: Acknowledge + Clone + Send + Sync + 'static,
    T::Error: Into<tower::BoxError>,
{
    /// Create a subscription, selecting the strategy and wiring the
    /// acknowledgment callbacks.
    ///
    /// The policy is resolved once, from the provider's name. The behavior's
    /// completion callback acknowledges; its error callback applies the
    /// requeue policy.
    ///
    /// # Errors
    ///
    /// Fails when the provider advertises no processing capability.
    pub fn try_new(
        queue: impl Into<String>,
        transport: T,
        provider: Arc<dyn ProvideConsumer<M>>,
        config: &PolicyConfig,
    ) -> Result<Self, SubscribeError> {
        let policy = config.resolve(provider.name());
        let behavior = BehaviorFactory::create(provider, &policy).map_err(SubscribeError::setup)?;

        behavior.register_completion_callback(completion_callback(transport.clone()));
        behavior.register_error_callback(error_callback(transport.clone(), policy));

        Ok(Self {
            queue: queue.into(),
            transport,
            behavior,
            decoder: JsonDecoder,
            hook: DefaultSubscriptionHook,
        })
    }
}

impl<M, T, D, HK> Subscription<M, T, D, HK> {
    /// Replace the payload decoder while keeping all other generics
    /// unchanged.
    pub fn with_decoder<D2: Decoder<M>>(self, decoder: D2) -> Subscription<M, T, D2, HK> {
        Subscription {
            queue: self.queue,
            transport: self.transport,
            behavior: self.behavior,
            decoder,
            hook: self.hook,
        }
    }

    /// Replace the subscription hook while keeping all other generics
    /// unchanged.
    pub fn with_hook<HK2: SubscriptionHook>(self, hook: HK2) -> Subscription<M, T, D, HK2> {
        Subscription {
            queue: self.queue,
            transport: self.transport,
            behavior: self.behavior,
            decoder: self.decoder,
            hook,
        }
    }
}

impl<M, T, D, HK> Subscription<M, T, D, HK>
where
    M: Send + 'static,
    T: ReceiveDeliveries + Acknowledge + Clone + Send + Sync + 'static,
    <T as ReceiveDeliveries>::Error: Into<tower::BoxError>,
    <T as Acknowledge>::Error: Into<tower::BoxError>,
    D: Decoder<M>,
    HK: SubscriptionHook,
{
    /// Run the subscription loop.
    ///
    /// The subscription:
    /// - Opens the delivery stream with the strategy's prefetch hint
    /// - Decodes each delivery and admits it into the strategy
    /// - Rejects undecodable deliveries without requeue
    /// - Stops on cancellation, stream end, or a fatal transport error
    ///
    /// Processing outcomes keep arriving at the broker asynchronously; this
    /// method returns once no more deliveries will be admitted.
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SubscribeError> {
        self.hook.on_startup(&self.queue);

        // One signal for every envelope, scoped to this subscription.
        let envelope_cancel = cancel.child_token();

        let mut deliveries = self
            .transport
            .deliveries(self.behavior.prefetch_hint(), cancel.clone())
            .await
            .map_err(|e| SubscribeError::transport(e.into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown(&self.queue);
                    break;
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.hook.on_delivery(&delivery);
                            self.dispatch(delivery, &envelope_cancel).await;
                        }
                        Some(Err(err)) => {
                            let err = err.into();
                            self.hook.on_feed_error(err.as_ref());
                            return Err(SubscribeError::transport(err));
                        }
                        None => {
                            self.hook.on_stream_end(&self.queue);
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Decode one delivery and admit it into the strategy.
    ///
    /// Decode failures are a transport-boundary concern: the delivery is
    /// rejected without requeue and never reaches the strategy.
    async fn dispatch(&self, delivery: Delivery, envelope_cancel: &CancellationToken) {
        match self.decoder.decode(&delivery.payload) {
            Ok(message) => {
                let envelope = Envelope {
                    message,
                    headers: delivery.headers,
                    cancel: envelope_cancel.clone(),
                    redelivered: delivery.redelivered,
                    handle: delivery.handle,
                };
                self.behavior.consume(envelope).await;
            }
            Err(err) => {
                self.hook.on_decode_error(err.as_ref());
                if let Err(err) = self.transport.reject(&delivery.handle, false).await {
                    let err: tower::BoxError = err.into();
                    tracing::error!(error = %err, "Failed to reject an undecodable message");
                }
            }
        }
    }
}

/// Completion callback: acknowledge the delivery.
fn completion_callback<M, T>(transport: T) -> OutcomeCallback<M>
where
    M: Send + 'static,
    T: Acknowledge + Clone + Send + Sync + 'static,
    T::Error: Into<tower::BoxError>,
{
    Arc::new(move |envelope: Envelope<M>| -> AckFuture {
        let transport = transport.clone();
        Box::pin(async move {
            transport
                .accept(&envelope.handle)
                .await
                .map_err(Into::into)
        })
    })
}

/// Error callback: apply the requeue policy.
fn error_callback<M, T>(transport: T, policy: ResolvedPolicy) -> OutcomeCallback<M>
where
    M: Send + 'static,
    T: Acknowledge + Clone + Send + Sync + 'static,
    T::Error: Into<tower::BoxError>,
{
    Arc::new(move |envelope: Envelope<M>| -> AckFuture {
        let transport = transport.clone();
        Box::pin(async move {
            if envelope.handle == DeliveryHandle::Missing {
                // Construction-failure path: the strategy already logged the
                // cause, the message stays unacknowledged at the broker.
                tracing::error!(
                    "No delivery handle for a failed message, leaving it unacknowledged"
                );
                return Ok(());
            }

            if envelope.redelivered {
                tracing::error!(
                    handle = ?envelope.handle,
                    "Message failed after redelivery, discarding"
                );
            }

            let requeue = !envelope.redelivered && policy.requeue_on_error;

            if policy.never_discard && !requeue {
                tracing::error!(
                    handle = ?envelope.handle,
                    "Requeue is not an option and never_discard is set, leaving the message unacknowledged"
                );
                return Ok(());
            }

            transport
                .reject(&envelope.handle, requeue)
                .await
                .map_err(Into::into)
        })
    })
}

/// Decodes raw payload bytes into the message type.
///
/// The wire format is pluggable; JSON is the default via [`JsonDecoder`].
pub trait Decoder<M>: Send + Sync {
    /// Decode one payload.
    fn decode(&self, payload: &[u8]) -> Result<M, tower::BoxError>;
}

/// JSON payload decoder backed by `serde_json`.
pub struct JsonDecoder;

impl<M> Decoder<M> for JsonDecoder
where
    M: serde::de::DeserializeOwned,
{
    fn decode(&self, payload: &[u8]) -> Result<M, tower::BoxError> {
        serde_json::from_slice(payload).map_err(|e| Box::new(e) as tower::BoxError)
    }
}

/// Error returned when the subscription loop fails.
#[derive(Debug)]
pub struct SubscribeError {
    context: tracing_error::SpanTrace,
    kind: SubscribeErrorKind,
}

impl SubscribeError {
    fn setup(error: SetupError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SubscribeErrorKind::Setup(error),
        }
    }

    fn transport(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SubscribeErrorKind::Transport(error),
        }
    }
}

/// Classification of subscription errors.
#[derive(Debug)]
pub enum SubscribeErrorKind {
    /// The strategy could not be selected for the consumer.
    Setup(SetupError),
    /// Errors originating from the transport.
    Transport(tower::BoxError),
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SubscribeErrorKind::Setup(err) => writeln!(f, "Setup error: {err}"),
            SubscribeErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SubscribeErrorKind::Setup(err) => Some(err),
            SubscribeErrorKind::Transport(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing subscription lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait SubscriptionHook: Send + Sync {
    fn on_startup(&self, queue: &str);
    fn on_shutdown(&self, queue: &str);
    fn on_delivery(&self, delivery: &Delivery);
    fn on_decode_error(&self, error: &dyn std::error::Error);
    fn on_feed_error(&self, error: &dyn std::error::Error);
    fn on_stream_end(&self, queue: &str);
}

/// Default subscription hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultSubscriptionHook;

impl SubscriptionHook for DefaultSubscriptionHook {
    fn on_startup(&self, queue: &str) {
        tracing::info!(queue, "Subscription is starting up");
    }

    fn on_shutdown(&self, queue: &str) {
        tracing::info!(queue, "Subscription is shutting down");
    }

    fn on_delivery(&self, delivery: &Delivery) {
        tracing::debug!(handle = ?delivery.handle, "Delivery received");
    }

    fn on_decode_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to decode message payload, rejecting");
    }

    fn on_feed_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error receiving delivery");
    }

    fn on_stream_end(&self, queue: &str) {
        tracing::info!(queue, "Delivery stream ended");
    }
}
