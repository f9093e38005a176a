use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

/// Message container flowing through the consumption pipeline.
///
/// `Envelope` bundles a decoded message payload with its delivery metadata and
/// the opaque handle used to later acknowledge or reject it at the broker.
///
/// ## Design
///
/// - `message` is the decoded payload; the engine never inspects it
/// - `headers` carry transport metadata as plain string pairs
/// - `cancel` is scoped to the whole subscription, not to this message:
///   handlers should observe it to abort cooperatively
/// - `redelivered` is set by the broker when this is not the first delivery
///   attempt, and drives the requeue policy
///
/// An envelope is created by the subscription on each raw delivery, is not
/// mutated afterwards, and is destroyed once its outcome has been reported.
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    /// Decoded message payload.
    pub message: M,
    /// Transport metadata attached to the delivery.
    pub headers: HashMap<String, String>,
    /// Cancellation signal for the owning subscription.
    pub cancel: CancellationToken,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Handle used to acknowledge or reject this delivery.
    pub handle: DeliveryHandle,
}

/// Opaque reference to one broker delivery.
///
/// A handle is valid until it has been acknowledged or rejected exactly once.
/// `Missing` marks an envelope that lost its broker identity; today this only
/// happens when consumer construction fails and the engine deliberately keeps
/// the message unacknowledged. Acknowledgment logic must treat `Missing` as
/// "take no broker action" rather than fail the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryHandle {
    /// Broker-issued delivery tag.
    Tag(u64),
    /// No broker handle; any acknowledgment action must be skipped.
    Missing,
}

impl DeliveryHandle {
    /// Return the delivery tag, if this handle still has one.
    pub fn tag(&self) -> Option<u64> {
        match self {
            DeliveryHandle::Tag(tag) => Some(*tag),
            DeliveryHandle::Missing => None,
        }
    }
}
