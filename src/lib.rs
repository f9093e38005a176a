#![doc = include_str!("../README.md")]

pub mod behavior;
pub mod consumer;
pub mod envelope;
pub mod policy;
mod subscription;
pub mod transport;

#[doc(inline)]
pub use envelope::{DeliveryHandle, Envelope};

#[doc(inline)]
pub use consumer::{
    BatchConsumer, Capability, Consumer, ProvideConsumer, ProvideError, ProvideErrorKind,
};

#[doc(inline)]
pub use behavior::{
    AckFuture, BatchBehavior, BehaviorFactory, ConsumerBehavior, DefaultBehavior, Outcome,
    OutcomeCallback, SetupError,
};

#[doc(inline)]
pub use policy::{PolicyConfig, PolicyOverride, ResolvedPolicy};

#[doc(inline)]
pub use subscription::{
    Decoder, DefaultSubscriptionHook, JsonDecoder, SubscribeError, SubscribeErrorKind,
    Subscription, SubscriptionHook,
};

#[doc(inline)]
pub use transport::{Acknowledge, Delivery, ReceiveDeliveries, TransportError, TransportErrorKind};
