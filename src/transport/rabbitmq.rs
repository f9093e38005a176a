use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::DeliveryHandle,
    transport::{Acknowledge, Delivery, ReceiveDeliveries, TransportError},
};

/// RabbitMQ transport receiver.
///
/// One `RabbitMq` instance corresponds to one queue subscription on its own
/// `lapin::Channel`, created from a shared connection. The queue is declared
/// durable, non-exclusive and without auto-delete.
///
/// ## Design
///
/// - The prefetch hint maps to `basic_qos`, but only when it fits the
///   protocol's `u16` prefetch count; oversized hints leave QoS unlimited
/// - The delivery tag and the redelivered flag map straight into
///   [`Delivery`]; string-convertible AMQP headers are carried over, other
///   value types are skipped
/// - Acknowledgments go through `basic_ack`/`basic_nack` on the same channel
///   the deliveries came from
///
/// The channel is wrapped in `Arc<Mutex<_>>` because:
/// - `lapin::Channel` is not `Sync`
/// - acknowledgments are issued concurrently with the consume stream
pub struct RabbitMq {
    /// Shared AMQP channel used for consuming and acknowledging.
    channel: Arc<Mutex<lapin::Channel>>,
    /// Queue this transport is subscribed to.
    queue: String,
}

impl Clone for RabbitMq {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            queue: self.queue.clone(),
        }
    }
}

impl RabbitMq {
    /// Create a transport for one queue, declaring the queue on a fresh
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be created or the queue
    /// declaration fails.
    pub async fn try_new(
        connection: &lapin::Connection,
        queue: impl Into<String>,
    ) -> Result<Self, lapin::Error> {
        let queue = queue.into();
        let channel = connection.create_channel().await?;

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = %queue, "Declared queue");

        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
            queue,
        })
    }
}

#[async_trait]
impl ReceiveDeliveries for RabbitMq {
    type Error = lapin::Error;

    /// Start consuming the queue and stream its deliveries.
    ///
    /// Cancellation is handled by the subscription's select loop; the
    /// consumer itself keeps running until the channel closes.
    async fn deliveries(
        &self,
        prefetch: usize,
        _cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Delivery, Self::Error>>, Self::Error> {
        let channel = self.channel.lock().await;

        // The AMQP prefetch count is a u16; larger hints leave QoS unset.
        if let Ok(count) = u16::try_from(prefetch) {
            channel.basic_qos(count, BasicQosOptions::default()).await?;
        }

        let consumer = channel
            .basic_consume(
                &self.queue,
                "maildrop",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = %self.queue, "Started consuming queue");

        Ok(Box::pin(
            consumer.map(|delivery| delivery.map(into_delivery)),
        ))
    }
}

#[async_trait]
impl Acknowledge for RabbitMq {
    type Error = TransportError;

    async fn accept(&self, handle: &DeliveryHandle) -> Result<(), TransportError> {
        let tag = match handle.tag() {
            Some(tag) => tag,
            None => return Err(TransportError::missing_handle()),
        };

        let channel = self.channel.lock().await;
        channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|err| TransportError::broker(Box::new(err)))
    }

    async fn reject(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), TransportError> {
        let tag = match handle.tag() {
            Some(tag) => tag,
            None => return Err(TransportError::missing_handle()),
        };

        let channel = self.channel.lock().await;
        channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| TransportError::broker(Box::new(err)))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(header_map)
        .unwrap_or_default();

    Delivery {
        payload: delivery.data,
        headers,
        redelivered: delivery.redelivered,
        handle: DeliveryHandle::Tag(delivery.delivery_tag),
    }
}

/// Carry string-convertible AMQP header values into the envelope headers.
fn header_map(table: &FieldTable) -> HashMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => Some(s.to_string()),
                AMQPValue::Boolean(b) => Some(b.to_string()),
                AMQPValue::LongInt(i) => Some(i.to_string()),
                AMQPValue::LongLongInt(i) => Some(i.to_string()),
                _ => None,
            };
            value.map(|value| (key.to_string(), value))
        })
        .collect()
}
