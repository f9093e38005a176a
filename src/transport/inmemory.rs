use std::{collections::VecDeque, convert::Infallible, sync::Arc};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::DeliveryHandle,
    transport::{Acknowledge, Delivery, ReceiveDeliveries, TransportError},
};

/// In-memory transport for testing or local pipelines.
///
/// Deliveries are seeded with [`push`](InMemory::push) and handed out as a
/// snapshot stream; every acknowledgment action is recorded and can be
/// inspected afterwards. It is useful for:
/// - Unit and integration testing
/// - Simulating a broker without running one
/// - Debugging consumption flows
#[derive(Clone, Default)]
pub struct InMemory {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Delivery>,
    next_tag: u64,
    accepted: Vec<DeliveryHandle>,
    rejected: Vec<(DeliveryHandle, bool)>,
}

impl InMemory {
    /// Create a new empty in-memory transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a delivery and return the handle assigned to it.
    ///
    /// Tags are assigned sequentially starting at 1.
    pub async fn push(&self, payload: impl Into<Vec<u8>>, redelivered: bool) -> DeliveryHandle {
        let mut state = self.state.lock().await;
        state.next_tag += 1;
        let handle = DeliveryHandle::Tag(state.next_tag);
        state.pending.push_back(Delivery {
            payload: payload.into(),
            headers: Default::default(),
            redelivered,
            handle: handle.clone(),
        });
        handle
    }

    /// Handles accepted so far, in acknowledgment order.
    pub async fn accepted(&self) -> Vec<DeliveryHandle> {
        self.state.lock().await.accepted.clone()
    }

    /// Handles rejected so far with their requeue flag, in acknowledgment
    /// order.
    pub async fn rejected(&self) -> Vec<(DeliveryHandle, bool)> {
        self.state.lock().await.rejected.clone()
    }
}

#[async_trait]
impl ReceiveDeliveries for InMemory {
    type Error = Infallible;

    /// Stream a snapshot of the currently seeded deliveries.
    ///
    /// The stream ends once the snapshot is exhausted; deliveries pushed
    /// afterwards require a new call.
    async fn deliveries(
        &self,
        _prefetch: usize,
        _cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Delivery, Self::Error>>, Self::Error> {
        let mut state = self.state.lock().await;
        let drained: Vec<_> = state.pending.drain(..).map(Ok).collect();
        Ok(Box::pin(tokio_stream::iter(drained)))
    }
}

#[async_trait]
impl Acknowledge for InMemory {
    type Error = TransportError;

    async fn accept(&self, handle: &DeliveryHandle) -> Result<(), TransportError> {
        if handle.tag().is_none() {
            return Err(TransportError::missing_handle());
        }
        self.state.lock().await.accepted.push(handle.clone());
        Ok(())
    }

    async fn reject(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), TransportError> {
        if handle.tag().is_none() {
            return Err(TransportError::missing_handle());
        }
        self.state
            .lock()
            .await
            .rejected
            .push((handle.clone(), requeue));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt as _;

    use super::*;

    #[tokio::test]
    async fn streams_seeded_deliveries_in_order() {
        let transport = InMemory::new();
        transport.push(b"one".to_vec(), false).await;
        transport.push(b"two".to_vec(), true).await;

        let mut stream = transport
            .deliveries(4, CancellationToken::new())
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert!(!first.redelivered);
        assert_eq!(first.handle, DeliveryHandle::Tag(1));

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.handle, DeliveryHandle::Tag(2));

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn records_acknowledgment_actions() {
        let transport = InMemory::new();
        let first = transport.push(b"one".to_vec(), false).await;
        let second = transport.push(b"two".to_vec(), false).await;

        transport.accept(&first).await.unwrap();
        transport.reject(&second, true).await.unwrap();

        assert_eq!(transport.accepted().await, vec![first]);
        assert_eq!(transport.rejected().await, vec![(second, true)]);
    }

    #[tokio::test]
    async fn missing_handles_are_refused() {
        let transport = InMemory::new();

        assert!(transport.accept(&DeliveryHandle::Missing).await.is_err());
        assert!(transport
            .reject(&DeliveryHandle::Missing, false)
            .await
            .is_err());
    }
}
