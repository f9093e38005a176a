use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    sync::{Mutex, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};

use crate::{
    behavior::{ConsumerBehavior, Outcome, OutcomeCallback},
    consumer::ProvideConsumer,
    envelope::{DeliveryHandle, Envelope},
    policy::ResolvedPolicy,
};

/// Bounded-concurrency single-message strategy.
///
/// Each admitted envelope gets its own processing unit: a freshly constructed
/// consumer instance invoked on its own task. Admission is gated by a
/// semaphore sized to the resolved batch size, so the number of admitted but
/// not yet acknowledged envelopes never exceeds that capacity; a full
/// strategy stalls `consume` until a slot frees up.
///
/// A single reaper task drains completed units in admission order and hands
/// each outcome to the registered completion or error callback. Awaiting the
/// oldest unit before moving on is what makes callback delivery FIFO even
/// though the consumers themselves run concurrently, and it bounds callback
/// concurrency to one.
///
/// When consumer construction fails the envelope still reaches the error
/// callback, but with its delivery handle replaced by
/// [`DeliveryHandle::Missing`]: the message is deliberately left
/// unacknowledged at the broker instead of being rejected over a
/// configuration problem.
pub struct DefaultBehavior<M> {
    shared: Arc<Shared<M>>,
    permits: Arc<Semaphore>,
    prefetch_hint: usize,
}

struct Shared<M> {
    provider: Arc<dyn ProvideConsumer<M>>,
    units: Mutex<UnitQueue<M>>,
    on_completion: OnceLock<OutcomeCallback<M>>,
    on_error: OnceLock<OutcomeCallback<M>>,
}

struct UnitQueue<M> {
    pending: VecDeque<Unit<M>>,
    reaping: bool,
}

struct Unit<M> {
    handle: JoinHandle<Outcome<M>>,
    // Held until the outcome callback has run, so capacity bounds
    // unacknowledged units rather than merely running consumers.
    permit: OwnedSemaphorePermit,
}

impl<M> DefaultBehavior<M>
where
    M: Send + 'static,
{
    /// Create a new single-message behavior.
    ///
    /// The resolved batch size acts as the concurrency capacity, not as a
    /// literal batch size.
    pub fn new(provider: Arc<dyn ProvideConsumer<M>>, policy: &ResolvedPolicy) -> Self {
        let capacity = policy.batch_size;
        Self {
            shared: Arc::new(Shared {
                provider,
                units: Mutex::new(UnitQueue {
                    pending: VecDeque::new(),
                    reaping: false,
                }),
                on_completion: OnceLock::new(),
                on_error: OnceLock::new(),
            }),
            permits: Arc::new(Semaphore::new(capacity)),
            prefetch_hint: capacity * 2,
        }
    }
}

#[async_trait]
impl<M> ConsumerBehavior<M> for DefaultBehavior<M>
where
    M: Send + 'static,
{
    async fn consume(&self, envelope: Envelope<M>) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                // The semaphore is never closed by the engine; this only
                // happens if the behavior outlived its runtime.
                tracing::error!(error = %err, "Admission gate closed, failing message");
                deliver(&self.shared.on_error, envelope).await;
                return;
            }
        };

        let handle = tokio::spawn(run_unit(Arc::clone(&self.shared), envelope));

        let mut units = self.shared.units.lock().await;
        units.pending.push_back(Unit { handle, permit });
        if !units.reaping {
            units.reaping = true;
            tokio::spawn(reap(Arc::clone(&self.shared)));
        }
    }

    fn register_completion_callback(&self, callback: OutcomeCallback<M>) {
        if self.shared.on_completion.set(callback).is_err() {
            tracing::warn!("Completion callback already registered");
        }
    }

    fn register_error_callback(&self, callback: OutcomeCallback<M>) {
        if self.shared.on_error.set(callback).is_err() {
            tracing::warn!("Error callback already registered");
        }
    }

    fn prefetch_hint(&self) -> usize {
        self.prefetch_hint
    }
}

/// Process one envelope with a freshly constructed consumer.
async fn run_unit<M>(shared: Arc<Shared<M>>, mut envelope: Envelope<M>) -> Outcome<M>
where
    M: Send + 'static,
{
    let consumer = match shared.provider.consumer().await {
        Ok(consumer) => consumer,
        Err(err) => {
            tracing::error!(
                error = %err,
                consumer = shared.provider.name(),
                "Failed to construct consumer! The message will stay unacknowledged until this is fixed"
            );
            // Drop the broker handle so the error policy skips ack/reject
            // instead of discarding the message over a configuration problem.
            envelope.handle = DeliveryHandle::Missing;
            return Outcome::Failure(envelope);
        }
    };

    match AssertUnwindSafe(consumer.consume(&envelope)).catch_unwind().await {
        Ok(Ok(())) => Outcome::Success(envelope),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "Message consume failed");
            Outcome::Failure(envelope)
        }
        Err(_panic) => {
            tracing::error!("Consumer panicked while processing a message");
            Outcome::Failure(envelope)
        }
    }
}

/// Drain completed units in admission order.
///
/// At most one reaper runs per behavior; the flag lives under the same mutex
/// as the unit queue, so a reaper observing an empty queue and a `consume`
/// enqueuing a new unit cannot miss each other.
async fn reap<M>(shared: Arc<Shared<M>>)
where
    M: Send + 'static,
{
    loop {
        let unit = {
            let mut units = shared.units.lock().await;
            match units.pending.pop_front() {
                Some(unit) => unit,
                None => {
                    units.reaping = false;
                    return;
                }
            }
        };

        let outcome = match unit.handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Unit tasks catch panics themselves; a join error means the
                // runtime tore the task down, nothing left to acknowledge.
                tracing::error!(error = %err, "Processing unit was aborted");
                continue;
            }
        };

        match outcome {
            Outcome::Success(envelope) => deliver(&shared.on_completion, envelope).await,
            Outcome::Failure(envelope) => deliver(&shared.on_error, envelope).await,
        }

        // The slot frees only now, after the acknowledgment ran.
        drop(unit.permit);
    }
}

async fn deliver<M>(slot: &OnceLock<OutcomeCallback<M>>, envelope: Envelope<M>) {
    if let Some(callback) = slot.get() {
        if let Err(err) = callback(envelope).await {
            tracing::error!(error = %err, "Message ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        consumer::{Capability, Consumer, ProvideError},
        policy::PolicyConfig,
    };

    fn envelope(tag: u64) -> Envelope<u64> {
        Envelope {
            message: tag,
            headers: HashMap::new(),
            cancel: CancellationToken::new(),
            redelivered: false,
            handle: DeliveryHandle::Tag(tag),
        }
    }

    fn recorder(log: Arc<Mutex<Vec<(u64, DeliveryHandle)>>>) -> OutcomeCallback<u64> {
        Arc::new(move |envelope: Envelope<u64>| -> crate::behavior::AckFuture {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().await.push((envelope.message, envelope.handle));
                Ok(())
            })
        })
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Consumer that sleeps longer for lower tags, so completion order is the
    /// reverse of admission order.
    #[derive(Clone)]
    struct InverseDelay;

    #[async_trait]
    impl Consumer<u64> for InverseDelay {
        async fn consume(&self, envelope: &Envelope<u64>) -> Result<(), tower::BoxError> {
            let delay = 100u64.saturating_sub(envelope.message * 20);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(())
        }
    }

    struct Provider<C: Clone>(C);

    #[async_trait]
    impl<C> ProvideConsumer<u64> for Provider<C>
    where
        C: Consumer<u64> + Clone + 'static,
    {
        fn name(&self) -> &str {
            "test-consumer"
        }

        fn capability(&self) -> Option<Capability> {
            Some(Capability::Single)
        }

        async fn consumer(&self) -> Result<Box<dyn Consumer<u64>>, ProvideError> {
            Ok(Box::new(self.0.clone()))
        }
    }

    #[derive(Clone)]
    struct Failing;

    #[async_trait]
    impl Consumer<u64> for Failing {
        async fn consume(&self, _envelope: &Envelope<u64>) -> Result<(), tower::BoxError> {
            Err("boom".into())
        }
    }

    #[derive(Clone)]
    struct Panicking;

    #[async_trait]
    impl Consumer<u64> for Panicking {
        async fn consume(&self, _envelope: &Envelope<u64>) -> Result<(), tower::BoxError> {
            panic!("consumer exploded");
        }
    }

    struct Unconstructible;

    #[async_trait]
    impl ProvideConsumer<u64> for Unconstructible {
        fn name(&self) -> &str {
            "unconstructible"
        }

        fn capability(&self) -> Option<Capability> {
            Some(Capability::Single)
        }

        async fn consumer(&self) -> Result<Box<dyn Consumer<u64>>, ProvideError> {
            Err(ProvideError::construction("missing dependency".into()))
        }
    }

    fn behavior_with(
        provider: Arc<dyn ProvideConsumer<u64>>,
        batch_size: usize,
    ) -> DefaultBehavior<u64> {
        let config = PolicyConfig {
            default_batch_size: Some(batch_size),
            ..PolicyConfig::default()
        };
        DefaultBehavior::new(provider, &config.resolve("test-consumer"))
    }

    #[tokio::test]
    async fn outcomes_follow_admission_order() {
        let behavior = behavior_with(Arc::new(Provider(InverseDelay)), 8);
        let completions = Arc::new(Mutex::new(Vec::new()));
        behavior.register_completion_callback(recorder(Arc::clone(&completions)));
        behavior.register_error_callback(recorder(Arc::new(Mutex::new(Vec::new()))));

        for tag in 1..=4 {
            behavior.consume(envelope(tag)).await;
        }

        wait_until(|| completions.try_lock().map(|l| l.len() == 4).unwrap_or(false)).await;

        let order: Vec<u64> = completions.lock().await.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn handler_errors_reach_the_error_callback_once() {
        let behavior = behavior_with(Arc::new(Provider(Failing)), 4);
        let completions = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        behavior.register_completion_callback(recorder(Arc::clone(&completions)));
        behavior.register_error_callback(recorder(Arc::clone(&errors)));

        behavior.consume(envelope(7)).await;

        wait_until(|| errors.try_lock().map(|l| l.len() == 1).unwrap_or(false)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(errors.lock().await.len(), 1);
        assert!(completions.lock().await.is_empty());
        assert_eq!(errors.lock().await[0], (7, DeliveryHandle::Tag(7)));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_a_failure() {
        let behavior = behavior_with(Arc::new(Provider(Panicking)), 4);
        let errors = Arc::new(Mutex::new(Vec::new()));
        behavior.register_completion_callback(recorder(Arc::new(Mutex::new(Vec::new()))));
        behavior.register_error_callback(recorder(Arc::clone(&errors)));

        behavior.consume(envelope(1)).await;

        wait_until(|| errors.try_lock().map(|l| l.len() == 1).unwrap_or(false)).await;
        assert_eq!(errors.lock().await[0], (1, DeliveryHandle::Tag(1)));
    }

    #[tokio::test]
    async fn construction_failure_fails_the_envelope_without_a_handle() {
        let behavior = behavior_with(Arc::new(Unconstructible), 4);
        let errors = Arc::new(Mutex::new(Vec::new()));
        behavior.register_completion_callback(recorder(Arc::new(Mutex::new(Vec::new()))));
        behavior.register_error_callback(recorder(Arc::clone(&errors)));

        behavior.consume(envelope(3)).await;

        wait_until(|| errors.try_lock().map(|l| l.len() == 1).unwrap_or(false)).await;
        assert_eq!(errors.lock().await[0], (3, DeliveryHandle::Missing));
    }

    /// Consumer that parks until released, counting how many run at once.
    #[derive(Clone)]
    struct Gated {
        running: Arc<std::sync::atomic::AtomicUsize>,
        peak: Arc<std::sync::atomic::AtomicUsize>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Consumer<u64> for Gated {
        async fn consume(&self, _envelope: &Envelope<u64>) -> Result<(), tower::BoxError> {
            use std::sync::atomic::Ordering;

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn capacity_bounds_concurrent_units() {
        use std::sync::atomic::Ordering;

        let gated = Gated {
            running: Arc::new(Default::default()),
            peak: Arc::new(Default::default()),
            release: Arc::new(Notify::new()),
        };
        let behavior = Arc::new(behavior_with(Arc::new(Provider(gated.clone())), 2));
        let completions = Arc::new(Mutex::new(Vec::new()));
        behavior.register_completion_callback(recorder(Arc::clone(&completions)));
        behavior.register_error_callback(recorder(Arc::new(Mutex::new(Vec::new()))));

        let feeder = {
            let behavior = Arc::clone(&behavior);
            tokio::spawn(async move {
                for tag in 1..=5 {
                    behavior.consume(envelope(tag)).await;
                }
            })
        };

        // Only two units may be admitted while nothing completes.
        wait_until(|| gated.running.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gated.running.load(Ordering::SeqCst), 2);
        assert!(!feeder.is_finished());

        // Release everything and drain.
        for _ in 0..16 {
            gated.release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        wait_until(|| completions.try_lock().map(|l| l.len() == 5).unwrap_or(false)).await;
        assert!(gated.peak.load(Ordering::SeqCst) <= 2);
        feeder.await.unwrap();
    }
}
