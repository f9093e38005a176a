use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::{
    behavior::{ConsumerBehavior, OutcomeCallback},
    consumer::ProvideConsumer,
    envelope::Envelope,
    policy::ResolvedPolicy,
};

/// Size/time triggered batch strategy.
///
/// Envelopes accumulate in a bounded buffer and are flushed to a single
/// consumer invocation either when the buffer reaches the configured batch
/// size or when the wait time elapses. A flush always drains the entire
/// buffer at once, and at most one flush runs at a time; batch order is
/// preserved when the outcome fans back out to the per-envelope callbacks.
///
/// The buffer bound applies to buffered messages, not to the batch currently
/// being processed: slots free as soon as the buffer is drained, so new
/// envelopes can accumulate while the previous batch is still in the
/// consumer.
///
/// When the batch consumer cannot be constructed the buffer is left intact
/// and nothing is acknowledged; the timed trigger retries every wait
/// interval until the configuration is fixed. This is a deliberate degraded
/// mode: the queue appears stuck, but no message is lost.
pub struct BatchBehavior<M> {
    shared: Arc<Shared<M>>,
    permits: Arc<Semaphore>,
    prefetch_hint: usize,
}

struct Shared<M> {
    provider: Arc<dyn ProvideConsumer<M>>,
    buffer: Mutex<Buffer<M>>,
    on_completion: OnceLock<OutcomeCallback<M>>,
    on_error: OnceLock<OutcomeCallback<M>>,
    batch_size: usize,
    wait_time: Duration,
}

struct Buffer<M> {
    entries: VecDeque<Buffered<M>>,
    flushing: bool,
    timer_running: bool,
}

struct Buffered<M> {
    envelope: Envelope<M>,
    // Dropped at drain time: the buffer bound, not an in-flight bound.
    permit: OwnedSemaphorePermit,
}

impl<M> BatchBehavior<M>
where
    M: Send + 'static,
{
    /// Create a new batch behavior from the resolved policy.
    pub fn new(provider: Arc<dyn ProvideConsumer<M>>, policy: &ResolvedPolicy) -> Self {
        let batch_size = policy.batch_size;
        Self {
            shared: Arc::new(Shared {
                provider,
                buffer: Mutex::new(Buffer {
                    entries: VecDeque::new(),
                    flushing: false,
                    timer_running: false,
                }),
                on_completion: OnceLock::new(),
                on_error: OnceLock::new(),
                batch_size,
                wait_time: policy.wait_time,
            }),
            permits: Arc::new(Semaphore::new(batch_size)),
            prefetch_hint: batch_size * 2,
        }
    }
}

#[async_trait]
impl<M> ConsumerBehavior<M> for BatchBehavior<M>
where
    M: Send + 'static,
{
    async fn consume(&self, envelope: Envelope<M>) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                tracing::error!(error = %err, "Admission gate closed, failing message");
                if let Some(callback) = self.shared.on_error.get() {
                    if let Err(err) = callback(envelope).await {
                        tracing::error!(error = %err, "Message rejection failed");
                    }
                }
                return;
            }
        };

        let mut buffer = self.shared.buffer.lock().await;
        buffer.entries.push_back(Buffered { envelope, permit });

        if !buffer.timer_running {
            buffer.timer_running = true;
            tokio::spawn(run_timer(Arc::clone(&self.shared)));
        }

        // Size trigger: a full buffer flushes immediately unless a flush is
        // already draining it.
        if buffer.entries.len() >= self.shared.batch_size && !buffer.flushing {
            buffer.flushing = true;
            tokio::spawn(run_flush(Arc::clone(&self.shared)));
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

/// Wait-time flush trigger.
///
/// Runs while the buffer is non-empty and starts a flush on every tick where
/// none is active. In the construction-failure degraded mode this is also
/// what retries the flush until the provider recovers.
async fn run_timer<M>(shared: Arc<Shared<M>>)
where
    M: Send + 'static,
{
    loop {
        tokio::time::sleep(shared.wait_time).await;

        let mut buffer = shared.buffer.lock().await;
        if buffer.entries.is_empty() {
            buffer.timer_running = false;
            return;
        }
        if !buffer.flushing {
            buffer.flushing = true;
            tokio::spawn(run_flush(Arc::clone(&shared)));
        }
    }
}

/// Drain and process the buffer, one full batch per round.
async fn run_flush<M>(shared: Arc<Shared<M>>)
where
    M: Send + 'static,
{
    loop {
        {
            let mut buffer = shared.buffer.lock().await;
            if buffer.entries.is_empty() {
                buffer.flushing = false;
                return;
            }
        }

        // One consumer per batch, constructed before the drain so that a
        // misconfigured provider leaves the buffer untouched.
        let consumer = match shared.provider.batch_consumer().await {
            Ok(consumer) => consumer,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    consumer = shared.provider.name(),
                    "Failed to construct batch consumer! Messages stay buffered until this is fixed"
                );
                shared.buffer.lock().await.flushing = false;
                return;
            }
        };

        let batch = {
            let mut buffer = shared.buffer.lock().await;
            let mut batch = Vec::with_capacity(buffer.entries.len());
            for entry in buffer.entries.drain(..) {
                batch.push(entry.envelope);
                // entry.permit dropped here: the buffer slot frees at drain.
            }
            batch
        };

        // Constructed the consumer for nothing.
        if batch.is_empty() {
            shared.buffer.lock().await.flushing = false;
            return;
        }

        match AssertUnwindSafe(consumer.consume(&batch)).catch_unwind().await {
            Ok(Ok(())) => {
                fan_out(&shared.on_completion, batch, "Message ack failed").await;
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Batch consume failed");
                fan_out(&shared.on_error, batch, "Message rejection failed").await;
            }
            Err(_panic) => {
                tracing::error!("Batch consumer panicked");
                fan_out(&shared.on_error, batch, "Message rejection failed").await;
            }
        }

        {
            let mut buffer = shared.buffer.lock().await;
            if buffer.entries.len() < shared.batch_size {
                buffer.flushing = false;
                return;
            }
            // The buffer refilled while we were processing; run another
            // round without giving up the flush slot.
        }
    }
}

/// Report one batch outcome to a callback, envelope by envelope in batch
/// order, isolating per-callback faults.
async fn fan_out<M>(slot: &OnceLock<OutcomeCallback<M>>, batch: Vec<Envelope<M>>, fault: &str) {
    let callback = match slot.get() {
        Some(callback) => callback,
        None => return,
    };
    for envelope in batch {
        if let Err(err) = callback(envelope).await {
            tracing::error!(error = %err, "{}", fault);
        }
    }
}
