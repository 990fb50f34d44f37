use crate::{
    backoff::Backoff,
    metrics::{DropReason, PropagateMetrics},
};
use gateway_controller_core::{
    delivery::{Delivery, PublishError},
    event::{EntityRef, PropagationEvent},
};
use std::{hash::BuildHasher, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::SendTimeoutError},
    time::Instant,
};
use tracing::{debug, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct Config {
    /// The number of worker queues. Events for one entity always land on the same worker.
    pub workers: usize,

    /// The capacity of each worker queue.
    pub queue_size: usize,

    /// How long `submit` may wait for queue capacity before dropping the event.
    pub enqueue_timeout: Duration,

    pub backoff: Backoff,
}

/// A cloneable handle that enqueues events for the propagation workers.
///
/// Once every handle is dropped the queues close and workers exit after draining them.
#[derive(Clone, Debug)]
pub struct Propagator {
    shards: Arc<[mpsc::Sender<PropagationEvent>]>,
    hasher: ahash::RandomState,
    enqueue_timeout: Duration,
    metrics: PropagateMetrics,
}

struct Worker<D> {
    rx: mpsc::Receiver<PropagationEvent>,
    delivery: Arc<D>,
    backoff: Backoff,
    metrics: PropagateMetrics,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 1024,
            enqueue_timeout: Duration::from_millis(100),
            backoff: Backoff::default(),
        }
    }
}

// === impl Propagator ===

impl Propagator {
    /// Spawns the workers onto the current runtime.
    ///
    /// Workers stop when `drain` is signaled, but only between events: an event that is being
    /// published (or backed off) finishes its retry cycle first.
    pub fn spawn<D: Delivery>(
        config: Config,
        delivery: Arc<D>,
        metrics: PropagateMetrics,
        drain: drain::Watch,
    ) -> Self {
        let workers = config.workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(config.queue_size.max(1));
            shards.push(tx);
            let worker = Worker {
                rx,
                delivery: delivery.clone(),
                backoff: config.backoff.clone(),
                metrics: metrics.clone(),
            };
            tokio::spawn(
                worker
                    .run(drain.clone())
                    .instrument(info_span!("propagate", worker = id)),
            );
        }

        Self {
            shards: shards.into(),
            hasher: ahash::RandomState::with_seeds(0x67, 0x61, 0x74, 0x65),
            enqueue_timeout: config.enqueue_timeout,
            metrics,
        }
    }

    /// Enqueues an event without waiting for it to be delivered.
    ///
    /// Returns false if the event was dropped because its queue stayed full for the enqueue
    /// timeout or the workers have stopped. Dropped events are re-sent by the next
    /// reconciliation sweep, so callers must not fail the originating mutation.
    pub async fn submit(&self, event: PropagationEvent) -> bool {
        let kind = event.entity.kind;
        let shard = self.shard(&event.entity);
        match shard.send_timeout(event, self.enqueue_timeout).await {
            Ok(()) => {
                self.metrics.submitted(kind);
                true
            }
            Err(SendTimeoutError::Timeout(event)) => {
                warn!(
                    entity = %event.entity,
                    revision = %event.revision,
                    "Propagation queue is full; dropping event until the next reconciliation"
                );
                self.metrics.dropped(kind, DropReason::QueueFull);
                false
            }
            Err(SendTimeoutError::Closed(event)) => {
                warn!(
                    entity = %event.entity,
                    revision = %event.revision,
                    "Propagation workers have stopped; dropping event"
                );
                self.metrics.dropped(kind, DropReason::Closed);
                false
            }
        }
    }

    /// Enqueues `events` in order on a background task and returns immediately.
    ///
    /// Fan-outs (e.g. certificate cascades) grow with the number of affected rules, so the
    /// caller never waits on their queue capacity.
    pub fn submit_all(&self, events: Vec<PropagationEvent>) {
        if events.is_empty() {
            return;
        }
        let propagator = self.clone();
        tokio::spawn(
            async move {
                let total = events.len();
                let mut queued = 0;
                for event in events {
                    if propagator.submit(event).await {
                        queued += 1;
                    }
                }
                debug!(total, queued, "Submitted batch");
            }
            .in_current_span(),
        );
    }

    fn shard(&self, entity: &EntityRef) -> &mpsc::Sender<PropagationEvent> {
        let idx = self.hasher.hash_one(entity) as usize % self.shards.len();
        &self.shards[idx]
    }
}

// === impl Worker ===

impl<D: Delivery> Worker<D> {
    async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("Shutting down");
                    return;
                }

                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("Queue closed");
                        return;
                    }
                },
            };

            self.deliver(event).await;
        }
    }

    async fn deliver(&self, event: PropagationEvent) {
        let kind = event.entity.kind;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let res = self.delivery.publish(&event).await;
            self.metrics.observe_delivery(start.elapsed());

            match res {
                Ok(()) => {
                    debug!(
                        entity = %event.entity,
                        revision = %event.revision,
                        operation = event.operation.as_str(),
                        attempt,
                        "Delivered"
                    );
                    self.metrics.delivered(kind);
                    return;
                }

                Err(PublishError::Permanent(error)) => {
                    warn!(
                        entity = %event.entity,
                        revision = %event.revision,
                        %error,
                        "Dropping event that cannot be delivered"
                    );
                    self.metrics.dropped(kind, DropReason::Permanent);
                    return;
                }

                Err(PublishError::Transient(error)) if self.backoff.exhausted(attempt) => {
                    warn!(
                        entity = %event.entity,
                        revision = %event.revision,
                        attempt,
                        %error,
                        "Giving up on event until the next reconciliation"
                    );
                    self.metrics.dropped(kind, DropReason::RetriesExhausted);
                    return;
                }

                Err(PublishError::Transient(error)) => {
                    let delay = self.backoff.delay(attempt);
                    debug!(
                        entity = %event.entity,
                        attempt,
                        %error,
                        delay_ms = delay.as_millis() as u64,
                        "Delivery failed; retrying"
                    );
                    self.metrics.retried(kind);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
