use crate::{metrics::PropagateMetrics, queue::Propagator};
use ahash::AHashMap as HashMap;
use gateway_controller_core::{
    event::{EntityKind, Operation, PropagationEvent},
    store::{RuleStore, StoreError},
    Certificate, HttpRule,
};
use std::{sync::Arc, time::Duration};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodically re-emits the full rule state so that dropped or lost events converge.
#[derive(Debug)]
pub struct Reconciler<S> {
    store: Arc<S>,
    propagator: Propagator,
    tombstone_retention: Duration,
    metrics: PropagateMetrics,
}

/// What a single sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub http_rules: usize,
    pub tcp_rules: usize,
    pub deletes: usize,

    /// Events that could not be enqueued. They are retried by the next sweep.
    pub dropped: usize,
    pub expired_placeholders: usize,
    pub pruned_tombstones: usize,
}

/// Builds an event for an HTTP rule with the material of the certificate it references.
///
/// A dangling reference is propagated without material rather than failing the caller.
pub async fn http_rule_event<S: RuleStore + ?Sized>(
    store: &S,
    operation: Operation,
    rule: HttpRule,
) -> Result<PropagationEvent, StoreError> {
    let certificate = match rule.certificate_ref() {
        None => None,
        Some(id) => match store.get_certificate(id).await {
            Ok(certificate) => Some(certificate),
            Err(StoreError::NotFound) => {
                warn!(rule_id = %rule.rule_id, certificate_id = %id, "Rule references a missing certificate");
                None
            }
            Err(error) => return Err(error),
        },
    };
    Ok(PropagationEvent::http_rule(operation, rule, certificate))
}

// === impl Reconciler ===

impl<S: RuleStore> Reconciler<S> {
    pub fn new(
        store: Arc<S>,
        propagator: Propagator,
        tombstone_retention: Duration,
        metrics: PropagateMetrics,
    ) -> Self {
        Self {
            store,
            propagator,
            tombstone_retention,
            metrics,
        }
    }

    /// Sweeps immediately and then once per `period` until `drain` is signaled.
    pub async fn run(self, period: Duration, drain: drain::Watch) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("Shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.sweep().await {
                Ok(sweep) => debug!(?sweep, "Reconciled"),
                Err(error) => warn!(%error, "Reconciliation sweep failed"),
            }
        }
    }

    /// Re-emits every active rule at its current revision and a delete event for every
    /// tombstone, then prunes expired placeholders and old tombstones.
    pub async fn sweep(&self) -> Result<Sweep, StoreError> {
        let now = Instant::now();
        let mut sweep = Sweep {
            expired_placeholders: self.store.remove_expired_reservations(now).await?,
            ..Default::default()
        };
        if let Some(before) = now.checked_sub(self.tombstone_retention) {
            sweep.pruned_tombstones = self.store.prune_tombstones(before).await?;
        }

        let mut certificates = HashMap::<String, Option<Certificate>>::new();
        for rule in self.store.list_http_rules().await? {
            let certificate = match rule.certificate_ref() {
                None => None,
                Some(id) => match certificates.get(id) {
                    Some(cached) => cached.clone(),
                    None => {
                        let found = match self.store.get_certificate(id).await {
                            Ok(certificate) => Some(certificate),
                            Err(StoreError::NotFound) => None,
                            Err(error) => return Err(error),
                        };
                        certificates.insert(id.to_string(), found.clone());
                        found
                    }
                },
            };
            let event = PropagationEvent::http_rule(Operation::Update, rule, certificate);
            self.emit(event, &mut sweep.dropped).await;
            sweep.http_rules += 1;
        }

        for rule in self.store.list_tcp_rules().await? {
            let event = PropagationEvent::tcp_rule(Operation::Update, rule);
            self.emit(event, &mut sweep.dropped).await;
            sweep.tcp_rules += 1;
        }

        let mut deletes = [0usize; 2];
        for tombstone in self.store.list_tombstones().await? {
            match tombstone.entity.kind {
                EntityKind::HttpRule => deletes[0] += 1,
                EntityKind::TcpRule => deletes[1] += 1,
            }
            let event = PropagationEvent::deleted(tombstone.entity, tombstone.version);
            self.emit(event, &mut sweep.dropped).await;
            sweep.deletes += 1;
        }

        self.metrics
            .swept(EntityKind::HttpRule, sweep.http_rules + deletes[0]);
        self.metrics
            .swept(EntityKind::TcpRule, sweep.tcp_rules + deletes[1]);
        self.metrics.sweep_completed();
        if sweep.dropped > 0 {
            info!(dropped = sweep.dropped, "Sweep could not enqueue every event");
        }
        Ok(sweep)
    }

    async fn emit(&self, event: PropagationEvent, dropped: &mut usize) {
        if !self.propagator.submit(event).await {
            *dropped += 1;
        }
    }
}
