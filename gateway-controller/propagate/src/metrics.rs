use gateway_controller_core::event::EntityKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct PropagateMetrics {
    submitted: Family<KindLabels, Counter>,
    delivered: Family<KindLabels, Counter>,
    retried: Family<KindLabels, Counter>,
    dropped: Family<DropLabels, Counter>,
    delivery_duration: Histogram,
    sweeps: Counter,
    reemitted: Family<KindLabels, Counter>,
}

/// Why an event was abandoned before the data plane accepted it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DropReason {
    QueueFull,
    Closed,
    RetriesExhausted,
    Permanent,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DropLabels {
    kind: &'static str,
    reason: &'static str,
}

// === impl PropagateMetrics ===

impl PropagateMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let submitted = Family::<KindLabels, Counter>::default();
        reg.register(
            "events_submitted",
            "Total number of propagation events accepted onto a worker queue",
            submitted.clone(),
        );

        let delivered = Family::<KindLabels, Counter>::default();
        reg.register(
            "events_delivered",
            "Total number of propagation events accepted by the data-plane transport",
            delivered.clone(),
        );

        let retried = Family::<KindLabels, Counter>::default();
        reg.register(
            "events_retried",
            "Total number of publish attempts retried after a transient failure",
            retried.clone(),
        );

        let dropped = Family::<DropLabels, Counter>::default();
        reg.register(
            "events_dropped",
            "Total number of propagation events abandoned until the next reconciliation",
            dropped.clone(),
        );

        let delivery_duration = Histogram::new(exponential_buckets(0.001, 4.0, 8));
        reg.register_with_unit(
            "delivery_duration",
            "Histogram of the time (seconds) spent on a single publish attempt",
            Unit::Seconds,
            delivery_duration.clone(),
        );

        let sweeps = Counter::default();
        reg.register(
            "reconcile_sweeps",
            "Total number of completed reconciliation sweeps",
            sweeps.clone(),
        );

        let reemitted = Family::<KindLabels, Counter>::default();
        reg.register(
            "reconcile_events",
            "Total number of events re-emitted by reconciliation sweeps",
            reemitted.clone(),
        );

        Self {
            submitted,
            delivered,
            retried,
            dropped,
            delivery_duration,
            sweeps,
            reemitted,
        }
    }

    pub(crate) fn submitted(&self, kind: EntityKind) {
        self.submitted.get_or_create(&KindLabels::new(kind)).inc();
    }

    pub(crate) fn delivered(&self, kind: EntityKind) {
        self.delivered.get_or_create(&KindLabels::new(kind)).inc();
    }

    pub(crate) fn retried(&self, kind: EntityKind) {
        self.retried.get_or_create(&KindLabels::new(kind)).inc();
    }

    pub(crate) fn dropped(&self, kind: EntityKind, reason: DropReason) {
        let labels = DropLabels {
            kind: kind.as_str(),
            reason: reason.as_str(),
        };
        self.dropped.get_or_create(&labels).inc();
    }

    pub(crate) fn observe_delivery(&self, elapsed: Duration) {
        self.delivery_duration.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn swept(&self, kind: EntityKind, events: usize) {
        self.reemitted
            .get_or_create(&KindLabels::new(kind))
            .inc_by(events as u64);
    }

    pub(crate) fn sweep_completed(&self) {
        self.sweeps.inc();
    }
}

impl Default for PropagateMetrics {
    /// Metrics that are recorded but never exported.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl DropReason ===

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Permanent => "permanent",
        }
    }
}

// === impl KindLabels ===

impl KindLabels {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind: kind.as_str(),
        }
    }
}
