use crate::controller::{ControllerConfig, GatewayController};
use gateway_controller_core::{
    delivery::{Delivery, Membership, PublishError},
    event::PropagationEvent,
    store::{PortOwner, PortReservation, RuleStore, StoreError, Tombstone},
    Certificate, HttpRule, PortAddr, RequestContext, TcpRule,
};
use gateway_controller_propagate::{Backoff, Config, PropagateMetrics, Propagator};
use gateway_controller_store::InMemoryStore;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};

/// Records every published event.
pub(crate) struct Recorder(mpsc::UnboundedSender<PropagationEvent>);

/// Rejects every publish as if no proxy were listening.
pub(crate) struct Unreachable;

pub(crate) struct Events {
    rx: mpsc::UnboundedReceiver<PropagationEvent>,
    _signal: drain::Signal,
}

/// Never completes a publish, so queued events are never drained.
pub(crate) struct Stuck;

pub(crate) struct Fleet(pub(crate) Vec<String>);

/// Delays TCP rule inserts, then stores the rule or fails as an unavailable backend.
pub(crate) struct SlowInserts {
    pub(crate) inner: Arc<InMemoryStore>,
    pub(crate) delay: Duration,
    pub(crate) fail: bool,
}

pub(crate) fn propagator<D: Delivery>(delivery: D) -> (Propagator, drain::Signal) {
    propagator_with(delivery, 2, 64)
}

pub(crate) fn propagator_with<D: Delivery>(
    delivery: D,
    workers: usize,
    queue_size: usize,
) -> (Propagator, drain::Signal) {
    let (signal, watch) = drain::channel();
    let config = Config {
        workers,
        queue_size,
        enqueue_timeout: Duration::from_millis(100),
        backoff: Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            max_attempts: 2,
            multiplier: 2.0,
        },
    };
    let propagator = Propagator::spawn(
        config,
        Arc::new(delivery),
        PropagateMetrics::default(),
        watch,
    );
    (propagator, signal)
}

pub(crate) fn controller() -> (GatewayController<InMemoryStore>, Arc<InMemoryStore>, Events) {
    let store = Arc::new(InMemoryStore::default());
    let (propagator, events) = Recorder::spawn();
    let controller = GatewayController::new(
        store.clone(),
        propagator,
        Arc::new(Fleet(vec!["10.0.0.1:8443".to_string()])),
        ControllerConfig::default(),
    );
    (controller, store, events)
}

pub(crate) fn controller_with<S: RuleStore>(
    store: Arc<S>,
    propagator: Propagator,
    config: ControllerConfig,
) -> GatewayController<S> {
    GatewayController::new(
        store,
        propagator,
        Arc::new(Fleet(vec!["10.0.0.1:8443".to_string()])),
        config,
    )
}

pub(crate) fn ctx() -> RequestContext {
    RequestContext::new("tenant-0", "event-0").expect("context must be valid")
}

pub(crate) fn mk_http_rule(id: &str, certificate_id: Option<&str>) -> HttpRule {
    HttpRule {
        rule_id: id.to_string(),
        workload_id: "workload-0".to_string(),
        container_port: 8080,
        domain: format!("{id}.example.com"),
        certificate_id: certificate_id.map(Into::into),
        extensions: vec![],
        configs: vec![],
        version: 0,
    }
}

// === impl Recorder ===

impl Recorder {
    pub(crate) fn spawn() -> (Propagator, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (propagator, signal) = propagator(Recorder(tx));
        (
            propagator,
            Events {
                rx,
                _signal: signal,
            },
        )
    }
}

#[async_trait::async_trait]
impl Delivery for Recorder {
    async fn publish(&self, event: &PropagationEvent) -> Result<(), PublishError> {
        let _ = self.0.send(event.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl Delivery for Unreachable {
    async fn publish(&self, _: &PropagationEvent) -> Result<(), PublishError> {
        Err(PublishError::Transient("connection refused".to_string()))
    }
}

#[async_trait::async_trait]
impl Delivery for Stuck {
    async fn publish(&self, _: &PropagationEvent) -> Result<(), PublishError> {
        std::future::pending().await
    }
}

#[async_trait::async_trait]
impl Membership for Fleet {
    async fn list_dataplane_addresses(&self) -> Vec<String> {
        self.0.clone()
    }
}

// === impl Events ===

impl Events {
    pub(crate) async fn next(&mut self) -> PropagationEvent {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("event must be published")
            .expect("recorder must not be closed")
    }

    pub(crate) async fn assert_idle(&mut self) {
        let res = tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await;
        assert!(res.is_err(), "unexpected event {res:?}");
    }
}

// === impl SlowInserts ===

#[async_trait::async_trait]
impl RuleStore for SlowInserts {
    async fn get_http_rule(&self, rule_id: &str) -> Result<HttpRule, StoreError> {
        self.inner.get_http_rule(rule_id).await
    }

    async fn list_http_rules(&self) -> Result<Vec<HttpRule>, StoreError> {
        self.inner.list_http_rules().await
    }

    async fn create_http_rule(&self, rule: HttpRule) -> Result<HttpRule, StoreError> {
        self.inner.create_http_rule(rule).await
    }

    async fn update_http_rule(
        &self,
        rule: HttpRule,
        expected_version: u64,
    ) -> Result<HttpRule, StoreError> {
        self.inner.update_http_rule(rule, expected_version).await
    }

    async fn delete_http_rule(&self, rule_id: &str) -> Result<HttpRule, StoreError> {
        self.inner.delete_http_rule(rule_id).await
    }

    async fn find_http_rules_by_certificate(
        &self,
        certificate_id: &str,
    ) -> Result<Vec<HttpRule>, StoreError> {
        self.inner.find_http_rules_by_certificate(certificate_id).await
    }

    async fn get_tcp_rule(&self, rule_id: &str) -> Result<TcpRule, StoreError> {
        self.inner.get_tcp_rule(rule_id).await
    }

    async fn list_tcp_rules(&self) -> Result<Vec<TcpRule>, StoreError> {
        self.inner.list_tcp_rules().await
    }

    async fn create_tcp_rule(&self, rule: TcpRule) -> Result<TcpRule, StoreError> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(StoreError::Unavailable("insert failed".to_string()));
        }
        self.inner.create_tcp_rule(rule).await
    }

    async fn update_tcp_rule(
        &self,
        rule: TcpRule,
        expected_version: u64,
    ) -> Result<TcpRule, StoreError> {
        self.inner.update_tcp_rule(rule, expected_version).await
    }

    async fn delete_tcp_rule(&self, rule_id: &str) -> Result<TcpRule, StoreError> {
        self.inner.delete_tcp_rule(rule_id).await
    }

    async fn find_tcp_rule_by_addr(&self, addr: PortAddr) -> Result<TcpRule, StoreError> {
        self.inner.find_tcp_rule_by_addr(addr).await
    }

    async fn get_certificate(&self, certificate_id: &str) -> Result<Certificate, StoreError> {
        self.inner.get_certificate(certificate_id).await
    }

    async fn create_certificate(
        &self,
        certificate: Certificate,
    ) -> Result<Certificate, StoreError> {
        self.inner.create_certificate(certificate).await
    }

    async fn update_certificate(
        &self,
        certificate: Certificate,
        expected_version: u64,
    ) -> Result<Certificate, StoreError> {
        self.inner.update_certificate(certificate, expected_version).await
    }

    async fn delete_certificate(&self, certificate_id: &str) -> Result<Certificate, StoreError> {
        self.inner.delete_certificate(certificate_id).await
    }

    async fn get_reservation(&self, addr: PortAddr) -> Result<PortReservation, StoreError> {
        self.inner.get_reservation(addr).await
    }

    async fn claim_port(
        &self,
        reservation: PortReservation,
        now: Instant,
    ) -> Result<(), StoreError> {
        self.inner.claim_port(reservation, now).await
    }

    async fn release_port(&self, addr: PortAddr, owner: &PortOwner) -> Result<(), StoreError> {
        self.inner.release_port(addr, owner).await
    }

    async fn list_reservations(&self) -> Result<Vec<PortReservation>, StoreError> {
        self.inner.list_reservations().await
    }

    async fn remove_expired_reservations(&self, now: Instant) -> Result<usize, StoreError> {
        self.inner.remove_expired_reservations(now).await
    }

    async fn list_tombstones(&self) -> Result<Vec<Tombstone>, StoreError> {
        self.inner.list_tombstones().await
    }

    async fn prune_tombstones(&self, before: Instant) -> Result<usize, StoreError> {
        self.inner.prune_tombstones(before).await
    }
}
