use crate::{
    allocator::{AllocatorConfig, PortAllocator},
    certificate::{CertificateManager, CertificateUpdate},
    validation,
};
use gateway_controller_core::{
    delivery::Membership,
    event::{EntityRef, Operation, PropagationEvent},
    request::{
        parse_ip, AddHttpRule, AddTcpRule, DeleteCertificate, DeleteRule, UpdateCertificate,
        UpdateHttpRule, UpdateRuleConfig, UpdateTcpRule,
    },
    store::{RuleStore, StoreError},
    Certificate, Error, FieldErrors, HttpRule, PortAddr, RequestContext, TcpRule, UNSPECIFIED_IP,
};
use gateway_controller_propagate::{http_rule_event, Propagator};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn, Instrument};

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub allocator: AllocatorConfig,

    /// Bounds the store and allocator work of a single operation.
    pub request_timeout: Duration,
}

/// Accepts rule mutations: validates them, reserves external ports, persists them and hands
/// the resulting events to the propagator.
///
/// A mutation succeeds once it is persisted. Propagation happens in the background, so an
/// unreachable data plane never fails a request.
pub struct GatewayController<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    store: Arc<S>,
    ports: PortAllocator<S>,
    certificates: CertificateManager<S>,
    propagator: Propagator,
    membership: Arc<dyn Membership>,
    request_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            allocator: AllocatorConfig::default(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

// === impl GatewayController ===

impl<S> Clone for GatewayController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for GatewayController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayController")
            .field("request_timeout", &self.inner.request_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: RuleStore> GatewayController<S> {
    pub fn new(
        store: Arc<S>,
        propagator: Propagator,
        membership: Arc<dyn Membership>,
        config: ControllerConfig,
    ) -> Self {
        let ports = PortAllocator::new(store.clone(), config.allocator);
        let certificates = CertificateManager::new(store.clone(), propagator.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                ports,
                certificates,
                propagator,
                membership,
                request_timeout: config.request_timeout,
            }),
        }
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %req.rule_id))]
    pub async fn add_http_rule(
        &self,
        ctx: RequestContext,
        req: AddHttpRule,
    ) -> Result<HttpRule, Error> {
        let (rule, event) = self
            .bounded(async {
                validation::add_http_rule(&req).into_result()?;
                if let Some(certificate) = req.certificate() {
                    self.inner.certificates.ensure(certificate).await?;
                }

                let rule = self
                    .inner
                    .store
                    .create_http_rule(req.to_rule())
                    .await
                    .map_err(|error| {
                        Error::store(error, format_args!("http rule {}", req.rule_id))
                    })?;
                info!(version = rule.version, "Added http rule");

                let event = self.http_rule_event(Operation::Create, &rule).await;
                Ok((rule, event))
            })
            .await?;
        self.propagate(event).await;
        Ok(rule)
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %req.rule_id))]
    pub async fn update_http_rule(
        &self,
        ctx: RequestContext,
        req: UpdateHttpRule,
    ) -> Result<HttpRule, Error> {
        let (rule, event) = self
            .bounded(async {
                validation::rule_id(&req.rule_id).into_result()?;
                let previous = self.load_http_rule(&req.rule_id).await?;
                validation::update_http_rule(&req, &previous).into_result()?;
                if let Some(certificate) = req.certificate(&previous) {
                    self.inner.certificates.ensure(certificate).await?;
                }

                let rule = self
                    .inner
                    .store
                    .update_http_rule(req.apply_to(&previous), previous.version)
                    .await
                    .map_err(|error| {
                        Error::store(error, format_args!("http rule {}", req.rule_id))
                    })?;
                info!(version = rule.version, "Updated http rule");

                let event = self.http_rule_event(Operation::Update, &rule).await;
                Ok((rule, event))
            })
            .await?;
        self.propagate(event).await;
        Ok(rule)
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %req.rule_id))]
    pub async fn delete_http_rule(
        &self,
        ctx: RequestContext,
        req: DeleteRule,
    ) -> Result<HttpRule, Error> {
        let rule = self
            .bounded(async {
                validation::rule_id(&req.rule_id).into_result()?;
                let rule = self
                    .inner
                    .store
                    .delete_http_rule(&req.rule_id)
                    .await
                    .map_err(|error| {
                        Error::store(error, format_args!("http rule {}", req.rule_id))
                    })?;
                info!(version = rule.version, "Deleted http rule");
                Ok(rule)
            })
            .await?;

        let entity = EntityRef::http_rule(&*rule.rule_id);
        self.propagate(Some(PropagationEvent::deleted(entity, rule.version + 1)))
            .await;
        Ok(rule)
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %rule_id))]
    pub async fn get_http_rule(
        &self,
        ctx: RequestContext,
        rule_id: &str,
    ) -> Result<HttpRule, Error> {
        self.bounded(self.load_http_rule(rule_id)).await
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %req.rule_id))]
    pub async fn add_tcp_rule(&self, ctx: RequestContext, req: AddTcpRule) -> Result<TcpRule, Error> {
        let rule = self
            .bounded(async {
                validation::add_tcp_rule(&req, self.inner.ports.min_external_port())
                    .into_result()?;
                let ip = parse_ip(&req.ip).map_err(|_| {
                    Error::Validation(FieldErrors::single("ip", "The ip field is invalid"))
                })?;
                let rule = req.to_rule(ip);

                let rule = self
                    .detached(move |gateway| async move { gateway.reserve_and_create(rule).await })
                    .await?;
                info!(addr = %rule.addr(), version = rule.version, "Added tcp rule");
                Ok(rule)
            })
            .await?;

        self.propagate(Some(PropagationEvent::tcp_rule(Operation::Create, rule.clone())))
            .await;
        Ok(rule)
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %req.rule_id))]
    pub async fn update_tcp_rule(
        &self,
        ctx: RequestContext,
        req: UpdateTcpRule,
    ) -> Result<TcpRule, Error> {
        let rule = self
            .bounded(async {
                validation::rule_id(&req.rule_id).into_result()?;
                let previous = self.load_tcp_rule(&req.rule_id).await?;
                validation::update_tcp_rule(&req, self.inner.ports.min_external_port())
                    .into_result()?;
                let ip = match req.ip.as_deref() {
                    Some(ip) => parse_ip(ip).map_err(|_| {
                        Error::Validation(FieldErrors::single("ip", "The ip field is invalid"))
                    })?,
                    None => previous.ip,
                };
                let merged = req.apply_to(&previous, ip);

                let rule = self
                    .detached(move |gateway| async move {
                        gateway.move_and_update(previous, merged).await
                    })
                    .await?;
                info!(addr = %rule.addr(), version = rule.version, "Updated tcp rule");
                Ok(rule)
            })
            .await?;

        self.propagate(Some(PropagationEvent::tcp_rule(Operation::Update, rule.clone())))
            .await;
        Ok(rule)
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %req.rule_id))]
    pub async fn delete_tcp_rule(
        &self,
        ctx: RequestContext,
        req: DeleteRule,
    ) -> Result<TcpRule, Error> {
        let rule = self
            .bounded(async {
                validation::rule_id(&req.rule_id).into_result()?;
                let rule_id = req.rule_id.clone();
                let rule = self
                    .detached(move |gateway| async move { gateway.remove_and_release(rule_id).await })
                    .await?;
                info!(addr = %rule.addr(), version = rule.version, "Deleted tcp rule");
                Ok(rule)
            })
            .await?;

        let entity = EntityRef::tcp_rule(&*rule.rule_id);
        self.propagate(Some(PropagationEvent::deleted(entity, rule.version + 1)))
            .await;
        Ok(rule)
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %rule_id))]
    pub async fn get_tcp_rule(&self, ctx: RequestContext, rule_id: &str) -> Result<TcpRule, Error> {
        self.bounded(self.load_tcp_rule(rule_id)).await
    }

    /// Returns the lowest free external port on all addresses, optionally holding it for a
    /// follow-up add.
    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, lock = lock))]
    pub async fn get_available_port(&self, ctx: RequestContext, lock: bool) -> Result<u16, Error> {
        self.bounded(self.inner.ports.find_available(UNSPECIFIED_IP, lock))
            .await
    }

    /// Replaces the proxy configuration entries of an HTTP rule.
    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, rule_id = %req.rule_id))]
    pub async fn update_rule_config(
        &self,
        ctx: RequestContext,
        req: UpdateRuleConfig,
    ) -> Result<HttpRule, Error> {
        let (rule, event) = self
            .bounded(async {
                validation::rule_config(&req).into_result()?;
                let previous = self.load_http_rule(&req.rule_id).await?;
                let version = previous.version;
                let rule = self
                    .inner
                    .store
                    .update_http_rule(
                        HttpRule {
                            configs: req.configs.clone(),
                            ..previous
                        },
                        version,
                    )
                    .await
                    .map_err(|error| {
                        Error::store(error, format_args!("http rule {}", req.rule_id))
                    })?;
                info!(version = rule.version, configs = rule.configs.len(), "Updated rule config");

                let event = self.http_rule_event(Operation::Update, &rule).await;
                Ok((rule, event))
            })
            .await?;
        self.propagate(event).await;
        Ok(rule)
    }

    /// Cascades to referencing rules are enqueued in the background once the certificate is
    /// stored.
    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, certificate_id = %req.certificate_id))]
    pub async fn update_certificate(
        &self,
        ctx: RequestContext,
        req: UpdateCertificate,
    ) -> Result<CertificateUpdate, Error> {
        self.bounded(self.inner.certificates.upsert(&req)).await
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id, certificate_id = %req.certificate_id))]
    pub async fn delete_certificate(
        &self,
        ctx: RequestContext,
        req: DeleteCertificate,
    ) -> Result<Certificate, Error> {
        self.bounded(self.inner.certificates.delete(&req.certificate_id))
            .await
    }

    #[instrument(skip_all, fields(tenant = %ctx.tenant_id, event = %ctx.event_id))]
    pub async fn list_dataplane_endpoints(&self, ctx: RequestContext) -> Vec<String> {
        self.inner.membership.list_dataplane_addresses().await
    }

    /// Bounds the store work of an operation. Propagation happens after the operation returns
    /// and is bounded separately by the propagator's enqueue timeout.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.inner.request_timeout, op).await {
            Ok(res) => res,
            Err(_) => {
                warn!(timeout = ?self.inner.request_timeout, "Request timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Runs a sequence that reserves or releases ports on its own task. A request timeout stops
    /// waiting for it but cannot interrupt it, so every reservation it makes ends up backed by
    /// a persisted rule or released.
    async fn detached<T, F, Fut>(&self, op: F) -> Result<T, Error>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(self.clone()).in_current_span())
            .await
            .map_err(|error| Error::Persistence(format!("port task failed: {error}")))?
    }

    async fn reserve_and_create(&self, rule: TcpRule) -> Result<TcpRule, Error> {
        let addr = rule.addr();
        let rule_id = rule.rule_id.clone();
        self.inner.ports.reserve(addr, &rule_id).await?;
        match self.inner.store.create_tcp_rule(rule).await {
            Ok(rule) => Ok(rule),
            Err(error) => {
                self.release_unused(addr, &rule_id).await;
                Err(Error::store(error, format_args!("tcp rule {rule_id}")))
            }
        }
    }

    async fn move_and_update(&self, previous: TcpRule, merged: TcpRule) -> Result<TcpRule, Error> {
        let (from, to) = (previous.addr(), merged.addr());
        let moved = from != to;
        let rule_id = previous.rule_id.clone();

        if moved {
            self.inner.ports.reserve(to, &rule_id).await?;
        }
        let rule = match self
            .inner
            .store
            .update_tcp_rule(merged, previous.version)
            .await
        {
            Ok(rule) => rule,
            Err(error) => {
                if moved {
                    self.release_unused(to, &rule_id).await;
                }
                return Err(Error::store(error, format_args!("tcp rule {rule_id}")));
            }
        };
        if moved {
            // The rule is persisted; a failed release only leaks the old pair.
            if let Err(error) = self.inner.ports.release(from, &rule_id).await {
                warn!(addr = %from, %error, "Failed to release previous port");
            }
        }
        Ok(rule)
    }

    async fn remove_and_release(&self, rule_id: String) -> Result<TcpRule, Error> {
        let rule = self
            .inner
            .store
            .delete_tcp_rule(&rule_id)
            .await
            .map_err(|error| Error::store(error, format_args!("tcp rule {rule_id}")))?;
        if let Err(error) = self.inner.ports.release(rule.addr(), &rule_id).await {
            warn!(addr = %rule.addr(), %error, "Failed to release port");
        }
        Ok(rule)
    }

    async fn load_http_rule(&self, rule_id: &str) -> Result<HttpRule, Error> {
        self.inner
            .store
            .get_http_rule(rule_id)
            .await
            .map_err(|error| Error::store(error, format_args!("http rule {rule_id}")))
    }

    async fn load_tcp_rule(&self, rule_id: &str) -> Result<TcpRule, Error> {
        self.inner
            .store
            .get_tcp_rule(rule_id)
            .await
            .map_err(|error| Error::store(error, format_args!("tcp rule {rule_id}")))
    }

    /// The rule is already persisted, so a failure to build its event is only logged; the next
    /// reconciliation sweep re-sends it.
    async fn http_rule_event(
        &self,
        operation: Operation,
        rule: &HttpRule,
    ) -> Option<PropagationEvent> {
        match http_rule_event(&*self.inner.store, operation, rule.clone()).await {
            Ok(event) => Some(event),
            Err(error) => {
                warn!(rule_id = %rule.rule_id, %error, "Failed to build propagation event");
                None
            }
        }
    }

    async fn propagate(&self, event: Option<PropagationEvent>) {
        if let Some(event) = event {
            self.inner.propagator.submit(event).await;
        }
    }

    /// Undoes a reservation made for a rule that failed to persist, unless an existing rule
    /// with the same id already uses the pair.
    async fn release_unused(&self, addr: PortAddr, rule_id: &str) {
        match self.inner.store.find_tcp_rule_by_addr(addr).await {
            Ok(owner) if owner.rule_id == rule_id => return,
            Ok(_) | Err(StoreError::NotFound) => {}
            Err(error) => {
                warn!(%addr, %error, "Failed to check port owner; releasing reservation");
            }
        }
        match self.inner.ports.release(addr, rule_id).await {
            Ok(()) => debug!(%addr, "Released reservation of unpersisted rule"),
            Err(error) => warn!(%addr, %error, "Failed to release reservation"),
        }
    }
}
