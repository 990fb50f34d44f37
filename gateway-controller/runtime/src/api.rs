//! The JSON request surface.
//!
//! Every response is wrapped in an envelope: `{"code", "msg", "bean"?, "validation_error"?}`.
//! Handlers decode the request, build a [`RequestContext`] from the `x-tenant-id` and
//! `x-event-id` headers and call into the [`GatewayController`].

use crate::{controller::GatewayController, server::Body};
use futures::future;
use gateway_controller_core::{
    request::{
        AddHttpRule, AddTcpRule, DeleteCertificate, DeleteRule, UpdateCertificate,
        UpdateHttpRule, UpdateRuleConfig, UpdateTcpRule,
    },
    store::RuleStore,
    Error as ControllerError, FieldErrors, RequestContext,
};
use http::{header, HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

const PREFIX: &str = "/v2/gateway/";
const TENANT_HEADER: &str = "x-tenant-id";
const EVENT_HEADER: &str = "x-event-id";
const MAX_BODY_BYTES: usize = 1 << 20;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub struct Api<S> {
    controller: GatewayController<S>,
    metrics: ApiMetrics,
}

#[derive(Clone, Debug)]
pub struct ApiMetrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    route: &'static str,
    method: &'static str,
    status: String,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    code: u16,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bean: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation_error: Option<FieldErrors>,
}

#[derive(Debug, Serialize)]
struct CertificateBean {
    certificate_id: String,
    version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cascaded: Option<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Route {
    HttpRule,
    TcpRule,
    AvailablePort,
    RuleConfig,
    Certificate,
    Ips,
}

/// A decoded request.
enum Call {
    AddHttpRule(AddHttpRule),
    UpdateHttpRule(UpdateHttpRule),
    DeleteHttpRule(DeleteRule),
    GetHttpRule(String),
    AddTcpRule(AddTcpRule),
    UpdateTcpRule(UpdateTcpRule),
    DeleteTcpRule(DeleteRule),
    GetTcpRule(String),
    AvailablePort { lock: bool },
    UpdateRuleConfig(UpdateRuleConfig),
    UpdateCertificate(UpdateCertificate),
    DeleteCertificate(DeleteCertificate),
    ListIps,
}

/// A request rejected before it reached the controller.
struct Rejection {
    status: StatusCode,
    msg: String,
    validation_error: Option<FieldErrors>,
}

// === impl Api ===

impl<S> Clone for Api<S> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S, B> tower::Service<Request<B>> for Api<S>
where
    S: RuleStore,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError> + Send,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), uri = %req.uri());
        let api = self.clone();
        Box::pin(async move { api.handle(req).await })
    }
}

impl<S: RuleStore> Api<S> {
    pub fn new(controller: GatewayController<S>, metrics: ApiMetrics) -> Self {
        Self {
            controller,
            metrics,
        }
    }

    async fn handle<B>(self, req: Request<B>) -> Result<Response<Body>, Error>
    where
        B: hyper::body::Body,
        B::Error: Into<BoxError>,
    {
        let method = method_label(req.method());
        let Some((route, id)) = Route::parse(req.uri().path()) else {
            self.metrics.observe("unknown", method, StatusCode::NOT_FOUND);
            return reject(Rejection::new(StatusCode::NOT_FOUND, "not found"));
        };

        let rsp = match context(req.headers()) {
            Err(rejection) => reject(rejection),
            Ok(ctx) => match Call::decode(route, id, req).await {
                Err(rejection) => reject(rejection),
                Ok(call) => self.dispatch(ctx, call).await,
            },
        }?;
        self.metrics.observe(route.as_str(), method, rsp.status());
        Ok(rsp)
    }

    async fn dispatch(&self, ctx: RequestContext, call: Call) -> Result<Response<Body>, Error> {
        let gateway = &self.controller;
        match call {
            Call::AddHttpRule(req) => reply(gateway.add_http_rule(ctx, req).await),
            Call::UpdateHttpRule(req) => reply(gateway.update_http_rule(ctx, req).await),
            Call::DeleteHttpRule(req) => reply(gateway.delete_http_rule(ctx, req).await),
            Call::GetHttpRule(id) => reply(gateway.get_http_rule(ctx, &id).await),
            Call::AddTcpRule(req) => reply(gateway.add_tcp_rule(ctx, req).await),
            Call::UpdateTcpRule(req) => reply(gateway.update_tcp_rule(ctx, req).await),
            Call::DeleteTcpRule(req) => reply(gateway.delete_tcp_rule(ctx, req).await),
            Call::GetTcpRule(id) => reply(gateway.get_tcp_rule(ctx, &id).await),
            Call::AvailablePort { lock } => reply(gateway.get_available_port(ctx, lock).await),
            Call::UpdateRuleConfig(req) => reply(gateway.update_rule_config(ctx, req).await),
            Call::UpdateCertificate(req) => {
                let res = gateway.update_certificate(ctx, req).await;
                reply(res.map(|update| CertificateBean {
                    certificate_id: update.certificate.certificate_id,
                    version: update.certificate.version,
                    cascaded: Some(update.cascaded),
                }))
            }
            Call::DeleteCertificate(req) => {
                let res = gateway.delete_certificate(ctx, req).await;
                reply(res.map(|certificate| CertificateBean {
                    certificate_id: certificate.certificate_id,
                    version: certificate.version,
                    cascaded: None,
                }))
            }
            Call::ListIps => reply(Ok(gateway.list_dataplane_endpoints(ctx).await)),
        }
    }
}

// === impl ApiMetrics ===

impl ApiMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of API requests by route and response status",
            requests.clone(),
        );
        Self { requests }
    }

    fn observe(&self, route: &'static str, method: &'static str, status: StatusCode) {
        let labels = RequestLabels {
            route,
            method,
            status: status.as_u16().to_string(),
        };
        self.requests.get_or_create(&labels).inc();
    }
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl Route ===

impl Route {
    /// Returns the route and the trailing id segment, if any.
    fn parse(path: &str) -> Option<(Self, Option<String>)> {
        let rest = path.strip_prefix(PREFIX)?.trim_end_matches('/');
        let (name, id) = match rest.split_once('/') {
            Some((name, id)) if !id.is_empty() && !id.contains('/') => (name, Some(id.to_string())),
            Some(_) => return None,
            None => (rest, None),
        };
        let route = match name {
            "http-rule" => Self::HttpRule,
            "tcp-rule" => Self::TcpRule,
            "available-port" => Self::AvailablePort,
            "rule-config" => Self::RuleConfig,
            "certificate" => Self::Certificate,
            "ips" => Self::Ips,
            _ => return None,
        };
        if id.is_some() && !matches!(route, Self::HttpRule | Self::TcpRule) {
            return None;
        }
        Some((route, id))
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::HttpRule => "http-rule",
            Self::TcpRule => "tcp-rule",
            Self::AvailablePort => "available-port",
            Self::RuleConfig => "rule-config",
            Self::Certificate => "certificate",
            Self::Ips => "ips",
        }
    }
}

// === impl Call ===

impl Call {
    async fn decode<B>(route: Route, id: Option<String>, req: Request<B>) -> Result<Self, Rejection>
    where
        B: hyper::body::Body,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let call = match (route, id, method) {
            (Route::HttpRule, Some(id), Method::GET) => Self::GetHttpRule(id),
            (Route::TcpRule, Some(id), Method::GET) => Self::GetTcpRule(id),
            (Route::HttpRule | Route::TcpRule, Some(_), _) => return Err(Rejection::method()),

            (Route::HttpRule, None, Method::POST) => Self::AddHttpRule(json(req).await?),
            (Route::HttpRule, None, Method::PUT) => Self::UpdateHttpRule(json(req).await?),
            (Route::HttpRule, None, Method::DELETE) => Self::DeleteHttpRule(json(req).await?),

            (Route::TcpRule, None, Method::POST) => Self::AddTcpRule(json(req).await?),
            (Route::TcpRule, None, Method::PUT) => Self::UpdateTcpRule(json(req).await?),
            (Route::TcpRule, None, Method::DELETE) => Self::DeleteTcpRule(json(req).await?),

            (Route::AvailablePort, _, Method::GET) => Self::AvailablePort {
                lock: query_flag(req.uri().query(), "lock"),
            },
            (Route::RuleConfig, _, Method::PUT) => Self::UpdateRuleConfig(json(req).await?),
            (Route::Certificate, _, Method::PUT) => Self::UpdateCertificate(json(req).await?),
            (Route::Certificate, _, Method::DELETE) => Self::DeleteCertificate(json(req).await?),
            (Route::Ips, _, Method::GET) => Self::ListIps,
            _ => return Err(Rejection::method()),
        };
        Ok(call)
    }
}

// === impl Rejection ===

impl Rejection {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
            validation_error: None,
        }
    }

    fn method() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    }
}

impl From<ControllerError> for Rejection {
    fn from(error: ControllerError) -> Self {
        let status = status(&error);
        let msg = error.to_string();
        let validation_error = match error {
            ControllerError::Validation(errors) => Some(errors),
            ControllerError::PortOutOfRange { port, min, max } => {
                let problem = if port <= min {
                    format!("The port field should be greater than {min}")
                } else {
                    format!("The port field should not be greater than {max}")
                };
                Some(FieldErrors::single("port", problem))
            }
            _ => None,
        };
        Self {
            status,
            msg,
            validation_error,
        }
    }
}

fn status(error: &ControllerError) -> StatusCode {
    match error {
        ControllerError::Validation(_) | ControllerError::PortOutOfRange { .. } => {
            StatusCode::BAD_REQUEST
        }
        ControllerError::Conflict(_) | ControllerError::PortConflict(_) => StatusCode::CONFLICT,
        ControllerError::NotFound(_) => StatusCode::NOT_FOUND,
        ControllerError::CapacityExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControllerError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ControllerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn context(headers: &HeaderMap) -> Result<RequestContext, Rejection> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let event_id = match header(EVENT_HEADER) {
        id if id.trim().is_empty() => format!("{:032x}", rand::random::<u128>()),
        id => id,
    };
    RequestContext::new(header(TENANT_HEADER), event_id).map_err(Rejection::from)
}

async fn json<T, B>(req: Request<B>) -> Result<T, Rejection>
where
    T: DeserializeOwned,
    B: hyper::body::Body,
    B::Error: Into<BoxError>,
{
    let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(body) => body.to_bytes(),
        Err(error) if error.downcast_ref::<LengthLimitError>().is_some() => {
            debug!(limit = MAX_BODY_BYTES, "Request body too large");
            return Err(Rejection::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {MAX_BODY_BYTES} bytes"),
            ));
        }
        Err(error) => {
            warn!(%error, "Failed to read request body");
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {error}"),
            ));
        }
    };
    serde_json::from_slice(&bytes).map_err(|error| {
        debug!(%error, "Failed to parse request body");
        Rejection::new(StatusCode::BAD_REQUEST, format!("invalid request body: {error}"))
    })
}

/// Parses a boolean query flag. Anything other than a true value is false.
fn query_flag(query: Option<&str>, name: &str) -> bool {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('=').or(Some((pair, "true"))))
        .filter(|(key, _)| *key == name)
        .any(|(_, value)| matches!(value.to_ascii_lowercase().as_str(), "1" | "t" | "true"))
}

fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        _ => "OTHER",
    }
}

fn reply<T: Serialize>(res: Result<T, ControllerError>) -> Result<Response<Body>, Error> {
    match res {
        Ok(bean) => envelope(
            StatusCode::OK,
            Envelope {
                code: StatusCode::OK.as_u16(),
                msg: "success".to_string(),
                bean: Some(bean),
                validation_error: None,
            },
        ),
        Err(error) => {
            if error.is_caller_error() {
                debug!(%error, "Request rejected");
            } else {
                info!(%error, "Request failed");
            }
            reject(error.into())
        }
    }
}

fn reject(rejection: Rejection) -> Result<Response<Body>, Error> {
    envelope::<()>(
        rejection.status,
        Envelope {
            code: rejection.status.as_u16(),
            msg: rejection.msg,
            bean: None,
            validation_error: rejection.validation_error,
        },
    )
}

fn envelope<T: Serialize>(
    status: StatusCode,
    envelope: Envelope<T>,
) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&envelope)?;
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("json response must be valid"))
}
