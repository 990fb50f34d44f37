//! Liveness, readiness and metrics endpoints.

use crate::server::Body;
use futures::future;
use http::{header, Method, Request, Response, StatusCode};
use prometheus_client::registry::Registry;
use std::{
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::watch;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct Admin {
    ready: watch::Receiver<bool>,
    registry: Arc<Registry>,
}

// === impl Admin ===

impl Admin {
    pub fn new(ready: watch::Receiver<bool>, registry: Arc<Registry>) -> Self {
        Self { ready, registry }
    }

    fn handle<B>(&self, req: &Request<B>) -> Response<Body> {
        if !matches!(*req.method(), Method::GET | Method::HEAD) {
            return rsp(StatusCode::METHOD_NOT_ALLOWED, Body::default());
        }
        match req.uri().path() {
            "/live" => text(StatusCode::OK, "live\n"),
            "/ready" => {
                if *self.ready.borrow() {
                    text(StatusCode::OK, "ready\n")
                } else {
                    text(StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
                }
            }
            "/metrics" => self.metrics(),
            _ => rsp(StatusCode::NOT_FOUND, Body::default()),
        }
    }

    fn metrics(&self) -> Response<Body> {
        let mut buf = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut buf, &self.registry) {
            warn!(%error, "Failed to encode metrics");
            return rsp(StatusCode::INTERNAL_SERVER_ERROR, Body::default());
        }
        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Body::from(buf))
            .expect("metrics response must be valid")
    }
}

impl<B> tower::Service<Request<B>> for Admin {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::Ready<Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        future::ok(self.handle(&req))
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .expect("text response must be valid")
}

fn rsp(status: StatusCode, body: Body) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(body)
        .expect("empty response must be valid")
}
