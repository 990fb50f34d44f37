//! Pushes propagation events to every data-plane proxy over HTTP.

use bytes::Bytes;
use gateway_controller_core::{
    delivery::{Delivery, Membership, PublishError},
    event::PropagationEvent,
};
use http::{header, Method, Request};
use http_body_util::Full;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, trace};

/// The path data-plane proxies accept events on.
pub const EVENTS_PATH: &str = "/v1/events";

/// POSTs each event as JSON to every address known to the membership.
///
/// A publish succeeds only once every proxy accepted the event. Retries re-send to all of them;
/// proxies discard events they have already applied.
pub struct HttpDelivery {
    client: Client<HttpConnector, Full<Bytes>>,
    membership: Arc<dyn Membership>,
    timeout: Duration,
}

// === impl HttpDelivery ===

impl HttpDelivery {
    pub fn new(membership: Arc<dyn Membership>, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            membership,
            timeout,
        }
    }

    async fn post(&self, addr: &str, body: Bytes) -> Result<(), String> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}{EVENTS_PATH}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|error| format!("invalid request: {error}"))?;

        let rsp = match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(rsp)) => rsp,
            Ok(Err(error)) => return Err(error.to_string()),
            Err(_) => return Err(format!("timed out after {:?}", self.timeout)),
        };
        if !rsp.status().is_success() {
            return Err(format!("unexpected status {}", rsp.status()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for HttpDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDelivery")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Delivery for HttpDelivery {
    async fn publish(&self, event: &PropagationEvent) -> Result<(), PublishError> {
        let body = serde_json::to_vec(event)
            .map(Bytes::from)
            .map_err(|error| PublishError::Permanent(error.to_string()))?;

        let addrs = self.membership.list_dataplane_addresses().await;
        if addrs.is_empty() {
            debug!(entity = %event.entity, "No data-plane proxies to publish to");
            return Ok(());
        }

        let results = futures::future::join_all(addrs.iter().map(|addr| {
            let body = body.clone();
            async move { (addr, self.post(addr, body).await) }
        }))
        .await;

        let failures = results
            .into_iter()
            .filter_map(|(addr, res)| res.err().map(|error| format!("{addr}: {error}")))
            .collect::<Vec<_>>();
        if !failures.is_empty() {
            return Err(PublishError::Transient(failures.join("; ")));
        }
        trace!(entity = %event.entity, proxies = addrs.len(), "Published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{membership::StaticMembership, server, test_util::mk_http_rule};
    use gateway_controller_core::event::Operation;
    use http::{Response, StatusCode};
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use std::net::SocketAddr;
    use tokio::{net::TcpListener, sync::mpsc};

    /// Serves a fake proxy that records decoded events and answers with `status`.
    async fn proxy(
        status: StatusCode,
    ) -> (
        SocketAddr,
        mpsc::UnboundedReceiver<PropagationEvent>,
        drain::Signal,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (signal, watch) = drain::channel();
        let svc = tower::service_fn(move |req: Request<Incoming>| {
            let tx = tx.clone();
            async move {
                assert_eq!(req.uri().path(), EVENTS_PATH);
                let body = req.into_body().collect().await?.to_bytes();
                let event = serde_json::from_slice::<PropagationEvent>(&body)
                    .expect("event must decode");
                let _ = tx.send(event);
                Ok::<_, hyper::Error>(
                    Response::builder()
                        .status(status)
                        .body(server::Body::default())
                        .unwrap(),
                )
            }
        });
        tokio::spawn(server::serve("proxy", listener, svc, watch));
        (addr, rx, signal)
    }

    fn delivery(addrs: impl IntoIterator<Item = SocketAddr>) -> HttpDelivery {
        let membership = StaticMembership::new(addrs.into_iter().map(|a| a.to_string()));
        HttpDelivery::new(Arc::new(membership), Duration::from_secs(2))
    }

    fn event() -> PropagationEvent {
        let rule = gateway_controller_core::HttpRule {
            version: 1,
            ..mk_http_rule("r1", None)
        };
        PropagationEvent::http_rule(Operation::Create, rule, None)
    }

    #[tokio::test]
    async fn publishes_to_every_proxy() {
        let (a, mut rx_a, _sa) = proxy(StatusCode::OK).await;
        let (b, mut rx_b, _sb) = proxy(StatusCode::ACCEPTED).await;

        delivery([a, b]).publish(&event()).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), event());
        assert_eq!(rx_b.recv().await.unwrap(), event());
    }

    #[tokio::test]
    async fn rejected_events_are_transient() {
        let (ok, _rx_ok, _s1) = proxy(StatusCode::OK).await;
        let (failing, _rx, _s2) = proxy(StatusCode::SERVICE_UNAVAILABLE).await;

        let res = delivery([ok, failing]).publish(&event()).await;
        match res {
            Err(PublishError::Transient(reason)) => {
                assert!(reason.contains(&failing.to_string()), "{reason}");
                assert!(!reason.contains(&ok.to_string()), "{reason}");
            }
            res => panic!("unexpected {res:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_proxies_are_transient() {
        // Bind and drop to find a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let res = delivery([addr]).publish(&event()).await;
        assert!(matches!(res, Err(PublishError::Transient(_))), "{res:?}");
    }

    #[tokio::test]
    async fn no_proxies_is_a_noop() {
        delivery([]).publish(&event()).await.unwrap();
    }
}
