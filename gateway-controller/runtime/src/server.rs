use hyper::{body::Incoming, Request, Response};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use std::error::Error as StdError;
use tokio::net::TcpListener;
use tracing::{debug, debug_span, info, warn, Instrument};

pub(crate) type Body = http_body_util::Full<bytes::Bytes>;

/// Serves HTTP/1 connections accepted by `listener` until `drain` is signaled. In-flight
/// connections are shut down gracefully and hold the drain until they complete.
pub(crate) async fn serve<S>(
    name: &'static str,
    listener: TcpListener,
    svc: S,
    drain: drain::Watch,
) -> anyhow::Result<()>
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let addr = listener.local_addr()?;
    info!(%addr, "{name} server listening");

    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        let (io, client) = tokio::select! {
            _ = &mut shutdown => {
                debug!(%addr, "{name} server shutting down");
                return Ok(());
            }
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
        };

        let svc = TowerToHyperService::new(svc.clone());
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(io), svc);
                tokio::pin!(conn);
                tokio::select! {
                    res = &mut conn => {
                        if let Err(error) = res {
                            debug!(%error, "Connection failed");
                        }
                    }
                    handle = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        if let Err(error) = handle.release_after(conn).await {
                            debug!(%error, "Connection failed while draining");
                        }
                    }
                }
            }
            .instrument(debug_span!("conn", server = name, %client)),
        );
    }
}
