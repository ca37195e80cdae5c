use crate::{
    core::{AllowListStore, UpdateOutcome, Updater},
    metrics::RequestMetrics,
};
use bytes::Bytes;
use futures::future;
use hyper::{http, Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    task::{Context, Poll},
};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, instrument, trace, warn, Instrument};

pub const ALLOWME_PATH: &str = "/allowme";

type Body = http_body_util::Full<Bytes>;

/// Builds an [`AllowMe`] service for each accepted connection.
pub struct NewAllowMe<S> {
    updater: Arc<Updater<S>>,
    metrics: RequestMetrics,
}

/// Adds the connection's peer address to the allow-list on `GET /allowme`.
///
/// Only the address of the connected socket is considered; forwarding headers
/// are ignored.
pub struct AllowMe<S> {
    peer: IpAddr,
    updater: Arc<Updater<S>>,
    metrics: RequestMetrics,
}

/// Accepts connections until the drain is signaled, then waits for in-flight
/// connections to complete.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve<S>(
    listener: TcpListener,
    new_svc: NewAllowMe<S>,
    drain: drain::Watch,
) -> anyhow::Result<()>
where
    S: AllowListStore + 'static,
{
    info!("HTTP server listening");
    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);

    loop {
        let (io, peer) = tokio::select! {
            accept = listener.accept() => match accept {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => {
                debug!("Stopped accepting connections");
                return Ok(());
            }
        };

        let svc = TowerToHyperService::new(new_svc.new_service(peer));
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let builder = auto::Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection(TokioIo::new(io), svc);
                tokio::pin!(conn);
                tokio::select! {
                    res = conn.as_mut() => {
                        if let Err(error) = res {
                            debug!(%error, "Connection failed");
                        }
                    }
                    release = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        if let Err(error) = release.release_after(conn).await {
                            debug!(%error, "Connection failed during shutdown");
                        }
                    }
                }
            }
            .instrument(info_span!("conn", %peer)),
        );
    }
}

// === impl NewAllowMe ===

impl<S> NewAllowMe<S> {
    pub fn new(updater: Arc<Updater<S>>, metrics: RequestMetrics) -> Self {
        Self { updater, metrics }
    }

    pub fn new_service(&self, peer: SocketAddr) -> AllowMe<S> {
        AllowMe {
            peer: peer.ip(),
            updater: self.updater.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S> Clone for NewAllowMe<S> {
    fn clone(&self) -> Self {
        Self {
            updater: self.updater.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

// === impl AllowMe ===

impl<S> Clone for AllowMe<S> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer,
            updater: self.updater.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S, B> tower::Service<Request<B>> for AllowMe<S>
where
    S: AllowListStore + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), path = %req.uri().path());
        if req.uri().path() != ALLOWME_PATH {
            return Box::pin(future::ok(empty(http::StatusCode::NOT_FOUND)));
        }
        if req.method() != http::Method::GET {
            return Box::pin(future::ok(empty(http::StatusCode::METHOD_NOT_ALLOWED)));
        }

        let AllowMe {
            peer,
            updater,
            metrics,
        } = self.clone();
        Box::pin(async move {
            let outcome = updater.admit(peer).await;
            metrics.observe(&outcome);
            Ok(respond(peer, outcome))
        })
    }
}

fn respond(peer: IpAddr, outcome: UpdateOutcome) -> Response<Body> {
    match outcome {
        UpdateOutcome::Added(addr) => {
            info!(%addr, "Added to allow-list");
            empty(http::StatusCode::NO_CONTENT)
        }
        UpdateOutcome::AlreadyPresent(addr) => {
            debug!(%addr, "Already allowed");
            empty(http::StatusCode::OK)
        }
        UpdateOutcome::Rejected(reason) => {
            info!(%peer, %reason, "Rejected source address");
            text(
                http::StatusCode::UNAUTHORIZED,
                format!("Invalid source address: {reason}\n"),
            )
        }
        UpdateOutcome::Failed(addr, error) => {
            warn!(%addr, %error, "Failed to update allow-list");
            text(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to update allow-list: {error}\n"),
            )
        }
    }
}

fn empty(status: http::StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("empty response must be valid")
}

fn text(status: http::StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("text response must be valid")
}
