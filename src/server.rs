//! HTTP listener: accepts connections and feeds requests to the engine.
//!
//! Connections are served by hyper-util's auto builder (HTTP/1.1 and h2c)
//! and tracked so shutdown can drain them. A maintenance task purges
//! expired rate-limit windows while the server runs.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Uri};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::proxy_body;
use crate::proxy_service::{ClientId, ProxyEngine, ProxyRequest};
use crate::rate_limiter::RateLimiter;

/// Pause after a failed accept (e.g. EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
/// How often expired rate-limit windows are dropped.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);
/// Longest wait for in-flight connections once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Split a request URI into the raw target and the base redirects are
/// rewritten against.
///
/// `?url=<encoded>` wins; otherwise everything after the first `/` is the
/// target (`/https://example.com/a?b=1`). An empty target yields `None`.
pub fn extract_target(uri: &Uri) -> (Option<String>, String) {
    if let Some(query) = uri.query() {
        let from_query = form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "url")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.trim().is_empty());
        if let Some(target) = from_query {
            return (Some(target), uri.path().to_string());
        }
    }

    let suffix = uri.path().trim_start_matches('/');
    if suffix.is_empty() {
        return (None, "/".to_string());
    }
    let target = match uri.query() {
        Some(query) => format!("{suffix}?{query}"),
        None => suffix.to_string(),
    };
    (Some(target), "/".to_string())
}

/// Detach a hyper request from its connection.
pub fn into_proxy_request(req: Request<Incoming>, peer: SocketAddr) -> ProxyRequest {
    let (parts, body) = req.into_parts();
    let (target, proxy_base) = extract_target(&parts.uri);
    ProxyRequest {
        method: parts.method,
        target,
        headers: parts.headers,
        body: proxy_body::boxed(body),
        client: ClientId::from(peer),
        proxy_base,
    }
}

/// Serve until `shutdown` is cancelled, then drain open connections.
pub async fn serve(
    listener: TcpListener,
    engine: ProxyEngine,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let tracker = TaskTracker::new();
    spawn_purge_task(&tracker, engine.rate_limiter(), shutdown.clone());

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        tracker.spawn(serve_connection(stream, peer, engine.clone(), shutdown.clone()));
    }

    info!(open_connections = tracker.len(), "Shutting down, draining connections");
    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        warn!(
            open_connections = tracker.len(),
            "Drain timeout elapsed, dropping remaining connections"
        );
    }
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: ProxyEngine,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let service = service_fn(move |req: Request<Incoming>| {
        let engine = engine.clone();
        async move { Ok::<_, Infallible>(engine.handle(into_proxy_request(req, peer)).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Connection closed with error");
    }
}

fn spawn_purge_task(tracker: &TaskTracker, limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
    if !limiter.is_enabled() {
        return;
    }
    tracker.spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    limiter.purge_expired();
                }
            }
        }
    });
}
