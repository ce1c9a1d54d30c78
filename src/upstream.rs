//! Outbound HTTP(S) client.
//!
//! The connector resolves host names through [`GuardedResolver`], which drops
//! private, loopback and link-local answers unless private targets are
//! allowed. Lexical checks in [`crate::target`] cannot see what a public
//! looking name resolves to; this closes that gap at connect time.

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::dns::Name;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tower_service::Service;
use tracing::{debug, warn};

use crate::error::{ProxyError, TimeoutPhase};
use crate::proxy_body::ProxyBody;
use crate::target::{TargetError, is_private_ip};

/// Pooled client used for every upstream request.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector<GuardedResolver>>, ProxyBody>;

/// How long an idle pooled upstream connection is kept.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// DNS failures and guard refusals.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dns lookup for {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{host} resolves only to private, loopback or link-local addresses")]
    Blocked { host: String },
}

/// DNS resolver that refuses internal addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardedResolver {
    allow_private: bool,
}

impl GuardedResolver {
    pub fn new(allow_private: bool) -> Self {
        Self { allow_private }
    }

    /// Resolve `host`, keeping only addresses the proxy may connect to.
    /// Ports in the result are 0; the connector fills in the target port.
    pub async fn resolve(&self, host: &str) -> Result<Vec<SocketAddr>, ResolveError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                source,
            })?
            .collect();
        self.filter(host, addrs)
    }

    fn filter(&self, host: &str, addrs: Vec<SocketAddr>) -> Result<Vec<SocketAddr>, ResolveError> {
        if self.allow_private {
            return Ok(addrs);
        }
        let total = addrs.len();
        let public: Vec<SocketAddr> = addrs
            .into_iter()
            .filter(|addr| !is_private_ip(&addr.ip()))
            .collect();
        if public.is_empty() {
            return Err(ResolveError::Blocked {
                host: host.to_string(),
            });
        }
        if public.len() < total {
            debug!(
                host,
                dropped = total - public.len(),
                "Dropped private addresses from DNS answer"
            );
        }
        Ok(public)
    }
}

impl Service<Name> for GuardedResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = ResolveError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = *self;
        Box::pin(async move { resolver.resolve(name.as_str()).await.map(Vec::into_iter) })
    }
}

/// Build the upstream client.
///
/// HTTPS targets are verified against the platform's root certificates. If
/// none can be loaded the client still serves plain HTTP targets and every
/// HTTPS handshake fails as unreachable.
pub fn build_client(allow_private: bool, connect_timeout: Duration) -> UpstreamClient {
    let mut http = HttpConnector::new_with_resolver(GuardedResolver::new(allow_private));
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(connect_timeout));

    let tls = match HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder,
        Err(e) => {
            warn!(error = %e, "No native root certificates found, HTTPS targets will fail");
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth();
            HttpsConnectorBuilder::new().with_tls_config(config)
        }
    };
    let https = tls
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(https)
}

/// Map a client failure onto the request taxonomy.
///
/// A guard refusal surfaces as an invalid target, a connect timer as a
/// timeout, and everything else (refused, reset, DNS, TLS) as unreachable.
pub fn classify(err: &hyper_util::client::legacy::Error, connect_timeout: Duration) -> ProxyError {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = source {
        if let Some(ResolveError::Blocked { host }) = cause.downcast_ref::<ResolveError>() {
            return ProxyError::InvalidTarget(TargetError::PrivateAddress(host.clone()));
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return ProxyError::Timeout {
                    phase: TimeoutPhase::Connecting,
                    after: connect_timeout,
                };
            }
        }
        source = cause.source();
    }
    ProxyError::UpstreamUnreachable(error_chain(err))
}

/// `outer: cause: root cause` rendering for logs.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_filter_drops_private_answers() {
        let resolver = GuardedResolver::new(false);
        let kept = resolver
            .filter("mixed.example", vec![addr("10.0.0.5:0"), addr("93.184.216.34:0")])
            .unwrap();
        assert_eq!(kept, vec![addr("93.184.216.34:0")]);
    }

    #[test]
    fn test_filter_blocks_all_private() {
        let resolver = GuardedResolver::new(false);
        let err = resolver
            .filter("internal.example", vec![addr("127.0.0.1:0"), addr("[::1]:0")])
            .unwrap_err();
        assert!(matches!(err, ResolveError::Blocked { host } if host == "internal.example"));
    }

    #[test]
    fn test_filter_allows_private_with_override() {
        let resolver = GuardedResolver::new(true);
        let kept = resolver.filter("localhost", vec![addr("127.0.0.1:0")]).unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn test_localhost_blocked_by_dns_guard() {
        let err = GuardedResolver::new(false).resolve("localhost").await.unwrap_err();
        assert!(matches!(err, ResolveError::Blocked { .. }));
    }

    #[test]
    fn test_error_chain_renders_sources() {
        let err = ResolveError::Lookup {
            host: "nx.example".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such host"),
        };
        let rendered = error_chain(&err);
        assert!(rendered.starts_with("dns lookup for nx.example failed"));
        assert!(rendered.ends_with(": no such host"));
    }
}
