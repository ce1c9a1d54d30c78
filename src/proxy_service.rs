//! The proxy engine.
//!
//! [`ProxyEngine::handle`] takes one [`ProxyRequest`] through
//! `Received -> Validated -> Authorized -> Connecting -> Streaming` and
//! always produces a response: either the target's, relayed with CORS
//! headers injected, or a CORS-enabled error response.
//!
//! Preflight (`OPTIONS`) requests are answered directly and never reach the
//! target, the origin policy or the rate limiter.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::ProxyOptions;
use crate::error::{ErrorKind, ProxyError};
use crate::headers::{self, CorsContext};
use crate::policy::{self, OriginPolicy, PolicyDecision};
use crate::proxy_body::{self, ProxyBody, RelayBody};
use crate::rate_limiter::RateLimiter;
use crate::target::{TargetDescriptor, TargetResolver};
use crate::timeout::{self, IdleTimeoutBody, ProgressBody};
use crate::upstream::{self, UpstreamClient};

// ============================================================================
// Request model
// ============================================================================

/// Identity the rate limiter counts against, normally the peer IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for ClientId {
    /// The port is dropped: every connection from one host shares a budget.
    fn from(addr: SocketAddr) -> Self {
        Self::from(addr.ip())
    }
}

impl From<IpAddr> for ClientId {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound request, already detached from the listener.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    /// Raw target URL as supplied by the caller; `None` if absent
    pub target: Option<String>,
    pub headers: HeaderMap,
    pub body: ProxyBody,
    pub client: ClientId,
    /// Path redirects are rewritten against, e.g. `/` or `/api/proxy`
    pub proxy_base: String,
}

impl ProxyRequest {
    pub fn new(method: Method, target: Option<impl Into<String>>) -> Self {
        Self {
            method,
            target: target.map(Into::into),
            headers: HeaderMap::new(),
            body: proxy_body::empty(),
            client: ClientId::from("unknown"),
            proxy_base: "/".to_string(),
        }
    }

    /// Append a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: ProxyBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_client(mut self, client: impl Into<ClientId>) -> Self {
        self.client = client.into();
        self
    }

    pub fn with_proxy_base(mut self, base: impl Into<String>) -> Self {
        self.proxy_base = base.into();
        self
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Where a request is in its lifecycle.
///
/// `Completed` for a relayed response is reported by the response body once
/// the last frame is delivered (see [`crate::proxy_body::StreamOutcome`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Received,
    Validated,
    Authorized,
    Connecting,
    Streaming,
    Completed,
    Failed(ErrorKind),
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyState::Received => f.write_str("received"),
            ProxyState::Validated => f.write_str("validated"),
            ProxyState::Authorized => f.write_str("authorized"),
            ProxyState::Connecting => f.write_str("connecting"),
            ProxyState::Streaming => f.write_str("streaming"),
            ProxyState::Completed => f.write_str("completed"),
            ProxyState::Failed(kind) => write!(f, "failed({kind})"),
        }
    }
}

impl ProxyState {
    fn advance(&mut self, next: ProxyState) {
        debug!(from = %self, to = %next, "State transition");
        *self = next;
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Shared, cheaply cloneable request handler.
#[derive(Clone)]
pub struct ProxyEngine {
    options: Arc<ProxyOptions>,
    policy: Arc<OriginPolicy>,
    limiter: Arc<RateLimiter>,
    resolver: TargetResolver,
    client: UpstreamClient,
}

impl ProxyEngine {
    pub fn new(options: ProxyOptions) -> Self {
        let policy = OriginPolicy::new(
            options.origin_whitelist.clone(),
            options.origin_blacklist.clone(),
            options.require_origin_header,
        );
        let limiter = RateLimiter::from_config(options.rate_limit);
        let resolver = TargetResolver::new(options.allow_private_targets);
        let client = upstream::build_client(
            options.allow_private_targets,
            options.timeouts.connect_timeout,
        );
        Self {
            options: Arc::new(options),
            policy: Arc::new(policy),
            limiter: Arc::new(limiter),
            resolver,
            client,
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Limiter shared with the maintenance task that purges stale windows.
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Handle one request. Never fails: errors become CORS-enabled
    /// responses with the status of their kind.
    pub async fn handle(&self, req: ProxyRequest) -> Response<ProxyBody> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "proxy",
            %request_id,
            client = %req.client,
            method = %req.method,
        );
        let cors = CorsContext::from_request(&req.headers);

        async move {
            let mut state = ProxyState::Received;
            match self.try_handle(req, &cors, &mut state).await {
                Ok(response) => response,
                Err(err) => {
                    state.advance(ProxyState::Failed(err.kind()));
                    log_failure(&err);
                    err.into_response(&cors)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_handle(
        &self,
        req: ProxyRequest,
        cors: &CorsContext,
        state: &mut ProxyState,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let ProxyRequest {
            method,
            target,
            headers: inbound,
            body,
            client,
            proxy_base,
        } = req;

        if method == Method::OPTIONS {
            let mut response = Response::new(proxy_body::empty());
            *response.headers_mut() = headers::preflight_headers(cors, self.options.cors_max_age);
            state.advance(ProxyState::Completed);
            return Ok(response);
        }

        let raw = target.ok_or(ProxyError::MissingTarget)?;
        let target = self.resolver.resolve(&raw)?;
        state.advance(ProxyState::Validated);

        self.authorize(cors.origin.as_ref().map(HeaderValue::as_bytes), &client)?;
        state.advance(ProxyState::Authorized);

        let mut outbound_headers = headers::for_request(&inbound, &self.options.remove_headers);
        if self.options.xfwd {
            headers::append_forwarded(&mut outbound_headers, &inbound, client.as_str(), "http");
        }
        let idle = self.options.timeouts.idle_timeout;
        let (upload, progress) = ProgressBody::new(IdleTimeoutBody::new(body, idle));
        let mut outbound = Request::new(proxy_body::boxed(upload));
        *outbound.method_mut() = method;
        *outbound.uri_mut() = target.uri().clone();
        *outbound.headers_mut() = outbound_headers;

        state.advance(ProxyState::Connecting);
        let connect_timeout = self.options.timeouts.connect_timeout;
        let upstream_response =
            timeout::await_response(self.client.request(outbound), progress, connect_timeout)
                .await?
                .map_err(|err| upstream::classify(&err, connect_timeout))?;

        state.advance(ProxyState::Streaming);
        Ok(self.relay(upstream_response, &target, cors, &proxy_base))
    }

    fn authorize(&self, origin: Option<&[u8]>, client: &ClientId) -> Result<(), ProxyError> {
        if let PolicyDecision::Deny(reason) = self.policy.check_raw(origin) {
            return Err(ProxyError::OriginDenied(reason));
        }

        let origin = origin.and_then(|raw| std::str::from_utf8(raw).ok());
        let exempt =
            origin.is_some_and(|o| policy::matches_any(&self.options.rate_limit_exempt, o));
        if !exempt && !self.limiter.allow(client.as_str()) {
            return Err(ProxyError::RateLimited {
                client: client.to_string(),
                origin: origin.map(str::to_string),
            });
        }
        Ok(())
    }

    fn relay(
        &self,
        upstream_response: Response<hyper::body::Incoming>,
        target: &TargetDescriptor,
        cors: &CorsContext,
        proxy_base: &str,
    ) -> Response<ProxyBody> {
        let (parts, incoming) = upstream_response.into_parts();
        let mut out_headers = headers::for_response(&parts.headers, cors);
        headers::set_target_urls(&mut out_headers, target);
        if self.options.redirect_same_origin
            && headers::rewrite_redirect(parts.status, &mut out_headers, target, proxy_base)
        {
            debug!(status = parts.status.as_u16(), "Redirect location rewritten through proxy");
        }
        info!(
            status = parts.status.as_u16(),
            target_url = %target,
            "Upstream responded"
        );

        let idle = self.options.timeouts.idle_timeout;
        let body = RelayBody::new(IdleTimeoutBody::new(incoming, idle), target.to_string());
        let mut response = Response::new(proxy_body::boxed(body));
        *response.status_mut() = parts.status;
        *response.headers_mut() = out_headers;
        response
    }
}

fn log_failure(err: &ProxyError) {
    let kind = err.kind();
    match kind {
        ErrorKind::MissingTarget | ErrorKind::InvalidTarget => {
            info!(error_kind = %kind, error = %err, "Rejected request target");
        }
        ErrorKind::OriginDenied => {
            warn!(error_kind = %kind, error = %err, "Origin policy denied request");
        }
        ErrorKind::RateLimited => {
            info!(error_kind = %kind, error = %err, "Rate limit exceeded");
        }
        ErrorKind::UpstreamUnreachable | ErrorKind::Timeout => {
            warn!(error_kind = %kind, error = %err, "Upstream request failed");
        }
    }
}
