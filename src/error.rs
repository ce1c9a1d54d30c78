//! Error taxonomy for proxied requests and process startup.
//!
//! Every [`ProxyError`] is terminal for the request it belongs to and maps to
//! exactly one HTTP status. Nothing here is retried: a proxied request is one
//! upstream attempt, and retry policy belongs to the caller.
//!
//! A client that disconnects mid-stream is not an error; see
//! [`crate::proxy_body::StreamOutcome`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Response, StatusCode};
use thiserror::Error;

use crate::headers::{self, CorsContext};
use crate::policy::DenyReason;
use crate::proxy_body::{self, ProxyBody};
use crate::target::TargetError;

/// Usage text returned when the caller supplied no target.
pub const USAGE: &str = "Missing required query parameter: url\n\nUsage: ?url=https://example.com";

/// Phase of the upstream exchange a timeout fired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Connecting and waiting for response headers.
    Connecting,
    /// Relaying a body after headers were exchanged.
    Streaming,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connecting => f.write_str("connecting"),
            TimeoutPhase::Streaming => f.write_str("streaming"),
        }
    }
}

/// Request-terminal failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No target URL was supplied at all.
    #[error("missing target url")]
    MissingTarget,

    /// The target URL was malformed or points somewhere the proxy refuses to go.
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] TargetError),

    /// The request's Origin failed the origin policy.
    #[error("origin denied: {0}")]
    OriginDenied(DenyReason),

    /// The client exceeded its request budget for the current window.
    #[error("rate limit exceeded for client {client}")]
    RateLimited {
        /// Client identity that was limited
        client: String,
        /// Origin header of the limited request, if any
        origin: Option<String>,
    },

    /// Network, DNS or TLS failure reaching the target.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The target did not answer in time.
    #[error("upstream timed out while {phase} after {after:?}")]
    Timeout {
        /// Phase the timer fired in
        phase: TimeoutPhase,
        /// Configured limit that was exceeded
        after: Duration,
    },
}

/// Fieldless mirror of [`ProxyError`] used in logs and state tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingTarget,
    InvalidTarget,
    OriginDenied,
    RateLimited,
    UpstreamUnreachable,
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MissingTarget => "missing_target",
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::OriginDenied => "origin_denied",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamUnreachable => "upstream_unreachable",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

impl ProxyError {
    /// Taxonomy member of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::MissingTarget => ErrorKind::MissingTarget,
            ProxyError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            ProxyError::OriginDenied(_) => ErrorKind::OriginDenied,
            ProxyError::RateLimited { .. } => ErrorKind::RateLimited,
            ProxyError::UpstreamUnreachable(_) => ErrorKind::UpstreamUnreachable,
            ProxyError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// HTTP status the caller sees for this error.
    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::MissingTarget | ErrorKind::InvalidTarget => StatusCode::BAD_REQUEST,
            ErrorKind::OriginDenied => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Short plain-text body for the caller.
    ///
    /// Denial messages name the offending origin the way cors-anywhere
    /// deployments do, so existing clients keep matching on them.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::MissingTarget => USAGE.to_string(),
            ProxyError::InvalidTarget(e) => format!("Invalid target URL: {e}"),
            ProxyError::OriginDenied(DenyReason::Blacklisted { origin }) => {
                format!("The origin \"{origin}\" was blacklisted by the operator of this proxy.")
            }
            ProxyError::OriginDenied(DenyReason::NotWhitelisted { origin }) => {
                format!(
                    "The origin \"{origin}\" was not whitelisted by the operator of this proxy."
                )
            }
            ProxyError::OriginDenied(DenyReason::MissingOrigin) => {
                "Missing required request header. Must specify one of: origin".to_string()
            }
            ProxyError::RateLimited { origin, client } => {
                let who = origin.as_deref().unwrap_or(client);
                format!(
                    "The origin \"{who}\" has sent too many requests.\n\
                     Try again later or host your own instance of this proxy."
                )
            }
            ProxyError::UpstreamUnreachable(_) => "Could not reach the target server.".to_string(),
            ProxyError::Timeout { phase, .. } => {
                format!("The target server timed out while {phase}.")
            }
        }
    }

    /// Render the error as a complete response, CORS headers included so a
    /// browser can read why the request failed.
    pub fn into_response(self, cors: &CorsContext) -> Response<ProxyBody> {
        let mut response = Response::new(proxy_body::full(Bytes::from(self.public_message())));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers::apply_cors(headers, cors);
        response
    }
}

/// Invalid startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rate limit {value:?}: {reason}")]
    RateLimit { value: String, reason: String },

    #[error("invalid header name {0:?}")]
    HeaderName(String),

    #[error("invalid origin pattern {0:?}")]
    OriginPattern(String),
}
