//! Configuration surface.
//!
//! [`Config`] is the CLI/environment view parsed by clap. It is validated
//! and converted into [`ProxyOptions`], the plain struct the engine consumes,
//! so library users never depend on clap.
//!
//! The environment variables of cors-anywhere deployments are honored:
//! `CORSANYWHERE_WHITELIST`, `CORSANYWHERE_BLACKLIST` (comma separated) and
//! `CORSANYWHERE_RATELIMIT`.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Parser};
use http::header::HeaderName;

use crate::error::ConfigError;
use crate::logging::LogFormat;
use crate::policy::{self, OriginPattern};
use crate::rate_limiter::RateLimitConfig;
use crate::timeout::TimeoutConfig;

/// Options the engine runs with. `Default` is the permissive out-of-the-box
/// policy: no lists, no rate limit, redirects kept inside the proxy.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Allowed origins; non-empty means everything else is denied
    pub origin_whitelist: Vec<OriginPattern>,
    /// Denied origins; ignored while a whitelist is set
    pub origin_blacklist: Vec<OriginPattern>,
    /// Per-client budget; `None` disables rate limiting
    pub rate_limit: Option<RateLimitConfig>,
    /// Origins that bypass the rate limiter
    pub rate_limit_exempt: Vec<OriginPattern>,
    /// Extra request headers stripped before forwarding
    pub remove_headers: Vec<HeaderName>,
    /// Refuse requests without an Origin header
    pub require_origin_header: bool,
    /// Rewrite redirect `Location`s back through the proxy
    pub redirect_same_origin: bool,
    /// Allow loopback, private and link-local targets
    pub allow_private_targets: bool,
    /// Add `X-Forwarded-*` headers to outbound requests
    pub xfwd: bool,
    pub timeouts: TimeoutConfig,
    /// `Access-Control-Max-Age` for preflight responses
    pub cors_max_age: Option<u64>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            origin_whitelist: Vec::new(),
            origin_blacklist: Vec::new(),
            rate_limit: None,
            rate_limit_exempt: Vec::new(),
            remove_headers: Vec::new(),
            require_origin_header: false,
            redirect_same_origin: true,
            allow_private_targets: false,
            xfwd: false,
            timeouts: TimeoutConfig::default(),
            cors_max_age: None,
        }
    }
}

/// Corsway - streaming CORS-anywhere proxy.
#[derive(Debug, Clone, Parser)]
#[command(name = "corsway", version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CORSWAY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Allowed origin patterns (comma separated)
    #[arg(long, env = "CORSANYWHERE_WHITELIST", value_delimiter = ',')]
    pub origin_whitelist: Vec<String>,

    /// Denied origin patterns (comma separated)
    #[arg(long, env = "CORSANYWHERE_BLACKLIST", value_delimiter = ',')]
    pub origin_blacklist: Vec<String>,

    /// "<max> <window> [exempt-origin ...]"; a bare number window is minutes
    #[arg(long, env = "CORSANYWHERE_RATELIMIT")]
    pub rate_limit: Option<String>,

    /// Request headers to strip before forwarding (comma separated)
    #[arg(long, env = "CORSWAY_REMOVE_HEADERS", value_delimiter = ',')]
    pub remove_headers: Vec<String>,

    /// Reject requests that carry no Origin header
    #[arg(long, env = "CORSWAY_REQUIRE_ORIGIN", default_value_t = false, action = ArgAction::Set)]
    pub require_origin_header: bool,

    /// Rewrite redirect targets through the proxy
    #[arg(
        long,
        env = "CORSWAY_REDIRECT_SAME_ORIGIN",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub redirect_same_origin: bool,

    /// Allow loopback, private and link-local targets
    #[arg(
        long,
        env = "CORSWAY_ALLOW_PRIVATE_TARGETS",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub allow_private_targets: bool,

    /// Add X-Forwarded-* headers to outbound requests
    #[arg(long, env = "CORSWAY_XFWD", default_value_t = false, action = ArgAction::Set)]
    pub xfwd: bool,

    /// Limit for connecting to the target and receiving its headers once the
    /// upload stops making progress
    #[arg(
        long,
        env = "CORSWAY_CONNECT_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub connect_timeout: Duration,

    /// Limit for a stalled body on either leg
    #[arg(
        long,
        env = "CORSWAY_IDLE_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub idle_timeout: Duration,

    /// Access-Control-Max-Age for preflight responses, in seconds
    #[arg(long, env = "CORSWAY_CORS_MAX_AGE")]
    pub cors_max_age: Option<u64>,

    /// Log output format
    #[arg(long, env = "CORSWAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    /// Validate and convert into engine options.
    pub fn proxy_options(&self) -> Result<ProxyOptions, ConfigError> {
        let (rate_limit, rate_limit_exempt) = match self.rate_limit.as_deref() {
            Some(raw) => match parse_rate_limit(raw)? {
                Some((limit, exempt)) => (Some(limit), exempt),
                None => (None, Vec::new()),
            },
            None => (None, Vec::new()),
        };

        Ok(ProxyOptions {
            origin_whitelist: policy::parse_patterns(&self.origin_whitelist)?,
            origin_blacklist: policy::parse_patterns(&self.origin_blacklist)?,
            rate_limit,
            rate_limit_exempt,
            remove_headers: parse_header_names(&self.remove_headers)?,
            require_origin_header: self.require_origin_header,
            redirect_same_origin: self.redirect_same_origin,
            allow_private_targets: self.allow_private_targets,
            xfwd: self.xfwd,
            timeouts: TimeoutConfig::new(self.connect_timeout, self.idle_timeout),
            cors_max_age: self.cors_max_age,
        })
    }
}

/// Parse `"<max> <window> [exempt-origin ...]"`.
///
/// A bare number window counts minutes, matching `CORSANYWHERE_RATELIMIT`
/// (`"50 3"` is 50 requests per 3 minutes); humantime values such as `60s`
/// are accepted too. Blank input means no limit.
pub fn parse_rate_limit(
    raw: &str,
) -> Result<Option<(RateLimitConfig, Vec<OriginPattern>)>, ConfigError> {
    let invalid = |reason: &str| ConfigError::RateLimit {
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut tokens = raw.split_whitespace();
    let Some(max) = tokens.next() else {
        return Ok(None);
    };
    let max_requests: u32 = max.parse().map_err(|_| invalid("max requests is not a number"))?;
    let window = match tokens.next() {
        Some(window) => match window.parse::<u64>() {
            Ok(minutes) => Duration::from_secs(minutes.saturating_mul(60)),
            Err(_) => humantime::parse_duration(window)
                .map_err(|_| invalid("window is not a duration"))?,
        },
        None => return Err(invalid("missing window")),
    };

    let limit = RateLimitConfig::new(max_requests, window);
    if !limit.is_valid() {
        return Err(invalid("max requests and window must be non-zero"));
    }
    let exempt = policy::parse_patterns(tokens)?;
    Ok(Some((limit, exempt)))
}

fn parse_header_names(names: &[String]) -> Result<Vec<HeaderName>, ConfigError> {
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(|name| {
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|_| ConfigError::HeaderName(name.to_string()))
        })
        .collect()
}
