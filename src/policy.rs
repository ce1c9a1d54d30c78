//! Origin allow/deny policy.
//!
//! # Evaluation Order
//!
//! 1. Missing `Origin` header: allowed unless the policy requires one.
//! 2. Non-empty whitelist: only matching origins are allowed. The blacklist
//!    is not consulted.
//! 3. Non-empty blacklist: matching origins are denied.
//! 4. Otherwise allowed.
//!
//! # Pattern Syntax
//!
//! - `https://app.example.com` (anything containing `://`): compared with
//!   the whole Origin header, ASCII case-insensitive.
//! - `app.example.com`: compared with the Origin's host.
//! - `*.example.com`: any subdomain of `example.com`, not the apex itself.
//!
//! Evaluation is pure; decisions are computed per request and never cached.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Outcome of an origin check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Let the request through to the rate limiter.
    Allow,

    /// Refuse the request with 403.
    Deny(DenyReason),
}

impl PolicyDecision {
    /// Returns `true` if the origin may proceed.
    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Returns `true` if the origin is refused.
    pub fn is_deny(&self) -> bool {
        matches!(self, PolicyDecision::Deny(_))
    }

    /// Returns the denial reason if this is a Deny decision.
    pub fn reason(&self) -> Option<&DenyReason> {
        match self {
            PolicyDecision::Deny(reason) => Some(reason),
            PolicyDecision::Allow => None,
        }
    }
}

/// Why an origin was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// A whitelist is configured and the origin matched none of it.
    NotWhitelisted { origin: String },

    /// The origin matched a blacklist entry.
    Blacklisted { origin: String },

    /// The request carried no Origin header and the policy requires one.
    MissingOrigin,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NotWhitelisted { origin } => {
                write!(f, "origin {origin} is not whitelisted")
            }
            DenyReason::Blacklisted { origin } => write!(f, "origin {origin} is blacklisted"),
            DenyReason::MissingOrigin => f.write_str("origin header is required"),
        }
    }
}

/// One whitelist/blacklist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPattern {
    /// Full origin, `scheme://host[:port]`.
    Origin(String),
    /// Exact host.
    Host(String),
    /// `*.suffix`; stores `.suffix`.
    Subdomain(String),
}

impl OriginPattern {
    /// Returns `true` if `origin` (an Origin header value) matches.
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            OriginPattern::Origin(expected) => origin.eq_ignore_ascii_case(expected),
            OriginPattern::Host(expected) => {
                origin_host(origin).is_some_and(|host| host.eq_ignore_ascii_case(expected))
            }
            OriginPattern::Subdomain(suffix) => origin_host(origin).is_some_and(|host| {
                let host = host.to_ascii_lowercase();
                host.len() > suffix.len() && host.ends_with(suffix.as_str())
            }),
        }
    }
}

impl FromStr for OriginPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pattern = s
            .trim_start()
            .trim_end_matches(|c: char| c == '/' || c.is_whitespace())
            .to_ascii_lowercase();
        if pattern.is_empty() || pattern == "*." {
            return Err(ConfigError::OriginPattern(s.to_string()));
        }
        if pattern.contains("://") {
            return Ok(OriginPattern::Origin(pattern));
        }
        if let Some(suffix) = pattern.strip_prefix('*') {
            if !suffix.starts_with('.') || suffix.contains('*') {
                return Err(ConfigError::OriginPattern(s.to_string()));
            }
            return Ok(OriginPattern::Subdomain(suffix.to_string()));
        }
        if pattern.contains('*') || pattern.contains('/') {
            return Err(ConfigError::OriginPattern(s.to_string()));
        }
        Ok(OriginPattern::Host(pattern))
    }
}

impl fmt::Display for OriginPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginPattern::Origin(origin) => f.write_str(origin),
            OriginPattern::Host(host) => f.write_str(host),
            OriginPattern::Subdomain(suffix) => write!(f, "*{suffix}"),
        }
    }
}

/// Parse a list of patterns, failing on the first invalid entry.
pub fn parse_patterns<I, S>(entries: I) -> Result<Vec<OriginPattern>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter(|entry| !entry.as_ref().trim().is_empty())
        .map(|entry| entry.as_ref().parse())
        .collect()
}

/// Returns `true` if any pattern matches `origin`.
pub fn matches_any(patterns: &[OriginPattern], origin: &str) -> bool {
    patterns.iter().any(|pattern| pattern.matches(origin))
}

/// Host component of an Origin value (`scheme://host[:port]`).
fn origin_host(origin: &str) -> Option<&str> {
    let (_, rest) = origin.split_once("://")?;
    let rest = rest.split('/').next().unwrap_or(rest);
    if let Some(v6) = rest.strip_prefix('[') {
        return v6.split(']').next().filter(|h| !h.is_empty());
    }
    let host = rest.rsplit_once(':').map_or(rest, |(host, _)| host);
    (!host.is_empty()).then_some(host)
}

/// Static origin policy shared by every request.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    whitelist: Vec<OriginPattern>,
    blacklist: Vec<OriginPattern>,
    require_origin: bool,
}

impl OriginPolicy {
    pub fn new(
        whitelist: Vec<OriginPattern>,
        blacklist: Vec<OriginPattern>,
        require_origin: bool,
    ) -> Self {
        Self {
            whitelist,
            blacklist,
            require_origin,
        }
    }

    /// Evaluate the Origin header of one request.
    pub fn check(&self, origin: Option<&str>) -> PolicyDecision {
        match origin.map(str::trim).filter(|o| !o.is_empty()) {
            None if self.require_origin => PolicyDecision::Deny(DenyReason::MissingOrigin),
            None => PolicyDecision::Allow,
            Some(origin) => check(Some(origin), &self.whitelist, &self.blacklist),
        }
    }

    /// Evaluate the raw bytes of an Origin header.
    ///
    /// Bytes that are not UTF-8 still count as a present origin, one that no
    /// pattern can match: a whitelist refuses it.
    pub fn check_raw(&self, origin: Option<&[u8]>) -> PolicyDecision {
        let Some(raw) = origin else {
            return self.check(None);
        };
        match std::str::from_utf8(raw) {
            Ok(text) => self.check(Some(text)),
            Err(_) if self.whitelist.is_empty() => PolicyDecision::Allow,
            Err(_) => PolicyDecision::Deny(DenyReason::NotWhitelisted {
                origin: String::from_utf8_lossy(raw).into_owned(),
            }),
        }
    }
}

/// Evaluate an Origin header against the lists, treating a missing header
/// as allowed.
pub fn check(
    origin: Option<&str>,
    whitelist: &[OriginPattern],
    blacklist: &[OriginPattern],
) -> PolicyDecision {
    let Some(origin) = origin else {
        return PolicyDecision::Allow;
    };

    if !whitelist.is_empty() {
        if matches_any(whitelist, origin) {
            return PolicyDecision::Allow;
        }
        return PolicyDecision::Deny(DenyReason::NotWhitelisted {
            origin: origin.to_string(),
        });
    }

    if matches_any(blacklist, origin) {
        return PolicyDecision::Deny(DenyReason::Blacklisted {
            origin: origin.to_string(),
        });
    }

    PolicyDecision::Allow
}
