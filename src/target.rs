//! Target URL resolution.
//!
//! Turns the caller-supplied target string into a [`TargetDescriptor`] the
//! upstream client can connect to. Resolution is pure: it never touches the
//! network. Hostnames that only turn private after DNS resolution are caught
//! later by [`crate::upstream::GuardedResolver`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use http::Uri;
use thiserror::Error;
use url::{Host, Url};

/// Supported target schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Reasons a target is refused before any connection is attempted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("target url is empty")]
    Empty,

    #[error("unsupported scheme {0:?}, only http and https can be proxied")]
    UnsupportedScheme(String),

    #[error("malformed url: {0}")]
    Malformed(String),

    #[error("target has no host")]
    MissingHost,

    #[error("{0:?} is not a valid public host name")]
    InvalidHost(String),

    #[error("{0} is a private, loopback or link-local address")]
    PrivateAddress(String),
}

/// A validated, connectable target. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
    uri: Uri,
}

impl TargetDescriptor {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host as it appears in a URL (IPv6 literals keep their brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Normalized path, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query string exactly as the caller supplied it, without the `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Host plus port, with the port omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `scheme://authority` of the target.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }

    /// Absolute request URI for the outbound request.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Resolve a possibly relative reference (e.g. a `Location` value)
    /// against this target.
    pub fn join(&self, reference: &str) -> Result<String, TargetError> {
        let base =
            Url::parse(&self.to_string()).map_err(|e| TargetError::Malformed(e.to_string()))?;
        base.join(reference)
            .map(String::from)
            .map_err(|e| TargetError::Malformed(e.to_string()))
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// Resolves raw target strings into [`TargetDescriptor`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetResolver {
    allow_private: bool,
}

impl TargetResolver {
    /// `allow_private` lifts the SSRF guard for loopback, private and
    /// link-local targets.
    pub fn new(allow_private: bool) -> Self {
        Self { allow_private }
    }

    /// Validate `raw` and build a descriptor.
    ///
    /// A missing scheme defaults to `http`, or to `https` when the explicit
    /// port is 443. The query string is carried verbatim; the fragment is
    /// dropped since it is never sent to a server.
    pub fn resolve(&self, raw: &str) -> Result<TargetDescriptor, TargetError> {
        // Path-style extraction leaves leading slashes ("/https://host/x").
        let raw = raw.trim().trim_start_matches('/');
        if raw.is_empty() {
            return Err(TargetError::Empty);
        }

        let (explicit_scheme, rest) = split_scheme(raw)?;
        let rest = rest.split('#').next().unwrap_or_default();
        let (before_query, query) = match rest.split_once('?') {
            Some((before, q)) if !q.is_empty() => (before, Some(q.to_string())),
            Some((before, _)) => (before, None),
            None => (rest, None),
        };
        let (authority, raw_path) = match before_query.find('/') {
            Some(idx) => before_query.split_at(idx),
            None => (before_query, "/"),
        };
        if authority.is_empty() {
            return Err(TargetError::MissingHost);
        }

        let scheme_hint = explicit_scheme.unwrap_or(Scheme::Http);
        let url = Url::parse(&format!("{}://{authority}{raw_path}", scheme_hint.as_str()))
            .map_err(|e| TargetError::Malformed(e.to_string()))?;

        let scheme = match explicit_scheme {
            Some(scheme) => scheme,
            None if url.port() == Some(443) => Scheme::Https,
            None => Scheme::Http,
        };
        let port = url.port().unwrap_or(scheme.default_port());

        let host = match url.host() {
            Some(Host::Ipv4(ip)) => {
                self.check_ip(IpAddr::V4(ip))?;
                ip.to_string()
            }
            Some(Host::Ipv6(ip)) => {
                self.check_ip(IpAddr::V6(ip))?;
                format!("[{ip}]")
            }
            Some(Host::Domain(name)) => {
                self.check_domain(name)?;
                name.to_string()
            }
            None => return Err(TargetError::MissingHost),
        };

        let path = url.path().to_string();
        let path_and_query = match &query {
            Some(q) => format!("{path}?{q}"),
            None => path.clone(),
        };
        let authority = if port == scheme.default_port() {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        let uri = Uri::builder()
            .scheme(scheme.as_str())
            .authority(authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
            .map_err(|e| TargetError::Malformed(e.to_string()))?;

        Ok(TargetDescriptor {
            scheme,
            host,
            port,
            path,
            query,
            uri,
        })
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), TargetError> {
        if !self.allow_private && is_private_ip(&ip) {
            return Err(TargetError::PrivateAddress(ip.to_string()));
        }
        Ok(())
    }

    fn check_domain(&self, name: &str) -> Result<(), TargetError> {
        let lower = name.to_ascii_lowercase();
        if lower == "localhost" || lower.ends_with(".localhost") {
            if self.allow_private {
                return Ok(());
            }
            return Err(TargetError::PrivateAddress(name.to_string()));
        }
        if !lower.contains('.') || lower.starts_with('.') || lower.contains("..") {
            return Err(TargetError::InvalidHost(name.to_string()));
        }
        Ok(())
    }
}

/// Resolve `raw` with the SSRF guard enabled.
pub fn resolve(raw: &str) -> Result<TargetDescriptor, TargetError> {
    TargetResolver::default().resolve(raw)
}

fn split_scheme(raw: &str) -> Result<(Option<Scheme>, &str), TargetError> {
    if let Some((prefix, rest)) = raw.split_once("://") {
        let is_scheme = !prefix.is_empty()
            && prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if is_scheme {
            return match prefix.to_ascii_lowercase().as_str() {
                "http" => Ok((Some(Scheme::Http), rest)),
                "https" => Ok((Some(Scheme::Https), rest)),
                other => Err(TargetError::UnsupportedScheme(other.to_string())),
            };
        }
    }
    Ok((None, raw))
}

/// Returns `true` for addresses that must not be reachable through the proxy:
/// private, loopback, link-local, CGNAT, multicast, broadcast and unspecified.
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => {
            ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_unspecified()
                || ip.is_multicast()
                // 100.64.0.0/10
                || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(ip) => {
            if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                return true;
            }
            if let Some(embedded) = embedded_ipv4(ip) {
                return is_private_ip(&IpAddr::V4(embedded));
            }
            // fc00::/7
            (ip.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// IPv4 address carried in the low 32 bits of a mapped (`::ffff:a.b.c.d`),
/// compatible (`::a.b.c.d`) or NAT64 (`64:ff9b::a.b.c.d`) address.
fn embedded_ipv4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return Some(mapped);
    }
    let segments = ip.segments();
    let compatible = segments[..6] == [0; 6];
    let nat64 = segments[..6] == [0x64, 0xff9b, 0, 0, 0, 0];
    if !compatible && !nat64 {
        return None;
    }
    let [.., a, b, c, d] = ip.octets();
    Some(Ipv4Addr::new(a, b, c, d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolves_full_url() {
        let target = resolve("https://example.com/data").unwrap();
        assert_eq!(target.scheme(), Scheme::Https);
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port(), 443);
        assert_eq!(target.path(), "/data");
        assert_eq!(target.query(), None);
        assert_eq!(target.to_string(), "https://example.com/data");
    }

    #[test]
    fn test_empty_is_rejected() {
        assert_eq!(resolve(""), Err(TargetError::Empty));
        assert_eq!(resolve("   "), Err(TargetError::Empty));
    }

    #[test]
    fn test_missing_scheme_defaults_to_http() {
        let target = resolve("example.com/a/b").unwrap();
        assert_eq!(target.scheme(), Scheme::Http);
        assert_eq!(target.port(), 80);
        assert_eq!(target.to_string(), "http://example.com/a/b");
    }

    #[test]
    fn test_missing_scheme_with_port_443_uses_https() {
        let target = resolve("example.com:443/x").unwrap();
        assert_eq!(target.scheme(), Scheme::Https);
        assert_eq!(target.authority(), "example.com");
    }

    #[test]
    fn test_protocol_relative_and_path_style() {
        let expected = resolve("http://example.com/x").unwrap();
        assert_eq!(resolve("//example.com/x").unwrap(), expected);
        assert_eq!(resolve("/example.com/x").unwrap(), expected);
        assert_eq!(resolve("/http://example.com/x").unwrap(), expected);
    }

    #[test]
    fn test_unsupported_scheme() {
        assert_eq!(
            resolve("ftp://example.com/file"),
            Err(TargetError::UnsupportedScheme("ftp".into()))
        );
        assert!(matches!(
            resolve("file:///etc/passwd"),
            Err(TargetError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_query_preserved_verbatim() {
        let target = resolve("https://example.com/search?q=a%20b&x=%7e&flag").unwrap();
        assert_eq!(target.query(), Some("q=a%20b&x=%7e&flag"));
        assert_eq!(
            target.uri().path_and_query().unwrap().as_str(),
            "/search?q=a%20b&x=%7e&flag"
        );
    }

    #[test]
    fn test_path_is_normalized_and_fragment_dropped() {
        let target = resolve("http://example.com/a/./b/../c#frag").unwrap();
        assert_eq!(target.path(), "/a/c");
        assert_eq!(target.query(), None);
    }

    #[test]
    fn test_non_default_port_kept_in_authority() {
        let target = resolve("http://example.com:8080/").unwrap();
        assert_eq!(target.port(), 8080);
        assert_eq!(target.authority(), "example.com:8080");
        assert_eq!(target.origin(), "http://example.com:8080");
    }

    #[test]
    fn test_loopback_and_private_rejected() {
        for raw in [
            "http://127.0.0.1/",
            "http://localhost:8080/",
            "http://api.localhost/",
            "http://10.1.2.3/",
            "http://192.168.0.1/admin",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[fe80::1]/",
            "http://2130706433/",
        ] {
            assert!(
                matches!(resolve(raw), Err(TargetError::PrivateAddress(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_private_allowed_with_override() {
        let resolver = TargetResolver::new(true);
        let target = resolver.resolve("http://127.0.0.1:3000/health").unwrap();
        assert_eq!(target.host(), "127.0.0.1");
        assert_eq!(target.port(), 3000);
        assert!(resolver.resolve("localhost:3000").is_ok());
    }

    #[test]
    fn test_bare_name_is_invalid_host() {
        assert_eq!(
            resolve("http://intranet/"),
            Err(TargetError::InvalidHost("intranet".into()))
        );
    }

    #[test]
    fn test_missing_host() {
        assert_eq!(resolve("http:///path"), Err(TargetError::MissingHost));
    }

    #[test]
    fn test_invalid_port_is_malformed() {
        assert!(matches!(
            resolve("example.com:99999/"),
            Err(TargetError::Malformed(_))
        ));
    }

    #[test]
    fn test_join_relative_location() {
        let target = resolve("https://example.com/a/b?x=1").unwrap();
        assert_eq!(target.join("/other").unwrap(), "https://example.com/other");
        assert_eq!(target.join("c").unwrap(), "https://example.com/a/c");
        assert_eq!(
            target.join("https://elsewhere.org/").unwrap(),
            "https://elsewhere.org/"
        );
    }

    #[test]
    fn test_is_private_ip() {
        assert!(is_private_ip(&"100.64.0.1".parse().unwrap()));
        assert!(is_private_ip(&"::ffff:127.0.0.1".parse().unwrap()));
        assert!(is_private_ip(&"fd00::1".parse().unwrap()));
        assert!(!is_private_ip(&"93.184.216.34".parse().unwrap()));
        assert!(!is_private_ip(&"2606:2800:220:1::1".parse().unwrap()));
    }

    #[test]
    fn test_embedded_ipv4_checked() {
        for private in ["::127.0.0.1", "::10.0.0.1", "64:ff9b::a00:1", "64:ff9b::7f00:1"] {
            assert!(is_private_ip(&private.parse().unwrap()), "{private}");
        }
        assert!(!is_private_ip(&"64:ff9b::5db8:d822".parse().unwrap()));
        assert!(!is_private_ip(&"::93.184.216.34".parse().unwrap()));
        assert!(resolve("http://[64:ff9b::a9fe:a9fe]/latest/meta-data").is_err());
    }

    proptest! {
        #[test]
        fn prop_scheme_less_equals_http(
            host in "[a-z]{1,10}\\.(com|org|net)",
            path in "(/[a-zA-Z0-9_-]{0,8}){0,4}",
            query in proptest::option::of("[a-z0-9=&]{1,12}"),
        ) {
            let mut raw = format!("{host}{path}");
            if let Some(q) = &query {
                raw.push('?');
                raw.push_str(q);
            }
            let bare = resolve(&raw);
            let explicit = resolve(&format!("http://{raw}"));
            prop_assert_eq!(bare, explicit);
        }
    }
}
