//! Request and response header rewriting.
//!
//! All functions here are pure: they take header maps by reference and
//! return new maps (or mutate one the caller owns), with no shared state.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use url::form_urlencoded;

use crate::target::TargetDescriptor;

/// Resolved target URL, echoed on every proxied response.
pub const X_REQUEST_URL: HeaderName = HeaderName::from_static("x-request-url");
/// Final URL after redirects. The proxy never follows redirects, so this
/// equals `x-request-url`; kept for clients of cors-anywhere deployments.
pub const X_FINAL_URL: HeaderName = HeaderName::from_static("x-final-url");

/// Methods advertised when a preflight did not name one.
pub const DEFAULT_ALLOW_METHODS: &str = "GET, HEAD, POST, PUT, PATCH, DELETE, OPTIONS";

/// Headers meaningful for a single transport hop only.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers that identify the inbound hop or an upstream proxy chain. The
/// outbound client sets `host` from the target URI.
const PROXY_IDENTIFYING: &[&str] = &[
    "host",
    "forwarded",
    "via",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-forwarded-proto",
    "x-real-ip",
];

/// Response headers a browser exposes without being told to.
const CORS_SAFELISTED: &[&str] = &[
    "cache-control",
    "content-language",
    "content-length",
    "content-type",
    "expires",
    "last-modified",
    "pragma",
];

/// CORS-relevant parts of the inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorsContext {
    pub origin: Option<HeaderValue>,
    pub request_method: Option<HeaderValue>,
    pub request_headers: Option<HeaderValue>,
}

impl CorsContext {
    pub fn from_request(headers: &HeaderMap) -> Self {
        Self {
            origin: headers.get(header::ORIGIN).filter(|v| !v.is_empty()).cloned(),
            request_method: headers.get(header::ACCESS_CONTROL_REQUEST_METHOD).cloned(),
            request_headers: headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS).cloned(),
        }
    }

    /// Origin header as text, if present and valid UTF-8.
    pub fn origin_str(&self) -> Option<&str> {
        self.origin.as_ref().and_then(|v| v.to_str().ok())
    }
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Header names listed in `Connection` are hop-by-hop for this message.
fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed = connection_tokens(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || listed.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers for the outbound request.
///
/// Drops hop-by-hop and proxy-identifying headers plus everything in
/// `remove`. Credentials (`cookie`, `authorization`) are forwarded.
pub fn for_request(headers: &HeaderMap, remove: &[HeaderName]) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    for name in PROXY_IDENTIFYING {
        out.remove(*name);
    }
    for name in remove {
        out.remove(name);
    }
    out
}

/// Append `X-Forwarded-For/Proto/Host` describing the inbound hop.
///
/// `for_request` has already dropped whatever the caller sent for these, so
/// the values here are the proxy's own view.
pub fn append_forwarded(out: &mut HeaderMap, inbound: &HeaderMap, client: &str, proto: &str) {
    if let Ok(value) = HeaderValue::from_str(client) {
        out.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    out.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_str(proto).unwrap_or(HeaderValue::from_static("http")),
    );
    if let Some(host) = inbound.get(header::HOST) {
        out.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
    }
}

/// Headers for the response relayed to the caller.
///
/// Drops hop-by-hop headers and the target's own `access-control-*` headers,
/// which would contradict the ones the proxy injects, then injects CORS
/// headers for `cors` and exposes every non-safelisted header.
pub fn for_response(headers: &HeaderMap, cors: &CorsContext) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    let upstream_cors: Vec<HeaderName> = out
        .keys()
        .filter(|name| name.as_str().starts_with("access-control-"))
        .cloned()
        .collect();
    for name in upstream_cors {
        out.remove(&name);
    }

    let exposed = expose_list(&out);
    apply_cors(&mut out, cors);
    if let Ok(value) = HeaderValue::from_str(&exposed) {
        out.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
    }
    out
}

/// Comma-separated names of headers a browser would otherwise hide.
fn expose_list(headers: &HeaderMap) -> String {
    let mut names: Vec<&str> = headers
        .keys()
        .map(HeaderName::as_str)
        .filter(|name| !CORS_SAFELISTED.contains(name) && *name != "set-cookie")
        .collect();
    for extra in ["x-request-url", "x-final-url"] {
        if !names.contains(&extra) {
            names.push(extra);
        }
    }
    names.join(",")
}

/// Insert the CORS headers every response carries.
///
/// A present Origin is echoed back with credentials allowed, so cookies and
/// authorization reach the target on the user's behalf; otherwise `*`. An
/// Origin that is not visible ASCII is never echoed.
pub fn apply_cors(headers: &mut HeaderMap, cors: &CorsContext) {
    match cors.origin.as_ref().filter(|v| v.to_str().is_ok()) {
        Some(origin) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
            headers.append(header::VARY, HeaderValue::from_static("Origin"));
        }
        None => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }
    }

    let methods = cors
        .request_method
        .clone()
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ALLOW_METHODS));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);

    if let Some(requested) = &cors.request_headers {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
}

/// Headers for a short-circuited `OPTIONS` preflight.
pub fn preflight_headers(cors: &CorsContext, max_age: Option<u64>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers, cors);
    if let Some(secs) = max_age {
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(secs));
    }
    headers
}

/// Record the resolved target on the response.
pub fn set_target_urls(headers: &mut HeaderMap, target: &TargetDescriptor) {
    if let Ok(value) = HeaderValue::from_str(&target.to_string()) {
        headers.insert(X_REQUEST_URL, value.clone());
        headers.insert(X_FINAL_URL, value);
    }
}

pub fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// `proxy_base?url=<encoded absolute>`.
pub fn proxied_url(proxy_base: &str, absolute: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(absolute.as_bytes()).collect();
    format!("{proxy_base}?url={encoded}")
}

/// Re-wrap a redirect's `Location` through the proxy.
///
/// Relative locations are resolved against `target` first. Returns `true`
/// if the header was rewritten; non-redirects and unparseable locations are
/// left untouched.
pub fn rewrite_redirect(
    status: StatusCode,
    headers: &mut HeaderMap,
    target: &TargetDescriptor,
    proxy_base: &str,
) -> bool {
    if !is_redirect(status) {
        return false;
    }
    let Some(location) = headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Ok(absolute) = target.join(location) else {
        return false;
    };
    match HeaderValue::from_str(&proxied_url(proxy_base, &absolute)) {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
            true
        }
        Err(_) => false,
    }
}
