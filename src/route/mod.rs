//! Route data model, egress-mode dispatch, and the [`RouteTable`] that
//! indexes routes both by exact domain and by wildcard trie.

pub mod trie;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::{Request, Response, StatusCode};

use crate::error::RoutingError;
use crate::lb::LoadBalancer;
use crate::proxy::{BoxError, ReverseProxy};
use trie::HostTrie;

/// One of the five upstream dispatch strategies a route may use.
///
/// Parsing is case-insensitive and accepts numeric aliases; an unrecognised
/// value defaults to [`EgressMode::Http`] rather than being rejected, both
/// for the bare parser and for config-file loading (the two paths do not
/// diverge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressMode {
    Http,
    HttpsVerify,
    HttpsSkipVerify,
    Redirect,
    LoadBalancer,
}

impl EgressMode {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "HTTP" | "0" => EgressMode::Http,
            "HTTPS" | "HTTPS_VERIFY" | "1" => EgressMode::HttpsVerify,
            "HTTPS_SKIP_VERIFY" | "2" => EgressMode::HttpsSkipVerify,
            "REDIRECT" | "3" => EgressMode::Redirect,
            "LOAD_BALANCER" | "4" => EgressMode::LoadBalancer,
            _ => EgressMode::Http,
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            EgressMode::Http => "http",
            _ => "https",
        }
    }

    /// Metric label for this mode, used by the ambient `/metrics` counters.
    pub fn label(self) -> &'static str {
        match self {
            EgressMode::Http => "HTTP",
            EgressMode::HttpsVerify => "HTTPS_VERIFY",
            EgressMode::HttpsSkipVerify => "HTTPS_SKIP_VERIFY",
            EgressMode::Redirect => "REDIRECT",
            EgressMode::LoadBalancer => "LOAD_BALANCER",
        }
    }
}

/// Authentication mode checked before a route's dispatcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
    ApiKey,
}

/// Pre-dispatch authentication configuration for a route.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub header_key: String,
    pub expected_value: String,
}

/// WebSocket bridging parameters for a route's reverse-proxy transport.
#[derive(Debug, Clone, Copy)]
pub struct WsConfig {
    pub enabled: bool,
    pub read_buf: usize,
    pub write_buf: usize,
    pub read_deadline: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_buf: 4096,
            write_buf: 4096,
            read_deadline: Duration::from_secs(60),
        }
    }
}

/// Statically loaded TLS key-pair material for a route's domain.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// The raw, pre-validation description of a route, as produced by the
/// configuration collaborator.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub domain: String,
    pub egress_mode: EgressMode,
    pub out_address: String,
    pub load_balancer_targets: Vec<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub autocert: bool,
    pub ws_config: WsConfig,
    pub auth: AuthConfig,
    pub force_https: bool,
    pub flush_interval: u64,
}

/// The eagerly-constructed dispatch strategy for a route. The reference
/// implementation memoises a closure on first request; this is the
/// systems-language equivalent named in the design notes: a tagged variant
/// built once at insert time, which sidesteps any first-use race entirely.
enum Dispatcher {
    Redirect { base: url::Url },
    Proxy(Arc<ReverseProxy>),
    LoadBalancer(Arc<LoadBalancer>),
}

/// A fully validated, ready-to-serve route.
pub struct Route {
    pub domain: String,
    pub egress_mode: EgressMode,
    pub autocert: bool,
    pub auth: AuthConfig,
    pub force_https: bool,
    pub tls_material: Option<TlsMaterial>,
    dispatcher: Dispatcher,
}

/// Context available to a route while dispatching a single request.
pub struct RequestContext {
    pub remote_addr: SocketAddr,
    pub inbound_is_tls: bool,
    pub metrics: Arc<crate::metrics::Metrics>,
}

fn empty_body() -> BoxBody<Bytes, BoxError> {
    use http_body_util::{BodyExt, Empty};
    Empty::new().map_err(|never| match never {}).boxed()
}

fn text_body(text: impl Into<Bytes>) -> BoxBody<Bytes, BoxError> {
    use http_body_util::{BodyExt, Full};
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

fn plain_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, BoxError>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(text_body(body))
        .expect("static response is well-formed")
}

impl Route {
    /// Validate `spec` against the invariants in the data model and build
    /// the eager dispatcher variant. Fails fast on any invariant violation.
    pub fn build(spec: RouteSpec) -> Result<Route, RoutingError> {
        let dispatcher = match spec.egress_mode {
            EgressMode::Redirect => {
                let base = url::Url::parse(&spec.out_address).map_err(|e| {
                    RoutingError::InvalidRedirectTarget {
                        domain: spec.domain.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Dispatcher::Redirect { base }
            }
            EgressMode::LoadBalancer => {
                if spec.load_balancer_targets.is_empty() {
                    return Err(RoutingError::EmptyLoadBalancerTargets(spec.domain.clone()));
                }
                let proxies = spec
                    .load_balancer_targets
                    .iter()
                    .map(|target| {
                        Arc::new(ReverseProxy::new(
                            "http",
                            target,
                            spec.ws_config,
                            Duration::from_secs(spec.flush_interval),
                            false,
                        ))
                    })
                    .collect();
                Dispatcher::LoadBalancer(Arc::new(LoadBalancer::new(proxies)))
            }
            mode => {
                let skip_verify = matches!(mode, EgressMode::HttpsSkipVerify);
                Dispatcher::Proxy(Arc::new(ReverseProxy::new(
                    mode.scheme(),
                    &spec.out_address,
                    spec.ws_config,
                    Duration::from_secs(spec.flush_interval),
                    skip_verify,
                )))
            }
        };

        let tls_material = match (spec.cert_file, spec.key_file) {
            (Some(cert_file), Some(key_file)) => Some(TlsMaterial { cert_file, key_file }),
            (None, None) => None,
            _ => return Err(RoutingError::IncompleteTlsMaterial(spec.domain.clone())),
        };

        Ok(Route {
            domain: spec.domain,
            egress_mode: spec.egress_mode,
            autocert: spec.autocert,
            auth: spec.auth,
            force_https: spec.force_https,
            tls_material,
            dispatcher,
        })
    }

    /// Apply the pre-dispatch apikey check, then run this route's dispatcher.
    pub async fn serve(
        &self,
        req: Request<hyper::body::Incoming>,
        ctx: RequestContext,
    ) -> Response<BoxBody<Bytes, BoxError>> {
        if self.auth.mode == AuthMode::ApiKey {
            let supplied = req
                .headers()
                .get(self.auth.header_key.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if supplied != self.auth.expected_value {
                tracing::debug!(host = %self.domain, "apikey auth rejected request");
                return plain_response(StatusCode::UNAUTHORIZED, Bytes::new());
            }
        }

        match &self.dispatcher {
            Dispatcher::Redirect { base } => dispatch_redirect(base, &req),
            Dispatcher::Proxy(proxy) => {
                if self.force_https && is_forwarded_http(&req) {
                    return redirect_to_https(&req);
                }
                proxy.serve(req, ctx.remote_addr, ctx.inbound_is_tls, &ctx.metrics).await
            }
            Dispatcher::LoadBalancer(lb) => lb.serve(req, ctx.remote_addr, ctx.inbound_is_tls, &ctx.metrics).await,
        }
    }
}

fn is_forwarded_http(req: &Request<hyper::body::Incoming>) -> bool {
    req.headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("http"))
        .unwrap_or(false)
}

fn redirect_to_https(req: &Request<hyper::body::Incoming>) -> Response<BoxBody<Bytes, BoxError>> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let location = format!("https://{host}{}", req.uri());
    Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(hyper::header::LOCATION, location)
        .body(empty_body())
        .expect("redirect response is well-formed")
}

fn dispatch_redirect(
    base: &url::Url,
    req: &Request<hyper::body::Incoming>,
) -> Response<BoxBody<Bytes, BoxError>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let resolved = match base.join(path_and_query) {
        Ok(url) => url,
        Err(e) => {
            return plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not redirect (invalid path); {e}"),
            );
        }
    };
    Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(hyper::header::LOCATION, resolved.to_string())
        .body(empty_body())
        .expect("redirect response is well-formed")
}

/// Two indices over the same set of routes: a hash map (authoritative,
/// enforces domain uniqueness) and a wildcard trie used for lookup.
#[derive(Default)]
pub struct RouteTable {
    by_domain: std::collections::HashMap<String, Arc<Route>>,
    trie: HostTrie,
    autocert_domains: std::collections::HashSet<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert `spec`, updating both indices atomically from
    /// the caller's point of view (the caller is expected to hold whatever
    /// lock guards the table as a whole).
    pub fn add(&mut self, spec: RouteSpec) -> Result<(), RoutingError> {
        let domain = spec.domain.clone();
        if self.by_domain.contains_key(&domain) {
            return Err(RoutingError::DuplicateDomain(domain));
        }
        let autocert = spec.autocert;
        let route = Arc::new(Route::build(spec)?);
        self.trie.add(&domain, route.clone()).map_err(|e| match e {
            trie::TrieInsertError::EmptyLabel => RoutingError::EmptyLabel(domain.clone()),
            trie::TrieInsertError::Duplicate => RoutingError::DuplicateDomain(domain.clone()),
        })?;
        if autocert {
            self.autocert_domains.insert(domain.clone());
        }
        self.by_domain.insert(domain, route);
        Ok(())
    }

    /// Exact-domain lookup, used for fallback resolution (bypasses the trie).
    pub fn get(&self, domain: &str) -> Option<&Arc<Route>> {
        self.by_domain.get(domain)
    }

    /// Wildcard-aware lookup by host, trying the wildcard branch first.
    pub fn find(&self, host: &str) -> Option<&Arc<Route>> {
        self.trie.find(host)
    }

    /// Whether `host` is allowed to obtain an ACME certificate: either it is
    /// a per-route `autocert = true` domain, or the caller passes
    /// `autocert_all = true` for the global override.
    pub fn autocert_allowed(&self, host: &str, autocert_all: bool) -> bool {
        autocert_all || self.autocert_domains.contains(host)
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(domain: &str, mode: EgressMode) -> RouteSpec {
        RouteSpec {
            domain: domain.to_string(),
            egress_mode: mode,
            out_address: "127.0.0.1:9092".to_string(),
            load_balancer_targets: vec![],
            cert_file: None,
            key_file: None,
            autocert: false,
            ws_config: WsConfig::default(),
            auth: AuthConfig::default(),
            force_https: false,
            flush_interval: 0,
        }
    }

    #[test]
    fn egress_mode_parsing_is_case_insensitive_with_numeric_aliases() {
        assert_eq!(EgressMode::parse("http"), EgressMode::Http);
        assert_eq!(EgressMode::parse("HTTP"), EgressMode::Http);
        assert_eq!(EgressMode::parse("0"), EgressMode::Http);
        assert_eq!(EgressMode::parse("https"), EgressMode::HttpsVerify);
        assert_eq!(EgressMode::parse("Https_Verify"), EgressMode::HttpsVerify);
        assert_eq!(EgressMode::parse("2"), EgressMode::HttpsSkipVerify);
        assert_eq!(EgressMode::parse("redirect"), EgressMode::Redirect);
        assert_eq!(EgressMode::parse("LOAD_BALANCER"), EgressMode::LoadBalancer);
        assert_eq!(EgressMode::parse("nonsense"), EgressMode::Http);
    }

    #[test]
    fn duplicate_domain_rejected() {
        let mut table = RouteTable::new();
        table.add(spec("example.com", EgressMode::Http)).unwrap();
        let err = table.add(spec("example.com", EgressMode::Http)).unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateDomain(_)));
    }

    #[test]
    fn load_balancer_requires_targets() {
        let err = Route::build(spec("lb.test", EgressMode::LoadBalancer)).unwrap_err();
        assert!(matches!(err, RoutingError::EmptyLoadBalancerTargets(_)));
    }

    #[test]
    fn redirect_requires_absolute_url() {
        let mut s = spec("a.test", EgressMode::Redirect);
        s.out_address = "not a url".to_string();
        let err = Route::build(s).unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRedirectTarget { .. }));
    }

    #[test]
    fn route_table_find_round_trips_through_wildcard() {
        let mut table = RouteTable::new();
        table.add(spec("*.x.com", EgressMode::Http)).unwrap();
        let found = table.find("a.x.com").unwrap();
        assert_eq!(found.domain, "*.x.com");
    }

    #[test]
    fn malformed_pattern_rejected_with_distinct_error_from_duplicate() {
        let mut table = RouteTable::new();
        let err = table.add(spec(".example.com", EgressMode::Http)).unwrap_err();
        assert!(matches!(err, RoutingError::EmptyLabel(_)));
    }

    #[test]
    fn autocert_policy_respects_allow_list_and_global_flag() {
        let mut table = RouteTable::new();
        let mut s = spec("foo.test", EgressMode::Http);
        s.autocert = true;
        table.add(s).unwrap();
        assert!(table.autocert_allowed("foo.test", false));
        assert!(!table.autocert_allowed("bar.test", false));
        assert!(table.autocert_allowed("bar.test", true));
    }
}
