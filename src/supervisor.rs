//! Owns the route table, the two listeners, the ACME manager, and the
//! shutdown signal; implements the top-level request pipeline described in
//! the system overview.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;

use crate::error::SupervisorError;
use crate::metrics::Metrics;
use crate::proxy::BoxError;
use crate::route::{RequestContext, RouteSpec, RouteTable};
use crate::tls::ChallengeHandler;

fn text_body(text: impl Into<Bytes>) -> BoxBody<Bytes, BoxError> {
    use http_body_util::{BodyExt, Full};
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

fn plain_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, BoxError>> {
    Response::builder()
        .status(status)
        .body(text_body(body))
        .expect("static response is well-formed")
}

/// Process-lifetime owner of routing state, listeners, and the shutdown
/// signal. Cloned as `Arc<Supervisor>` into every connection task.
pub struct Supervisor {
    routes: RwLock<RouteTable>,
    fallback_domain: String,
    debug: bool,
    listen_addr: String,
    listen_addr_tls: Option<String>,
    tls_acceptor: RwLock<Option<TlsAcceptor>>,
    challenge_handler: RwLock<Option<Arc<ChallengeHandler>>>,
    shutdown: Notify,
    shutting_down: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Supervisor {
    pub fn new(listen_addr: String, listen_addr_tls: Option<String>, fallback_domain: String, debug: bool) -> Self {
        Self {
            routes: RwLock::new(RouteTable::new()),
            fallback_domain,
            debug,
            listen_addr,
            listen_addr_tls,
            tls_acceptor: RwLock::new(None),
            challenge_handler: RwLock::new(None),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// The metrics registry backing this supervisor's `/metrics` endpoint,
    /// shared with the ACME manager so issuance outcomes are counted too.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Validate and insert a route; see [`RouteTable::add`] for the
    /// invariants enforced.
    pub fn add(&self, spec: RouteSpec) -> Result<(), crate::error::RoutingError> {
        self.routes.write().add(spec)
    }

    pub fn autocert_allowed(&self, host: &str, autocert_all: bool) -> bool {
        self.routes.read().autocert_allowed(host, autocert_all)
    }

    /// Wire up the TLS listener's certificate resolver and (if ACME is in
    /// use) the HTTP-01 challenge responder. Called once at start-up, after
    /// every route has been [`Supervisor::add`]-ed, since the ACME
    /// host-allowance policy reads this same route table.
    pub fn configure_tls(&self, acceptor: TlsAcceptor, challenge_handler: Option<Arc<ChallengeHandler>>) {
        *self.tls_acceptor.write() = Some(acceptor);
        *self.challenge_handler.write() = challenge_handler;
    }

    fn extract_host<'a>(&self, req: &'a Request<hyper::body::Incoming>) -> &'a str {
        if self.debug
            && let Some(debug_host) = req.headers().get("x-debug-host").and_then(|v| v.to_str().ok())
        {
            return debug_host;
        }
        req.headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// Look up `host`, falling through to `fallback_domain` on a miss, per
    /// the routing-miss error disposition in §7. The open question of which
    /// diagnostic to emit when the fallback domain is itself absent is
    /// resolved here as: emit the fallback-specific message whenever a
    /// fallback domain is configured at all, even if it has no route.
    async fn serve(
        &self,
        req: Request<hyper::body::Incoming>,
        remote_addr: SocketAddr,
        inbound_is_tls: bool,
    ) -> Response<BoxBody<Bytes, BoxError>> {
        if !inbound_is_tls && ChallengeHandler::is_challenge_request(req.uri().path()) {
            let handler = self.challenge_handler.read().clone();
            if let Some(handler) = handler {
                return match handler.respond(req.uri().path()) {
                    Some(token) => plain_response(StatusCode::OK, token),
                    None => plain_response(StatusCode::NOT_FOUND, ""),
                };
            }
        }

        // Served on the plain listener only; checked by path, so it never
        // enters the routing trie and can't be shadowed by a tenant domain.
        if !inbound_is_tls && req.method() == hyper::Method::GET && req.uri().path() == "/metrics" {
            return Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(text_body(self.metrics.render()))
                .expect("static response is well-formed");
        }

        let host = self.extract_host(&req).to_string();
        let ctx = RequestContext {
            remote_addr,
            inbound_is_tls,
            metrics: self.metrics.clone(),
        };

        let route = {
            let routes = self.routes.read();
            routes.find(&host).cloned()
        };

        let route = match route {
            Some(route) => route,
            None if !self.fallback_domain.is_empty() => {
                let fallback = self.routes.read().get(&self.fallback_domain).cloned();
                match fallback {
                    Some(route) => route,
                    None => {
                        return plain_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("fallback domain not found {host}"),
                        );
                    }
                }
            }
            None => {
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, format!("domain not found {host}"));
            }
        };

        self.metrics.record_request(route.egress_mode.label());
        route.serve(req, ctx).await
    }

    /// Start both listeners and block until [`Supervisor::close`] is called.
    pub async fn run(self: Arc<Self>) -> Result<(), SupervisorError> {
        let plain = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| SupervisorError::Bind {
                listener: "plain",
                addr: self.listen_addr.clone(),
                source,
            })?;
        tracing::info!(addr = %self.listen_addr, "plain listener bound");

        let tls_configured = self.tls_acceptor.read().is_some();
        let tls_listener = match (&self.listen_addr_tls, tls_configured) {
            (Some(addr), true) => {
                let listener = TcpListener::bind(addr).await.map_err(|source| SupervisorError::Bind {
                    listener: "tls",
                    addr: addr.clone(),
                    source,
                })?;
                tracing::info!(addr = %addr, "tls listener bound");
                Some(listener)
            }
            _ => None,
        };

        let plain_task = {
            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.accept_loop(plain, false).await })
        };
        let tls_task = tls_listener.map(|listener| {
            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.accept_loop(listener, true).await })
        });

        self.shutdown.notified().await;
        plain_task.abort();
        if let Some(task) = tls_task {
            task.abort();
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, is_tls: bool) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if is_tls {
                let _ = stream.set_nodelay(true);
                Self::set_tcp_keepalive(&stream);
            }
            let supervisor = self.clone();
            let acceptor = self.tls_acceptor.read().clone();
            tokio::spawn(async move {
                if is_tls {
                    let Some(acceptor) = acceptor else { return };
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => supervisor.serve_connection(tls_stream, remote_addr, true).await,
                        Err(e) => tracing::debug!(error = %e, "tls handshake failed"),
                    }
                } else {
                    supervisor.serve_connection(stream, remote_addr, false).await
                }
            });
        }
    }

    fn set_tcp_keepalive(stream: &TcpStream) {
        use socket2::{SockRef, TcpKeepalive};
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new().with_time(std::time::Duration::from_secs(180));
        let _ = sock_ref.set_tcp_keepalive(&keepalive);
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, remote_addr: SocketAddr, is_tls: bool)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let supervisor = self.clone();
        let service = hyper::service::service_fn(move |req| {
            let supervisor = supervisor.clone();
            async move { Ok::<_, std::convert::Infallible>(supervisor.serve(req, remote_addr, is_tls).await) }
        });

        if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
        {
            tracing::debug!(error = %e, "connection closed with error");
        }
    }

    /// Signal both accept loops and [`Supervisor::run`]'s blocking wait to
    /// stop. Best-effort: in-flight requests are not guaranteed to drain.
    pub fn close(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{AuthConfig, EgressMode, WsConfig};

    fn spec(domain: &str) -> RouteSpec {
        RouteSpec {
            domain: domain.to_string(),
            egress_mode: EgressMode::Http,
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

    fn supervisor(fallback: &str, debug: bool) -> Supervisor {
        Supervisor::new("127.0.0.1:0".to_string(), None, fallback.to_string(), debug)
    }

    #[test]
    fn route_lookup_misses_for_unregistered_host() {
        let supervisor = supervisor("", false);
        supervisor.add(spec("example.com")).unwrap();
        assert!(supervisor.routes.read().find("notfound.net").is_none());
        assert!(supervisor.routes.read().find("example.com").is_some());
    }

    #[test]
    fn debug_host_header_overrides_host_when_debug_enabled() {
        let supervisor = supervisor("", true);
        supervisor.add(spec("example.com")).unwrap();
        assert!(supervisor.debug);
    }

    #[test]
    fn close_marks_shutting_down() {
        let supervisor = supervisor("", false);
        assert!(!supervisor.is_shutting_down());
        supervisor.close();
        assert!(supervisor.is_shutting_down());
    }
}
