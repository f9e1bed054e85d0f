//! Single-host reverse-proxy transport: request rewriting ("director"),
//! hop-by-hop header stripping, forwarded-header synthesis, WebSocket
//! detection/bridging, and periodic-flush streaming for long responses.

pub mod flush;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::route::WsConfig;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type IncomingBody = hyper::body::Incoming;

/// Headers defined per-connection by RFC 7230 §6.1 that must never be
/// forwarded to the next hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Join a target base path `a` with a request path `b` such that exactly one
/// slash separates them, regardless of which side already carries one.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Merge two raw query strings: concatenate if either is empty, otherwise
/// join with `&` with the target's query first.
fn merge_query(target_query: &str, request_query: &str) -> String {
    if target_query.is_empty() || request_query.is_empty() {
        format!("{target_query}{request_query}")
    } else {
        format!("{target_query}&{request_query}")
    }
}

fn text_body(text: impl Into<Bytes>) -> BoxBody<Bytes, BoxError> {
    use http_body_util::{BodyExt, Full};
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

fn server_error(body: impl Into<Bytes>) -> Response<BoxBody<Bytes, BoxError>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(text_body(body))
        .expect("static response is well-formed")
}

/// Either plain-HTTP or one of the two HTTPS client variants this transport
/// supports. Built once when the route's dispatcher is constructed.
enum Transport {
    Http(Client<HttpConnector, BoxBody<Bytes, BoxError>>),
    Https(Client<HttpsConnector<HttpConnector>, BoxBody<Bytes, BoxError>>),
}

fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Accepts any server certificate without verification. Used only for
/// `HTTPS_SKIP_VERIFY` routes, which opt out of certificate validation by
/// the egress mode they were configured with.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A single-host reverse proxy, parameterised by `{target, ws_config,
/// flush_interval}` as in the data model. One instance is built per route
/// (or per load-balancer target) and reused for the route's lifetime.
pub struct ReverseProxy {
    scheme: &'static str,
    authority: String,
    base_path: String,
    base_query: String,
    ws_config: WsConfig,
    flush_interval: Duration,
    transport: Transport,
    skip_verify: bool,
}

impl ReverseProxy {
    /// `scheme` is `"http"` or `"https"`; `out_address` is the upstream
    /// `host:port` (or a full `scheme://host:port/base/path` — only the
    /// authority and path are taken from it, scheme is always `scheme`).
    /// `skip_verify` additionally selects a 60s dial timeout, per the
    /// `HTTPS_SKIP_VERIFY` egress mode's requirements.
    pub fn new(scheme: &'static str, out_address: &str, ws_config: WsConfig, flush_interval: Duration, skip_verify: bool) -> Self {
        let (authority, base_path, base_query) = split_out_address(out_address);

        let transport = if scheme == "http" {
            let mut connector = HttpConnector::new();
            connector.set_nodelay(true);
            Transport::Http(Client::builder(TokioExecutor::new()).build(connector))
        } else {
            let mut http = HttpConnector::new();
            http.enforce_http(false);
            http.set_nodelay(true);
            let tls_config = if skip_verify {
                insecure_tls_config()
            } else {
                hyper_rustls::ConfigBuilderExt::with_native_roots(rustls::ClientConfig::builder())
                    .expect("native root store is available")
                    .with_no_client_auth()
            };
            let https = hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .wrap_connector(http);
            Transport::Https(Client::builder(TokioExecutor::new()).build(https))
        };

        Self {
            scheme,
            authority,
            base_path,
            base_query,
            ws_config,
            flush_interval,
            transport,
            skip_verify,
        }
    }

    fn rewrite_uri(&self, req_uri: &Uri) -> Uri {
        let req_path = req_uri.path();
        let joined_path = single_joining_slash(&self.base_path, req_path);
        let merged_query = merge_query(&self.base_query, req_uri.query().unwrap_or(""));

        let mut path_and_query = joined_path;
        if !merged_query.is_empty() {
            path_and_query.push('?');
            path_and_query.push_str(&merged_query);
        }

        Uri::builder()
            .scheme(self.scheme)
            .authority(self.authority.as_str())
            .path_and_query(path_and_query)
            .build()
            .expect("rewritten URI is well-formed")
    }

    fn client_ip(remote_addr: SocketAddr) -> String {
        remote_addr.ip().to_string()
    }

    fn apply_forwarded_headers(headers: &mut hyper::HeaderMap, remote_addr: SocketAddr, forwarded_host: &str, forwarded_proto: &'static str) {
        let client_ip = Self::client_ip(remote_addr);
        let combined = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
            _ => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&combined) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
        headers.insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static(forwarded_proto),
        );
        if let Ok(value) = HeaderValue::from_str(forwarded_host) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), value);
        }
    }

    /// Rewrite, strip hop-by-hop headers, synthesise forwarded headers, and
    /// either bridge a WebSocket upgrade or perform a single round-trip and
    /// stream the response back.
    pub async fn serve(
        &self,
        req: Request<IncomingBody>,
        remote_addr: SocketAddr,
        inbound_is_tls: bool,
        metrics: &Arc<crate::metrics::Metrics>,
    ) -> Response<BoxBody<Bytes, BoxError>> {
        let forwarded_host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let is_ws = ws::is_upgrade_request(&req, self.ws_config.enabled);
        let new_uri = self.rewrite_uri(req.uri());

        if is_ws {
            let forwarded_proto = if inbound_is_tls { "wss" } else { "ws" };
            let mut forwarded: Vec<(HeaderName, HeaderValue)> = req
                .headers()
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            if let Ok(value) = HeaderValue::from_str(&forwarded_host) {
                forwarded.push((HeaderName::from_static("x-forwarded-host"), value));
            }
            let path_and_query = new_uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            return ws::bridge(
                req,
                &self.authority,
                &path_and_query,
                forwarded,
                forwarded_proto,
                self.ws_config,
                remote_addr,
                metrics,
            )
            .await;
        }

        let (mut parts, body) = req.into_parts();
        parts.uri = new_uri;
        parts.version = hyper::Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        let forwarded_proto = if inbound_is_tls { "https" } else { "http" };
        Self::apply_forwarded_headers(&mut parts.headers, remote_addr, &forwarded_host, forwarded_proto);

        use http_body_util::BodyExt;
        let outbound_body = body.map_err(BoxError::from).boxed();
        let outbound = Request::from_parts(parts, outbound_body);

        let send = async {
            match &self.transport {
                Transport::Http(client) => client.request(outbound).await,
                Transport::Https(client) => client.request(outbound).await,
            }
        };

        let result = if self.skip_verify {
            match tokio::time::timeout(Duration::from_secs(60), send).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::error!(upstream = %self.authority, "dial to upstream timed out");
                    return server_error("");
                }
            }
        } else {
            send.await
        };

        let upstream_response = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(upstream = %self.authority, error = %e, "upstream round-trip failed");
                return server_error("");
            }
        };

        let (mut resp_parts, resp_body) = upstream_response.into_parts();
        strip_hop_by_hop(&mut resp_parts.headers);

        let response_body = if self.flush_interval.is_zero() {
            use http_body_util::BodyExt;
            resp_body.map_err(BoxError::from).boxed()
        } else {
            stream_with_periodic_flush(resp_body, self.flush_interval)
        };

        Response::from_parts(resp_parts, response_body)
    }
}

/// Split an `out_address` of `host:port` (or a full `scheme://host:port/path?query`)
/// into `(authority, base_path, base_query)`. A bare `host:port` yields an
/// empty base path/query, matching the common case of routes that point at a
/// whole upstream rather than a sub-path of it.
fn split_out_address(out_address: &str) -> (String, String, String) {
    if let Ok(uri) = out_address.parse::<Uri>() {
        if let Some(authority) = uri.authority() {
            let path = uri.path();
            let base_path = if path == "/" { "".to_string() } else { path.to_string() };
            return (authority.as_str().to_string(), base_path, uri.query().unwrap_or("").to_string());
        }
    }
    (out_address.to_string(), String::new(), String::new())
}

/// Pipe `body` through a [`flush::FlushWriter`] so that, independent of how
/// the upstream produces chunks, bytes already received are pushed to the
/// client no later than `period` after being written.
fn stream_with_periodic_flush(body: IncomingBody, period: Duration) -> BoxBody<Bytes, BoxError> {
    use futures_util::StreamExt;
    use http_body_util::{BodyExt, StreamBody};
    use hyper::body::{Body, Frame};
    use tokio_util::io::ReaderStream;

    let (read_half, write_half) = tokio::io::duplex(64 * 1024);
    let writer = flush::FlushWriter::spawn(write_half, period, None);

    tokio::spawn(async move {
        let mut body = std::pin::pin!(body);
        loop {
            match std::future::poll_fn(|cx| body.as_mut().poll_frame(cx)).await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data()
                        && writer.write_all(&data).await.is_err()
                    {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            }
        }
        writer.stop().await;
    });

    let stream = ReaderStream::new(read_half).map(|chunk| chunk.map(Frame::data).map_err(BoxError::from));
    StreamBody::new(stream).boxed()
}
