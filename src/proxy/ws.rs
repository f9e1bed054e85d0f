//! Bidirectional WebSocket bridging between the inbound client connection
//! and a dialled-up upstream connection.
//!
//! The inbound side is upgraded manually (hyper has no built-in WebSocket
//! support): the `Sec-WebSocket-Accept` value is derived from the client's
//! `Sec-WebSocket-Key` per RFC 6455 §4.2.2, exactly what a dedicated
//! WebSocket server library computes internally. The outbound side uses
//! `tokio-tungstenite`'s client handshake, which regenerates
//! `Sec-WebSocket-Key`/`-Version`/`-Extensions` itself — those three headers
//! are stripped from what we forward.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};

use crate::proxy::BoxError;
use crate::route::WsConfig;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const STRIPPED_CLIENT_HEADERS: &[&str] = &[
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// True when `req` requests a WebSocket upgrade the caller is configured to
/// honour: `Upgrade: websocket` and a `Connection` header containing the
/// `upgrade` token, case-insensitively either way.
pub fn is_upgrade_request(req: &Request<hyper::body::Incoming>, ws_enabled: bool) -> bool {
    if !ws_enabled {
        return false;
    }
    let upgrade_is_websocket = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_has_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade_is_websocket && connection_has_upgrade
}

fn bad_request(body: &'static str) -> Response<BoxBody<Bytes, BoxError>> {
    use http_body_util::{BodyExt, Full};
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(
            Full::new(Bytes::from_static(body.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response is well-formed")
}

fn server_error(body: String) -> Response<BoxBody<Bytes, BoxError>> {
    use http_body_util::{BodyExt, Full};
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("static response is well-formed")
}

fn method_not_allowed() -> Response<BoxBody<Bytes, BoxError>> {
    use http_body_util::{BodyExt, Empty};
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .expect("static response is well-formed")
}

/// Dial `target_host`, perform the upstream WebSocket client handshake, and
/// if that succeeds, reply 101 to the inbound request and spawn the
/// bidirectional frame bridge. Must only be called after
/// [`is_upgrade_request`] has already returned true.
pub async fn bridge(
    mut req: Request<hyper::body::Incoming>,
    target_host: &str,
    path_and_query: &str,
    mut forwarded_headers: Vec<(HeaderName, HeaderValue)>,
    forwarded_proto: &'static str,
    ws_config: WsConfig,
    _remote_addr: SocketAddr,
    metrics: &Arc<crate::metrics::Metrics>,
) -> Response<BoxBody<Bytes, BoxError>> {
    if req.method() != hyper::Method::GET {
        return method_not_allowed();
    }

    let Some(client_key) = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return bad_request("missing Sec-WebSocket-Key");
    };

    let stream = match TcpStream::connect(target_host).await {
        Ok(s) => s,
        Err(e) => return server_error(format!("could not dial upstream: {e}")),
    };

    forwarded_headers.retain(|(name, _)| {
        !STRIPPED_CLIENT_HEADERS
            .iter()
            .any(|stripped| name.as_str().eq_ignore_ascii_case(stripped))
    });
    forwarded_headers.push((
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static(forwarded_proto),
    ));

    let mut upstream_req = http::Request::builder()
        .method("GET")
        .uri(format!("ws://{target_host}{path_and_query}"));
    for (name, value) in &forwarded_headers {
        upstream_req = upstream_req.header(name, value);
    }
    let upstream_req = match upstream_req.body(()) {
        Ok(r) => r,
        Err(e) => return server_error(format!("invalid upstream request: {e}")),
    };

    let ws_protocol_config = WebSocketConfig::default()
        .max_frame_size(Some(ws_config.read_buf))
        .max_message_size(Some(ws_config.read_buf));

    let upstream_ws = match tokio_tungstenite::client_async_with_config(
        upstream_req,
        stream,
        Some(ws_protocol_config),
    )
    .await
    {
        Ok((ws, _response)) => ws,
        Err(e) => return server_error(format!("websocket handshake with upstream failed: {e}")),
    };

    let upgrade = hyper::upgrade::on(&mut req);
    let accept = accept_key(&client_key);
    let deadline = ws_config.read_deadline;
    metrics.record_websocket_session();

    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let client_ws =
                    WebSocketStream::from_raw_socket(io, Role::Server, Some(ws_protocol_config))
                        .await;
                bridge_frames(client_ws, upstream_ws, deadline).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to upgrade inbound connection for websocket bridge");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::CONNECTION, "Upgrade")
        .header("sec-websocket-accept", accept)
        .body({
            use http_body_util::{BodyExt, Empty};
            Empty::new().map_err(|never| match never {}).boxed()
        })
        .expect("upgrade response is well-formed")
}

/// Spawn two concurrent copiers — client→upstream and upstream→client —
/// sharing a close-once signal: either side erroring, closing, or exceeding
/// its read deadline promptly tears down both peers.
async fn bridge_frames<C, U>(client: WebSocketStream<C>, upstream: WebSocketStream<U>, deadline: Duration)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (client_tx, client_rx) = client.split();
    let (upstream_tx, upstream_rx) = upstream.split();

    let closed = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(Notify::new());

    let a = copy_direction(client_rx, upstream_tx, deadline, closed.clone(), notify.clone());
    let b = copy_direction(upstream_rx, client_tx, deadline, closed.clone(), notify.clone());

    tokio::join!(a, b);
}

async fn copy_direction<From, To>(
    from: From,
    to: To,
    read_deadline: Duration,
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
) where
    From: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    To: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let mut from = from;
    let mut to = to;
    let sleep = tokio::time::sleep(read_deadline);
    tokio::pin!(sleep);

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = &mut sleep => {
                break;
            }
            _ = notify.notified() => {
                break;
            }
            next = from.next() => {
                match next {
                    None => break,
                    Some(Err(_)) => break,
                    Some(Ok(Message::Pong(_))) => {
                        sleep.as_mut().reset(Instant::now() + read_deadline);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let _ = to.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(Ok(msg)) => {
                        if to.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    notify.notify_waiters();
    let _ = to.close().await;
}
