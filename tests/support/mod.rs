use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

/// Reserve an ephemeral port by binding and immediately dropping a listener.
/// Same trick the teacher's own test support module uses to hand a concrete
/// port to a process/task that binds it moments later.
pub fn pick_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("reserve an ephemeral port")
        .local_addr()
        .expect("bound listener has a local address")
        .port()
}

pub fn local_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("valid socket address")
}

/// A minimal HTTP/1.1 upstream: replies 200 with a body of
/// `"<label>:<path>"`, so tests can assert both which upstream answered
/// (load-balancer fan-out) and that the request path survived the proxy's
/// rewrite (single-joining-slash, query merge).
pub async fn spawn_echo_upstream(label: &'static str, port: u16) {
    let listener = TcpListener::bind(local_addr(port)).await.expect("bind upstream listener");
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = match stream.read(&mut buf).await {
                    Ok(n) if n > 0 => n,
                    _ => return,
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                let path_and_query = request
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                let body = format!("{label}:{path_and_query}");
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
}

/// A WebSocket upstream that echoes every frame back verbatim, using the
/// same `tokio-tungstenite` crate the bridge's outbound client handshake
/// uses, so both halves of the test speak the identical protocol dialect.
pub async fn spawn_echo_websocket_upstream(port: u16) {
    let listener = TcpListener::bind(local_addr(port)).await.expect("bind websocket upstream listener");
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                    if ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

pub async fn wait_until_ready(port: u16, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect(local_addr(port)).await.is_ok() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("port {port} never became ready");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
