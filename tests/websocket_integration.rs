mod support;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sandproxy::route::{AuthConfig, EgressMode, RouteSpec, WsConfig};
use sandproxy::supervisor::Supervisor;
use support::{pick_port, spawn_echo_websocket_upstream, wait_until_ready};
use tokio_tungstenite::tungstenite::Message;

fn base_spec(domain: &str, out_address: String) -> RouteSpec {
    RouteSpec {
        domain: domain.to_string(),
        egress_mode: EgressMode::Http,
        out_address,
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

#[tokio::test]
async fn websocket_frames_round_trip_through_the_bridge() {
    let upstream_port = pick_port();
    spawn_echo_websocket_upstream(upstream_port).await;

    let proxy_port = pick_port();
    let supervisor = Arc::new(Supervisor::new(format!("127.0.0.1:{proxy_port}"), None, String::new(), false));
    supervisor
        .add(base_spec("ws.test", format!("127.0.0.1:{upstream_port}")))
        .unwrap();
    let running = supervisor.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    wait_until_ready(proxy_port, Duration::from_secs(2)).await;

    let request = http::Request::builder()
        .method("GET")
        .uri(format!("ws://127.0.0.1:{proxy_port}/socket"))
        .header("host", "ws.test")
        .body(())
        .unwrap();

    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);

    ws.send(Message::text("hello")).await.unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed.into_text().unwrap(), "hello");

    ws.close(None).await.unwrap();
    supervisor.close();
}
