mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sandproxy::route::{AuthConfig, EgressMode, RouteSpec, WsConfig};
use sandproxy::supervisor::Supervisor;
use support::{pick_port, spawn_echo_upstream, wait_until_ready};

fn base_spec(domain: &str, mode: EgressMode, out_address: String) -> RouteSpec {
    RouteSpec {
        domain: domain.to_string(),
        egress_mode: mode,
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

async fn spawn_plain_proxy() -> (Arc<Supervisor>, u16) {
    let port = pick_port();
    let supervisor = Arc::new(Supervisor::new(format!("127.0.0.1:{port}"), None, String::new(), false));
    let running = supervisor.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    wait_until_ready(port, Duration::from_secs(2)).await;
    (supervisor, port)
}

#[tokio::test]
async fn redirect_route_issues_a_308_to_the_resolved_target() {
    let (supervisor, proxy_port) = spawn_plain_proxy().await;
    supervisor
        .add(base_spec(
            "redirect.test",
            EgressMode::Redirect,
            "https://elsewhere.example".to_string(),
        ))
        .unwrap();

    let client = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap();
    let resp = client
        .get(format!("http://127.0.0.1:{proxy_port}/a/b?x=1"))
        .header("host", "redirect.test")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 308);
    let location = resp.headers().get("location").unwrap().to_str().unwrap();
    assert_eq!(location, "https://elsewhere.example/a/b?x=1");
    supervisor.close();
}

#[tokio::test]
async fn load_balancer_route_distributes_across_all_targets() {
    let port_a = pick_port();
    let port_b = pick_port();
    spawn_echo_upstream("a", port_a).await;
    spawn_echo_upstream("b", port_b).await;

    let (supervisor, proxy_port) = spawn_plain_proxy().await;
    let mut spec = base_spec("lb.test", EgressMode::LoadBalancer, String::new());
    spec.load_balancer_targets = vec![format!("127.0.0.1:{port_a}"), format!("127.0.0.1:{port_b}")];
    supervisor.add(spec).unwrap();

    let client = reqwest::Client::new();
    let mut seen = HashSet::new();
    for _ in 0..8 {
        let resp = client
            .get(format!("http://127.0.0.1:{proxy_port}/"))
            .header("host", "lb.test")
            .send()
            .await
            .unwrap();
        seen.insert(resp.text().await.unwrap());
    }

    assert!(seen.contains("a:/"));
    assert!(seen.contains("b:/"));
    supervisor.close();
}

#[tokio::test]
async fn metrics_endpoint_counts_requests_by_egress_mode() {
    let upstream_port = pick_port();
    spawn_echo_upstream("m", upstream_port).await;

    let (supervisor, proxy_port) = spawn_plain_proxy().await;
    supervisor
        .add(base_spec("metered.test", EgressMode::Http, format!("127.0.0.1:{upstream_port}")))
        .unwrap();

    let client = reqwest::Client::new();
    client
        .get(format!("http://127.0.0.1:{proxy_port}/"))
        .header("host", "metered.test")
        .send()
        .await
        .unwrap();

    let metrics = client
        .get(format!("http://127.0.0.1:{proxy_port}/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), 200);
    let body = metrics.text().await.unwrap();
    assert!(body.contains("sandproxy_requests_total"));
    assert!(body.contains(r#"egress_mode="HTTP"} 1"#));
    supervisor.close();
}
