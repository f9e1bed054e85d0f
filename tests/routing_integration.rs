mod support;

use std::sync::Arc;
use std::time::Duration;

use sandproxy::route::{AuthConfig, AuthMode, EgressMode, RouteSpec, WsConfig};
use sandproxy::supervisor::Supervisor;
use support::{pick_port, spawn_echo_upstream, wait_until_ready};

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

async fn spawn_plain_proxy(fallback_domain: &str, debug: bool) -> (Arc<Supervisor>, u16) {
    let port = pick_port();
    let supervisor = Arc::new(Supervisor::new(
        format!("127.0.0.1:{port}"),
        None,
        fallback_domain.to_string(),
        debug,
    ));
    let running = supervisor.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    wait_until_ready(port, Duration::from_secs(2)).await;
    (supervisor, port)
}

#[tokio::test]
async fn routes_by_debug_host_header_when_debug_enabled() {
    let upstream_port = pick_port();
    spawn_echo_upstream("tenant", upstream_port).await;

    let (supervisor, proxy_port) = spawn_plain_proxy("", true).await;
    supervisor
        .add(base_spec("tenant.test", format!("127.0.0.1:{upstream_port}")))
        .unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://127.0.0.1:{proxy_port}/widgets"))
        .header("host", "unrelated.invalid")
        .header("x-debug-host", "tenant.test")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "tenant:/widgets");
    supervisor.close();
}

#[tokio::test]
async fn wildcard_sibling_wins_over_exact_domain_on_overlap() {
    let exact_port = pick_port();
    let wildcard_port = pick_port();
    spawn_echo_upstream("exact", exact_port).await;
    spawn_echo_upstream("wildcard", wildcard_port).await;

    let (supervisor, proxy_port) = spawn_plain_proxy("", false).await;
    supervisor
        .add(base_spec("*.x.test", format!("127.0.0.1:{wildcard_port}")))
        .unwrap();
    supervisor
        .add(base_spec("a.x.test", format!("127.0.0.1:{exact_port}")))
        .unwrap();

    let client = reqwest::Client::new();

    // a.x.test matches both the exact route and the wildcard sibling; the
    // wildcard branch is tried first at every trie node, so it wins.
    let overlapping = client
        .get(format!("http://127.0.0.1:{proxy_port}/"))
        .header("host", "a.x.test")
        .send()
        .await
        .unwrap();
    assert_eq!(overlapping.text().await.unwrap(), "wildcard:/");

    let wildcard_only = client
        .get(format!("http://127.0.0.1:{proxy_port}/"))
        .header("host", "b.x.test")
        .send()
        .await
        .unwrap();
    assert_eq!(wildcard_only.text().await.unwrap(), "wildcard:/");

    supervisor.close();
}

#[tokio::test]
async fn unmatched_host_falls_through_to_fallback_domain() {
    let fallback_port = pick_port();
    spawn_echo_upstream("fallback", fallback_port).await;

    let (supervisor, proxy_port) = spawn_plain_proxy("fallback.test", false).await;
    supervisor
        .add(base_spec("fallback.test", format!("127.0.0.1:{fallback_port}")))
        .unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://127.0.0.1:{proxy_port}/lost"))
        .header("host", "nowhere.invalid")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "fallback:/lost");
    supervisor.close();
}

#[tokio::test]
async fn unmatched_host_with_no_fallback_domain_returns_500() {
    let (supervisor, proxy_port) = spawn_plain_proxy("", false).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://127.0.0.1:{proxy_port}/"))
        .header("host", "nowhere.invalid")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 500);
    let body = resp.text().await.unwrap();
    assert!(body.contains("domain not found"));
    assert!(!body.contains("fallback"));
    supervisor.close();
}

#[tokio::test]
async fn configured_but_absent_fallback_domain_reports_fallback_specific_message() {
    let (supervisor, proxy_port) = spawn_plain_proxy("missing.test", false).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://127.0.0.1:{proxy_port}/"))
        .header("host", "nowhere.invalid")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 500);
    let body = resp.text().await.unwrap();
    assert!(body.contains("fallback domain not found"));
    supervisor.close();
}

#[tokio::test]
async fn apikey_auth_rejects_missing_or_wrong_header() {
    let upstream_port = pick_port();
    spawn_echo_upstream("secure", upstream_port).await;

    let (supervisor, proxy_port) = spawn_plain_proxy("", false).await;
    let mut spec = base_spec("secure.test", format!("127.0.0.1:{upstream_port}"));
    spec.auth = AuthConfig {
        mode: AuthMode::ApiKey,
        header_key: "x-api-key".to_string(),
        expected_value: "topsecret".to_string(),
    };
    supervisor.add(spec).unwrap();

    let client = reqwest::Client::new();

    let missing = client
        .get(format!("http://127.0.0.1:{proxy_port}/"))
        .header("host", "secure.test")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client
        .get(format!("http://127.0.0.1:{proxy_port}/"))
        .header("host", "secure.test")
        .header("x-api-key", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let right = client
        .get(format!("http://127.0.0.1:{proxy_port}/"))
        .header("host", "secure.test")
        .header("x-api-key", "topsecret")
        .send()
        .await
        .unwrap();
    assert_eq!(right.status(), 200);

    supervisor.close();
}
