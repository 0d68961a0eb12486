//! Integration tests driving real listeners end to end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use servegate::config::Config;
use servegate::server::Gateway;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Write a config file, boot a gateway on it, and wait for the listener.
async fn start_gateway(yaml: String, listen_port: u16) -> (Arc<Gateway>, watch::Sender<bool>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, yaml).unwrap();

    let config = Config::load(&path).unwrap();
    let gateway = Gateway::new(config).unwrap();
    gateway.start().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let _ = gateway.run(shutdown_rx).await;
        });
    }

    assert!(
        wait_for_port(listen_port, Duration::from_secs(5)).await,
        "gateway listener did not come up on port {}",
        listen_port
    );

    (gateway, shutdown_tx)
}

async fn teardown(gateway: Arc<Gateway>, shutdown_tx: watch::Sender<bool>) {
    let _ = shutdown_tx.send(true);
    gateway.shutdown().await;
}

/// Minimal backend: accepts connections and answers 200 with a fixed body.
async fn spawn_mock_backend(port: u16) -> JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nbackend",
                    )
                    .await;
            });
        }
    })
}

/// Wait for a port to accept connections.
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send an HTTP GET with a custom Host header and collect the full response.
async fn http_get_with_host(port: u16, path: &str, host: &str) -> std::io::Result<String> {
    http_get_with_headers(port, path, host, &[]).await
}

async fn http_get_with_headers(
    port: u16,
    path: &str,
    host: &str,
    extra_headers: &[(&str, &str)],
) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, host);
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Open the SSE stream and read until `patterns` have all appeared, bounded
/// by `timeout`.
async fn read_sse_until(
    port: u16,
    host: &str,
    patterns: &[&str],
    timeout: Duration,
) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    let request = format!("GET /events HTTP/1.1\r\nHost: {}\r\n\r\n", host);
    stream.write_all(request.as_bytes()).await?;

    let mut collected = String::new();
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 4096];

    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if patterns.iter().all(|p| collected.contains(p)) {
                    return Ok(collected);
                }
            }
            _ => break,
        }
    }
    Ok(collected)
}

// ---------------------------------------------------------------------------
// On-demand spawn

#[tokio::test(flavor = "multi_thread")]
async fn test_on_demand_spawn_forwards_once_ready() {
    let listen = 47101;
    let backend = 47201;
    let backend_handle = spawn_mock_backend(backend).await;

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  app:
    subdomain: app
    forwards_to: "127.0.0.1:{backend}"
    start: ["sleep", "60"]
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    let begin = Instant::now();
    let response = http_get_with_host(listen, "/", "app.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("backend"));
    assert!(begin.elapsed() < Duration::from_secs(3), "first request should be fast");

    backend_handle.abort();
    teardown(gateway, shutdown).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_on_demand_spawn_times_out_without_backend() {
    let listen = 47102;

    // Nothing listens on the forward target; the probe must exhaust.
    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  app:
    subdomain: app
    forwards_to: "127.0.0.1:47299"
    start: ["sleep", "60"]
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    let begin = Instant::now();
    let response = http_get_with_host(listen, "/", "app.example.com").await.unwrap();
    let elapsed = begin.elapsed();

    assert!(response.starts_with("HTTP/1.1 500"), "got: {response}");
    assert!(response.contains("did not start in time"));
    assert!(elapsed >= Duration::from_secs(9), "probe must run its full course");
    assert!(elapsed < Duration::from_secs(15));

    teardown(gateway, shutdown).await;
}

// ---------------------------------------------------------------------------
// Idle shutdown

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_timeout_stops_service() {
    let listen = 47103;
    let backend = 47203;
    let backend_handle = spawn_mock_backend(backend).await;

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  app:
    subdomain: app
    forwards_to: "127.0.0.1:{backend}"
    start: ["sleep", "60"]
    timeout: 1
  mgmt:
    subdomain: api
    api: true
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    let sse = tokio::spawn(async move {
        read_sse_until(
            listen,
            "api.example.com",
            &[
                "event: connected",
                r#"{"type":"start","service":"app"}"#,
                r#"{"type":"stop","service":"app"}"#,
            ],
            Duration::from_secs(10),
        )
        .await
    });
    // Give the SSE client a moment to subscribe before the start event fires.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = http_get_with_host(listen, "/", "app.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let status = http_get_with_host(listen, "/status?service=app", "api.example.com")
        .await
        .unwrap();
    assert!(status.contains(r#"{"running":false}"#), "got: {status}");

    let events = sse.await.unwrap().unwrap();
    assert!(events.contains(r#"{"type":"start","service":"app"}"#), "got: {events}");
    assert!(events.contains(r#"{"type":"stop","service":"app"}"#), "got: {events}");

    backend_handle.abort();
    teardown(gateway, shutdown).await;
}

// ---------------------------------------------------------------------------
// Graceful shutdown then kill

#[tokio::test(flavor = "multi_thread")]
async fn test_sigint_immune_child_killed_after_grace() {
    let listen = 47104;
    let backend = 47204;
    let backend_handle = spawn_mock_backend(backend).await;

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  app:
    subdomain: app
    forwards_to: "127.0.0.1:{backend}"
    start: ["sh", "-c", "trap '' INT; sleep 60"]
    kill_timeout: 1
  mgmt:
    subdomain: api
    api: true
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    let response = http_get_with_host(listen, "/", "app.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

    let begin = Instant::now();
    let stop = http_get_with_host(listen, "/stop?service=app", "api.example.com")
        .await
        .unwrap();
    let elapsed = begin.elapsed();
    assert!(stop.contains(r#"{"status":"ok"}"#), "got: {stop}");
    assert!(elapsed >= Duration::from_secs(1), "grace period must elapse first");
    assert!(elapsed < Duration::from_millis(2500), "SIGKILL must follow promptly");

    let status = http_get_with_host(listen, "/status?service=app", "api.example.com")
        .await
        .unwrap();
    assert!(status.contains(r#"{"running":false}"#), "got: {status}");

    backend_handle.abort();
    teardown(gateway, shutdown).await;
}

// ---------------------------------------------------------------------------
// Router resolution

#[tokio::test(flavor = "multi_thread")]
async fn test_router_subdomain_apex_and_miss() {
    let listen = 47105;
    let backend = 47205;
    let backend_handle = spawn_mock_backend(backend).await;

    let files_dir = tempfile::tempdir().unwrap();
    std::fs::write(files_dir.path().join("index.html"), "<h1>apex</h1>").unwrap();

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  a:
    subdomain: a
    forwards_to: "127.0.0.1:{backend}"
  b:
    subdomain: ""
    serve_files: {files_dir}
"#,
        files_dir = files_dir.path().display()
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    // Subdomain -> proxy service (no start argv, forwards directly).
    let response = http_get_with_host(listen, "/", "a.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("backend"));

    // Apex -> static files.
    let response = http_get_with_host(listen, "/", "example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("<h1>apex</h1>"));

    // Unrelated host falls back to its leftmost label, which matches nothing.
    let response = http_get_with_host(listen, "/", "other.tld").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
    assert!(response.contains("Service not found"));

    backend_handle.abort();
    teardown(gateway, shutdown).await;
}

// ---------------------------------------------------------------------------
// IP filter

#[tokio::test(flavor = "multi_thread")]
async fn test_ip_filter_allow_and_block() {
    let listen = 47106;
    let backend = 47206;
    let backend_handle = spawn_mock_backend(backend).await;

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
allowlist: ["10.0.0.0/8"]
blocklist: ["10.0.0.5"]
services:
  a:
    subdomain: a
    forwards_to: "127.0.0.1:{backend}"
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    // The filter judges the first X-Forwarded-For token when present.
    let allowed = http_get_with_headers(
        listen,
        "/",
        "a.example.com",
        &[("X-Forwarded-For", "10.0.0.1")],
    )
    .await
    .unwrap();
    assert!(allowed.starts_with("HTTP/1.1 200"), "got: {allowed}");

    let blocked = http_get_with_headers(
        listen,
        "/",
        "a.example.com",
        &[("X-Forwarded-For", "10.0.0.5")],
    )
    .await
    .unwrap();
    assert!(blocked.starts_with("HTTP/1.1 403"), "got: {blocked}");

    let outside = http_get_with_headers(
        listen,
        "/",
        "a.example.com",
        &[("X-Forwarded-For", "192.168.0.1")],
    )
    .await
    .unwrap();
    assert!(outside.starts_with("HTTP/1.1 403"), "got: {outside}");

    // Without the header the loopback peer is outside the allowlist.
    let peer = http_get_with_host(listen, "/", "a.example.com").await.unwrap();
    assert!(peer.starts_with("HTTP/1.1 403"), "got: {peer}");

    backend_handle.abort();
    teardown(gateway, shutdown).await;
}

// ---------------------------------------------------------------------------
// Management API

#[tokio::test(flavor = "multi_thread")]
async fn test_api_list_hides_hidden_and_reports_status() {
    let listen = 47107;
    let backend = 47207;
    let backend_handle = spawn_mock_backend(backend).await;

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  app:
    subdomain: app
    forwards_to: "127.0.0.1:{backend}"
    start: ["sleep", "60"]
  secret:
    subdomain: secret
    forwards_to: "127.0.0.1:{backend}"
    hidden: true
  mgmt:
    subdomain: api
    api: true
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    let list = http_get_with_host(listen, "/list", "api.example.com").await.unwrap();
    assert!(list.contains(r#""app":{"status":"stopped","subdomain":"app"}"#), "got: {list}");
    assert!(!list.contains("secret"), "hidden services must not be listed: {list}");
    assert!(list.contains(r#""mgmt":{"status":"started","subdomain":"api"}"#), "got: {list}");

    // Start via the API, then the list shows it running.
    let start = http_get_with_host(listen, "/start?service=app", "api.example.com")
        .await
        .unwrap();
    assert!(start.contains(r#"{"status":"ok"}"#), "got: {start}");

    let list = http_get_with_host(listen, "/list", "api.example.com").await.unwrap();
    assert!(list.contains(r#""app":{"status":"started","subdomain":"app"}"#), "got: {list}");

    let status = http_get_with_host(listen, "/status?service=app", "api.example.com")
        .await
        .unwrap();
    assert!(status.contains(r#"{"running":true}"#), "got: {status}");

    // CORS headers ride on every JSON response.
    assert!(list.contains("access-control-allow-origin: *") || list.contains("Access-Control-Allow-Origin: *"));

    backend_handle.abort();
    teardown(gateway, shutdown).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_api_unknown_endpoint_and_unknown_service() {
    let listen = 47108;

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  mgmt:
    subdomain: api
    api: true
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    let response = http_get_with_host(listen, "/bogus", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
    assert!(response.contains("Unknown API endpoint"));

    let response = http_get_with_host(listen, "/start?service=nope", "api.example.com")
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
    assert!(response.contains("Unknown service"));

    // The API service itself always reports running.
    let response = http_get_with_host(listen, "/status", "api.example.com").await.unwrap();
    assert!(response.contains(r#"{"running":true}"#), "got: {response}");

    teardown(gateway, shutdown).await;
}

// ---------------------------------------------------------------------------
// SSE stream

#[tokio::test(flavor = "multi_thread")]
async fn test_events_stream_announces_and_relays() {
    let listen = 47109;
    let backend = 47209;
    let backend_handle = spawn_mock_backend(backend).await;

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  app:
    subdomain: app
    forwards_to: "127.0.0.1:{backend}"
    start: ["sleep", "60"]
  mgmt:
    subdomain: api
    api: true
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    let sse = tokio::spawn(async move {
        read_sse_until(
            listen,
            "api.example.com",
            &["event: connected", r#"{"type":"start","service":"app"}"#],
            Duration::from_secs(10),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = http_get_with_host(listen, "/start?service=app", "api.example.com")
        .await
        .unwrap();
    assert!(start.contains(r#"{"status":"ok"}"#), "got: {start}");

    let events = sse.await.unwrap().unwrap();
    assert!(events.contains("text/event-stream"), "got: {events}");
    assert!(events.contains("event: connected\ndata: connected"), "got: {events}");
    assert!(
        events.contains("event: message\ndata: {\"type\":\"start\",\"service\":\"app\"}"),
        "got: {events}"
    );

    backend_handle.abort();
    teardown(gateway, shutdown).await;
}

// ---------------------------------------------------------------------------
// Autostart

#[tokio::test(flavor = "multi_thread")]
async fn test_autostart_runs_service_at_boot() {
    let listen = 47110;
    let backend = 47210;
    let backend_handle = spawn_mock_backend(backend).await;

    let yaml = format!(
        r#"
listen: {{ http: "127.0.0.1:{listen}" }}
domain: example.com
services:
  app:
    subdomain: app
    forwards_to: "127.0.0.1:{backend}"
    start: ["sleep", "60"]
    autostart: true
  mgmt:
    subdomain: api
    api: true
"#
    );
    let (gateway, shutdown) = start_gateway(yaml, listen).await;

    // Started during boot, before any request touched it.
    let status = http_get_with_host(listen, "/status?service=app", "api.example.com")
        .await
        .unwrap();
    assert!(status.contains(r#"{"running":true}"#), "got: {status}");

    backend_handle.abort();
    teardown(gateway, shutdown).await;
}
