//! Integration tests for the nginx load balancer
//!
//! nginx is replaced by a shell script that answers `-v` and `-t` and
//! otherwise idles until SIGQUIT. Its status page is served by a stub
//! listener bound to the configured health port.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ingress_proxy::config::NginxConfig;
use ingress_proxy::error::ProxyError;
use ingress_proxy::ingress::{IngressEntry, IngressUpdate};
use ingress_proxy::loadbalancer::NginxLoadBalancer;
use ingress_proxy::metrics::{Gauge, NoopMetrics, PrometheusMetrics};
use ingress_proxy::process::{OsSignaller, ProcessState, Signaller};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const STATUS_BODY: &str = "Active connections: 291 \n\
server accepts handled requests\n \
16630948 16630948 31070465 \n\
Reading: 6 Writing: 179 Waiting: 106 \n";

const FAKE_NGINX: &str = r#"#!/bin/sh
case "$1" in
  -v)
    echo "nginx version: nginx/1.25.3" >&2
    exit 0
    ;;
  -t)
    if grep -q 'invalid.example' "$3"; then
      echo "nginx: [emerg] host not found in upstream \"invalid.example\" in $3" >&2
      exit 1
    fi
    echo "nginx: configuration file $3 test is successful" >&2
    exit 0
    ;;
esac
trap 'exit 0' QUIT
trap '' HUP
while true; do sleep 0.05; done
"#;

const CRASHING_NGINX: &str = r#"#!/bin/sh
case "$1" in
  -v) echo "nginx version: nginx/1.25.3" >&2; exit 0 ;;
esac
echo "nginx: [emerg] bind() to 0.0.0.0:8080 failed (98: Address already in use)" >&2
exit 1
"#;

/// Real signals, with reloads counted
#[derive(Default)]
struct CountingSignaller {
    reloads: AtomicUsize,
}

impl Signaller for CountingSignaller {
    fn shutdown(&self, pid: u32) -> std::io::Result<()> {
        OsSignaller.shutdown(pid)
    }

    fn reload(&self, pid: u32) -> std::io::Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        OsSignaller.reload(pid)
    }
}

struct Harness {
    dir: tempfile::TempDir,
    lb: NginxLoadBalancer,
    signaller: Arc<CountingSignaller>,
}

impl Harness {
    fn config_path(&self) -> PathBuf {
        self.dir.path().join("nginx.conf")
    }

    fn config(&self) -> String {
        std::fs::read_to_string(self.config_path()).unwrap()
    }

    fn reloads(&self) -> usize {
        self.signaller.reloads.load(Ordering::SeqCst)
    }
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("nginx");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn harness_with(script: &str, health_port: u16, metrics: Arc<PrometheusMetrics>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), script);
    std::fs::copy(
        concat!(env!("CARGO_MANIFEST_DIR"), "/templates/nginx.tmpl"),
        dir.path().join("nginx.tmpl"),
    )
    .unwrap();

    let mut conf = NginxConfig::new(binary, dir.path());
    conf.health_port = health_port;
    conf.start_delay_ms = 100;
    conf.metrics_interval_ms = 50;
    conf.metrics_timeout_ms = 500;
    conf.shutdown_timeout_secs = 5;

    let signaller = Arc::new(CountingSignaller::default());
    let lb = NginxLoadBalancer::with_signaller(conf, metrics, signaller.clone());
    Harness { dir, lb, signaller }
}

fn harness(health_port: u16) -> Harness {
    harness_with(FAKE_NGINX, health_port, Arc::new(PrometheusMetrics::new()))
}

/// Serve `STATUS_BODY` for every request until the test ends
async fn stub_status_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    STATUS_BODY.len(),
                    STATUS_BODY
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    port
}

/// A port with nothing listening on it
async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll until `check` passes or the timeout elapses
async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn entry(name: &str, host: &str, path: &str) -> IngressEntry {
    IngressEntry::new(name, host, path, "10.0.0.1", 8080)
}

#[tokio::test]
async fn test_start_writes_default_config_and_stop() {
    let port = stub_status_server().await;
    let h = harness(port);

    h.lb.start().await.unwrap();
    assert_eq!(h.lb.status().state, ProcessState::Running);
    assert!(h.lb.status().pid.is_some());

    let config = h.config();
    assert!(!config.contains("# Start entry"));
    assert!(config.contains("default_server"));
    assert!(config.contains("return 404;"));
    assert!(config.contains(&format!("listen {};", port)));
    assert!(config.contains("stub_status"));

    h.lb.stop().await.unwrap();
    assert_eq!(h.lb.status().state, ProcessState::Exited);
    assert_eq!(h.lb.status().last_error, None);
}

#[tokio::test]
async fn test_start_replaces_stale_config() {
    let port = stub_status_server().await;
    let h = harness(port);
    std::fs::write(h.config_path(), "stale contents from a previous run\n").unwrap();

    h.lb.start().await.unwrap();
    assert!(!h.config().contains("stale contents"));

    h.lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_healthy_while_running_and_not_after_stop() {
    let port = stub_status_server().await;
    let h = harness(port);

    h.lb.start().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            h.lb.health().is_ok() && h.lb.status().metrics.is_some()
        })
        .await,
        "health never succeeded"
    );

    h.lb.stop().await.unwrap();
    for _ in 0..3 {
        let err = h.lb.health().unwrap_err();
        assert!(matches!(err, ProxyError::NotRunning));
        assert_eq!(err.to_string(), "nginx is not running");
    }
}

#[tokio::test]
async fn test_unhealthy_when_status_unreachable() {
    let port = unused_port().await;
    let h = harness(port);

    h.lb.start().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            matches!(h.lb.health(), Err(ProxyError::MetricsUnhealthy))
        })
        .await,
        "metrics failure never surfaced in health"
    );

    h.lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_fails_when_nginx_dies_immediately() {
    let port = unused_port().await;
    let h = harness_with(CRASHING_NGINX, port, Arc::new(PrometheusMetrics::new()));

    let err = h.lb.start().await.unwrap_err();
    assert!(matches!(err, ProxyError::DiedImmediately { .. }));
    assert!(err.to_string().contains("died shortly after starting"));
    assert!(h.lb.health().is_err());
    assert_eq!(h.lb.status().state, ProcessState::Exited);
}

#[tokio::test]
async fn test_start_fails_without_template() {
    let port = unused_port().await;
    let h = harness(port);
    std::fs::remove_file(h.dir.path().join("nginx.tmpl")).unwrap();

    let err = h.lb.start().await.unwrap_err();
    assert!(matches!(err, ProxyError::TemplateRead { .. }));
    assert_eq!(h.lb.status().state, ProcessState::NotStarted);
}

#[tokio::test]
async fn test_update_renders_entry_and_reloads() {
    let port = stub_status_server().await;
    let h = harness(port);
    h.lb.start().await.unwrap();

    let update = IngressUpdate::new(vec![entry("svc-a", "a.example.com", "/foo")]);
    assert!(h.lb.update(&update).await.unwrap());
    assert_eq!(h.reloads(), 1);

    let config = h.config();
    assert!(config.contains("upstream upstream000 {"));
    assert!(config.contains("server 10.0.0.1:8080;"));
    assert!(config.contains("proxy_pass http://upstream000/;"));
    assert!(config.contains("location /foo/ {"));
    assert!(config.contains("server_name a.example.com;"));

    h.lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_update_orders_entries_by_name() {
    let port = stub_status_server().await;
    let h = harness(port);
    h.lb.start().await.unwrap();

    let update = IngressUpdate::new(vec![
        entry("b-second", "b.example.com", "/b"),
        entry("a-first", "a.example.com", "/a"),
    ]);
    assert!(h.lb.update(&update).await.unwrap());

    let config = h.config();
    let first = config.find("# a-first").unwrap();
    let second = config.find("# b-second").unwrap();
    assert!(first < second);
    assert!(config[first..second].contains("upstream upstream000"));
    assert!(config[second..].contains("upstream upstream001"));

    let reordered = IngressUpdate::new(vec![
        entry("a-first", "a.example.com", "/a"),
        entry("b-second", "b.example.com", "/b"),
    ]);
    assert!(!h.lb.update(&reordered).await.unwrap());
    assert_eq!(h.reloads(), 1);

    h.lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_identical_update_does_not_reload() {
    let port = stub_status_server().await;
    let h = harness(port);
    h.lb.start().await.unwrap();

    let update = IngressUpdate::new(vec![entry("svc-a", "a.example.com", "foo")]);
    assert!(h.lb.update(&update).await.unwrap());
    let written = h.config();

    assert!(!h.lb.update(&update).await.unwrap());
    assert_eq!(h.reloads(), 1);
    assert_eq!(h.config(), written);

    // Removing every entry is a change back to the default config
    assert!(h.lb.update(&IngressUpdate::default()).await.unwrap());
    assert_eq!(h.reloads(), 2);
    assert!(!h.config().contains("# Start entry"));

    h.lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_validation_failure_keeps_nginx_running() {
    let port = stub_status_server().await;
    let h = harness(port);
    h.lb.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || h.lb.health().is_ok()).await);

    let update = IngressUpdate::new(vec![entry("bad", "invalid.example", "/")]);
    let err = h.lb.update(&update).await.unwrap_err();

    assert!(err.is_validation());
    let msg = err.to_string();
    assert!(msg.contains("host not found in upstream \"invalid.example\""));
    assert!(msg.contains(" -t -c "));
    assert_eq!(h.reloads(), 0);

    // The rejected config stays on disk but nginx was never told about it
    assert!(h.config().contains("invalid.example"));
    h.lb.health().unwrap();
    assert_eq!(h.lb.status().state, ProcessState::Running);

    h.lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_update_after_stop_fails() {
    let port = stub_status_server().await;
    let h = harness(port);
    h.lb.start().await.unwrap();
    h.lb.stop().await.unwrap();

    let update = IngressUpdate::new(vec![entry("svc-a", "a.example.com", "/")]);
    let err = h.lb.update(&update).await.unwrap_err();
    assert!(matches!(err, ProxyError::NotRunning));
    assert_eq!(h.reloads(), 0);
}

#[tokio::test]
async fn test_second_start_is_rejected_without_touching_config() {
    let port = stub_status_server().await;
    let h = harness(port);
    h.lb.start().await.unwrap();

    let update = IngressUpdate::new(vec![entry("svc-a", "a.example.com", "/foo")]);
    assert!(h.lb.update(&update).await.unwrap());
    let before = h.config();

    assert!(matches!(h.lb.start().await, Err(ProxyError::AlreadyStarted)));
    assert_eq!(h.config(), before);
    assert!(!h.lb.update(&update).await.unwrap());
    assert_eq!(h.reloads(), 1);

    h.lb.stop().await.unwrap();
    assert!(matches!(h.lb.start().await, Err(ProxyError::AlreadyStarted)));
    assert_eq!(h.config(), before);
}

#[tokio::test]
async fn test_missing_template_keeps_previous_config() {
    let port = unused_port().await;
    let h = harness(port);
    std::fs::write(h.config_path(), "previous config\n").unwrap();
    std::fs::remove_file(h.dir.path().join("nginx.tmpl")).unwrap();

    assert!(h.lb.start().await.is_err());
    assert_eq!(h.config(), "previous config\n");
}

/// Real shutdowns; every reload fails
struct ReloadFailingSignaller;

impl Signaller for ReloadFailingSignaller {
    fn shutdown(&self, pid: u32) -> std::io::Result<()> {
        OsSignaller.shutdown(pid)
    }

    fn reload(&self, _pid: u32) -> std::io::Result<()> {
        Err(std::io::ErrorKind::PermissionDenied.into())
    }
}

#[tokio::test]
async fn test_reload_signal_failure_is_returned_from_update() {
    let port = stub_status_server().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), FAKE_NGINX);
    std::fs::copy(
        concat!(env!("CARGO_MANIFEST_DIR"), "/templates/nginx.tmpl"),
        dir.path().join("nginx.tmpl"),
    )
    .unwrap();

    let mut conf = NginxConfig::new(binary, dir.path());
    conf.health_port = port;
    conf.metrics_interval_ms = 50;
    conf.shutdown_timeout_secs = 5;
    let lb = NginxLoadBalancer::with_signaller(conf, Arc::new(NoopMetrics), Arc::new(ReloadFailingSignaller));

    lb.start().await.unwrap();

    let update = IngressUpdate::new(vec![entry("svc-a", "a.example.com", "/foo")]);
    let err = lb.update(&update).await.unwrap_err();
    assert!(matches!(err, ProxyError::Signal { signal: "SIGHUP", .. }));
    assert!(err.to_string().contains("SIGHUP"));

    // The validated config was written even though nginx never heard about it
    let written = std::fs::read_to_string(dir.path().join("nginx.conf")).unwrap();
    assert!(written.contains("# svc-a"));
    assert_eq!(lb.status().state, ProcessState::Running);

    lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_counters_reach_metrics() {
    let port = stub_status_server().await;
    let metrics = Arc::new(PrometheusMetrics::new());
    let h = harness_with(FAKE_NGINX, port, metrics.clone());

    h.lb.start().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || {
            metrics.get(Gauge::Requests) == 31070465.0
        })
        .await
    );

    assert_eq!(metrics.get(Gauge::Connections), 291.0);
    assert_eq!(metrics.get(Gauge::Accepts), 16630948.0);
    assert_eq!(metrics.get(Gauge::Handled), 16630948.0);
    assert_eq!(metrics.get(Gauge::ReadingConnections), 6.0);
    assert_eq!(metrics.get(Gauge::WritingConnections), 179.0);
    assert_eq!(metrics.get(Gauge::WaitingConnections), 106.0);

    let snapshot = h.lb.status().metrics.unwrap();
    assert_eq!(snapshot.active_connections, 291);

    h.lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_noop_metrics_sink() {
    let port = stub_status_server().await;
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), FAKE_NGINX);
    std::fs::copy(
        concat!(env!("CARGO_MANIFEST_DIR"), "/templates/nginx.tmpl"),
        dir.path().join("nginx.tmpl"),
    )
    .unwrap();

    let mut conf = NginxConfig::new(binary, dir.path());
    conf.health_port = port;
    conf.metrics_interval_ms = 50;
    let lb = NginxLoadBalancer::new(conf, Arc::new(NoopMetrics));

    lb.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || lb.status().metrics.is_some()).await);
    lb.stop().await.unwrap();
}
