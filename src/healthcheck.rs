//! Periodic scraping of the nginx stub_status page
//!
//! The monitor runs from proxy start until the process exits. A failed
//! scrape marks nginx unhealthy until the next successful one; it never
//! stops the ticker and is never returned to a caller.

use crate::error::{ProxyError, Result};
use crate::metrics::{Gauge, MetricsSink};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shortest scrape interval; `tokio::time::interval` panics on zero
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Counters parsed from one status page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub active_connections: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
}

impl StatusSnapshot {
    /// Parse the stub_status body:
    ///
    /// ```text
    /// Active connections: 9
    /// server accepts handled requests
    ///  13287 13286 66627
    /// Reading: 2 Writing: 1 Waiting: 8
    /// ```
    pub fn parse(body: &str) -> Result<Self> {
        let mut lines = body.lines();
        let mut next_line = |what: &str| {
            lines
                .next()
                .ok_or_else(|| ProxyError::StatusScrape(format!("missing {} line", what)))
        };

        let active_line = next_line("active connections")?;
        let active_connections = active_line
            .trim()
            .strip_prefix("Active connections:")
            .ok_or_else(|| {
                ProxyError::StatusScrape(format!("unexpected active connections line: {:?}", active_line))
            })
            .and_then(|v| parse_count("active connections", v))?;

        next_line("header")?;

        let totals: Vec<&str> = next_line("totals")?.split_whitespace().collect();
        let [accepts, handled, requests] = totals.as_slice() else {
            return Err(ProxyError::StatusScrape(format!(
                "expected 3 totals, got {:?}",
                totals
            )));
        };

        let states: Vec<&str> = next_line("connection states")?.split_whitespace().collect();
        let ["Reading:", reading, "Writing:", writing, "Waiting:", waiting] = states.as_slice() else {
            return Err(ProxyError::StatusScrape(format!(
                "unexpected connection states line: {:?}",
                states.join(" ")
            )));
        };

        Ok(Self {
            active_connections,
            accepts: parse_count("accepts", accepts)?,
            handled: parse_count("handled", handled)?,
            requests: parse_count("requests", requests)?,
            reading: parse_count("reading", reading)?,
            writing: parse_count("writing", writing)?,
            waiting: parse_count("waiting", waiting)?,
        })
    }

    fn publish(&self, metrics: &dyn MetricsSink) {
        metrics.set_gauge(Gauge::Connections, self.active_connections as f64);
        metrics.set_gauge(Gauge::Accepts, self.accepts as f64);
        metrics.set_gauge(Gauge::Handled, self.handled as f64);
        metrics.set_gauge(Gauge::Requests, self.requests as f64);
        metrics.set_gauge(Gauge::ReadingConnections, self.reading as f64);
        metrics.set_gauge(Gauge::WritingConnections, self.writing as f64);
        metrics.set_gauge(Gauge::WaitingConnections, self.waiting as f64);
    }
}

fn parse_count(what: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| ProxyError::StatusScrape(format!("invalid {} value {:?}: {}", what, value, e)))
}

/// Scrapes the status page on a fixed interval and tracks whether it succeeded
pub struct HealthMonitor {
    url: String,
    interval: Duration,
    client: reqwest::Client,
    metrics: Arc<dyn MetricsSink>,
    unhealthy: AtomicBool,
    last_snapshot: Mutex<Option<StatusSnapshot>>,
}

impl HealthMonitor {
    pub fn new(
        url: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build status client with timeout, using defaults");
                reqwest::Client::new()
            });

        let url = url.into();
        if interval < MIN_INTERVAL {
            warn!(
                url = %url,
                interval_ms = interval.as_millis() as u64,
                min_ms = MIN_INTERVAL.as_millis() as u64,
                "Metrics interval too short, clamping"
            );
        }

        Self {
            url,
            interval: interval.max(MIN_INTERVAL),
            client,
            metrics,
            unhealthy: AtomicBool::new(false),
            last_snapshot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Counters from the most recent successful scrape
    pub fn last_snapshot(&self) -> Option<StatusSnapshot> {
        *self.last_snapshot.lock()
    }

    /// Fails if the most recent scrape failed
    pub fn health(&self) -> Result<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            Err(ProxyError::MetricsUnhealthy)
        } else {
            Ok(())
        }
    }

    /// Scrape immediately, then on every tick until `done_rx` turns true
    pub fn spawn(self: &Arc<Self>, done_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run(done_rx).await })
    }

    async fn run(&self, mut done_rx: watch::Receiver<bool>) {
        if *done_rx.borrow() {
            debug!("nginx already exited, not starting metrics monitor");
            return;
        }

        info!(
            url = %self.url,
            interval_ms = self.interval.as_millis() as u64,
            "nginx metrics monitor started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.update().await;
                }
                changed = done_rx.changed() => {
                    if changed.is_err() || *done_rx.borrow() {
                        info!("nginx has exited, stopping metrics monitor");
                        break;
                    }
                }
            }
        }
    }

    /// Scrape once and record the outcome
    pub async fn update(&self) {
        match self.scrape().await {
            Ok(snapshot) => {
                debug!(?snapshot, "Updated nginx metrics");
                snapshot.publish(self.metrics.as_ref());
                *self.last_snapshot.lock() = Some(snapshot);
                self.unhealthy.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(error = %e, "Unable to update nginx metrics");
                self.unhealthy.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn scrape(&self) -> Result<StatusSnapshot> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ProxyError::StatusScrape(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::StatusScrape(format!(
                "{} returned {}",
                self.url, status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::StatusScrape(e.to_string()))?;
        StatusSnapshot::parse(&body)
    }
}
