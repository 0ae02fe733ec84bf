//! nginx-backed load balancer
//!
//! Ties the pieces together: render the template, persist it if it changed,
//! validate it with `nginx -t`, then signal nginx to reload. A rejected
//! config leaves the running nginx untouched on its previous config.

use crate::config::NginxConfig;
use crate::error::{ProxyError, Result};
use crate::healthcheck::{HealthMonitor, StatusSnapshot};
use crate::ingress::IngressUpdate;
use crate::metrics::MetricsSink;
use crate::process::{OsSignaller, ProcessState, ProcessSupervisor, Signaller};
use crate::render::ConfigRenderer;
use crate::store::ConfigStore;
use crate::updater::Updater;
use crate::validate::ConfigValidator;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Snapshot of the load balancer for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub metrics_healthy: bool,
    pub metrics: Option<StatusSnapshot>,
    pub config_path: PathBuf,
}

/// Manages one nginx instance and its configuration
pub struct NginxLoadBalancer {
    conf: NginxConfig,
    renderer: ConfigRenderer,
    store: ConfigStore,
    validator: ConfigValidator,
    supervisor: ProcessSupervisor,
    monitor: Arc<HealthMonitor>,
}

impl NginxLoadBalancer {
    pub fn new(conf: NginxConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self::with_signaller(conf, metrics, Arc::new(OsSignaller))
    }

    /// Create a load balancer that delivers control signals through `signaller`
    pub fn with_signaller(
        conf: NginxConfig,
        metrics: Arc<dyn MetricsSink>,
        signaller: Arc<dyn Signaller>,
    ) -> Self {
        let conf = conf.normalized();
        let supervisor = ProcessSupervisor::new(&conf.binary_location, conf.config_path(), signaller)
            .with_start_delay(conf.start_delay())
            .with_shutdown_timeout(conf.shutdown_timeout());
        let monitor = Arc::new(HealthMonitor::new(
            conf.status_url(),
            conf.metrics_interval(),
            conf.metrics_timeout(),
            metrics,
        ));

        Self {
            renderer: ConfigRenderer::new(conf.template_path()),
            store: ConfigStore::new(conf.config_path()),
            validator: ConfigValidator::new(&conf.binary_location),
            supervisor,
            monitor,
            conf,
        }
    }

    pub fn config(&self) -> &NginxConfig {
        &self.conf
    }

    pub fn config_path(&self) -> PathBuf {
        self.conf.config_path()
    }

    /// Log the version, write an empty config, spawn nginx and start scraping its status
    pub async fn start(&self) -> Result<()> {
        // A started instance owns nginx.conf; leave it alone
        if self.supervisor.is_started() {
            return Err(ProxyError::AlreadyStarted);
        }

        self.validator.version().await?;
        self.initialise_config()?;

        let pid = self.supervisor.start().await?;
        debug!(pid, "nginx pid");

        self.monitor.spawn(self.supervisor.subscribe_done());
        Ok(())
    }

    /// Replace any stale config with one that has no ingress entries.
    /// Rendering happens first so a broken template leaves the old file in place.
    fn initialise_config(&self) -> Result<()> {
        let candidate = self.renderer.render(&self.conf, &IngressUpdate::default())?;
        self.store.remove()?;
        self.store.persist(&candidate)?;
        Ok(())
    }

    /// Apply `update`. Returns whether nginx was reloaded.
    pub async fn update(&self, update: &IngressUpdate) -> Result<bool> {
        if self.supervisor.state() == ProcessState::NotStarted {
            return Err(ProxyError::NotStarted);
        }
        debug!(%update, "Updating load balancer");

        let candidate = self.renderer.render(&self.conf, update)?;
        if !self.store.persist(&candidate)?.is_changed() {
            return Ok(false);
        }

        self.validator.check(self.store.path()).await?;
        self.supervisor.reload()?;
        info!(entries = update.len(), "nginx updated");
        Ok(true)
    }

    /// Gracefully stop nginx and wait for it to exit
    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
    }

    /// Healthy only while nginx runs and its status page scrapes cleanly
    pub fn health(&self) -> Result<()> {
        self.supervisor.health()?;
        self.monitor.health()
    }

    pub fn status(&self) -> LoadBalancerStatus {
        LoadBalancerStatus {
            state: self.supervisor.state(),
            pid: self.supervisor.pid(),
            last_error: self.supervisor.last_error(),
            metrics_healthy: self.monitor.health().is_ok(),
            metrics: self.monitor.last_snapshot(),
            config_path: self.conf.config_path(),
        }
    }
}

#[async_trait]
impl Updater for NginxLoadBalancer {
    async fn start(&self) -> Result<()> {
        NginxLoadBalancer::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        NginxLoadBalancer::stop(self).await
    }

    async fn update(&self, update: &IngressUpdate) -> Result<bool> {
        NginxLoadBalancer::update(self, update).await
    }

    fn health(&self) -> Result<()> {
        NginxLoadBalancer::health(self)
    }
}

impl std::fmt::Display for NginxLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "nginx proxy")
    }
}
