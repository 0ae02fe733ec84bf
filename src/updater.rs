//! Orchestration of the proxy and any external frontends pointing at it

use crate::error::Result;
use crate::ingress::IngressUpdate;
use crate::metrics::{Gauge, MetricsSink};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Something that serves ingress traffic and can be reconfigured
#[async_trait]
pub trait Updater: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Apply the full set of ingress entries. Returns whether anything changed.
    async fn update(&self, update: &IngressUpdate) -> Result<bool>;
    fn health(&self) -> Result<()>;
}

/// External traffic source (cloud load balancer, DNS, ...) routed to this instance
#[async_trait]
pub trait Frontend: Send + Sync {
    /// Register this instance. Returns the number of frontends now attached.
    async fn attach(&self) -> Result<usize>;
    async fn detach(&self) -> Result<()>;
}

/// Used when nothing sits in front of the proxy
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFrontend;

#[async_trait]
impl Frontend for NoFrontend {
    async fn attach(&self) -> Result<usize> {
        Ok(0)
    }

    async fn detach(&self) -> Result<()> {
        Ok(())
    }
}

/// Attaches frontends around the proxy lifecycle and forwards updates to it
pub struct IngressUpdater {
    frontend: Arc<dyn Frontend>,
    proxy: Arc<dyn Updater>,
    metrics: Arc<dyn MetricsSink>,
}

impl IngressUpdater {
    pub fn new(
        frontend: Arc<dyn Frontend>,
        proxy: Arc<dyn Updater>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            frontend,
            proxy,
            metrics,
        }
    }
}

#[async_trait]
impl Updater for IngressUpdater {
    async fn start(&self) -> Result<()> {
        info!("Starting ingress updater");

        let attached = self.frontend.attach().await?;
        self.metrics.set_gauge(Gauge::FrontendsAttached, attached as f64);
        debug!(attached, "Frontends attached");

        self.proxy.start().await
    }

    /// Best effort: failures are logged so shutdown always completes
    async fn stop(&self) -> Result<()> {
        info!("Stopping ingress updater");

        match self.frontend.detach().await {
            Ok(()) => self.metrics.set_gauge(Gauge::FrontendsAttached, 0.0),
            Err(e) => error!(error = %e, "Unable to detach frontend"),
        }

        if let Err(e) = self.proxy.stop().await {
            error!(error = %e, "Error while stopping proxy");
        }

        Ok(())
    }

    async fn update(&self, update: &IngressUpdate) -> Result<bool> {
        debug!(%update, "Processing ingress update");

        let updated = self.proxy.update(update).await?;
        if updated {
            info!(entries = update.len(), "Load balancer updated");
        } else {
            info!("No changes to load balancer");
        }
        Ok(updated)
    }

    fn health(&self) -> Result<()> {
        self.proxy.health()
    }
}
