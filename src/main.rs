use anyhow::Context;
use ingress_proxy::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use ingress_proxy::config::Config;
use ingress_proxy::loadbalancer::NginxLoadBalancer;
use ingress_proxy::metrics::PrometheusMetrics;
use ingress_proxy::updater::{IngressUpdater, NoFrontend, Updater};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ingress_proxy=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let metrics = Arc::new(PrometheusMetrics::new());
    let load_balancer = Arc::new(NginxLoadBalancer::new(config.nginx.clone(), metrics.clone()));
    let updater: Arc<dyn Updater> = Arc::new(IngressUpdater::new(
        Arc::new(NoFrontend),
        load_balancer.clone(),
        metrics.clone(),
    ));

    updater.start().await.context("unable to start ingress updater")?;

    if let Err(e) = updater.update(&config.ingress_update()).await {
        error!(error = %e, "Failed to apply initial ingress entries");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .context("invalid admin bind address")?;
    let admin_server = AdminServer::new(
        admin_addr,
        AdminState {
            updater: updater.clone(),
            load_balancer: load_balancer.clone(),
            metrics,
        },
        shutdown_rx,
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or an ingress reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading ingress entries...");
                    reload_ingress(&config_path, &config, updater.as_ref()).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping nginx...");
    updater.stop().await?;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Re-read the config file and apply its ingress entries. nginx settings
/// only take effect on restart.
async fn reload_ingress(path: &Path, current: &Config, updater: &dyn Updater) {
    let reloaded = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return;
        }
    };

    let nginx_changed = toml::to_string(&reloaded.nginx).ok() != toml::to_string(&current.nginx).ok();
    if nginx_changed {
        warn!("nginx settings changed; restart the controller to apply them");
    }

    match updater.update(&reloaded.ingress_update()).await {
        Ok(changed) => info!(entries = reloaded.ingress.len(), changed, "Ingress entries reloaded"),
        Err(e) => error!(error = %e, "Failed to apply ingress entries"),
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting ingress controller");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        "Admin API settings"
    );
    info!(
        binary = %config.nginx.binary_location.display(),
        working_dir = %config.nginx.working_dir.display(),
        ingress_port = config.nginx.ingress_port,
        health_port = config.nginx.health_port,
        worker_processes = config.nginx.worker_processes,
        "nginx settings"
    );
    info!(
        metrics_interval_ms = config.nginx.metrics_interval_ms,
        shutdown_timeout_secs = config.nginx.shutdown_timeout_secs,
        "Supervision settings"
    );
    if config.ingress.is_empty() {
        info!("No static ingress entries configured");
    } else {
        for entry in &config.ingress {
            info!(
                name = %entry.name,
                host = %entry.host,
                path = %entry.path,
                service = %format!("{}:{}", entry.service_address, entry.service_port),
                "Ingress entry"
            );
        }
    }
}
