use crate::ingress::{IngressEntry, IngressUpdate};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the generated nginx configuration inside the working directory
pub const CONFIG_FILE_NAME: &str = "nginx.conf";

/// File name of the nginx template inside the working directory
pub const TEMPLATE_FILE_NAME: &str = "nginx.tmpl";

/// Top-level configuration file for the controller binary
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Controller HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// nginx process settings
    #[serde(default)]
    pub nginx: NginxConfig,

    /// Static ingress entries applied after start and on every SIGHUP
    #[serde(default)]
    pub ingress: Vec<IngressEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for the controller's admin API (health, metrics, status)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_port: default_admin_port(),
            bind: default_bind_address(),
        }
    }
}

/// Static settings for one nginx instance. Fixed for the controller's lifetime.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NginxConfig {
    /// Path to the nginx binary
    #[serde(default = "default_binary_location")]
    pub binary_location: PathBuf,

    /// Directory holding nginx.tmpl and the generated nginx.conf
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Number of nginx worker processes
    #[serde(default = "default_worker_processes")]
    pub worker_processes: u32,

    /// Maximum connections per worker
    #[serde(default = "default_worker_connections")]
    pub worker_connections: u32,

    /// Keepalive timeout for client connections in seconds
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u64,

    /// Idle keepalive connections cached per upstream
    #[serde(default = "default_backend_keepalives")]
    pub backend_keepalives: u32,

    /// Read/send timeout for backend connections in seconds
    #[serde(default = "default_backend_keepalive_seconds")]
    pub backend_keepalive_seconds: u64,

    /// Connect timeout for backend connections in seconds
    #[serde(default = "default_backend_connect_timeout_seconds")]
    pub backend_connect_timeout_seconds: u64,

    /// Port serving /health and /status
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Port serving ingress traffic
    #[serde(default = "default_ingress_port")]
    pub ingress_port: u16,

    /// Frontend CIDRs whose X-Forwarded-For header is trusted
    #[serde(default)]
    pub trusted_frontends: Vec<String>,

    /// nginx error_log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Time to wait after spawning before checking nginx is still alive
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,

    /// Interval between status page scrapes in milliseconds
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Timeout for a single status page scrape in milliseconds
    #[serde(default = "default_metrics_timeout_ms")]
    pub metrics_timeout_ms: u64,

    /// Time to wait for a graceful shutdown before killing nginx
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            binary_location: default_binary_location(),
            working_dir: default_working_dir(),
            worker_processes: default_worker_processes(),
            worker_connections: default_worker_connections(),
            keepalive_seconds: default_keepalive_seconds(),
            backend_keepalives: default_backend_keepalives(),
            backend_keepalive_seconds: default_backend_keepalive_seconds(),
            backend_connect_timeout_seconds: default_backend_connect_timeout_seconds(),
            health_port: default_health_port(),
            ingress_port: default_ingress_port(),
            trusted_frontends: Vec::new(),
            log_level: default_log_level(),
            start_delay_ms: default_start_delay_ms(),
            metrics_interval_ms: default_metrics_interval_ms(),
            metrics_timeout_ms: default_metrics_timeout_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl NginxConfig {
    /// Create a config for the given binary and working directory with defaults
    pub fn new(binary_location: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_location: binary_location.into(),
            working_dir: working_dir.into(),
            ..Self::default()
        }
        .normalized()
    }

    /// Strip trailing slashes from the working directory and fill in an empty log level
    pub fn normalized(mut self) -> Self {
        let dir = self.working_dir.to_string_lossy().into_owned();
        let trimmed = dir.trim_end_matches('/');
        if trimmed.len() != dir.len() {
            self.working_dir = if trimmed.is_empty() {
                PathBuf::from("/")
            } else {
                PathBuf::from(trimmed)
            };
        }
        if self.log_level.trim().is_empty() {
            self.log_level = default_log_level();
        }
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.working_dir.join(CONFIG_FILE_NAME)
    }

    pub fn template_path(&self) -> PathBuf {
        self.working_dir.join(TEMPLATE_FILE_NAME)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn metrics_timeout(&self) -> Duration {
        Duration::from_millis(self.metrics_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// URL of the nginx stub_status page
    pub fn status_url(&self) -> String {
        format!("http://127.0.0.1:{}/status", self.health_port)
    }

    /// Validate the nginx configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.binary_location.as_os_str().is_empty() {
            errors.push("nginx: 'binary_location' must be set".to_string());
        }
        if self.working_dir.as_os_str().is_empty() {
            errors.push("nginx: 'working_dir' must be set".to_string());
        }
        if self.worker_processes == 0 {
            errors.push("nginx: 'worker_processes' must be greater than 0".to_string());
        }
        if self.ingress_port == 0 {
            errors.push("nginx: 'ingress_port' must be greater than 0".to_string());
        }
        if self.health_port == 0 {
            errors.push("nginx: 'health_port' must be greater than 0".to_string());
        }
        if self.ingress_port == self.health_port {
            errors.push(format!(
                "nginx: 'ingress_port' and 'health_port' must differ (both {})",
                self.ingress_port
            ));
        }
        if self.metrics_interval_ms == 0 {
            errors.push("nginx: 'metrics_interval_ms' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_admin_port() -> u16 {
    12082
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_binary_location() -> PathBuf {
    PathBuf::from("/usr/sbin/nginx")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/nginx")
}

fn default_worker_processes() -> u32 {
    1
}

fn default_worker_connections() -> u32 {
    1024
}

fn default_keepalive_seconds() -> u64 {
    60
}

fn default_backend_keepalives() -> u32 {
    512
}

fn default_backend_keepalive_seconds() -> u64 {
    28 // Just under the usual 30s backend idle timeout
}

fn default_backend_connect_timeout_seconds() -> u64 {
    10
}

fn default_health_port() -> u16 {
    8081
}

fn default_ingress_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_start_delay_ms() -> u64 {
    100
}

fn default_metrics_interval_ms() -> u64 {
    10_000
}

fn default_metrics_timeout_ms() -> u64 {
    2_000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("unable to parse {}", path.display()))?;
        config.nginx = config.nginx.normalized();
        config.validate()?;
        Ok(config)
    }

    /// The static ingress entries as an update
    pub fn ingress_update(&self) -> IngressUpdate {
        IngressUpdate::new(self.ingress.clone())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(nginx_errors) = self.nginx.validate() {
            errors.extend(nginx_errors);
        }

        if self.server.admin_port == self.nginx.ingress_port
            || self.server.admin_port == self.nginx.health_port
        {
            errors.push(format!(
                "server: 'admin_port' {} collides with an nginx port",
                self.server.admin_port
            ));
        }

        for entry in &self.ingress {
            if entry.name.is_empty() {
                errors.push(format!("ingress for host '{}': 'name' must be set", entry.host));
            }
            if entry.service_port == 0 {
                errors.push(format!(
                    "ingress '{}': 'service_port' must be greater than 0",
                    entry.name
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
