//! Errors raised while managing the nginx process and its configuration

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the proxy controller
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The nginx binary could not be spawned
    #[error("unable to start nginx ({}): {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// nginx exited within the start grace interval
    #[error("nginx died shortly after starting ({}): {reason}", .binary.display())]
    DiedImmediately { binary: PathBuf, reason: String },

    /// `nginx -v` could not be run or failed
    #[error("unable to determine nginx version ({}): {reason}", .binary.display())]
    Version { binary: PathBuf, reason: String },

    /// The template artifact could not be read
    #[error("unable to read nginx template {}: {source}", .path.display())]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The template is malformed or could not be expanded
    #[error("unable to render nginx config, it will be out of date: {0}")]
    Render(#[from] minijinja::Error),

    /// The existing configuration artifact could not be read
    #[error("unable to read nginx config {}: {source}", .path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration artifact could not be written
    #[error("unable to write nginx config {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `nginx -t` rejected the candidate configuration
    #[error("Config check failed: {command}: {output}")]
    Validation { command: String, output: String },

    /// A control signal could not be delivered
    #[error("unable to send {signal} to nginx (pid {pid}): {source}")]
    Signal {
        signal: &'static str,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// The process is not running
    #[error("nginx is not running")]
    NotRunning,

    /// The most recent status scrape failed
    #[error("nginx metrics are failing to update")]
    MetricsUnhealthy,

    /// The process exited with an error
    #[error("nginx exited with an error: {0}")]
    Exited(String),

    /// `start` was called on an instance that has already been started
    #[error("nginx has already been started by this controller")]
    AlreadyStarted,

    /// `stop` or a reload was requested before `start`
    #[error("nginx has not been started")]
    NotStarted,

    /// The status page could not be fetched or parsed
    #[error("unable to scrape nginx status: {0}")]
    StatusScrape(String),

    /// The external frontend failed to attach or detach
    #[error("frontend error: {0}")]
    Frontend(String),
}

impl ProxyError {
    /// Whether this error comes from the candidate configuration being rejected
    pub fn is_validation(&self) -> bool {
        matches!(self, ProxyError::Validation { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
