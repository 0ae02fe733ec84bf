//! Ingress proxy - a controller that drives a local nginx as a reverse proxy
//!
//! This library:
//! - Renders ingress entries into nginx.conf through a template
//! - Persists the config atomically and only when it changed, logging a diff
//! - Validates every changed config with `nginx -t` before reloading
//! - Supervises the nginx process and escalates to SIGKILL on a stuck stop
//! - Scrapes nginx's stub status into gauges and derives health from it

pub mod admin;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod ingress;
pub mod loadbalancer;
pub mod metrics;
pub mod process;
pub mod render;
pub mod store;
pub mod updater;
pub mod validate;
