//! Routing intent handed to the proxy controller

use serde::{Deserialize, Serialize};
use std::fmt;

/// One routable rule: requests for `host` under `path` go to
/// `service_address:service_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressEntry {
    /// Name of the ingress resource, used to order entries
    pub name: String,
    /// Host header to match
    pub host: String,
    /// URL path prefix to match (normalized during rendering)
    #[serde(default)]
    pub path: String,
    /// Backend service address
    pub service_address: String,
    /// Backend service port
    pub service_port: u16,
    /// Client CIDRs allowed to reach this entry
    #[serde(default)]
    pub allow: Vec<String>,
}

impl IngressEntry {
    pub fn new(name: &str, host: &str, path: &str, service_address: &str, service_port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            service_address: service_address.to_string(),
            service_port,
            allow: Vec::new(),
        }
    }

    /// Set the allowed client CIDRs (builder pattern)
    pub fn with_allow(mut self, allow: Vec<String>) -> Self {
        self.allow = allow;
        self
    }
}

/// A full set of ingress entries; every update replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressUpdate {
    #[serde(default)]
    pub entries: Vec<IngressEntry>,
}

impl IngressUpdate {
    pub fn new(entries: Vec<IngressEntry>) -> Self {
        Self { entries }
    }

    /// Entries sorted by name. The sort is stable, so entries sharing a name
    /// keep their relative input order.
    pub fn sorted_by_name(&self) -> Vec<IngressEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<IngressEntry>> for IngressUpdate {
    fn from(entries: Vec<IngressEntry>) -> Self {
        Self::new(entries)
    }
}

impl fmt::Display for IngressUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
        write!(f, "IngressUpdate[{} entries: {}]", self.entries.len(), names.join(", "))
    }
}
