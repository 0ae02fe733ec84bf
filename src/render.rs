//! Renders nginx.conf from the template and the current ingress entries
//!
//! Rendering is deterministic: entries are sorted by name and numbered by
//! position, so the same logical input always produces the same bytes and
//! the config store can rely on a plain content diff.

use crate::config::NginxConfig;
use crate::error::{ProxyError, Result};
use crate::ingress::{IngressEntry, IngressUpdate};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// Values visible to the template
#[derive(Serialize)]
struct TemplateContext<'a> {
    #[serde(flatten)]
    conf: &'a NginxConfig,
    entries: Vec<TemplateEntry>,
}

/// An ingress entry with its normalized path and generated upstream name
#[derive(Debug, Clone, Serialize)]
pub struct TemplateEntry {
    #[serde(flatten)]
    pub entry: IngressEntry,
    pub upstream_id: String,
}

/// Expands the nginx template found in the working directory
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    template_path: PathBuf,
}

impl ConfigRenderer {
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
        }
    }

    pub fn template_path(&self) -> &PathBuf {
        &self.template_path
    }

    /// Render the configuration text for `update`.
    ///
    /// The template is read from disk on every call so edits to it are
    /// picked up by the next update.
    pub fn render(&self, conf: &NginxConfig, update: &IngressUpdate) -> Result<String> {
        let source = std::fs::read_to_string(&self.template_path).map_err(|source| {
            ProxyError::TemplateRead {
                path: self.template_path.clone(),
                source,
            }
        })?;

        let entries = template_entries(update);
        debug!(
            template = %self.template_path.display(),
            entries = entries.len(),
            "Rendering nginx config"
        );

        render_template(&source, conf, entries)
    }
}

/// Sort, number and normalize the entries of an update
pub fn template_entries(update: &IngressUpdate) -> Vec<TemplateEntry> {
    update
        .sorted_by_name()
        .into_iter()
        .enumerate()
        .map(|(idx, mut entry)| {
            entry.path = normalize_path(&entry.path);
            TemplateEntry {
                entry,
                upstream_id: upstream_id(idx),
            }
        })
        .collect()
}

/// Upstream name for the entry at `idx` in name order
pub fn upstream_id(idx: usize) -> String {
    format!("upstream{:03}", idx)
}

/// Wrap a location path in slashes so it matches the prefix and anything below it.
/// An empty path becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

fn render_template(source: &str, conf: &NginxConfig, entries: Vec<TemplateEntry>) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);

    let context = TemplateContext { conf, entries };
    env.render_str(source, context).map_err(ProxyError::from)
}
