//! On-disk nginx.conf with diff-based change detection

use crate::error::{ProxyError, Result};
use similar::TextDiff;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Result of persisting a candidate configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// No configuration existed, the candidate was written
    Created,
    /// The candidate matches the file on disk; nothing was written
    Unchanged,
    /// The candidate differs and replaced the file on disk
    Changed {
        /// Unified diff from the previous to the new content
        diff: String,
    },
}

impl PersistOutcome {
    /// Whether the file on disk now holds new content
    pub fn is_changed(&self) -> bool {
        !matches!(self, PersistOutcome::Unchanged)
    }
}

/// Owns the generated configuration file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current content of the file, or `None` if it does not exist
    pub fn read(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ProxyError::ReadConfig {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Write `candidate` if it differs from what is on disk.
    ///
    /// A changed file is written before anyone validates it, so a rejected
    /// candidate stays on disk until the next successful update replaces it.
    pub fn persist(&self, candidate: &str) -> Result<PersistOutcome> {
        let existing = match self.read()? {
            Some(existing) => existing,
            None => {
                info!(path = %self.path.display(), "Creating nginx config for the first time");
                self.write(candidate)?;
                return Ok(PersistOutcome::Created);
            }
        };

        if existing == candidate.as_bytes() {
            info!("Configuration has not changed");
            return Ok(PersistOutcome::Unchanged);
        }

        let diff = unified_diff(&String::from_utf8_lossy(&existing), candidate);
        info!(diff = %diff, "Updating nginx config");
        self.write(candidate)?;

        Ok(PersistOutcome::Changed { diff })
    }

    /// Delete the file, ignoring a missing file
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed existing nginx config");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProxyError::Persist {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replace the file in one rename so readers never see a partial config
    fn write(&self, content: &str) -> Result<()> {
        let persist_err = |source: std::io::Error| ProxyError::Persist {
            path: self.path.clone(),
            source,
        };

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persist_err)?;
        tmp.write_all(content.as_bytes()).map_err(persist_err)?;
        tmp.as_file().sync_all().map_err(persist_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))
                .map_err(persist_err)?;
        }

        tmp.persist(&self.path).map_err(|e| persist_err(e.error))?;
        Ok(())
    }
}

/// Line-based unified diff between two configurations
pub fn unified_diff(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header("nginx.conf (current)", "nginx.conf (updated)")
        .to_string()
}
