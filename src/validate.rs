//! Runs the nginx binary's own syntax check and version commands

use crate::error::{ProxyError, Result};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

/// Checks candidate configurations with `nginx -t`
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    binary: PathBuf,
}

impl ConfigValidator {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `<binary> -t -c <path>`. A non-zero exit is a validation error
    /// carrying the combined output of the check.
    pub async fn check(&self, path: &Path) -> Result<()> {
        let command = format!("{} -t -c {}", self.binary.display(), path.display());
        debug!(%command, "Checking nginx config");

        let output = Command::new(&self.binary)
            .arg("-t")
            .arg("-c")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProxyError::Validation {
                command: command.clone(),
                output: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(ProxyError::Validation {
            output: format!("{}: {}", output.status, combined_output(&output)),
            command,
        })
    }

    /// Run `<binary> -v` and log what it prints
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("-v")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProxyError::Version {
                binary: self.binary.clone(),
                reason: e.to_string(),
            })?;

        let text = combined_output(&output);
        if !output.status.success() {
            return Err(ProxyError::Version {
                binary: self.binary.clone(),
                reason: format!("{}: {}", output.status, text),
            });
        }

        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            info!(target: "nginx", "{}", line);
        }
        Ok(text)
    }
}

/// stdout followed by stderr, lossily decoded and trimmed
fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}
