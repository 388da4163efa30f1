//! Installed-version probe
//!
//! Runs the installed target binary with `--version` under a timeout and
//! reports what it prints. A missing binary, a non-zero exit or a timeout all
//! read as "not installed".

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::engine::updater::capabilities::{InstalledVersion, InstalledVersionProbe};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CommandVersionProbe {
    binary: Option<PathBuf>,
    timeout: Duration,
}

impl CommandVersionProbe {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self {
            binary,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Pull a version out of the first line of `--version` output.
pub fn parse_version_line(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let token = line
        .split_whitespace()
        .find(|t| {
            let t = t.strip_prefix('v').unwrap_or(t);
            t.chars().next().is_some_and(|c| c.is_ascii_digit())
        })
        .unwrap_or(line);
    Some(token.to_string())
}

#[async_trait]
impl InstalledVersionProbe for CommandVersionProbe {
    async fn probe(&self) -> InstalledVersion {
        let Some(binary) = &self.binary else {
            return InstalledVersion::not_installed();
        };
        if !binary.exists() {
            tracing::debug!(binary = %binary.display(), "Target binary not found");
            return InstalledVersion::not_installed();
        }

        let child = Command::new(binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                InstalledVersion {
                    installed: true,
                    version_name: parse_version_line(&stdout),
                }
            }
            Ok(Ok(output)) => {
                tracing::warn!(binary = %binary.display(), code = ?output.status.code(), "Version probe exited with failure");
                InstalledVersion::not_installed()
            }
            Ok(Err(e)) => {
                tracing::error!(binary = %binary.display(), error = %e, "Failed to run version probe");
                InstalledVersion::not_installed()
            }
            Err(_) => {
                tracing::warn!(binary = %binary.display(), "Version probe timed out");
                InstalledVersion::not_installed()
            }
        }
    }
}
