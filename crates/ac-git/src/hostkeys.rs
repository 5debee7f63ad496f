//! SSH host-key validation.
//!
//! Clones over SSH are gated on the target host being present in the
//! managed known-hosts file. The big public forges ship with pinned keys;
//! anything else is queried once via `ssh-keyscan`. SSH itself then runs
//! with `StrictHostKeyChecking=accept-new` against that file, so a key
//! that changes after first contact still fails loudly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::process::{CommandSpec, ProcessRunner};

const KEYSCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Published host keys for the major forges (ed25519 lines).
const PINNED_KEYS: &[(&str, &str)] = &[
    (
        "github.com",
        "github.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl",
    ),
    (
        "gitlab.com",
        "gitlab.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAfuCHKVTjquxvt6CM6tdG4SLp1Btn/nOeHHE5UOzRdf",
    ),
    (
        "bitbucket.org",
        "bitbucket.org ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIIazEu89wgQZ4bqs3d63QSMzYVa0MuJ2e2gKTKqu+UUO",
    ),
];

#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("host key scan returned nothing for {0}")]
    EmptyScan(String),

    #[error("host key scan failed for {host}: {stderr}")]
    ScanFailed { host: String, stderr: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Process(#[from] crate::process::ProcessError),
}

pub type Result<T> = std::result::Result<T, HostKeyError>;

/// Validates hosts into a single known-hosts file.
pub struct HostKeyValidator {
    runner: Arc<dyn ProcessRunner>,
    known_hosts_path: PathBuf,
}

impl HostKeyValidator {
    pub fn new(runner: Arc<dyn ProcessRunner>, known_hosts_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            known_hosts_path: known_hosts_path.into(),
        }
    }

    pub fn known_hosts_path(&self) -> &Path {
        &self.known_hosts_path
    }

    /// Ensure `host` is present in the known-hosts file, scanning it if it
    /// is not one of the pinned forges. Returns the key lines written (or
    /// already present).
    pub async fn validate(&self, host: &str) -> Result<Vec<String>> {
        if self.already_known(host)? {
            return Ok(Vec::new());
        }

        let lines = match pinned_key(host) {
            Some(line) => vec![line.to_string()],
            None => self.scan(host).await?,
        };

        self.append_lines(&lines)?;
        tracing::info!(host, lines = lines.len(), "host key recorded");
        Ok(lines)
    }

    fn already_known(&self, host: &str) -> Result<bool> {
        match std::fs::read_to_string(&self.known_hosts_path) {
            Ok(content) => Ok(content.lines().any(|l| {
                let mut fields = l.split_whitespace();
                fields.next().is_some_and(|h| {
                    h.split(',').any(|candidate| candidate == host)
                })
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan(&self, host: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .run(
                CommandSpec::new("ssh-keyscan")
                    .arg("-T")
                    .arg("10")
                    .arg(host)
                    .timeout(KEYSCAN_TIMEOUT),
            )
            .await?;

        if !output.success() {
            return Err(HostKeyError::ScanFailed {
                host: host.to_string(),
                stderr: output.stderr,
            });
        }

        let lines: Vec<String> = output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();

        if lines.is_empty() {
            return Err(HostKeyError::EmptyScan(host.to_string()));
        }
        Ok(lines)
    }

    fn append_lines(&self, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.known_hosts_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = match std::fs::read_to_string(&self.known_hosts_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        for line in lines {
            if !content.ends_with('\n') && !content.is_empty() {
                content.push('\n');
            }
            content.push_str(line);
            content.push('\n');
        }
        std::fs::write(&self.known_hosts_path, content)?;
        Ok(())
    }

    /// The SSH options every git-over-SSH command runs with.
    pub fn ssh_options(&self) -> String {
        format!(
            "-o StrictHostKeyChecking=accept-new -o UserKnownHostsFile={}",
            self.known_hosts_path.display()
        )
    }
}

fn pinned_key(host: &str) -> Option<&'static str> {
    PINNED_KEYS
        .iter()
        .find(|(h, _)| *h == host)
        .map(|(_, line)| *line)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
