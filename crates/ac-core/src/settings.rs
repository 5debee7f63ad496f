//! Workspace-level settings.
//!
//! Loaded from a TOML file, with environment overrides applied by the
//! daemon at startup. Every section has serde defaults so a partial file
//! (or none at all) yields a usable configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Root for `runs/` (audit logs, bus persistence, PR snapshots).
    pub runtime_root: String,
    /// Root for per-project working directories.
    pub work_root: String,
    /// Directory holding the human-readable sub-task backlog.
    pub backlog_dir: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            runtime_root: "runtime".to_string(),
            work_root: "workspaces".to_string(),
            backlog_dir: "workflows/backlog".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    /// `ollama` or `local` (OpenAI-compatible endpoint).
    pub kind: String,
    /// Backend endpoint. Overridden by `OLLAMA_HOST` when set.
    pub endpoint: String,
    pub model: String,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            kind: "ollama".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_workers: usize,
    pub max_workers: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    /// Non-protected branch that agent branches merge into.
    pub integration_branch: String,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            integration_branch: "develop".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub adapter: AdapterSettings,
    pub pool: PoolSettings,
    pub merge: MergeSettings,
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply environment overrides (currently `OLLAMA_HOST`).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            if !host.trim().is_empty() {
                self.adapter.endpoint = host;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let s = Settings::default();
        assert_eq!(s.paths.backlog_dir, "workflows/backlog");
        assert_eq!(s.merge.integration_branch, "develop");
        assert_eq!(s.pool.min_workers, 1);
        assert_eq!(s.pool.max_workers, 5);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let s = Settings::from_toml(
            r#"
[adapter]
model = "qwen2.5-coder"

[pool]
max_workers = 8
"#,
        )
        .unwrap();
        assert_eq!(s.adapter.model, "qwen2.5-coder");
        assert_eq!(s.adapter.kind, "ollama");
        assert_eq!(s.pool.max_workers, 8);
        assert_eq!(s.pool.min_workers, 1);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(s.adapter.kind, "ollama");
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(Settings::from_toml("this is [not toml").is_err());
    }
}
