//! Shell settings read from a TOML file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Settings of one shell instance. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    pub prompt: String,
    /// Default filter for logging when `RUST_LOG` is unset.
    pub log_level: String,
    /// Bytes kept by capture mode; `0` keeps everything.
    pub capture_limit: usize,
    /// Chunks buffered by a stream bridge before writers wait.
    pub bridge_capacity: usize,
    /// Operation budget of one script block; `0` is unlimited.
    pub script_max_operations: u64,
    /// Variables exported into the root frame at startup.
    pub env: BTreeMap<String, String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            prompt: "$ ".to_string(),
            log_level: "warn".to_string(),
            capture_limit: 16 * 1024 * 1024,
            bridge_capacity: crate::bridge::DEFAULT_CAPACITY,
            script_max_operations: 1_000_000,
            env: BTreeMap::new(),
        }
    }
}

impl ShellConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid shell configuration")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Load `explicit`, else the per-user file if it exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Capture limit as an optional bound.
    pub fn capture_bound(&self) -> Option<usize> {
        (self.capture_limit > 0).then_some(self.capture_limit)
    }
}

/// `$XDG_CONFIG_HOME/shell_engine/config.toml`, falling back to `~/.config`.
fn default_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("shell_engine").join("config.toml"))
}
