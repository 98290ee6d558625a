use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable that relocates the base directory.
pub const HOME_ENV: &str = "PEERCAST_HOME";

/// On-disk layout: `~/.peercast/{config.json, identity.json, logs/}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    base: PathBuf,
}

impl AppPaths {
    /// Resolve the base directory from `PEERCAST_HOME`, falling back to
    /// `~/.peercast`.
    pub fn from_env() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve the base directory using an arbitrary variable lookup.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup(HOME_ENV).filter(|d| !d.trim().is_empty()) {
            return Ok(Self::at(dir));
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self::at(home.join(".peercast")))
    }

    /// Use `base` as the base directory.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// `<base>/config.json`
    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// `<base>/identity.json`
    pub fn identity_path(&self) -> PathBuf {
        self.base.join("identity.json")
    }

    /// `<base>/logs/`
    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Ensures all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.base.clone(), self.logs_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }
}
