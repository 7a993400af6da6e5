//! Application configuration management.
//!
//! Configuration is stored at `~/.config/shellcache/config.json`. Values from
//! the environment (or a `.env` file) take precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use shellcache_core::network::http::DEFAULT_TIMEOUT_SECS;
use shellcache_core::{CacheGeneration, DiskStorage, PrecacheManifest, DEFAULT_CACHE_PREFIX};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "shellcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_VERSION: &str = "v1";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

const ENV_ORIGIN: &str = "SHELLCACHE_ORIGIN";
const ENV_VERSION: &str = "SHELLCACHE_VERSION";
const ENV_CACHE_DIR: &str = "SHELLCACHE_CACHE_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the application being cached
    pub origin: Option<String>,
    /// Release version token; bump it to roll out a new generation
    pub version: String,
    pub cache_prefix: String,
    /// Overrides the built-in precache manifest
    pub manifest: Option<Vec<String>>,
    pub request_timeout_secs: u64,
    pub cache_dir: Option<PathBuf>,
    /// Bind address for `serve`
    pub listen: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: None,
            version: DEFAULT_VERSION.to_string(),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            manifest: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            cache_dir: None,
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

impl Config {
    /// Load from `path` (or the default location), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(origin) = lookup(ENV_ORIGIN).filter(|v| !v.is_empty()) {
            self.origin = Some(origin);
        }
        if let Some(version) = lookup(ENV_VERSION).filter(|v| !v.is_empty()) {
            self.version = version;
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn origin_url(&self) -> Result<Url> {
        let origin = self.origin.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No origin configured. Set \"origin\" in the config file or {}.",
                ENV_ORIGIN
            )
        })?;
        let url = Url::parse(origin).with_context(|| format!("Invalid origin URL: {}", origin))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Origin must be an http(s) URL: {}", origin);
        }
        Ok(url)
    }

    pub fn generation(&self) -> CacheGeneration {
        CacheGeneration::with_prefix(self.cache_prefix.as_str(), self.version.as_str())
    }

    pub fn manifest(&self) -> Result<PrecacheManifest> {
        match &self.manifest {
            Some(entries) => {
                PrecacheManifest::new(entries.iter()).context("Invalid manifest in config")
            }
            None => Ok(PrecacheManifest::default()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(DiskStorage::default_root()?),
        }
    }
}
