//! Layered configuration.
//!
//! Sources are merged in order, later ones winning:
//!
//! 1. built-in defaults,
//! 2. `haul.toml` in the platform configuration directory (if it exists),
//! 3. an explicitly given file (TOML, YAML or JSON, picked by extension),
//! 4. `HAUL_`-prefixed environment variables, with `__` separating nested
//!    keys (`HAUL_STORAGE__ROOT=/srv/bundles`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "HAUL_";
const CONFIG_FILE: &str = "haul.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub manifest: ManifestConfig,
    pub timing: TimingConfig,
}

/// Where bundles are fetched from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the built bundles. Relative paths are resolved
    /// against the working directory.
    pub root: PathBuf,
    /// Path prefix inside the root, usually the platform folder the bundles
    /// were built for (`Android`, `iOS`).
    pub prefix: Option<PathBuf>,
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self { root: PathBuf::from("bundles"), prefix: None }
    }
}
impl StorageConfig {
    pub fn root(&self) -> Result<PathBuf> {
        std::path::absolute(&self.root).or_raise(|| ErrorKind::Invalid(format!("storage root {}", self.root.display())))
    }
}

/// Local copies of versioned bundles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Defaults to the platform cache directory.
    pub dir: Option<PathBuf>,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, dir: None }
    }
}
impl CacheConfig {
    /// Resolved cache directory, or `None` when caching is disabled or no
    /// platform cache directory could be determined.
    pub fn dir(&self) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        match &self.dir {
            Some(dir) => std::path::absolute(dir).ok(),
            None => ProjectDirs::from("", "", "haul").map(|dirs| dirs.cache_dir().join("bundles")),
        }
    }
}

/// Which bundle carries the manifest, and under which asset name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub key: String,
    pub asset: String,
}
impl Default for ManifestConfig {
    fn default() -> Self {
        Self { key: "manifest".to_string(), asset: "manifest".to_string() }
    }
}

/// What a waiter does once an operation has shown no progress for too long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallPolicy {
    /// Stop waiting; the download keeps running.
    #[default]
    Abandon,
    /// Stop waiting and cancel the download.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub tick_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub stall_timeout_secs: f64,
    pub on_stall: StallPolicy,
}
impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            poll_interval_ms: 10,
            stall_timeout_secs: 5.0,
            on_stall: StallPolicy::Abandon,
        }
    }
}
impl TimingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_limit(&self) -> Duration {
        // Validated on load; fall back to the default rather than panic.
        Duration::try_from_secs_f64(self.stall_timeout_secs).unwrap_or(Duration::from_secs(5))
    }
}

impl Config {
    /// Load configuration from all sources, optionally including an explicit
    /// file on top of the defaults and the user's configuration directory.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(explicit)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()
    }

    /// The merged provider stack, before extraction.
    pub fn figment(explicit: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(dirs) = ProjectDirs::from("", "", "haul") {
            // Missing files are skipped by figment.
            figment = figment.merge(Toml::file(dirs.config_dir().join(CONFIG_FILE)));
        }
        if let Some(path) = explicit {
            tracing::debug!(path = %path.display(), "Loading configuration file");
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file_exact(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
                Some("json") => figment.merge(Json::file_exact(path)),
                _ => exn::bail!(ErrorKind::Invalid(format!("unsupported config file {}", path.display()))),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn validate(self) -> Result<Self> {
        if self.manifest.key.trim().is_empty() {
            exn::bail!(ErrorKind::Invalid("manifest.key must not be empty".to_string()));
        }
        if self.manifest.asset.trim().is_empty() {
            exn::bail!(ErrorKind::Invalid("manifest.asset must not be empty".to_string()));
        }
        if self.timing.tick_interval_ms == 0 {
            exn::bail!(ErrorKind::Invalid("timing.tick_interval_ms must be positive".to_string()));
        }
        let stall = self.timing.stall_timeout_secs;
        if !stall.is_finite() || stall <= 0.0 {
            exn::bail!(ErrorKind::Invalid(format!("timing.stall_timeout_secs must be positive, got {stall}")));
        }
        Ok(self)
    }
}
