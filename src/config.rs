//! Operator configuration loaded from `shellcache.toml`
//!
//! ```toml
//! origin = "https://app.example.com"
//! version = "2024-06-01"
//!
//! [manifest]
//! paths = ["/", "/offline.html", "/static/app.css"]
//! offline_fallback = "/offline.html"
//!
//! [routing]
//! api_prefixes = ["/api/"]
//! allowed_hosts = ["fonts.gstatic.com"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::classifier::{AdmissionFilter, RoutingTable};
use crate::lifecycle::{LifecycleError, Manifest};

/// Default transport timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// File name looked up in the XDG config directory
const CONFIG_FILE_NAME: &str = "shellcache.toml";

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is syntactically valid but unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The manifest section is inconsistent
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] LifecycleError),
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The application's own origin
    pub origin: Url,
    /// Label of the generation to install
    pub version: String,
    /// Shell resources pre-cached at install
    pub manifest: ManifestSettings,
    /// Classification and admission settings
    #[serde(default)]
    pub routing: RoutingSettings,
    /// Network transport settings
    #[serde(default)]
    pub transport: TransportSettings,
    /// Cache store settings
    #[serde(default)]
    pub store: StoreSettings,
}

/// Ordered list of shell resources and the designated offline page
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestSettings {
    /// Absolute paths fetched during install
    pub paths: Vec<String>,
    /// Path served for failed navigations with nothing cached; must be in `paths`
    pub offline_fallback: String,
}

/// Conventions used by the request classifier and admission filter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Build-output path prefixes served cache-first
    pub asset_prefixes: Vec<String>,
    /// File extensions served cache-first
    pub asset_extensions: Vec<String>,
    /// API path prefixes served stale-while-revalidate
    pub api_prefixes: Vec<String>,
    /// Third-party hosts admitted alongside the origin
    pub allowed_hosts: Vec<String>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            asset_prefixes: strings(&["/_next/static/", "/static/", "/assets/"]),
            asset_extensions: strings(&[
                "js", "css", "woff", "woff2", "ttf", "otf", "eot", "png", "jpg", "jpeg", "gif",
                "svg", "webp", "ico", "avif",
            ]),
            api_prefixes: strings(&["/api/"]),
            allowed_hosts: strings(&["fonts.googleapis.com", "fonts.gstatic.com"]),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Network transport settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl TransportSettings {
    /// The per-request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Cache store settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store root; defaults to the XDG cache directory
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Default configuration path (`~/.config/shellcache/shellcache.toml` on Linux)
    pub fn default_path() -> Option<PathBuf> {
        let project_dirs = ProjectDirs::from("", "", "shellcache")?;
        Some(project_dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Reads and validates a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that the schema alone cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.origin.scheme(), "http" | "https") || !self.origin.has_host() {
            return Err(ConfigError::Invalid(format!(
                "origin must be an http(s) URL, got '{}'",
                self.origin
            )));
        }
        if self.version.trim().is_empty() {
            return Err(ConfigError::Invalid("version must not be empty".to_string()));
        }
        if self.transport.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transport.timeout_secs must be positive".to_string(),
            ));
        }
        self.manifest()?;
        Ok(())
    }

    /// Builds the install manifest against the origin
    pub fn manifest(&self) -> Result<Manifest, ConfigError> {
        Ok(Manifest::new(
            &self.origin,
            &self.manifest.paths,
            &self.manifest.offline_fallback,
        )?)
    }

    /// Builds the ordered routing table
    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::from_settings(&self.routing)
    }

    /// Builds the origin/host admission filter
    pub fn admission_filter(&self) -> AdmissionFilter {
        AdmissionFilter::new(&self.origin, self.routing.allowed_hosts.iter().cloned())
    }
}
