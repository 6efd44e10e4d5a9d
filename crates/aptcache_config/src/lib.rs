#![deny(missing_docs)]

//! Configuration for the aptcacher proxy, loaded from the YAML document
//! described in spec.md §6.
//!
//! Unknown keys are ignored rather than rejected, so that config files
//! written against a newer or older version of the schema still load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading a [`Config`].
#[derive(Error, Debug)]
pub enum LoadError {
    /// The configuration file could not be read from disk.
    #[error("failed to read configuration file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    /// The configuration file did not parse as YAML.
    #[error("failed to parse configuration file {0}: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

fn default_cache_directory() -> String {
    "./cache".to_string()
}

fn default_listen_port() -> u16 {
    8090
}

fn default_listen_port_secure() -> u16 {
    8091
}

/// Top-level configuration document, matching spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the on-disk content store. Overridable by the `CACHE_DIR`
    /// environment variable.
    #[serde(default = "default_cache_directory")]
    pub cache_directory: String,

    /// Plain-HTTP listener port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// TLS listener port, used only when `https.intercept` is enabled.
    #[serde(default = "default_listen_port_secure")]
    pub listen_port_secure: u16,

    /// Suffix-matched allowlist of domains served from the cache.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Suffix-matched domains that are tunnelled/forwarded without caching.
    #[serde(default)]
    pub passthrough_domains: Vec<String>,

    /// Distribution mirror overrides.
    #[serde(default)]
    pub overrides: Overrides,

    /// Ordered exact-path rewrites, applied before cache lookup.
    #[serde(default)]
    pub remap: Vec<Remap>,

    /// HTTPS interception settings.
    #[serde(default)]
    pub https: Https,

    /// mDNS announcement toggle. Carried for schema completeness; the
    /// announcement service itself is an external collaborator
    /// (spec.md §1, Out of scope).
    #[serde(default)]
    pub mdns: bool,

    /// Self-registration with a repository index/discovery service.
    #[serde(default)]
    pub index: Index,

    /// Expiration sweep settings.
    #[serde(default)]
    pub expiration: Expiration,
}

/// Repository index/discovery announcement settings (spec.md §6). Like
/// `mdns`, announcing to an external index is outside this crate's scope
/// (spec.md §1); the fields are carried so the schema round-trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    /// Whether to announce this proxy to the configured index.
    #[serde(default)]
    pub enable: bool,
    /// Hostnames this proxy should be announced under.
    #[serde(default)]
    pub hostnames: Vec<String>,
    /// Contact information shown alongside the announcement.
    #[serde(default)]
    pub contact: String,
}

/// One exact-path rewrite entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remap {
    /// Path to match exactly.
    pub from: String,
    /// Replacement path.
    pub to: String,
}

/// Distribution-specific mirror overrides (spec.md §4.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Overrides {
    /// Mirror used in place of `archive.ubuntu.com` / `security.ubuntu.com`.
    #[serde(default)]
    pub ubuntu_server: Option<String>,
    /// Mirror used in place of `deb.debian.org`.
    #[serde(default)]
    pub debian_server: Option<String>,
}

/// HTTPS interception configuration (spec.md §4.9, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Https {
    /// If true, all CONNECT requests are rejected with 403.
    #[serde(default)]
    pub prevent: bool,
    /// If true, CONNECT requests are MITM-intercepted rather than tunnelled.
    #[serde(default)]
    pub intercept: bool,
    /// Path to the intermediate CA certificate (PEM, possibly a chain).
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// Path to the intermediate CA private key (PEM).
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Passphrase for an encrypted private key, if any.
    #[serde(default)]
    pub password: Option<String>,
    /// Whether to serve a CRL at the admin CRL endpoint.
    #[serde(default)]
    pub enable_crl: bool,
}

/// Expiration sweep configuration (spec.md §4.11).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expiration {
    /// Number of days of inactivity after which an object is evicted. Zero
    /// disables the sweep.
    #[serde(default)]
    pub unused_days: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_directory: default_cache_directory(),
            listen_port: default_listen_port(),
            listen_port_secure: default_listen_port_secure(),
            domains: Vec::new(),
            passthrough_domains: Vec::new(),
            overrides: Overrides::default(),
            remap: Vec::new(),
            https: Https::default(),
            mdns: false,
            index: Index::default(),
            expiration: Expiration::default(),
        }
    }
}

impl Config {
    /// Parses a config document from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Loads a config document from a path on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| LoadError::Io(path.to_path_buf(), e))?;
        Self::from_yaml_str(&contents).map_err(|e| LoadError::Parse(path.to_path_buf(), e))
    }

    /// Loads the config from `path` (or built-in defaults if `path` is
    /// `None`), then applies the `CACHE_DIR` environment override.
    pub fn load(path: Option<&Path>) -> Result<Self, LoadError> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        if let Ok(dir) = std::env::var("CACHE_DIR") {
            tracing::debug!(cache_dir = %dir, "overriding cache_directory from CACHE_DIR");
            config.cache_directory = dir;
        }
        if config.domains.is_empty() && config.passthrough_domains.is_empty() {
            tracing::warn!(
                "no cacheable or passthrough domains configured; running as an open proxy"
            );
        }
        Ok(config)
    }

    /// The cache directory as a [`PathBuf`].
    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.cache_directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.listen_port, 8090);
        assert_eq!(config.listen_port_secure, 8091);
        assert_eq!(config.cache_directory, "./cache");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let yaml = "cache_directory: /tmp/x\nunknown_future_key: true\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache_directory, "/tmp/x");
    }

    #[test]
    fn parses_full_document() {
        let yaml = r"
cache_directory: /srv/cache
listen_port: 9090
listen_port_secure: 9091
domains:
  - archive.ubuntu.com
passthrough_domains:
  - example.com
overrides:
  ubuntu_server: mirror.example:8080/ubuntu
  debian_server: mirror.example/debian
remap:
  - from: /foo
    to: /bar
https:
  prevent: false
  intercept: true
  cert: /etc/aptcacher/ca.pem
  key: /etc/aptcacher/ca.key
  password: secret
  enable_crl: true
index:
  enable: true
  hostnames:
    - cache.example
  contact: ops@example.com
mdns: false
expiration:
  unused_days: 30
";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.listen_port, 9090);
        assert_eq!(config.remap[0].from, "/foo");
        assert!(config.https.intercept);
        assert!(config.index.enable);
        assert_eq!(config.index.hostnames, vec!["cache.example".to_string()]);
        assert_eq!(config.expiration.unused_days, 30);
    }

    #[test]
    fn from_path_reports_missing_file() {
        let err = Config::from_path("/nonexistent/path.yaml").unwrap_err();
        assert!(matches!(err, LoadError::Io(_, _)));
    }
}
