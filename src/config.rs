//! Configuration loading.
//!
//! A TOML file selects the storage backends and server policy:
//!
//! ```toml
//! [store]
//! kind = "disk"            # or "external"
//! path = "/srv/bundles"
//! # kind = "external" additionally wants:
//! # put_binary = "/usr/local/bin/blobput"
//! # put_args = ["{filename}"]
//! # get_binary = "/usr/local/bin/blobget"
//! # get_args = ["{filename}", "{handle}"]
//!
//! [index]
//! kind = "disk"            # or "db"
//! path = "/srv/index"
//! lock_timeout_secs = 120
//!
//! [server]
//! branch_pattern = "scratch/*"
//! store_all_parts = false
//! bundle_size_limit = 104857600
//! idle_timeout_secs = 3600
//! owner_file = "/run/scratchpush/owner"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, ServerError};

/// Default ceiling for one stored bundle: 100 MB.
pub const DEFAULT_BUNDLE_SIZE_LIMIT: u64 = 100 * 1024 * 1024;

const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Backend tag: "disk" or "external".
    #[serde(default)]
    pub kind: String,
    /// Root directory for the disk store.
    pub path: Option<PathBuf>,
    /// External backend: executable that persists a blob. Reads the
    /// formatted args; prints the handle on stdout.
    pub put_binary: Option<String>,
    #[serde(default)]
    pub put_args: Vec<String>,
    /// External backend: executable that fetches a blob into a file.
    pub get_binary: Option<String>,
    #[serde(default)]
    pub get_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Backend tag: "disk" or "db".
    #[serde(default)]
    pub kind: String,
    pub path: Option<PathBuf>,
    /// How long a push waits for the index's exclusive lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            path: None,
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bookmark pattern routed to the bundle store instead of the main
    /// history. Literal name or trailing-`*` prefix.
    #[serde(default = "default_branch_pattern")]
    pub branch_pattern: String,
    /// Forward every incoming part into the stored bundle instead of
    /// processing it.
    #[serde(default)]
    pub store_all_parts: bool,
    #[serde(default = "default_bundle_size_limit")]
    pub bundle_size_limit: u64,
    /// Shut the server down after this long with no frames. None
    /// disables the watchdog timer.
    pub idle_timeout_secs: Option<u64>,
    /// Ownership marker; the server exits when this file disappears.
    pub owner_file: Option<PathBuf>,
}

fn default_branch_pattern() -> String {
    "scratch/*".to_string()
}

fn default_bundle_size_limit() -> u64 {
    DEFAULT_BUNDLE_SIZE_LIMIT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            branch_pattern: default_branch_pattern(),
            store_all_parts: false,
            bundle_size_limit: default_bundle_size_limit(),
            idle_timeout_secs: None,
            owner_file: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| ServerError::Config(format!("bad config {}: {}", path.display(), e)))
    }
}

/// Matcher for bookmark names that belong to the scratch namespace.
/// Only literal names and trailing-`*` prefixes are supported.
#[derive(Debug, Clone)]
pub struct BranchPattern {
    prefix: String,
    wildcard: bool,
}

impl BranchPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(ServerError::Config(
                "branch pattern must not be empty".to_string(),
            ));
        }
        let wildcard = pattern.ends_with('*');
        let prefix = if wildcard {
            &pattern[..pattern.len() - 1]
        } else {
            pattern
        };
        if prefix.contains('*') {
            return Err(ServerError::Config(format!(
                "branch pattern {:?}: only a trailing * is supported",
                pattern
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            wildcard,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.wildcard {
            name.starts_with(&self.prefix)
        } else {
            name == self.prefix
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [store]
            kind = "external"
            put_binary = "blobput"
            put_args = ["{filename}"]
            get_binary = "blobget"
            get_args = ["{filename}", "{handle}"]

            [index]
            kind = "db"
            path = "/srv/index"
            lock_timeout_secs = 5

            [server]
            branch_pattern = "scratch/*"
            store_all_parts = true
            idle_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.store.kind, "external");
        assert_eq!(config.index.lock_timeout_secs, 5);
        assert!(config.server.store_all_parts);
        assert_eq!(config.server.bundle_size_limit, DEFAULT_BUNDLE_SIZE_LIMIT);
        assert_eq!(config.server.idle_timeout_secs, Some(60));
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.branch_pattern, "scratch/*");
        assert_eq!(config.index.lock_timeout_secs, DEFAULT_LOCK_TIMEOUT_SECS);
        assert!(!config.server.store_all_parts);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("[server]\nbogus = 1\n").is_err());
    }

    #[test]
    fn test_branch_pattern_prefix() {
        let pattern = BranchPattern::new("scratch/*").unwrap();
        assert!(pattern.matches("scratch/feature"));
        assert!(pattern.matches("scratch/"));
        assert!(!pattern.matches("release/1.0"));
    }

    #[test]
    fn test_branch_pattern_literal() {
        let pattern = BranchPattern::new("scratch/exact").unwrap();
        assert!(pattern.matches("scratch/exact"));
        assert!(!pattern.matches("scratch/exact2"));
    }

    #[test]
    fn test_branch_pattern_rejects_inner_star() {
        assert!(BranchPattern::new("scr*tch/*").is_err());
    }
}
