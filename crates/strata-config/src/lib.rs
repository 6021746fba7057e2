//! # strata-config
//!
//! Configuration management for Strata.
//!
//! Loads configuration from:
//! 1. `~/.strata/config.toml` (global)
//! 2. `<root>/.strata/config.toml` (repository-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility)
    pub config_version: u32,
    pub storage: StorageConfig,
    pub pack: PackConfig,
    pub compression: CompressionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            storage: StorageConfig::default(),
            pack: PackConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations (CWD-relative repository config)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_root(Path::new("."))
    }

    /// Load config for a specific repository root directory.
    /// Resolution order: global → repository → env vars.
    pub fn load_for_root(repo_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.strata/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load repository config (<root>/.strata/config.toml)
        let repo_config_path = repo_root.join(".strata/config.toml");
        if repo_config_path.exists() {
            debug!("Loading repository config from {:?}", repo_config_path);
            let contents = std::fs::read_to_string(&repo_config_path)?;
            let repo_config: Config = toml::from_str(&contents)?;
            config.merge(repo_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        // 4. Resolve repository root to absolute path if relative
        if config.storage.root.as_os_str() == "." {
            if let Ok(abs) = std::fs::canonicalize(repo_root) {
                config.storage.root = abs;
            } else {
                config.storage.root = repo_root.to_path_buf();
            }
        }

        Ok(config)
    }

    /// Global config path: ~/.strata/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".strata/config.toml"))
    }

    /// Merge another config (repository overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        let default_storage = StorageConfig::default();
        if other.storage.root != default_storage.root {
            self.storage.root = other.storage.root;
        }

        let default_pack = PackConfig::default();
        if other.pack.max_objects != default_pack.max_objects {
            self.pack.max_objects = other.pack.max_objects;
        }
        if other.pack.max_size != default_pack.max_size {
            self.pack.max_size = other.pack.max_size;
        }

        let default_comp = CompressionConfig::default();
        if other.compression.enabled != default_comp.enabled {
            self.compression.enabled = other.compression.enabled;
        }
        if other.compression.min_size != default_comp.min_size {
            self.compression.min_size = other.compression.min_size;
        }
        if other.compression.check_bytes != default_comp.check_bytes {
            self.compression.check_bytes = other.compression.check_bytes;
        }
        if other.compression.check_ratio != default_comp.check_ratio {
            self.compression.check_ratio = other.compression.check_ratio;
        }
    }

    /// Apply environment variable overrides (highest priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("STRATA_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Ok(n) = std::env::var("STRATA_PACK_MAX_OBJECTS") {
            if let Ok(n) = n.parse() {
                self.pack.max_objects = n;
            }
        }
        if let Ok(n) = std::env::var("STRATA_PACK_MAX_SIZE") {
            if let Ok(n) = n.parse() {
                self.pack.max_size = n;
            }
        }
        if let Ok(v) = std::env::var("STRATA_COMPRESSION") {
            self.compression.enabled = v != "0";
        }
    }

    /// Generate TOML template for repository initialization.
    pub fn init_toml() -> String {
        let default = Config::default();
        format!(
            r#"# Strata repository configuration
config_version = 1

[storage]
# root = "."

[pack]
max_objects = {max_objects}
max_size = {max_size}

[compression]
enabled = {enabled}
# min_size = {min_size}
# check_bytes = {check_bytes}
# check_ratio = {check_ratio}
"#,
            max_objects = default.pack.max_objects,
            max_size = default.pack.max_size,
            enabled = default.compression.enabled,
            min_size = default.compression.min_size,
            check_bytes = default.compression.check_bytes,
            check_ratio = default.compression.check_ratio,
        )
    }

    /// Get the repository root path
    pub fn root(&self) -> &Path {
        &self.storage.root
    }
}

/// Storage location configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Repository root directory (auto-resolved to absolute path)
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
        }
    }
}

/// Packfile size limits. A pack stops accepting objects once either
/// threshold is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PackConfig {
    /// Maximum number of objects per pack
    pub max_objects: u32,
    /// Maximum pack file size in bytes
    pub max_size: u64,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            max_objects: 4096,
            max_size: 256 * 1024 * 1024,
        }
    }
}

/// Per-object compression admission policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressionConfig {
    /// Global compression on/off
    pub enabled: bool,
    /// Payloads at or below this size are never compressed
    pub min_size: u64,
    /// Compressed-prefix sample size for the admission ratio
    pub check_bytes: usize,
    /// Accept compression if sampled ratio <= this value
    pub check_ratio: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 512,
            check_bytes: 4096,
            check_ratio: 0.9,
        }
    }
}
