//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use bytesize::ByteSize;
use thiserror::Error;
use tracing::debug;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use driftfs::cache::attr::AttrTimeouts;
use driftfs::mount::MountConfig;
use driftfs::node::registry::NodeSizing;
use driftfs::rpc::{EngineConfig, PoolConfig};
use sunrpc::NfsProgram;

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("driftfs").join("config.toml"))
}

/// Protocol version selector as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVersion {
    V2,
    #[default]
    V3,
    V4,
}

impl From<ProtocolVersion> for NfsProgram {
    fn from(v: ProtocolVersion) -> Self {
        match v {
            ProtocolVersion::V2 => Self::V2,
            ProtocolVersion::V3 => Self::V3,
            ProtocolVersion::V4 => Self::V4,
        }
    }
}

/// Attribute-cache tunables, in whole seconds like the mount options
/// they mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheSettings {
    pub file_attr_min_secs: u64,
    pub file_attr_max_secs: u64,
    pub dir_attr_min_secs: u64,
    pub dir_attr_max_secs: u64,
    /// Slots in the per-node access-rights ring.
    pub access_cache_size: usize,
    /// Capacity of one packed directory buffer.
    pub dir_buffer_size: ByteSize,
    /// Entries in the per-directory cookie cache.
    pub cookie_cache_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            file_attr_min_secs: 3,
            file_attr_max_secs: 60,
            dir_attr_min_secs: 30,
            dir_attr_max_secs: 60,
            access_cache_size: 8,
            dir_buffer_size: ByteSize::kib(8),
            cookie_cache_size: 16,
        }
    }
}

/// Worker-pool tunables shared by every mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub idle_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_workers: 16,
            idle_secs: 30,
        }
    }
}

impl PoolSettings {
    #[must_use]
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.max_workers,
            idle: Duration::from_secs(self.idle_secs),
        }
    }
}

/// One configured mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountSettings {
    /// `host:port` of the server.
    pub server: String,
    /// Export path on the server.
    pub export: String,
    #[serde(default)]
    pub version: ProtocolVersion,
    /// Soft mounts surface timeouts as errors instead of retrying
    /// forever.
    #[serde(default)]
    pub soft: bool,
    #[serde(default = "default_timeo_ms")]
    pub timeo_ms: u64,
    #[serde(default = "default_retrans")]
    pub retrans: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_timeo_ms() -> u64 {
    1000
}

fn default_retrans() -> u32 {
    3
}

fn default_max_restarts() -> u32 {
    8
}

impl MountSettings {
    /// Lower this mount plus the shared cache settings into the core's
    /// config struct.
    #[must_use]
    pub fn to_mount_config(&self, cache: &CacheSettings) -> MountConfig {
        let mut config = MountConfig::new(
            self.server.clone(),
            self.export.clone(),
            self.version.into(),
        );
        config.file_attrs = AttrTimeouts {
            min: Duration::from_secs(cache.file_attr_min_secs),
            max: Duration::from_secs(cache.file_attr_max_secs),
        };
        config.dir_attrs = AttrTimeouts {
            min: Duration::from_secs(cache.dir_attr_min_secs),
            max: Duration::from_secs(cache.dir_attr_max_secs),
        };
        #[expect(
            clippy::cast_possible_truncation,
            reason = "validate() bounds the buffer size well below usize::MAX"
        )]
        let dir_buffer_capacity = cache.dir_buffer_size.as_u64() as usize;
        config.sizing = NodeSizing {
            access_capacity: cache.access_cache_size,
            dir_buffer_capacity,
            cookie_cache_capacity: cache.cookie_cache_size,
        };
        config.engine = EngineConfig {
            soft: self.soft,
            retrans: self.retrans,
            timeo: Duration::from_millis(self.timeo_ms),
            ..EngineConfig::default()
        };
        config.max_restarts = self.max_restarts;
        config
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub cache: CacheSettings,
    pub pool: PoolSettings,
    /// Named mounts, e.g. `[mounts.home]`.
    pub mounts: HashMap<String, MountSettings>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Load the configuration from `path`, the default location, or fall
    /// back to built-in defaults if no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(p) => p,
            None => {
                debug!("no config directory available, using defaults");
                return Ok(Self::default());
            }
        };
        if !path.exists() {
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Validate the configuration, accumulating every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cache.file_attr_min_secs > self.cache.file_attr_max_secs {
            errors.push("cache.file-attr-min-secs exceeds file-attr-max-secs".to_owned());
        }
        if self.cache.dir_attr_min_secs > self.cache.dir_attr_max_secs {
            errors.push("cache.dir-attr-min-secs exceeds dir-attr-max-secs".to_owned());
        }
        if self.cache.access_cache_size == 0 {
            errors.push("cache.access-cache-size must be at least 1".to_owned());
        }
        if self.cache.cookie_cache_size == 0 {
            errors.push("cache.cookie-cache-size must be at least 1".to_owned());
        }
        if self.cache.dir_buffer_size.as_u64() < 512 {
            errors.push("cache.dir-buffer-size must be at least 512 bytes".to_owned());
        }
        if self.cache.dir_buffer_size > ByteSize::mib(8) {
            errors.push("cache.dir-buffer-size must not exceed 8 MiB".to_owned());
        }
        if self.pool.max_workers == 0 {
            errors.push("pool.max-workers must be at least 1".to_owned());
        }

        for (name, mount) in &self.mounts {
            if mount.server.is_empty() {
                errors.push(format!("mounts.{name}.server must not be empty"));
            }
            if mount.export.is_empty() {
                errors.push(format!("mounts.{name}.export must not be empty"));
            }
            if mount.timeo_ms == 0 {
                errors.push(format!("mounts.{name}.timeo-ms must be positive"));
            }
            if mount.soft && mount.retrans == 0 {
                errors.push(format!(
                    "mounts.{name}.retrans must be positive on a soft mount"
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
