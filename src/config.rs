use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocator::RangeSet;
use crate::types::Route;

/// Prefix of environment variables that override the configuration file.
pub const ENV_PREFIX: &str = "REMOTE_IPAM_";

/// Daemon configuration. Loaded once at startup and never mutated.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Scope name to the ranges allocated from in that scope.
    pub ranges: BTreeMap<String, RangeSet>,
    #[serde(rename = "dataDir")]
    pub data_dir: PathBuf,
    /// Resolver file whose settings are attached to every result.
    #[serde(
        rename = "resolvConf",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_path_as_none"
    )]
    pub resolv_conf: Option<PathBuf>,
    #[serde(default)]
    pub routes: Vec<Route>,
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ranges: BTreeMap::new(),
            data_dir: PathBuf::from("/var/lib/remote-ipam"),
            resolv_conf: None,
            routes: Vec::new(),
            listen: SocketAddr::from(([0, 0, 0, 0], 80)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0:?} does not exist")]
    Missing(PathBuf),
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("scope {scope:?}: {source}")]
    InvalidRange {
        scope: String,
        #[source]
        source: crate::allocator::AllocationError,
    },
    #[error("scope {0:?} has no ranges")]
    EmptyScope(String),
}

impl ServerConfig {
    /// Load the configuration file at `path` (JSON, or TOML when the file
    /// ends in `.toml`), then apply `REMOTE_IPAM_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }

        let figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => figment.merge(Toml::file(path)),
            _ => figment.merge(Json::file(path)),
        };
        Self::from_figment(figment.merge(env_overrides()))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: ServerConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (scope, ranges) in &self.ranges {
            if ranges.is_empty() {
                return Err(ConfigError::EmptyScope(scope.clone()));
            }
            for range in ranges {
                range.validate().map_err(|source| ConfigError::InvalidRange {
                    scope: scope.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

/// `REMOTE_IPAM_DATA_DIR` and friends, mapped onto the file's key names.
///
/// `Env` lowercases after mapping by default, which would undo the camel
/// case keys, so lowercasing happens here instead.
fn env_overrides() -> Env {
    Env::prefixed(ENV_PREFIX).lowercase(false).map(|key| {
        let key = key.as_str().to_ascii_lowercase();
        match key.as_str() {
            "data_dir" => "dataDir".into(),
            "resolv_conf" => "resolvConf".into(),
            _ => key.into(),
        }
    })
}

fn empty_path_as_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let path = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(path.filter(|p| !p.as_os_str().is_empty()))
}
