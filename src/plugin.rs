//! The runtime-facing side of the `remote-ipam` plugin binary.
//!
//! The container runtime invokes the plugin with the command in
//! `CNI_COMMAND`, the container id in `CNI_CONTAINERID` and the network
//! configuration on stdin. The plugin answers on stdout: a result envelope
//! for `ADD`, nothing for `DEL`, an error object when anything fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::{ClientError, DelegationConfig, Delegator};
use crate::types::SUPPORTED_VERSIONS;

pub const ENV_COMMAND: &str = "CNI_COMMAND";
pub const ENV_CONTAINER_ID: &str = "CNI_CONTAINERID";

/// Generic failure code of the calling convention.
pub const CODE_INTERNAL: u32 = 999;

const DEFAULT_VERSION: &str = "0.4.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCommand {
    Add,
    Del,
    Version,
}

impl PluginCommand {
    pub fn parse(command: &str) -> Result<Self, PluginError> {
        match command {
            "ADD" => Ok(PluginCommand::Add),
            "DEL" => Ok(PluginCommand::Del),
            "VERSION" => Ok(PluginCommand::Version),
            other => Err(PluginError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("required environment variable {0} missing")]
    MissingEnv(&'static str),
    #[error("unknown CNI_COMMAND: {0:?}")]
    UnknownCommand(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Error object printed on stdout when the plugin fails.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorOutput {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionOutput {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

/// Execute one plugin invocation and return what belongs on stdout.
pub async fn run(
    command: &str,
    container_id: Option<&str>,
    stdin: &[u8],
    delegator: &Delegator,
) -> Result<Option<String>, PluginError> {
    let command = PluginCommand::parse(command)?;
    if command == PluginCommand::Version {
        let output = VersionOutput {
            cni_version: DEFAULT_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        };
        return Ok(Some(serde_json::to_string(&output)?));
    }

    let container_id = container_id
        .filter(|id| !id.is_empty())
        .ok_or(PluginError::MissingEnv(ENV_CONTAINER_ID))?;
    let config = DelegationConfig::from_slice(stdin)?;

    match command {
        PluginCommand::Add => {
            let mut result = delegator.add(&config, container_id).await?;
            result.cni_version = Some(config.protocol_version.clone());
            Ok(Some(serde_json::to_string(&result)?))
        }
        PluginCommand::Del => {
            delegator.del(&config, container_id).await?;
            Ok(None)
        }
        PluginCommand::Version => Ok(None),
    }
}

/// Render `err` the way the runtime expects, using the configured version
/// when stdin carries one.
pub fn error_output(err: &PluginError, stdin: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Versioned {
        #[serde(rename = "cniVersion")]
        cni_version: Option<String>,
    }

    let cni_version = serde_json::from_slice::<Versioned>(stdin)
        .ok()
        .and_then(|v| v.cni_version)
        .unwrap_or_else(|| DEFAULT_VERSION.to_string());
    let output = ErrorOutput {
        cni_version,
        code: CODE_INTERNAL,
        msg: err.to_string(),
    };
    serde_json::to_string(&output).unwrap_or_else(|_| err.to_string())
}
