//! Client side of the delegation protocol.
//!
//! The plugin does not allocate anything itself. It turns the runtime's
//! `ADD`/`DEL` into one `GET` against the remote daemon and hands the answer
//! back unchanged. A failed call is final: there is no retry, and a call that
//! timed out may still have completed on the remote.

use std::time::Duration;

use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::protocol::{Command, ContainerKey, DelegationRequest};
use crate::types::DelegationResult;

/// Upper bound for one round trip to the remote.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// The network configuration the runtime passes to the plugin.
#[derive(Debug, Clone, Deserialize)]
struct NetConf {
    #[serde(default)]
    name: String,
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
    ipam: Option<IpamConf>,
}

#[derive(Debug, Clone, Deserialize)]
struct IpamConf {
    remote: Url,
    id: String,
    scope: String,
}

/// Everything needed to delegate one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationConfig {
    pub network_name: String,
    /// Result schema version, echoed to the remote and used for the output.
    pub protocol_version: String,
    pub remote: Url,
    pub pool_id: String,
    pub scope: String,
}

impl DelegationConfig {
    /// Parse the full network configuration of the calling plugin.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ClientError> {
        let net: NetConf = serde_json::from_slice(bytes).map_err(ClientError::InvalidConfig)?;
        let ipam = net.ipam.ok_or(ClientError::MissingIpam)?;
        Ok(Self {
            network_name: net.name,
            protocol_version: net.cni_version,
            remote: ipam.remote,
            pool_id: ipam.id,
            scope: ipam.scope,
        })
    }

    pub fn key(&self, container_id: &str) -> ContainerKey {
        ContainerKey::new(&self.pool_id, container_id)
    }

    fn request(&self, cmd: Command, container_id: &str) -> DelegationRequest {
        DelegationRequest {
            cmd,
            scope: self.scope.clone(),
            version: self.protocol_version.clone(),
            key: self.key(container_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to parse network configuration: {0}")]
    InvalidConfig(#[source] serde_json::Error),
    #[error("IPAM config missing 'ipam' key")]
    MissingIpam,
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to call remote {remote:?}: {source}")]
    Transport {
        remote: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to call remote {remote:?}: unexpected status code {status} for {cmd} in scope {scope:?}")]
    Remote {
        remote: String,
        status: StatusCode,
        cmd: Command,
        scope: String,
    },
    #[error("failed to parse remote response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Issues delegations against the remote named in a [`DelegationConfig`].
#[derive(Debug, Clone)]
pub struct Delegator {
    client: reqwest::Client,
}

impl Delegator {
    pub fn new() -> Result<Self, ClientError> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Client)?;
        Ok(Self { client })
    }

    /// Ask the remote for an address for `container_id`.
    pub async fn add(
        &self,
        config: &DelegationConfig,
        container_id: &str,
    ) -> Result<DelegationResult, ClientError> {
        let body = self.call(config, Command::Add, container_id).await?;
        serde_json::from_slice(&body).map_err(ClientError::Decode)
    }

    /// Tell the remote that `container_id` is gone.
    pub async fn del(&self, config: &DelegationConfig, container_id: &str) -> Result<(), ClientError> {
        self.call(config, Command::Del, container_id).await?;
        Ok(())
    }

    async fn call(
        &self,
        config: &DelegationConfig,
        cmd: Command,
        container_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        let remote = config.remote.to_string();
        let transport = |source| ClientError::Transport {
            remote: remote.clone(),
            source,
        };

        let url = config.request(cmd, container_id).to_url(&config.remote);
        debug!("Delegating {} to {}", cmd, url);

        let response = self.client.get(url).send().await.map_err(transport)?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::Remote {
                remote: remote.clone(),
                status: response.status(),
                cmd,
                scope: config.scope.clone(),
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        Ok(body.to_vec())
    }
}
