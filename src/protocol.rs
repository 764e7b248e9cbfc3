//! Wire shape of the delegation protocol.
//!
//! A delegation is a plain `GET` against the remote endpoint carrying four
//! query parameters:
//!
//! | parameter     | meaning                                             |
//! |---------------|-----------------------------------------------------|
//! | `cmd`         | `add` or `del`                                      |
//! | `scope`       | name of the address range on the remote             |
//! | `version`     | result schema version the caller expects            |
//! | `containerid` | the [`ContainerKey`] (`<pool id>/<container id>`)   |
//!
//! An `add` answers `200` with a JSON [`DelegationResult`](crate::types::DelegationResult),
//! a `del` answers `200` with an empty body. Any other status is a failure.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

pub const PARAM_CMD: &str = "cmd";
pub const PARAM_SCOPE: &str = "scope";
pub const PARAM_VERSION: &str = "version";
pub const PARAM_CONTAINER_ID: &str = "containerid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Add,
    Del,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Add => "add",
            Command::Del => "del",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown command {0:?}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Command::Add),
            "del" => Ok(Command::Del),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// Identifies one container within one pool on the remote.
///
/// Several pools may share a single remote, so the caller's container id is
/// prefixed with the pool id. The same key must be sent on `add` and on the
/// matching `del`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerKey(String);

impl ContainerKey {
    pub fn new(pool_id: &str, container_id: &str) -> Self {
        Self(format!("{pool_id}/{container_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The server treats the key as opaque and takes it as received.
impl From<String> for ContainerKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully specified delegation request, as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    pub cmd: Command,
    pub scope: String,
    pub version: String,
    pub key: ContainerKey,
}

impl DelegationRequest {
    /// Build the request URL against `remote`.
    ///
    /// Query parameters already present on `remote` are kept and the
    /// delegation parameters are appended after them.
    pub fn to_url(&self, remote: &Url) -> Url {
        let mut url = remote.clone();
        url.query_pairs_mut()
            .append_pair(PARAM_CMD, self.cmd.as_str())
            .append_pair(PARAM_SCOPE, &self.scope)
            .append_pair(PARAM_VERSION, &self.version)
            .append_pair(PARAM_CONTAINER_ID, self.key.as_str());
        url
    }
}

/// Query parameters as received by the server.
///
/// Nothing is validated here. When a parameter is repeated the first
/// occurrence wins, even if it is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegationQuery {
    pub cmd: Option<String>,
    pub scope: Option<String>,
    pub version: Option<String>,
    pub container_id: Option<String>,
}

impl DelegationQuery {
    pub fn parse(query: Option<&str>) -> Self {
        let mut parsed = DelegationQuery::default();
        let Some(query) = query else {
            return parsed;
        };

        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match name.as_ref() {
                PARAM_CMD => &mut parsed.cmd,
                PARAM_SCOPE => &mut parsed.scope,
                PARAM_VERSION => &mut parsed.version,
                PARAM_CONTAINER_ID => &mut parsed.container_id,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        parsed
    }

    /// Check that `containerid`, `scope` and `version` are all present and
    /// non-empty.
    pub fn validate(self) -> Result<ScopedQuery, MissingParameter> {
        let present = |value: Option<String>| value.filter(|v| !v.is_empty());
        let Some(container_id) = present(self.container_id) else {
            return Err(MissingParameter(PARAM_CONTAINER_ID));
        };
        let Some(scope) = present(self.scope) else {
            return Err(MissingParameter(PARAM_SCOPE));
        };
        let Some(version) = present(self.version) else {
            return Err(MissingParameter(PARAM_VERSION));
        };
        Ok(ScopedQuery {
            cmd: self.cmd,
            scope,
            version,
            key: ContainerKey::from(container_id),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("missing required parameter {0:?}")]
pub struct MissingParameter(pub &'static str);

/// A query with every required parameter present.
///
/// `cmd` stays unparsed: an unknown command is only reported once the scope
/// has been found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedQuery {
    pub cmd: Option<String>,
    pub scope: String,
    pub version: String,
    pub key: ContainerKey,
}
