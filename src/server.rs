//! Delegation endpoint.
//!
//! Every request, whatever its path or method, is handled as a delegation:
//!
//! 1. `containerid`, `scope` and `version` must be present, otherwise `400`.
//! 2. `scope` must name a configured range set, otherwise `404`.
//! 3. `cmd=add` allocates and answers the JSON result, `cmd=del` releases and
//!    answers an empty `200`. Any other command is a `404`.
//!
//! Allocation failures answer `500` with a human readable body. The endpoint
//! keeps no state between requests; all of it lives behind the
//! [`AllocatorFactory`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use log::{debug, error, info};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::allocator::{AllocationError, AllocatorFactory, IpAllocator, RangeSet};
use crate::config::ServerConfig;
use crate::protocol::{Command, ContainerKey, DelegationQuery, MissingParameter};
use crate::types::{DelegationResult, DnsConfig, Route};

/// Everything a request handler may read. Built once at startup.
pub struct ServerState<F> {
    scopes: BTreeMap<String, RangeSet>,
    routes: Vec<Route>,
    dns: DnsConfig,
    allocators: F,
}

impl<F: AllocatorFactory> ServerState<F> {
    /// `dns` is the resolver block attached to every result, if any.
    pub fn new(config: &ServerConfig, dns: Option<DnsConfig>, allocators: F) -> Self {
        Self {
            scopes: config.ranges.clone(),
            routes: config.routes.clone(),
            dns: dns.unwrap_or_default(),
            allocators,
        }
    }
}

pub fn router<F: AllocatorFactory>(state: Arc<ServerState<F>>) -> Router {
    Router::new().fallback(delegate::<F>).with_state(state)
}

/// Serve delegations on `bind_addr` until the future is dropped.
pub async fn run_server<F: AllocatorFactory>(
    bind_addr: SocketAddr,
    state: Arc<ServerState<F>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    serve(listener, state).await
}

/// Serve delegations on an already bound listener.
pub async fn serve<F: AllocatorFactory>(
    listener: TcpListener,
    state: Arc<ServerState<F>>,
) -> anyhow::Result<()> {
    info!("Delegation endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state).into_make_service()).await?;
    Ok(())
}

async fn delegate<F: AllocatorFactory>(
    State(state): State<Arc<ServerState<F>>>,
    RawQuery(query): RawQuery,
) -> Result<Response, DispatchError> {
    let query = DelegationQuery::parse(query.as_deref()).validate()?;

    let ranges = state
        .scopes
        .get(&query.scope)
        .ok_or_else(|| DispatchError::UnknownScope(query.scope.clone()))?;

    let cmd = query
        .cmd
        .as_deref()
        .and_then(|cmd| cmd.parse::<Command>().ok())
        .ok_or_else(|| DispatchError::UnknownCommand(query.cmd.clone()))?;

    let allocator = state.allocators.allocator(ranges);
    match cmd {
        Command::Add => {
            let ip = allocator
                .get(&query.key, None)
                .await
                .map_err(|source| DispatchError::Allocate { source })?;
            info!(
                "Allocated {} to {} in scope {}",
                ip.address, query.key, query.scope
            );

            let result = DelegationResult {
                cni_version: Some(query.version),
                interfaces: Vec::new(),
                ips: vec![ip],
                routes: state.routes.clone(),
                dns: state.dns.clone(),
            };
            let body = serde_json::to_vec(&result).map_err(DispatchError::Encode)?;
            Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
        }
        Command::Del => {
            allocator
                .release(&query.key)
                .await
                .map_err(|source| DispatchError::Release {
                    key: query.key.clone(),
                    source,
                })?;
            info!("Released {} in scope {}", query.key, query.scope);
            Ok(StatusCode::OK.into_response())
        }
    }
}

/// Why a delegation was not carried out.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    MissingParameter(#[from] MissingParameter),
    #[error("unknown scope {0:?}")]
    UnknownScope(String),
    #[error("unknown command {0:?}")]
    UnknownCommand(Option<String>),
    #[error("failed to allocate: {source}")]
    Allocate { source: AllocationError },
    #[error("failed to release {key}: {source}")]
    Release {
        key: ContainerKey,
        source: AllocationError,
    },
    #[error("failed to marshal result: {0}")]
    Encode(serde_json::Error),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            DispatchError::UnknownScope(_) | DispatchError::UnknownCommand(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::Allocate { .. }
            | DispatchError::Release { .. }
            | DispatchError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
            (status, self.to_string()).into_response()
        } else {
            debug!("Rejected delegation: {}", self);
            status.into_response()
        }
    }
}
