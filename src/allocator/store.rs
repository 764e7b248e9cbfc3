use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::ContainerKey;

/// Durable record of which key holds which address.
///
/// Implementations must make [`reserve`](Store::reserve) atomic: two callers
/// racing for the same address never both get `true`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reserve `ip` for `key`. Returns `false` if `ip` is already taken.
    async fn reserve(&self, key: &ContainerKey, ip: IpAddr) -> Result<bool, StoreError>;

    /// Addresses currently held by `key`.
    async fn get_by_key(&self, key: &ContainerKey) -> Result<Vec<IpAddr>, StoreError>;

    /// Drop every reservation of `key` and return the freed addresses.
    async fn release_by_key(&self, key: &ContainerKey) -> Result<Vec<IpAddr>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O on {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Non-persistent store, mostly useful for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    held: Mutex<HashMap<IpAddr, ContainerKey>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses currently reserved.
    pub fn held(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, ContainerKey>> {
        // The map stays consistent even if a holder panicked.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn reserve(&self, key: &ContainerKey, ip: IpAddr) -> Result<bool, StoreError> {
        let mut held = self.lock();
        if held.contains_key(&ip) {
            return Ok(false);
        }
        held.insert(ip, key.clone());
        Ok(true)
    }

    async fn get_by_key(&self, key: &ContainerKey) -> Result<Vec<IpAddr>, StoreError> {
        let mut ips: Vec<IpAddr> = self
            .lock()
            .iter()
            .filter(|(_, holder)| *holder == key)
            .map(|(ip, _)| *ip)
            .collect();
        ips.sort();
        Ok(ips)
    }

    async fn release_by_key(&self, key: &ContainerKey) -> Result<Vec<IpAddr>, StoreError> {
        let mut held = self.lock();
        let mut released: Vec<IpAddr> = held
            .iter()
            .filter(|(_, holder)| *holder == key)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &released {
            held.remove(ip);
        }
        released.sort();
        Ok(released)
    }
}
