//! First-available allocation over a [`RangeSet`].

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::Mutex;

use super::{AllocationError, IpAllocator, Range, RangeSet, Store};
use crate::protocol::ContainerKey;
use crate::types::IpConfig;

/// Allocates from a range set using a shared [`Store`].
///
/// Uniqueness of addresses comes from the store's atomic
/// [`reserve`](Store::reserve). `lock` is shared by every allocator over the
/// same store and is held for a whole `get` or `release`, so a key never
/// ends up holding two addresses.
pub struct RangeAllocator {
    ranges: RangeSet,
    store: Arc<dyn Store>,
    lock: Arc<Mutex<()>>,
}

impl RangeAllocator {
    pub fn new(ranges: RangeSet, store: Arc<dyn Store>, lock: Arc<Mutex<()>>) -> Self {
        Self {
            ranges,
            store,
            lock,
        }
    }

    fn range_for(&self, ip: IpAddr) -> Option<&Range> {
        self.ranges.iter().find(|range| range.contains(ip))
    }
}

#[async_trait]
impl IpAllocator for RangeAllocator {
    async fn get(
        &self,
        key: &ContainerKey,
        requested: Option<IpAddr>,
    ) -> Result<IpConfig, AllocationError> {
        let _guard = self.lock.lock().await;

        if let Some(ip) = requested {
            let range = self
                .range_for(ip)
                .ok_or(AllocationError::NotInRange(ip))?;
            if !self.store.reserve(key, ip).await? {
                return Err(AllocationError::AlreadyAllocated(ip));
            }
            info!("Reserved requested {} for {}", ip, key);
            return range.ip_config(ip);
        }

        // A repeated add for the same key gets the address it already holds.
        for ip in self.store.get_by_key(key).await? {
            if let Some(range) = self.range_for(ip) {
                debug!("{} already holds {}", key, ip);
                return range.ip_config(ip);
            }
        }

        for range in &self.ranges {
            for ip in range.candidates()? {
                if self.store.reserve(key, ip).await? {
                    info!("Reserved {} for {}", ip, key);
                    return range.ip_config(ip);
                }
            }
        }

        Err(AllocationError::Exhausted)
    }

    async fn release(&self, key: &ContainerKey) -> Result<(), AllocationError> {
        let _guard = self.lock.lock().await;
        let released = self.store.release_by_key(key).await?;
        if released.is_empty() {
            return Err(AllocationError::NotAllocated(key.clone()));
        }
        for ip in released {
            info!("Released {} held by {}", ip, key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::allocator::{AllocatorFactory, DiskStore, MemoryStore, StoreAllocatorFactory};

    fn allocator(subnet: &str, store: &Arc<MemoryStore>) -> RangeAllocator {
        let store: Arc<dyn Store> = store.clone();
        RangeAllocator::new(
            vec![Range::new(subnet.parse().unwrap())],
            store,
            Arc::new(Mutex::new(())),
        )
    }

    fn key(id: &str) -> ContainerKey {
        ContainerKey::new("pool1", id)
    }

    #[tokio::test]
    async fn first_available_address_is_handed_out() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator("10.0.0.0/24", &store);

        let a = alloc.get(&key("a"), None).await.unwrap();
        let b = alloc.get(&key("b"), None).await.unwrap();
        assert_eq!(a.address.to_string(), "10.0.0.1/24");
        assert_eq!(b.address.to_string(), "10.0.0.2/24");
        assert_eq!(store.held(), 2);
    }

    #[tokio::test]
    async fn repeated_get_returns_held_address() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator("10.0.0.0/24", &store);

        let first = alloc.get(&key("a"), None).await.unwrap();
        let again = alloc.get(&key("a"), None).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.held(), 1);
    }

    #[tokio::test]
    async fn requested_address_is_reserved_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator("10.0.0.0/24", &store);
        let ip: IpAddr = "10.0.0.42".parse().unwrap();

        let config = alloc.get(&key("a"), Some(ip)).await.unwrap();
        assert_eq!(config.address.addr(), ip);

        let err = alloc.get(&key("b"), Some(ip)).await.unwrap_err();
        assert!(matches!(err, AllocationError::AlreadyAllocated(addr) if addr == ip));

        let outside: IpAddr = "10.0.1.1".parse().unwrap();
        let err = alloc.get(&key("c"), Some(outside)).await.unwrap_err();
        assert!(matches!(err, AllocationError::NotInRange(_)));
    }

    #[tokio::test]
    async fn exhausted_range_fails() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator("10.0.0.0/30", &store);

        alloc.get(&key("a"), None).await.unwrap();
        alloc.get(&key("b"), None).await.unwrap();
        let err = alloc.get(&key("c"), None).await.unwrap_err();
        assert!(matches!(err, AllocationError::Exhausted));
    }

    #[tokio::test]
    async fn release_frees_the_held_address() {
        let store = Arc::new(MemoryStore::new());
        let alloc = allocator("10.0.0.0/24", &store);

        let first = alloc.get(&key("a"), None).await.unwrap();
        alloc.release(&key("a")).await.unwrap();
        assert_eq!(store.held(), 0);

        let err = alloc.release(&key("a")).await.unwrap_err();
        assert!(matches!(err, AllocationError::NotAllocated(_)));

        let reused = alloc.get(&key("b"), None).await.unwrap();
        assert_eq!(reused.address, first.address);
    }

    #[tokio::test]
    async fn concurrent_gets_receive_distinct_addresses() {
        let store = Arc::new(MemoryStore::new());
        let alloc = Arc::new(allocator("10.0.0.0/24", &store));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let alloc = Arc::clone(&alloc);
                tokio::spawn(async move { alloc.get(&key(&i.to_string()), None).await })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let config = handle.await.unwrap().unwrap();
            assert!(seen.insert(config.address));
        }
        assert_eq!(store.held(), 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_gets_for_one_key_share_an_address() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStore::open(dir.path()).await.unwrap());
        let factory = Arc::new(StoreAllocatorFactory::new(store.clone()));
        let ranges: RangeSet = vec![Range::new("10.0.0.0/24".parse().unwrap())];

        for round in 0..10 {
            let key = key(&format!("abc{round}"));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    // One allocator per task, like one per request.
                    let alloc = factory.allocator(&ranges);
                    let key = key.clone();
                    tokio::spawn(async move { alloc.get(&key, None).await })
                })
                .collect();

            let mut addresses = HashSet::new();
            for handle in handles {
                addresses.insert(handle.await.unwrap().unwrap().address);
            }
            assert_eq!(addresses.len(), 1);
            assert_eq!(store.get_by_key(&key).await.unwrap().len(), 1);
        }
    }
}
