//! File-backed [`Store`].
//!
//! Every reserved address is a file named after the address whose content is
//! the holding [`ContainerKey`]. Reservation relies on exclusive file creation,
//! so several daemons pointed at the same directory still never hand out an
//! address twice.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::warn;
use tokio::fs;
use tokio::sync::Mutex;

use super::{Store, StoreError};
use crate::protocol::ContainerKey;

pub struct DiskStore {
    dir: PathBuf,
    // Serialises scans against reservations made by this process.
    lock: Mutex<()>,
}

impl DiskStore {
    /// Open the store in `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// All reservations whose content matches `key`.
    async fn held_by(&self, key: &ContainerKey) -> Result<Vec<(IpAddr, PathBuf)>, StoreError> {
        let mut held = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(Self::io_err(&self.dir))?;

        while let Some(entry) = entries.next_entry().await.map_err(Self::io_err(&self.dir))? {
            let path = entry.path();
            let Some(ip) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse::<IpAddr>().ok())
            else {
                continue;
            };

            let holder = match fs::read_to_string(&path).await {
                Ok(holder) => holder,
                // Released concurrently by another process.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io_err(&path)(e)),
            };
            if holder.trim() == key.as_str() {
                held.push((ip, path));
            }
        }

        held.sort();
        Ok(held)
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn reserve(&self, key: &ContainerKey, ip: IpAddr) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.dir.join(ip.to_string());

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match file {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(Self::io_err(&path)(e)),
        }

        if let Err(e) = fs::write(&path, key.as_str()).await {
            // Do not leave an ownerless reservation behind.
            if let Err(remove_err) = fs::remove_file(&path).await {
                warn!("Failed to clean up {:?}: {}", path, remove_err);
            }
            return Err(Self::io_err(&path)(e));
        }
        Ok(true)
    }

    async fn get_by_key(&self, key: &ContainerKey) -> Result<Vec<IpAddr>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.held_by(key).await?.into_iter().map(|(ip, _)| ip).collect())
    }

    async fn release_by_key(&self, key: &ContainerKey) -> Result<Vec<IpAddr>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut released = Vec::new();
        for (ip, path) in self.held_by(key).await? {
            match fs::remove_file(&path).await {
                Ok(()) => released.push(ip),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Self::io_err(&path)(e)),
            }
        }
        Ok(released)
    }
}
