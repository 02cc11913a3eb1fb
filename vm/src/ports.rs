use cradle_fs::{self as fs, FsError};
use dir_lock::DirLock;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::paths::Workspace;

/// Highest number of ephemeral ports asked of the OS before giving up.
pub const MAX_PORT_ATTEMPTS: usize = 10_000;

/// Host port forwarded to the guest's SSH server when it is free.
pub const DEFAULT_SSH_PORT: u16 = 2222;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("no free port found after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error("failed to lock port allocations '{path}': {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: dir_lock::Error,
    },

    #[error("failed to bind an ephemeral port: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to serialize port allocations: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Claimed ports, persisted as `{ "port": true }`.
type Allocations = BTreeMap<u16, bool>;

/// Hands out host ports that are unique across every cradle process on the machine.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    record: PathBuf,
    lock: PathBuf,
}

impl PortAllocator {
    pub fn new(record: impl Into<PathBuf>, lock: impl Into<PathBuf>) -> Self {
        Self {
            record: record.into(),
            lock: lock.into(),
        }
    }

    pub fn for_workspace(workspace: &Workspace) -> Self {
        Self::new(workspace.port_alloc_file(), workspace.port_alloc_lock())
    }

    /// Allocate a fresh ephemeral port and record it.
    #[tracing::instrument(skip(self))]
    pub async fn allocate(&self) -> Result<u16, PortError> {
        let _lock = self.acquire().await?;
        let mut allocations = self.load().await?;
        let (port, held) = pick_ephemeral(&allocations)?;
        allocations.insert(port, true);
        self.store(&allocations).await?;
        drop(held);
        info!(port, "Allocated port");
        Ok(port)
    }

    /// Claim `preferred` if nothing else holds it, else allocate a fresh port.
    #[tracing::instrument(skip(self))]
    pub async fn allocate_preferring(&self, preferred: u16) -> Result<u16, PortError> {
        let _lock = self.acquire().await?;
        let mut allocations = self.load().await?;
        let (port, held) = if !allocations.contains_key(&preferred) && is_available(preferred) {
            (preferred, Vec::new())
        } else {
            pick_ephemeral(&allocations)?
        };
        allocations.insert(port, true);
        self.store(&allocations).await?;
        drop(held);
        info!(port, "Allocated port");
        Ok(port)
    }

    #[tracing::instrument(skip(self))]
    pub async fn release(&self, port: u16) -> Result<(), PortError> {
        let _lock = self.acquire().await?;
        let mut allocations = self.load().await?;
        if allocations.remove(&port).is_some() {
            self.store(&allocations).await?;
            debug!(port, "Released port");
        }
        Ok(())
    }

    /// Ports currently recorded as claimed.
    pub async fn claimed(&self) -> Result<Vec<u16>, PortError> {
        let _lock = self.acquire().await?;
        Ok(self.load().await?.into_keys().collect())
    }

    async fn acquire(&self) -> Result<DirLock, PortError> {
        if let Some(parent) = self.lock.parent() {
            fs::create_dir(parent).await?;
        }
        DirLock::new(&self.lock)
            .await
            .map_err(|source| PortError::Lock {
                path: self.lock.clone(),
                source,
            })
    }

    async fn load(&self) -> Result<Allocations, PortError> {
        if !fs::path_exists(&self.record).await? {
            return Ok(Allocations::new());
        }
        let json = match fs::read_file_to_string(&self.record).await {
            Ok(json) => json,
            Err(error) => {
                warn!(%error, "Unreadable port allocation file, starting empty");
                return Ok(Allocations::new());
            }
        };
        match serde_json::from_str(&json) {
            Ok(allocations) => Ok(allocations),
            Err(error) => {
                warn!(path = %self.record.display(), %error, "Corrupt port allocation file, starting empty");
                Ok(Allocations::new())
            }
        }
    }

    async fn store(&self, allocations: &Allocations) -> Result<(), PortError> {
        let json = serde_json::to_vec(allocations).map_err(PortError::Serialize)?;
        fs::write_file_atomic(&self.record, &json).await?;
        Ok(())
    }
}

/// Ask the OS for ephemeral ports until one is not already claimed.
///
/// Every listener, the winner's included, is handed back to the caller and must stay
/// alive until the allocation is persisted, so the OS cannot hand the same port out twice.
fn pick_ephemeral(allocations: &Allocations) -> Result<(u16, Vec<TcpListener>), PortError> {
    let mut held = Vec::new();
    for _ in 0..MAX_PORT_ATTEMPTS {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .map_err(PortError::Bind)?;
        let port = listener.local_addr().map_err(PortError::Bind)?.port();
        held.push(listener);
        if !allocations.contains_key(&port) {
            return Ok((port, held));
        }
    }
    Err(PortError::Exhausted {
        attempts: MAX_PORT_ATTEMPTS,
    })
}

/// Best-effort probe: can `port` be bound on the loopback interface right now?
pub fn is_available(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(dir: &std::path::Path) -> PortAllocator {
        PortAllocator::new(dir.join("port-alloc.json"), dir.join("port-alloc.lock"))
    }

    #[tokio::test]
    async fn test_sequential_allocations_are_distinct_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = allocator(dir.path());

        let mut ports = Vec::new();
        for _ in 0..3 {
            ports.push(allocator.allocate().await.unwrap());
        }

        let mut distinct = ports.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);

        let claimed = allocator.claimed().await.unwrap();
        for port in &ports {
            assert!(claimed.contains(port));
        }
    }

    #[tokio::test]
    async fn test_corrupt_record_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = allocator(dir.path());
        std::fs::write(dir.path().join("port-alloc.json"), b"{{{ garbage").unwrap();

        let port = allocator.allocate().await.unwrap();

        assert_eq!(allocator.claimed().await.unwrap(), vec![port]);
    }

    #[tokio::test]
    async fn test_release_forgets_port() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = allocator(dir.path());

        let port = allocator.allocate().await.unwrap();
        allocator.release(port).await.unwrap();

        assert!(allocator.claimed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preferred_port_is_skipped_when_claimed() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = allocator(dir.path());

        let first = allocator.allocate().await.unwrap();
        let second = allocator.allocate_preferring(first).await.unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_is_available_sees_bound_port() {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_available(port));
        drop(listener);
        assert!(is_available(port));
    }
}
