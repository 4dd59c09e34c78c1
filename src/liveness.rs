//! Liveness Signal
//!
//! Every process holds an exclusive lease named after itself for as long as
//! it lives. Holding and releasing the lease are reported to the coordinator
//! as a faster companion to heartbeat timeouts. Nothing depends on the lease
//! for correctness; without it failover falls back to the heartbeat bound.

use std::any::Any;
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use nix::fcntl::{flock, FlockArg};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::{LivenessBackend, LivenessConfig};
use crate::error::{Error, Result};
use crate::protocol::ToCoordinator;

/// Lease name for a process
pub fn lease_name(process_id: &str) -> String {
    format!("leasehold-liveness:{}", process_id)
}

/// A held lease; dropping it releases the lease
pub struct Lease {
    name: String,
    _hold: Box<dyn Any + Send + Sync>,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("name", &self.name).finish()
    }
}

/// Exclusive named lease primitive
#[async_trait::async_trait]
pub trait LivenessSignal: Send + Sync {
    /// Wait until the named lease is ours
    async fn acquire(&self, name: &str) -> Result<Lease>;

    /// Take the named lease only if nobody holds it
    async fn try_acquire(&self, name: &str) -> Result<Option<Lease>>;
}

/// Build the configured backend (None disables the signal)
pub fn from_config(config: &LivenessConfig) -> Option<Arc<dyn LivenessSignal>> {
    match config.backend {
        LivenessBackend::None => None,
        LivenessBackend::Local => Some(Arc::new(LocalLeases::new())),
        LivenessBackend::File => Some(Arc::new(FileLeases::new(config.lock_dir.clone()))),
    }
}

/// In-process named leases
#[derive(Default)]
pub struct LocalLeases {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalLeases {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait::async_trait]
impl LivenessSignal for LocalLeases {
    async fn acquire(&self, name: &str) -> Result<Lease> {
        let guard = self.slot(name).await.lock_owned().await;
        Ok(Lease {
            name: name.to_string(),
            _hold: Box::new(guard),
        })
    }

    async fn try_acquire(&self, name: &str) -> Result<Option<Lease>> {
        match self.slot(name).await.try_lock_owned() {
            Ok(guard) => Ok(Some(Lease {
                name: name.to_string(),
                _hold: Box::new(guard),
            })),
            Err(_) => Ok(None),
        }
    }
}

/// Host-wide leases backed by advisory `flock` on lock files
pub struct FileLeases {
    dir: PathBuf,
}

impl FileLeases {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.lock", file_name))
    }

    fn open_lock_file(&self, name: &str) -> Result<std::fs::File> {
        std::fs::create_dir_all(&self.dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(name))?;
        Ok(file)
    }

    fn lock(&self, name: &str, arg: FlockArg) -> Result<Option<Lease>> {
        let file = self.open_lock_file(name)?;
        match flock(file.as_raw_fd(), arg) {
            Ok(()) => Ok(Some(Lease {
                name: name.to_string(),
                _hold: Box::new(file),
            })),
            Err(nix::errno::Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(Error::Lease(format!("flock {} failed: {}", name, e))),
        }
    }
}

#[async_trait::async_trait]
impl LivenessSignal for FileLeases {
    async fn acquire(&self, name: &str) -> Result<Lease> {
        let leases = FileLeases::new(self.dir.clone());
        let name = name.to_string();
        tokio::task::spawn_blocking(move || leases.lock(&name, FlockArg::LockExclusive))
            .await
            .map_err(|e| Error::Internal(format!("lease task failed: {}", e)))?
            .and_then(|lease| lease.ok_or_else(|| Error::Lease("blocking flock returned busy".into())))
    }

    async fn try_acquire(&self, name: &str) -> Result<Option<Lease>> {
        self.lock(name, FlockArg::LockExclusiveNonblock)
    }
}

/// Hold the process's lease until `release` fires (or its sender is dropped),
/// reporting both transitions to the coordinator.
pub(crate) async fn hold(
    signal: Arc<dyn LivenessSignal>,
    process_id: String,
    tx: mpsc::UnboundedSender<ToCoordinator>,
    mut release: oneshot::Receiver<()>,
) {
    let name = lease_name(&process_id);

    let lease = tokio::select! {
        lease = signal.acquire(&name) => lease,
        _ = &mut release => return,
    };

    let lease = match lease {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!("Liveness lease {} unavailable: {}", name, e);
            return;
        }
    };

    tracing::debug!("Liveness lease held: {}", lease.name());
    let _ = tx.send(ToCoordinator::LivenessHeld {
        process_id: process_id.clone(),
    });

    let _ = release.await;
    drop(lease);

    tracing::debug!("Liveness lease released: {}", name);
    let _ = tx.send(ToCoordinator::LivenessReleased { process_id });
}
