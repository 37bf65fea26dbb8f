//! Worker lifecycle management.
//!
//! Every accepted connection runs in its own tokio task, a worker. Workers are
//! tracked in a slab keyed by [`WorkerId`] from the moment they are spawned
//! until the [`Reaper`] observes their completion notice and removes them.
//!
//! Each worker owns a completion guard whose `Drop` sends exactly one notice,
//! whether the handler returned, failed, panicked or was aborted. A slab key is
//! only recycled after its record was reaped, so a notice always refers to the
//! worker that sent it.

use chrono::{DateTime, Utc};
use slab::Slab;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::handler::{handle_connection, Disconnect, HandlerSettings};

/// Opaque identifier of an outstanding worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Why a worker could not be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The manager stopped accepting work.
    Closed,
    /// No tokio runtime is available on this thread.
    NoRuntime,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Closed => write!(f, "worker manager is closed"),
            SpawnError::NoRuntime => write!(f, "no runtime available to spawn worker"),
        }
    }
}

impl std::error::Error for SpawnError {}

struct WorkerRecord {
    peer: SocketAddr,
    spawned_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct Registry {
    workers: Slab<WorkerRecord>,
    closed: bool,
}

struct Inner {
    registry: Mutex<Registry>,
    completions: mpsc::UnboundedSender<WorkerId>,
    outstanding: watch::Sender<usize>,
    settings: Arc<HandlerSettings>,
}

/// Sends the completion notice for its worker when dropped.
struct CompletionGuard {
    id: WorkerId,
    completions: mpsc::UnboundedSender<WorkerId>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        // The reaper only goes away with the whole manager.
        let _ = self.completions.send(self.id);
    }
}

/// Spawns and tracks connection workers.
///
/// Cloning is cheap; all clones share one registry.
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    /// Create a manager and the reaper that reclaims its workers.
    ///
    /// The reaper must be driven (see [`Reaper::run`]) for completed workers
    /// to leave the registry.
    pub fn new(settings: HandlerSettings) -> (Self, Reaper) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0);

        let manager = WorkerManager {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    workers: Slab::new(),
                    closed: false,
                }),
                completions: tx,
                outstanding,
                settings: Arc::new(settings),
            }),
        };

        let reaper = Reaper {
            manager: manager.clone(),
            completions: rx,
        };

        (manager, reaper)
    }

    /// Spawn a worker serving `stream` and return without waiting for it.
    ///
    /// `permit` is held for the worker's lifetime when admission control is
    /// enabled. On error the stream is dropped, closing the connection.
    pub fn spawn<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<WorkerId, SpawnError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let settings = Arc::clone(&self.inner.settings);

        self.launch(peer, move |id| async move {
            let _permit = permit;
            debug!(peer = %peer, worker = %id, "Worker handling client");

            match handle_connection(stream, peer, &settings).await {
                Ok(Disconnect::PeerClosed) => {
                    info!(peer = %peer, worker = %id, "Client disconnected");
                }
                Ok(Disconnect::IdleTimeout) => {
                    info!(peer = %peer, worker = %id, "Client idle, connection closed");
                }
                Err(e) => {
                    warn!(peer = %peer, worker = %id, error = %e, "Connection error");
                }
            }
        })
    }

    /// Register a worker and spawn the future built for its id.
    ///
    /// The slab entry is reserved and filled under one lock acquisition, so
    /// the reaper cannot see a notice before the record exists.
    fn launch<F, Fut>(&self, peer: SocketAddr, make: F) -> Result<WorkerId, SpawnError>
    where
        F: FnOnce(WorkerId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SpawnError::NoRuntime)?;

        let mut registry = self.registry();
        if registry.closed {
            return Err(SpawnError::Closed);
        }

        let entry = registry.workers.vacant_entry();
        let id = WorkerId(entry.key());
        let guard = CompletionGuard {
            id,
            completions: self.inner.completions.clone(),
        };
        let work = make(id);

        let handle = runtime.spawn(async move {
            let _guard = guard;
            work.await;
        });

        entry.insert(WorkerRecord {
            peer,
            spawned_at: Utc::now(),
            handle,
        });
        self.inner.outstanding.send_replace(registry.workers.len());

        Ok(id)
    }

    /// Number of workers spawned but not yet reaped.
    pub fn outstanding(&self) -> usize {
        self.registry().workers.len()
    }

    /// Resolve once no worker is outstanding.
    pub async fn wait_idle(&self) {
        let mut outstanding = self.inner.outstanding.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }

    /// Refuse all further spawns.
    pub fn close(&self) {
        self.registry().closed = true;
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }

    /// Cancel every outstanding worker, returning how many were signalled.
    ///
    /// Aborted workers still send their completion notice and are reaped
    /// like any other.
    pub fn abort_all(&self) -> usize {
        let registry = self.registry();
        for (_, record) in registry.workers.iter() {
            record.handle.abort();
        }
        registry.workers.len()
    }

    fn remove(&self, id: WorkerId) -> Option<WorkerRecord> {
        let mut registry = self.registry();
        let record = registry.workers.try_remove(id.0)?;
        self.inner.outstanding.send_replace(registry.workers.len());
        Some(record)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reclaims completed workers.
pub struct Reaper {
    manager: WorkerManager,
    completions: mpsc::UnboundedReceiver<WorkerId>,
}

impl Reaper {
    /// Reap every worker whose completion notice is already queued,
    /// without waiting for new ones.
    pub async fn reap_completed(&mut self) -> Vec<WorkerId> {
        let mut reaped = Vec::new();
        while let Ok(id) = self.completions.try_recv() {
            if Self::reap(&self.manager, id).await {
                reaped.push(id);
            }
        }
        reaped
    }

    /// Reap workers as they complete. Runs until the task is aborted.
    pub async fn run(mut self) {
        while let Some(id) = self.completions.recv().await {
            Self::reap(&self.manager, id).await;
            self.reap_completed().await;
        }
    }

    async fn reap(manager: &WorkerManager, id: WorkerId) -> bool {
        let Some(record) = manager.remove(id) else {
            warn!(worker = %id, "Completion notice for unknown worker");
            return false;
        };

        // The guard fires while the task is being torn down, so this resolves
        // almost immediately.
        let outcome = record.handle.await;
        let duration_ms = (Utc::now() - record.spawned_at).num_milliseconds();

        match outcome {
            Ok(()) => {
                debug!(worker = %id, peer = %record.peer, duration_ms, "Worker reaped");
            }
            Err(e) if e.is_panic() => {
                error!(worker = %id, peer = %record.peer, duration_ms, "Worker panicked");
            }
            Err(_) => {
                debug!(worker = %id, peer = %record.peer, duration_ms, "Worker cancelled");
            }
        }

        true
    }
}
