//! Background delivery of remote store calls.
//!
//! A single owned task drains a bounded request queue and talks to the
//! remote store, so callers never hold gallery locks across network I/O.
//! A full queue is rejected immediately instead of blocking the caller.
//!
//! Only the worker applies the timeout. A request that waited in the queue
//! longer than the timeout, or whose caller went away, is answered without
//! ever reaching the store, so a caller told a call failed can rely on it
//! not landing on the remote later.

use crate::remote::{RemoteError, RemoteStore};
use facegate_core::{Embedding, IdentityRecord, Pose};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, RemoteError>>;

/// Messages sent from the mutation protocol to the sync worker.
enum SyncRequest {
    FetchAll {
        reply: Reply<Vec<(String, IdentityRecord)>>,
    },
    Push {
        record: IdentityRecord,
        reply: Reply<()>,
    },
    PushAugmentation {
        id_real: String,
        pose: Pose,
        embedding: Embedding,
        reply: Reply<()>,
    },
    Delete {
        id_real: String,
        reply: Reply<()>,
    },
}

impl SyncRequest {
    fn name(&self) -> &'static str {
        match self {
            SyncRequest::FetchAll { .. } => "fetch_all",
            SyncRequest::Push { .. } => "push",
            SyncRequest::PushAugmentation { .. } => "push_augmentation",
            SyncRequest::Delete { .. } => "delete",
        }
    }

    fn caller_gone(&self) -> bool {
        match self {
            SyncRequest::FetchAll { reply } => reply.is_closed(),
            SyncRequest::Push { reply, .. }
            | SyncRequest::PushAugmentation { reply, .. }
            | SyncRequest::Delete { reply, .. } => reply.is_closed(),
        }
    }

    /// Answer with `error` without calling the store.
    fn fail(self, error: RemoteError) {
        match self {
            SyncRequest::FetchAll { reply } => {
                let _ = reply.send(Err(error));
            }
            SyncRequest::Push { reply, .. }
            | SyncRequest::PushAugmentation { reply, .. }
            | SyncRequest::Delete { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Clone-safe handle to the sync worker.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<(Instant, SyncRequest)>,
}

impl SyncHandle {
    pub async fn fetch_all(&self) -> Result<Vec<(String, IdentityRecord)>, RemoteError> {
        self.request(|reply| SyncRequest::FetchAll { reply }).await
    }

    pub async fn push(&self, record: IdentityRecord) -> Result<(), RemoteError> {
        self.request(|reply| SyncRequest::Push { record, reply }).await
    }

    pub async fn push_augmentation(
        &self,
        id_real: &str,
        pose: Pose,
        embedding: Embedding,
    ) -> Result<(), RemoteError> {
        let id_real = id_real.to_string();
        self.request(|reply| SyncRequest::PushAugmentation {
            id_real,
            pose,
            embedding,
            reply,
        })
        .await
    }

    pub async fn delete(&self, id_real: &str) -> Result<(), RemoteError> {
        let id_real = id_real.to_string();
        self.request(|reply| SyncRequest::Delete { id_real, reply }).await
    }

    /// Enqueue without waiting for space, then wait for the worker's answer.
    ///
    /// The worker answers every request within its timeout once dequeued,
    /// either with the store's result or with `Timeout` for a stale request.
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SyncRequest,
    ) -> Result<T, RemoteError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send((Instant::now(), make(reply_tx)))
            .map_err(|e| match e {
                TrySendError::Full(_) => RemoteError::QueueFull,
                TrySendError::Closed(_) => RemoteError::WorkerGone,
            })?;

        reply_rx.await.unwrap_or(Err(RemoteError::WorkerGone))
    }
}

/// Bound a single remote call by `timeout`.
async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout))
}

/// Spawn the sync worker on the current tokio runtime.
///
/// The worker exits once every [`SyncHandle`] has been dropped.
pub fn spawn_sync_worker(store: Arc<dyn RemoteStore>, capacity: usize, timeout: Duration) -> SyncHandle {
    let (tx, mut rx) = mpsc::channel::<(Instant, SyncRequest)>(capacity.max(1));

    tokio::spawn(async move {
        tracing::info!(capacity, "remote sync worker started");
        while let Some((queued_at, req)) = rx.recv().await {
            if req.caller_gone() {
                tracing::debug!(request = req.name(), "caller gone, remote request skipped");
                continue;
            }
            let waited = queued_at.elapsed();
            if waited > timeout {
                tracing::warn!(
                    request = req.name(),
                    waited_ms = waited.as_millis() as u64,
                    "remote request expired in queue"
                );
                req.fail(RemoteError::Timeout);
                continue;
            }
            match req {
                SyncRequest::FetchAll { reply } => {
                    let result = bounded(timeout, store.fetch_all()).await;
                    let _ = reply.send(result);
                }
                SyncRequest::Push { record, reply } => {
                    let result = bounded(timeout, store.push(&record)).await;
                    if let Err(e) = &result {
                        tracing::warn!(id_real = %record.id_real, error = %e, "remote push failed");
                    }
                    let _ = reply.send(result);
                }
                SyncRequest::PushAugmentation {
                    id_real,
                    pose,
                    embedding,
                    reply,
                } => {
                    let result = bounded(timeout, store.push_augmentation(&id_real, pose, &embedding)).await;
                    if let Err(e) = &result {
                        tracing::warn!(id_real = %id_real, %pose, error = %e, "remote augmentation push failed");
                    }
                    let _ = reply.send(result);
                }
                SyncRequest::Delete { id_real, reply } => {
                    let result = bounded(timeout, store.delete(&id_real)).await;
                    if let Err(e) = &result {
                        tracing::warn!(id_real = %id_real, error = %e, "remote delete failed");
                    }
                    let _ = reply.send(result);
                }
            }
        }
        tracing::info!("remote sync worker exiting");
    });

    SyncHandle { tx }
}
