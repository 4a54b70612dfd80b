//! Upload manager.
//!
//! Dequeues dirty inodes, runs the right upload protocol, and commits
//! the result back into the graph: local ids are rewritten to the
//! server-issued id, the remote hash and ETag are updated, dirty flags
//! cleared, and drained offline-change records removed.
//!
//! ## Session state machine
//!
//! ```text
//! ENQUEUED ──dispatch──► RUNNING ──final chunk──► COMMITTING ──► DONE
//!                          │  ▲                                 (terminal)
//!               transient  │  │ backoff
//!                          ▼  │
//!                         RETRY
//!                          │
//!          permanent error ▼
//!                        FAILED   (inode stays dirty; the next
//!                                  connectivity event re-enqueues it)
//! ```
//!
//! ## The wait-for contract
//!
//! `wait_for(id)` must never race `enqueue`: the session is registered
//! in the lookup table *before* `enqueue` returns, under the same lock
//! that queues it. Callers that enqueue and then immediately wait are
//! guaranteed to find the session.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use nimbus_core::config::TransferConfig;
use nimbus_core::domain::ids::ItemId;
use nimbus_core::ports::remote::{
    ChunkOutcome, CloudProvider, RemoteError, RemoteErrorKind, RemoteItem, SessionHandle,
};
use nimbus_core::domain::change::ChangeOp;
use nimbus_store::metadata::SessionCheckpoint;
use nimbus_store::{BodyStore, MetadataStore};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::ContentCache;
use crate::error::VfsError;
use crate::oracle::ConnectivityOracle;
use crate::tree::InodeGraph;

/// Queue lane for an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPriority {
    /// Background retry or reconnect drain.
    Background,
    /// User-initiated flush; overtakes background work.
    Flush,
}

/// Session lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Enqueued,
    Running,
    Committing,
    Done,
    Retry { attempts: u32 },
    Failed(String),
}

/// One tracked upload session.
struct Session {
    /// Id at enqueue time; may be a local id that gets adopted.
    original_id: ItemId,
    state: Mutex<UploadState>,
    outcome_tx: watch::Sender<Option<Result<ItemId, String>>>,
    outcome_rx: watch::Receiver<Option<Result<ItemId, String>>>,
}

impl Session {
    fn new(original_id: ItemId) -> Arc<Self> {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        Arc::new(Self {
            original_id,
            state: Mutex::new(UploadState::Enqueued),
            outcome_tx,
            outcome_rx,
        })
    }

    fn set_state(&self, state: UploadState) {
        *self.state.lock().expect("session state poisoned") = state;
    }

    fn state(&self) -> UploadState {
        self.state.lock().expect("session state poisoned").clone()
    }
}

struct Queues {
    high: VecDeque<ItemId>,
    normal: VecDeque<ItemId>,
    /// Per-id exclusion: at most one live session per inode.
    sessions: HashMap<ItemId, Arc<Session>>,
}

/// Priority-queued, resumable, chunked uploader.
pub struct UploadManager {
    provider: Arc<dyn CloudProvider>,
    graph: Arc<InodeGraph>,
    bodies: Arc<BodyStore>,
    cache: Arc<ContentCache>,
    meta: Arc<MetadataStore>,
    oracle: Arc<ConnectivityOracle>,
    config: TransferConfig,
    queues: Arc<Mutex<Queues>>,
    wake: Arc<Notify>,
    max_attempts: u32,
}

impl UploadManager {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        graph: Arc<InodeGraph>,
        bodies: Arc<BodyStore>,
        cache: Arc<ContentCache>,
        meta: Arc<MetadataStore>,
        oracle: Arc<ConnectivityOracle>,
        config: TransferConfig,
    ) -> Self {
        Self {
            provider,
            graph,
            bodies,
            cache,
            meta,
            oracle,
            config,
            queues: Arc::new(Mutex::new(Queues {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                sessions: HashMap::new(),
            })),
            wake: Arc::new(Notify::new()),
            max_attempts: 5,
        }
    }

    /// Enqueues an upload for a dirty inode.
    ///
    /// Idempotent per id: re-enqueueing while a session is live only
    /// bumps its priority lane. The session is discoverable by
    /// [`wait_for`](Self::wait_for) before this returns.
    pub fn enqueue(&self, id: &ItemId, priority: UploadPriority) {
        let id = self.graph.resolve(id);
        {
            let mut queues = self.queues.lock().expect("upload queues poisoned");
            if let Some(existing) = queues.sessions.get(&id) {
                if existing.state() != UploadState::Done {
                    if priority == UploadPriority::Flush && !queues.high.contains(&id) {
                        queues.normal.retain(|q| q != &id);
                        queues.high.push_back(id.clone());
                    }
                    drop(queues);
                    self.wake.notify_one();
                    return;
                }
                queues.sessions.remove(&id);
            }

            let session = Session::new(id.clone());
            queues.sessions.insert(id.clone(), session);
            match priority {
                UploadPriority::Flush => queues.high.push_back(id.clone()),
                UploadPriority::Background => queues.normal.push_back(id.clone()),
            }
        }
        self.wake.notify_one();
        debug!(id = %id, ?priority, "upload enqueued");
    }

    /// Blocks until the session for `id` reaches a terminal state.
    ///
    /// Returns the committed server id. An id with no live session is
    /// already settled and returns immediately.
    pub async fn wait_for(&self, id: &ItemId) -> Result<ItemId, VfsError> {
        let id = self.graph.resolve(id);
        let mut rx = {
            let queues = self.queues.lock().expect("upload queues poisoned");
            match queues.sessions.get(&id) {
                Some(session) => session.outcome_rx.clone(),
                None => return Ok(id),
            }
        };

        loop {
            {
                let outcome = rx.borrow();
                if let Some(ref result) = *outcome {
                    return result.clone().map_err(|msg| {
                        if msg == "offline" {
                            VfsError::Offline("upload deferred until reconnect".to_string())
                        } else {
                            VfsError::Remote(RemoteError::fatal(msg))
                        }
                    });
                }
            }
            if rx.changed().await.is_err() {
                return Err(VfsError::Interrupted);
            }
        }
    }

    /// Current state of the session for an id, if one is tracked.
    pub fn session_state(&self, id: &ItemId) -> Option<UploadState> {
        let id = self.graph.resolve(id);
        let queues = self.queues.lock().expect("upload queues poisoned");
        queues.sessions.get(&id).map(|s| s.state())
    }

    /// Runs `count` workers until cancellation.
    pub async fn run_workers(self: Arc<Self>, count: usize, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(count);
        for worker in 0..count {
            let manager = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                manager.worker_loop(worker, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "upload worker started");
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.pop_next() {
                Some((id, session)) => {
                    self.run_session(&id, &session).await;
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
    }

    /// Pops the next id, high lane first.
    fn pop_next(&self) -> Option<(ItemId, Arc<Session>)> {
        let mut queues = self.queues.lock().expect("upload queues poisoned");
        let id = queues.high.pop_front().or_else(|| queues.normal.pop_front())?;
        let session = queues.sessions.get(&id).cloned()?;
        Some((id, session))
    }

    fn requeue_later(&self, id: ItemId, delay: Duration) {
        let queues = Arc::clone(&self.queues);
        let wake = Arc::clone(&self.wake);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut queues = queues.lock().expect("upload queues poisoned");
                if !queues.normal.contains(&id) && !queues.high.contains(&id) {
                    queues.normal.push_back(id);
                }
            }
            wake.notify_one();
        });
    }

    /// Drops the session from the table and publishes its outcome.
    fn finish(&self, key: &ItemId, session: &Session, outcome: Result<ItemId, String>) {
        session.set_state(match &outcome {
            Ok(_) => UploadState::Done,
            Err(msg) => UploadState::Failed(msg.clone()),
        });
        let _ = session.outcome_tx.send(Some(outcome));
        let mut queues = self.queues.lock().expect("upload queues poisoned");
        queues.sessions.remove(key);
    }

    async fn run_session(&self, key: &ItemId, session: &Arc<Session>) {
        // Read the retry count before the state moves to Running.
        let prior_attempts = match session.state() {
            UploadState::Retry { attempts } => attempts,
            _ => 0,
        };
        session.set_state(UploadState::Running);

        let id = self.graph.resolve(&session.original_id);
        let Some(inode) = self.graph.get(&id) else {
            // Deleted while queued; nothing to upload.
            self.finish(key, session, Ok(id));
            return;
        };

        // Virtual items never produce upload requests.
        if inode.is_virtual() {
            self.finish(key, session, Ok(id));
            return;
        }
        if !inode.has_changes() && !id.is_local() {
            self.finish(key, session, Ok(id));
            return;
        }
        if !self.oracle.is_online() {
            debug!(id = %id, "upload deferred: offline");
            self.finish(key, session, Err("offline".to_string()));
            return;
        }

        match self.run_protocol(&id, session).await {
            Ok(remote) => match self.commit(&id, remote).await {
                Ok(server_id) => {
                    info!(id = %server_id, "upload committed");
                    self.finish(key, session, Ok(server_id));
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "upload commit failed");
                    self.finish(key, session, Err(e.to_string()));
                }
            },
            Err(e) if e.is_retryable() => {
                self.oracle.record_failure(e.kind());
                let attempts = prior_attempts + 1;
                if attempts > self.max_attempts {
                    warn!(id = %id, attempts, "upload retry budget exhausted");
                    self.finish(key, session, Err(e.to_string()));
                    return;
                }
                session.set_state(UploadState::Retry { attempts });
                let delay = Duration::from_millis(500 * (1u64 << attempts.min(6)));
                debug!(id = %id, attempts, delay_ms = delay.as_millis() as u64, "upload will retry");
                self.requeue_later(key.clone(), delay);
            }
            Err(e) => {
                // Permanent failure: surface it, keep the inode dirty,
                // and log the mutation for the next drain unless the
                // server rejected it outright.
                warn!(id = %id, error = %e, "upload failed permanently");
                if e.kind() != RemoteErrorKind::Validation {
                    if let Err(log_err) = self.meta.append_change(&id, &ChangeOp::Write).await {
                        warn!(error = %log_err, "failed to log deferred write");
                    }
                }
                let _ = self.meta.delete_session(&id).await;
                self.finish(key, session, Err(e.to_string()));
            }
        }
    }

    /// Chooses and runs the wire protocol, returning the committed item.
    async fn run_protocol(
        &self,
        id: &ItemId,
        session: &Session,
    ) -> Result<RemoteItem, RemoteError> {
        self.cache
            .seal_for_upload(id)
            .map_err(|e| RemoteError::fatal(e.to_string()))?;

        let inode = self
            .graph
            .get(id)
            .ok_or_else(|| RemoteError::fatal(format!("inode vanished: {id}")))?;
        let size = self
            .bodies
            .len(id)
            .map_err(|e| RemoteError::fatal(e.to_string()))?
            .unwrap_or(0);
        let parent = inode
            .parent()
            .map(|p| self.graph.resolve(p))
            .ok_or_else(|| RemoteError::fatal("upload target has no parent".to_string()))?;
        if parent.is_local() {
            // Ancestors commit before children; the drain enforces the
            // order, so hitting this means the parent create failed.
            return Err(RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("parent of {} not yet on the server", inode.name()),
            ));
        }

        let outcome = if size <= self.config.small_upload_threshold {
            let bytes = self
                .bodies
                .read_at(id, 0, size as usize)
                .map_err(|e| RemoteError::fatal(e.to_string()))?;
            if id.is_local() {
                self.provider
                    .put_small_new(&parent, inode.name(), &bytes)
                    .await?
            } else {
                self.provider.put_small(id, &bytes).await?
            }
        } else {
            self.run_chunked(id, &parent, inode.name(), size, session)
                .await?
        };
        self.oracle.record_success();
        Ok(outcome)
    }

    /// Resumable chunked session for large bodies.
    async fn run_chunked(
        &self,
        id: &ItemId,
        parent: &ItemId,
        name: &str,
        size: u64,
        session: &Session,
    ) -> Result<RemoteItem, RemoteError> {
        // Prefer a checkpointed session from a previous attempt; fall
        // back to negotiating a fresh one.
        let (handle, mut offset) = match self.resume_checkpoint(id).await {
            Some(resumed) => resumed,
            None => {
                let handle = if id.is_local() {
                    self.provider.create_upload_session_new(parent, name).await?
                } else {
                    self.provider.create_upload_session(id).await?
                };
                (handle, 0)
            }
        };

        self.checkpoint(id, &handle, size, offset).await;

        let chunk_size = self.config.upload_chunk_size as usize;
        loop {
            let chunk = self
                .bodies
                .read_at(id, offset, chunk_size.min((size - offset) as usize))
                .map_err(|e| RemoteError::fatal(e.to_string()))?;
            if chunk.is_empty() {
                return Err(RemoteError::fatal(format!(
                    "body truncated during upload of {id} at offset {offset}"
                )));
            }

            match self.provider.put_chunk(&handle, offset, size, &chunk).await {
                Ok(ChunkOutcome::Accepted { next_expected }) => {
                    offset = next_expected;
                    self.checkpoint(id, &handle, size, offset).await;
                }
                Ok(ChunkOutcome::Complete(item)) => {
                    session.set_state(UploadState::Committing);
                    return Ok(*item);
                }
                Err(e) if e.is_retryable() => {
                    // Ask the session where to resume rather than
                    // resending blindly.
                    match self.provider.session_status(&handle).await {
                        Ok(next) => {
                            debug!(id = %id, next, "resuming upload session");
                            offset = next;
                            self.checkpoint(id, &handle, size, offset).await;
                        }
                        Err(_) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn resume_checkpoint(&self, id: &ItemId) -> Option<(SessionHandle, u64)> {
        let checkpoint = self.meta.load_session(id).await.ok().flatten()?;
        let handle = SessionHandle {
            upload_url: checkpoint.upload_url,
            expires: checkpoint.expires,
        };
        match self.provider.session_status(&handle).await {
            Ok(next) => {
                debug!(id = %id, next, "resuming checkpointed upload session");
                Some((handle, next))
            }
            Err(_) => {
                // Session expired server-side; start over.
                None
            }
        }
    }

    async fn checkpoint(&self, id: &ItemId, handle: &SessionHandle, size: u64, offset: u64) {
        let checkpoint = SessionCheckpoint {
            item_id: id.clone(),
            upload_url: handle.upload_url.clone(),
            total_size: size,
            next_offset: offset,
            expires: handle.expires,
            created_at: Utc::now(),
        };
        if let Err(e) = self.meta.save_session(&checkpoint).await {
            warn!(id = %id, error = %e, "failed to checkpoint upload session");
        }
    }

    /// Applies a successful upload to the graph and the stores.
    async fn commit(&self, id: &ItemId, remote: RemoteItem) -> Result<ItemId, VfsError> {
        let server_id = remote.id.clone();

        if id.is_local() {
            self.bodies.rename_id(id, &server_id)?;
            self.graph.adopt_server_id(id, server_id.clone())?;
        }

        self.graph.update(&server_id, |i| {
            i.commit_upload(remote.hash.clone(), remote.etag.clone())
        })?;

        // Local mutations for this item are now on the server.
        self.meta.remove_changes_for(&server_id).await?;
        if id != &server_id {
            self.meta.remove_changes_for(id).await?;
        }
        self.meta.delete_session(&server_id).await?;
        self.meta.delete_session(id).await?;

        Ok(server_id)
    }
}
