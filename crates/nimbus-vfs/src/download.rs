//! On-demand download manager.
//!
//! Keyed by item id with an intention table: at most one in-flight
//! fetch per id, and concurrent readers attach to the same fetch. A
//! fetch streams progressively into the body file, so reads of an
//! already-written prefix proceed while the tail is still arriving.
//!
//! Cancellation follows the waiter count: if every waiter disappears
//! before any prefix has been written the network task aborts; once
//! bytes are on disk the fetch runs to completion so the partial body
//! is not wasted. A mid-stream network error resumes with a ranged
//! request, using the remote hash as the witness that the content is
//! still the same body.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use nimbus_core::config::TransferConfig;
use nimbus_core::domain::ids::ItemId;
use nimbus_core::domain::item::ItemState;
use nimbus_core::ports::remote::CloudProvider;
use nimbus_hash::quick_xor_stream;
use nimbus_store::BodyStore;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use crate::error::VfsError;
use crate::oracle::ConnectivityOracle;
use crate::tree::InodeGraph;

/// Priority hint for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPriority {
    /// Background prefetch or eager tree sync.
    Normal,
    /// A reader is blocked on this body right now.
    Foreground,
}

/// Observable progress of one fetch.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Contiguous bytes available from offset 0.
    pub available: u64,
    /// Total body size.
    pub total: u64,
    /// Terminal outcome once set: `Ok(())` or an error message.
    pub outcome: Option<Result<(), String>>,
}

/// Counts attached waiters; the token decrements on drop.
struct WaiterToken {
    count: Arc<AtomicUsize>,
}

impl WaiterToken {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count }
    }
}

impl Clone for WaiterToken {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.count))
    }
}

impl Drop for WaiterToken {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to an in-flight (or finished) fetch.
///
/// The first-block and full-body milestones are separately observable:
/// [`wait_range`](FetchHandle::wait_range) resolves as soon as the
/// requested prefix is on disk, [`wait_complete`](FetchHandle::wait_complete)
/// when the whole body is verified.
#[derive(Clone)]
pub struct FetchHandle {
    progress: watch::Receiver<DownloadProgress>,
    _waiter: WaiterToken,
}

impl FetchHandle {
    /// Waits until bytes `[0, end)` are available.
    pub async fn wait_range(&mut self, end: u64) -> Result<(), VfsError> {
        loop {
            {
                let p = self.progress.borrow();
                if p.available >= end.min(p.total) {
                    return Ok(());
                }
                if let Some(ref outcome) = p.outcome {
                    return match outcome {
                        Ok(()) => Ok(()),
                        Err(msg) => Err(VfsError::Corrupt(msg.clone())),
                    };
                }
            }
            if self.progress.changed().await.is_err() {
                return Err(VfsError::Interrupted);
            }
        }
    }

    /// Waits for the first block (enough to answer an `open`).
    pub async fn wait_first_block(&mut self) -> Result<(), VfsError> {
        let first = {
            let p = self.progress.borrow();
            p.total.min(4096)
        };
        self.wait_range(first).await
    }

    /// Waits for full-body completion.
    pub async fn wait_complete(&mut self) -> Result<(), VfsError> {
        loop {
            {
                let p = self.progress.borrow();
                if let Some(ref outcome) = p.outcome {
                    return outcome
                        .clone()
                        .map_err(VfsError::Corrupt);
                }
            }
            if self.progress.changed().await.is_err() {
                return Err(VfsError::Interrupted);
            }
        }
    }
}

struct ActiveFetch {
    progress_rx: watch::Receiver<DownloadProgress>,
    waiters: Arc<AtomicUsize>,
}

/// Deduplicated, concurrency-capped download manager.
pub struct DownloadManager {
    provider: Arc<dyn CloudProvider>,
    bodies: Arc<BodyStore>,
    graph: Arc<InodeGraph>,
    oracle: Arc<ConnectivityOracle>,
    config: TransferConfig,
    /// Intention table: at most one entry per id.
    active: DashMap<ItemId, ActiveFetch>,
    /// Worker cap for normal-priority fetches.
    workers: Arc<Semaphore>,
    /// Small reserve so foreground readers overtake a saturated pool.
    reserve: Arc<Semaphore>,
}

impl DownloadManager {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        bodies: Arc<BodyStore>,
        graph: Arc<InodeGraph>,
        oracle: Arc<ConnectivityOracle>,
        config: TransferConfig,
    ) -> Self {
        let reserve_permits = (config.download_workers / 4).max(1);
        Self {
            provider,
            bodies,
            graph,
            oracle,
            workers: Arc::new(Semaphore::new(config.download_workers)),
            reserve: Arc::new(Semaphore::new(reserve_permits)),
            config,
            active: DashMap::new(),
        }
    }

    /// Starts (or attaches to) the fetch for an id.
    ///
    /// By the time this returns, the fetch is registered in the
    /// intention table, so a concurrent `fetch` for the same id attaches
    /// instead of double-downloading.
    pub fn fetch(
        self: Arc<Self>,
        id: &ItemId,
        priority: DownloadPriority,
    ) -> Result<FetchHandle, VfsError> {
        let id = self.graph.resolve(id);

        // Attach to an in-flight fetch when one exists.
        if let Some(active) = self.active.get(&id) {
            return Ok(FetchHandle {
                progress: active.progress_rx.clone(),
                _waiter: WaiterToken::new(Arc::clone(&active.waiters)),
            });
        }

        let inode = self
            .graph
            .get(&id)
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;
        if !inode.is_file() {
            return Err(VfsError::Corrupt(format!(
                "fetch on non-file item {id}"
            )));
        }
        let total = inode.size();

        // Already hydrated and on disk: hand back a completed handle.
        if inode.state().is_local() && self.bodies.len(&id)?.unwrap_or(0) >= total {
            let (_tx, rx) = watch::channel(DownloadProgress {
                available: total,
                total,
                outcome: Some(Ok(())),
            });
            return Ok(FetchHandle {
                progress: rx,
                _waiter: WaiterToken::new(Arc::new(AtomicUsize::new(0))),
            });
        }

        if !self.oracle.is_online() {
            return Err(VfsError::Offline(format!(
                "body of {} is not cached",
                inode.name()
            )));
        }

        let (tx, rx) = watch::channel(DownloadProgress {
            available: 0,
            total,
            outcome: None,
        });
        let waiters = Arc::new(AtomicUsize::new(0));
        let handle = FetchHandle {
            progress: rx.clone(),
            _waiter: WaiterToken::new(Arc::clone(&waiters)),
        };

        // Register before spawning: the task removes the entry when done.
        self.active.insert(
            id.clone(),
            ActiveFetch {
                progress_rx: rx,
                waiters: Arc::clone(&waiters),
            },
        );

        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            manager.run_fetch(id, total, priority, tx, waiters).await;
        });

        Ok(handle)
    }

    async fn run_fetch(
        self: Arc<Self>,
        id: ItemId,
        total: u64,
        priority: DownloadPriority,
        tx: watch::Sender<DownloadProgress>,
        waiters: Arc<AtomicUsize>,
    ) {
        let permit = self.acquire_slot(priority).await;
        let result = self.stream_body(&id, total, &tx, &waiters).await;
        drop(permit);

        match result {
            Ok(()) => {
                let _ = self.graph.update(&id, |i| {
                    if *i.state() == ItemState::Hydrating {
                        i.transition_to(ItemState::Hydrated)
                    } else {
                        Ok(())
                    }
                });
                let _ = tx.send(DownloadProgress {
                    available: total,
                    total,
                    outcome: Some(Ok(())),
                });
                debug!(id = %id, total, "hydration complete");
            }
            Err(e) => {
                // Roll the state back so a later read retries.
                let _ = self.graph.update(&id, |i| {
                    if *i.state() == ItemState::Hydrating {
                        i.transition_to(ItemState::Ghost)
                    } else {
                        Ok(())
                    }
                });
                warn!(id = %id, error = %e, "hydration failed");
                let _ = tx.send(DownloadProgress {
                    available: 0,
                    total,
                    outcome: Some(Err(e.to_string())),
                });
            }
        }
        self.active.remove(&id);
    }

    async fn acquire_slot(&self, priority: DownloadPriority) -> tokio::sync::OwnedSemaphorePermit {
        match priority {
            DownloadPriority::Normal => Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .expect("download semaphore closed"),
            DownloadPriority::Foreground => {
                // Take a free normal slot when available, otherwise the
                // reserve lane so saturation by background work cannot
                // starve an interactive reader.
                match Arc::clone(&self.workers).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => Arc::clone(&self.reserve)
                        .acquire_owned()
                        .await
                        .expect("download reserve semaphore closed"),
                }
            }
        }
    }

    async fn stream_body(
        &self,
        id: &ItemId,
        total: u64,
        tx: &watch::Sender<DownloadProgress>,
        waiters: &Arc<AtomicUsize>,
    ) -> Result<(), VfsError> {
        self.graph.update(id, |i| {
            if *i.state() == ItemState::Hydrating {
                Ok(())
            } else {
                i.transition_to(ItemState::Hydrating)
            }
        })?;

        // Start from scratch: partial bodies from prior runs were
        // discarded at startup, and within one run the intention table
        // guarantees a single writer.
        self.bodies.truncate(id, 0)?;

        if total == 0 {
            self.bodies.sync(id)?;
            return Ok(());
        }

        if total <= self.config.range_get_threshold {
            let bytes = match self.provider.get_content(id, None).await {
                Ok(bytes) => {
                    self.oracle.record_success();
                    bytes
                }
                Err(e) => {
                    self.oracle.record_failure(e.kind());
                    return Err(e.into());
                }
            };
            self.bodies.write_at(id, 0, &bytes)?;
            let _ = tx.send(DownloadProgress {
                available: bytes.len() as u64,
                total,
                outcome: None,
            });
        } else {
            self.stream_chunks(id, total, tx, waiters).await?;
        }

        self.verify_body(id, total)?;
        self.bodies.sync(id)?;
        Ok(())
    }

    /// Ranged streaming for large bodies, with resume on mid-stream
    /// failures while the remote hash is unchanged.
    async fn stream_chunks(
        &self,
        id: &ItemId,
        total: u64,
        tx: &watch::Sender<DownloadProgress>,
        waiters: &Arc<AtomicUsize>,
    ) -> Result<(), VfsError> {
        let chunk = self.config.download_chunk_size.max(1);
        let mut offset = 0u64;
        let mut resume_attempts = 0u32;

        while offset < total {
            // Nobody waiting and nothing written yet: the work would be
            // pure waste, so abort. Once a prefix exists, finish it.
            if offset == 0 && waiters.load(Ordering::SeqCst) == 0 {
                debug!(id = %id, "fetch abandoned before first byte");
                return Err(VfsError::Interrupted);
            }

            let end = (offset + chunk).min(total);
            match self.provider.get_content(id, Some(offset..end)).await {
                Ok(bytes) => {
                    self.oracle.record_success();
                    self.bodies.write_at(id, offset, &bytes)?;
                    offset += bytes.len() as u64;
                    resume_attempts = 0;
                    let _ = tx.send(DownloadProgress {
                        available: offset,
                        total,
                        outcome: None,
                    });
                    if bytes.is_empty() {
                        return Err(VfsError::Corrupt(format!(
                            "empty range response at offset {offset}"
                        )));
                    }
                }
                Err(e) if e.is_retryable() && resume_attempts < 3 => {
                    self.oracle.record_failure(e.kind());
                    resume_attempts += 1;
                    // Witness of identity: if the remote hash moved the
                    // prefix is stale and the fetch restarts.
                    let expected = self.graph.get(id).and_then(|i| i.remote_hash().cloned());
                    match self.provider.get_item(id).await {
                        Ok(fresh) if fresh.hash == expected => {
                            debug!(id = %id, offset, "resuming ranged fetch after transient error");
                        }
                        Ok(_) => {
                            debug!(id = %id, "remote content changed mid-fetch, restarting");
                            offset = 0;
                            self.bodies.truncate(id, 0)?;
                        }
                        Err(probe) => {
                            self.oracle.record_failure(probe.kind());
                            return Err(probe.into());
                        }
                    }
                }
                Err(e) => {
                    self.oracle.record_failure(e.kind());
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Hash-verifies a freshly streamed body against the recorded
    /// remote hash. Mismatch discards the body.
    fn verify_body(&self, id: &ItemId, total: u64) -> Result<(), VfsError> {
        let inode = self
            .graph
            .get(id)
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;
        let Some(expected) = inode.remote_hash().cloned() else {
            return Ok(());
        };

        let mut file = self.bodies.open_read(id)?;
        let actual = quick_xor_stream(&mut file).map_err(nimbus_store::StoreError::Io)?;
        if actual != expected.as_str() {
            self.bodies.delete(id)?;
            return Err(VfsError::Corrupt(format!(
                "downloaded body hash mismatch for {id}: got {actual}, recorded {expected} ({total} bytes)"
            )));
        }
        Ok(())
    }
}
