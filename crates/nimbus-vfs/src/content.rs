//! Content cache.
//!
//! Read/write access to item bodies. A read that targets an id without
//! a present body triggers a download and blocks cooperatively until
//! the requested range is available. Writes only touch the body file
//! and dirty the inode; the upload is enqueued at flush so editors that
//! write in many small chunks upload once per close.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use nimbus_core::config::CacheConfig;
use nimbus_core::domain::ids::{ContentHash, ItemId};
use nimbus_core::domain::item::ItemState;
use nimbus_hash::quick_xor_stream;
use nimbus_store::BodyStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::download::{DownloadManager, DownloadPriority};
use crate::error::VfsError;
use crate::oracle::ConnectivityOracle;
use crate::tree::InodeGraph;

/// Disk-backed body access with hydration-on-miss and TTL eviction.
pub struct ContentCache {
    graph: Arc<InodeGraph>,
    bodies: Arc<BodyStore>,
    downloads: Arc<DownloadManager>,
    oracle: Arc<ConnectivityOracle>,
    config: CacheConfig,
}

impl ContentCache {
    pub fn new(
        graph: Arc<InodeGraph>,
        bodies: Arc<BodyStore>,
        downloads: Arc<DownloadManager>,
        oracle: Arc<ConnectivityOracle>,
        config: CacheConfig,
    ) -> Self {
        Self {
            graph,
            bodies,
            downloads,
            oracle,
            config,
        }
    }

    /// Reads up to `len` bytes at `offset`, hydrating on demand.
    pub async fn read(&self, id: &ItemId, offset: u64, len: usize) -> Result<Vec<u8>, VfsError> {
        let id = self.graph.resolve(id);
        let inode = self
            .graph
            .get(&id)
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;

        if inode.is_directory() {
            return Err(VfsError::Corrupt(format!("read on directory {id}")));
        }

        // Virtual items serve from memory.
        if let Some(body) = inode.virtual_body() {
            let start = (offset as usize).min(body.len());
            let end = (start + len).min(body.len());
            return Ok(body[start..end].to_vec());
        }

        let wanted_end = offset.saturating_add(len as u64).min(inode.size());
        if wanted_end == 0 || offset >= inode.size() {
            // Empty file or a read entirely past EOF; nothing to fetch.
            return Ok(Vec::new());
        }

        let body_len = self.bodies.len(&id)?.unwrap_or(0);
        let body_complete = inode.state().is_local() && body_len >= inode.size();
        if !body_complete && body_len < wanted_end.max(1) {
            // Range not on disk yet: attach to (or start) the fetch and
            // wait for the prefix to arrive.
            let mut handle =
                Arc::clone(&self.downloads).fetch(&id, DownloadPriority::Foreground)?;
            handle.wait_range(wanted_end).await?;
        }

        Ok(self.bodies.read_at(&id, offset, len)?)
    }

    /// Writes `data` at `offset`, dirtying the inode.
    ///
    /// Overwriting part of a file whose remote body has never been
    /// fetched first hydrates it fully, so the untouched bytes are
    /// real. Purely local items (and full overwrites from offset 0)
    /// skip that.
    pub async fn write(&self, id: &ItemId, offset: u64, data: &[u8]) -> Result<usize, VfsError> {
        let id = self.graph.resolve(id);
        let inode = self
            .graph
            .get(&id)
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;

        if inode.is_virtual() {
            return Err(VfsError::Domain(
                nimbus_core::domain::DomainError::Validation(
                    "virtual items are read-only".to_string(),
                ),
            ));
        }

        let body_len = self.bodies.len(&id)?.unwrap_or(0);
        let needs_hydration = *inode.state() == ItemState::Ghost
            && inode.size() > 0
            && body_len < inode.size()
            && !(offset == 0 && data.len() as u64 >= inode.size());
        if needs_hydration {
            if !self.oracle.is_online() {
                return Err(VfsError::Offline(format!(
                    "partial write to uncached body of {}",
                    inode.name()
                )));
            }
            let mut handle =
                Arc::clone(&self.downloads).fetch(&id, DownloadPriority::Foreground)?;
            handle.wait_complete().await?;
        }

        self.bodies.write_at(&id, offset, data)?;

        let new_len = self.bodies.len(&id)?.unwrap_or(0);
        self.graph.update(&id, |i| {
            // The local hash is recomputed at flush; writes in between
            // only dirty the inode.
            i.mark_dirty(None, new_len, Utc::now())
        })?;

        Ok(data.len())
    }

    /// Truncates the body to `size` and dirties the inode.
    pub fn truncate(&self, id: &ItemId, size: u64) -> Result<(), VfsError> {
        let id = self.graph.resolve(id);
        self.bodies.truncate(&id, size)?;
        self.graph
            .update(&id, |i| i.mark_dirty(None, size, Utc::now()))?;
        Ok(())
    }

    /// Finalizes a write burst at flush time: hashes the body, stores
    /// the local hash, and returns it for the upload commit to compare.
    pub fn seal_for_upload(&self, id: &ItemId) -> Result<Option<ContentHash>, VfsError> {
        let id = self.graph.resolve(id);
        let inode = self
            .graph
            .get(&id)
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;
        if !inode.has_changes() {
            return Ok(None);
        }

        // A file created and closed without writes has no body file
        // yet; materialize the empty body so it can be hashed and
        // uploaded.
        if self.bodies.len(&id)?.is_none() {
            self.bodies.truncate(&id, 0)?;
        }

        self.bodies.sync(&id)?;
        let mut file = self.bodies.open_read(&id)?;
        let hash = quick_xor_stream(&mut file).map_err(nimbus_store::StoreError::Io)?;
        let hash = ContentHash::new(hash)?;

        let size = self.bodies.len(&id)?.unwrap_or(0);
        self.graph
            .update(&id, |i| i.mark_dirty(Some(hash.clone()), size, i.mtime()))?;
        Ok(Some(hash))
    }

    /// Corruption check on open: a clean body whose hash disagrees with
    /// the recorded remote hash is discarded so the next read refetches
    /// instead of serving stale or torn bytes from a prior run.
    ///
    /// Returns true when the body was discarded.
    pub fn verify_or_evict(&self, id: &ItemId) -> Result<bool, VfsError> {
        let id = self.graph.resolve(id);
        let inode = self
            .graph
            .get(&id)
            .ok_or_else(|| VfsError::NotFound(id.to_string()))?;

        if inode.has_changes() || *inode.state() != ItemState::Hydrated || !inode.is_file() {
            return Ok(false);
        }
        let Some(expected) = inode.remote_hash().cloned() else {
            return Ok(false);
        };
        if !self.bodies.exists(&id) {
            return Ok(false);
        }

        let mut file = self.bodies.open_read(&id)?;
        let actual = quick_xor_stream(&mut file).map_err(nimbus_store::StoreError::Io)?;
        if actual == expected.as_str() {
            return Ok(false);
        }

        warn!(id = %id, "cached body failed hash verification, discarding");
        self.bodies.delete(&id)?;
        self.graph
            .update(&id, |i| i.transition_to(ItemState::Ghost))?;
        Ok(true)
    }

    /// Evicts bodies idle past the TTL. Dirty bodies are pinned and
    /// never evicted before their upload commits.
    pub fn evict_idle(&self) -> Result<usize, VfsError> {
        let ttl = Duration::from_secs(self.config.expiration_secs);
        let now = SystemTime::now();
        let mut evicted = 0usize;

        for id in self.graph.all_ids() {
            let Some(inode) = self.graph.get(&id) else {
                continue;
            };
            if !inode.is_file()
                || inode.has_changes()
                || *inode.state() != ItemState::Hydrated
            {
                continue;
            }
            let Some(mtime) = self.bodies.mtime(&id)? else {
                continue;
            };
            let idle = now.duration_since(mtime).unwrap_or_default();
            if idle < ttl {
                continue;
            }

            self.bodies.delete(&id)?;
            self.graph
                .update(&id, |i| i.transition_to(ItemState::Ghost))?;
            evicted += 1;
            debug!(id = %id, "idle body evicted");
        }
        Ok(evicted)
    }

    /// Background eviction sweep.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cache sweeper stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            match self.evict_idle() {
                Ok(0) => {}
                Ok(n) => info!(evicted = n, "cache sweep evicted idle bodies"),
                Err(e) => warn!(error = %e, "cache sweep failed"),
            }
        }
    }

    /// Disk usage of the body store, for statfs.
    pub fn disk_usage(&self) -> Result<u64, VfsError> {
        Ok(self.bodies.disk_usage()?)
    }
}
