//! Delta reconciliation loop.
//!
//! Periodically pulls batches from the remote change feed and merges
//! them into the inode graph. The merge rules protect local state:
//!
//! - a tombstone for a directory that still has children in the cache
//!   is rejected and re-queued (the remote delivers tombstones out of
//!   order at times);
//! - an update to a dirty inode is **local-wins**: name, parent and
//!   ETag are absorbed, the dirty body and its pending upload survive;
//! - when the content hash is unchanged the mtime is left alone, so
//!   editors probing lockfile mtimes see stable values;
//! - a record with no hash is applied with the hash field untouched.
//!
//! The delta link is persisted after each fully applied batch, so the
//! next start resumes mid-feed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use nimbus_core::config::DeltaConfig;
use nimbus_core::domain::ids::{DeltaLink, ItemId};
use nimbus_core::domain::item::{Inode, ItemState};
use nimbus_core::ports::remote::{CloudProvider, RemoteItem};
use nimbus_store::{BodyStore, MetadataStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::VfsError;
use crate::oracle::ConnectivityOracle;
use crate::tree::InodeGraph;

/// Tracks recent FUSE activity to tighten the poll cadence.
pub struct ActivityTracker {
    last_op: AtomicI64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_op: AtomicI64::new(0),
        }
    }

    /// Called by the FUSE bridge on every user-driven operation.
    pub fn poke(&self) {
        self.last_op.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// True within `window` seconds of the last operation.
    pub fn is_active(&self, window: u64) -> bool {
        let last = self.last_op.load(Ordering::Relaxed);
        last != 0 && (Utc::now().timestamp() - last) <= window as i64
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of applying one change record.
#[derive(Debug, PartialEq, Eq)]
enum Applied {
    Done,
    /// Parent not in the graph yet; retry later in the batch or pass.
    Deferred,
    /// Out-of-order tombstone on a nonempty directory.
    Requeued,
}

/// The server-change absorption loop.
pub struct DeltaLoop {
    provider: Arc<dyn CloudProvider>,
    graph: Arc<InodeGraph>,
    bodies: Arc<BodyStore>,
    meta: Arc<MetadataStore>,
    oracle: Arc<ConnectivityOracle>,
    config: DeltaConfig,
    activity: Arc<ActivityTracker>,
    /// Records rejected this pass, retried on the next.
    requeued: Mutex<Vec<RemoteItem>>,
}

impl DeltaLoop {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        graph: Arc<InodeGraph>,
        bodies: Arc<BodyStore>,
        meta: Arc<MetadataStore>,
        oracle: Arc<ConnectivityOracle>,
        config: DeltaConfig,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            provider,
            graph,
            bodies,
            meta,
            oracle,
            config,
            activity,
            requeued: Mutex::new(Vec::new()),
        }
    }

    /// Periodic polling until cancellation. The cadence tightens to the
    /// active interval for a window after user activity.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let secs = if self.activity.is_active(self.config.active_window_secs) {
                self.config.active_interval_secs
            } else {
                self.config.interval_secs
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("delta loop stopped");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(secs.max(1))) => {}
            }
            match self.poll_once().await {
                Ok(applied) if applied > 0 => {
                    info!(applied, "delta batch absorbed");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "delta poll failed"),
            }
        }
    }

    /// One full poll: requeued records first, then feed pages until the
    /// batch's delta link arrives. Returns the number of applied records.
    pub async fn poll_once(&self) -> Result<usize, VfsError> {
        let mut applied = 0usize;

        // Records rejected last pass get first shot: their blockers
        // (child tombstones) usually arrived in the meantime.
        let retry: Vec<RemoteItem> = {
            let mut requeued = self.requeued.lock().expect("requeue lock poisoned");
            std::mem::take(&mut *requeued)
        };
        applied += self.apply_batch(retry);

        let mut link = self.meta.delta_link().await?;
        loop {
            let page = match self.provider.delta(link.as_ref()).await {
                Ok(page) => {
                    self.oracle.record_success();
                    page
                }
                Err(e) => {
                    self.oracle.record_failure(e.kind());
                    return Err(e.into());
                }
            };

            applied += self.apply_batch(page.items);

            if let Some(next) = page.next_link {
                link = Some(DeltaLink::new(next));
                continue;
            }
            if let Some(delta_link) = page.delta_link {
                self.meta.set_delta_link(&delta_link).await?;
            }
            break;
        }
        Ok(applied)
    }

    /// Applies a batch with in-batch deferral: a child can precede its
    /// parent in the same page, so unresolved records retry until a
    /// pass makes no progress.
    fn apply_batch(&self, items: Vec<RemoteItem>) -> usize {
        let mut applied = 0usize;
        let mut pending = items;

        loop {
            let mut deferred = Vec::new();
            let mut progressed = false;

            for item in pending {
                match self.apply_record(&item) {
                    Applied::Done => {
                        applied += 1;
                        progressed = true;
                    }
                    Applied::Deferred => deferred.push(item),
                    Applied::Requeued => {
                        self.requeued
                            .lock()
                            .expect("requeue lock poisoned")
                            .push(item);
                    }
                }
            }

            if deferred.is_empty() {
                break;
            }
            if !progressed {
                // Parents truly absent from this batch; try next pass.
                let mut requeued = self.requeued.lock().expect("requeue lock poisoned");
                for item in deferred {
                    debug!(id = %item.id, "deferring record until its parent appears");
                    requeued.push(item);
                }
                break;
            }
            pending = deferred;
        }
        applied
    }

    /// Applies one record. Re-application of an identical record is a
    /// no-op (and in particular never bumps the mtime).
    fn apply_record(&self, item: &RemoteItem) -> Applied {
        if item.is_deleted {
            return self.apply_tombstone(item);
        }

        // The feed reports the root itself; its metadata is fixed.
        if item.parent_id.is_none() {
            return Applied::Done;
        }

        match self.graph.get(&item.id) {
            Some(existing) => self.apply_update(item, existing),
            None => self.apply_create(item),
        }
    }

    fn apply_tombstone(&self, item: &RemoteItem) -> Applied {
        let Some(existing) = self.graph.get(&item.id) else {
            // Already gone; tombstones are idempotent.
            return Applied::Done;
        };

        if existing.is_directory() && self.graph.has_children(&item.id) {
            debug!(id = %item.id, "tombstone on nonempty directory rejected, re-queued");
            return Applied::Requeued;
        }

        match self.graph.remove(&item.id) {
            Ok(_) => {
                if let Err(e) = self.bodies.delete(&item.id) {
                    warn!(id = %item.id, error = %e, "failed to evict body of tombstoned item");
                }
                Applied::Done
            }
            Err(VfsError::NotEmpty(_)) => Applied::Requeued,
            Err(e) => {
                warn!(id = %item.id, error = %e, "tombstone application failed");
                Applied::Done
            }
        }
    }

    fn apply_create(&self, item: &RemoteItem) -> Applied {
        let Some(parent) = item.parent_id.clone() else {
            return Applied::Done;
        };
        if !self.graph.contains(&parent) {
            return Applied::Deferred;
        }

        let inode = if item.is_directory {
            Inode::new_directory(
                item.id.clone(),
                Some(parent),
                &item.name,
                item.modified.unwrap_or_else(Utc::now),
            )
        } else {
            Inode::new_file(
                item.id.clone(),
                parent,
                &item.name,
                item.size,
                item.modified.unwrap_or_else(Utc::now),
            )
        };

        let mut inode = match inode {
            Ok(inode) => inode,
            Err(e) => {
                warn!(id = %item.id, error = %e, "delta create carried an invalid name");
                return Applied::Done;
            }
        };
        inode.set_remote_hash(item.hash.clone());
        inode.set_etag(item.etag.clone());
        inode.set_child_count(item.child_count);

        match self.graph.insert(inode) {
            Ok(()) => Applied::Done,
            Err(e) => {
                warn!(id = %item.id, error = %e, "delta create rejected by graph");
                Applied::Done
            }
        }
    }

    fn apply_update(&self, item: &RemoteItem, existing: Inode) -> Applied {
        // Remote rename/move is absorbed for clean and dirty items alike.
        let wants_move = item
            .parent_id
            .as_ref()
            .map(|p| self.graph.resolve(p) != self.graph.resolve(existing.parent().unwrap_or(p)))
            .unwrap_or(false);
        let wants_rename = item.name != existing.name();
        if wants_move || wants_rename {
            if let Some(parent) = item.parent_id.clone() {
                if !self.graph.contains(&parent) {
                    return Applied::Deferred;
                }
                if let Err(e) = self.graph.rename(&item.id, &parent, &item.name) {
                    warn!(id = %item.id, error = %e, "remote rename could not be applied");
                }
            }
        }

        if existing.has_changes() {
            // Local-wins: absorb non-content metadata, preserve the
            // dirty body and the pending upload.
            let result = self.graph.update(&item.id, |i| {
                i.set_etag(item.etag.clone());
                i.set_child_count(item.child_count);
                Ok(())
            });
            if let Err(e) = result {
                warn!(id = %item.id, error = %e, "local-wins metadata update failed");
            }
            return Applied::Done;
        }

        // Hash equality decides whether content moved. A record with no
        // hash is treated as content-unchanged and leaves the recorded
        // hash alone.
        let content_changed = match (&item.hash, existing.remote_hash()) {
            (Some(new), Some(old)) => new != old,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if content_changed {
            if let Err(e) = self.bodies.delete(&item.id) {
                warn!(id = %item.id, error = %e, "failed to evict outdated body");
            }
        }

        let result = self.graph.update(&item.id, |i| {
            i.set_etag(item.etag.clone());
            i.set_child_count(item.child_count);
            if content_changed {
                i.set_remote_hash(item.hash.clone());
                i.set_size(item.size);
                if let Some(modified) = item.modified {
                    i.set_mtime(modified);
                }
                if *i.state() == ItemState::Hydrated {
                    i.transition_to(ItemState::Ghost)?;
                }
            }
            // Content unchanged: mtime deliberately untouched.
            Ok(())
        });
        if let Err(e) = result {
            warn!(id = %item.id, error = %e, "delta update failed");
        }
        Applied::Done
    }

    /// Ids still waiting in the requeue buffer (diagnostics).
    pub fn requeued_len(&self) -> usize {
        self.requeued.lock().expect("requeue lock poisoned").len()
    }

    /// Applies a batch of records directly, outside the polling cadence.
    pub fn absorb(&self, items: Vec<RemoteItem>) -> usize {
        self.apply_batch(items)
    }
}
