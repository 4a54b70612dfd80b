//! Offline mutation log and drain.
//!
//! Mutations accepted while the connectivity oracle reports offline are
//! durably appended (through the metadata store) with a monotonic
//! sequence number. When connectivity returns, the drain replays the
//! log in sequence order through the normal upload/metadata paths.
//!
//! Conflict policy during drain: content is local-wins (the write is
//! replayed even when the remote ETag moved), while metadata conflicts
//! (rename target exists) are resolved by appending a disambiguating
//! suffix.

use std::sync::Arc;

use nimbus_core::domain::change::{ChangeOp, ChangeRecord};
use nimbus_core::domain::ids::ItemId;
use nimbus_core::ports::remote::{CloudProvider, MetadataPatch, RemoteErrorKind};
use nimbus_store::MetadataStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::VfsError;
use crate::oracle::ConnectivityOracle;
use crate::tree::InodeGraph;
use crate::upload::{UploadManager, UploadPriority};

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub dropped: usize,
    /// Records left for the next pass after a connectivity abort.
    pub remaining: usize,
}

/// The durable queue of deferred local mutations.
pub struct OfflineLog {
    meta: Arc<MetadataStore>,
    graph: Arc<InodeGraph>,
    provider: Arc<dyn CloudProvider>,
    uploads: Arc<UploadManager>,
    oracle: Arc<ConnectivityOracle>,
    /// Drainers take exclusive access for the duration of one pass.
    drain_lock: Mutex<()>,
}

impl OfflineLog {
    pub fn new(
        meta: Arc<MetadataStore>,
        graph: Arc<InodeGraph>,
        provider: Arc<dyn CloudProvider>,
        uploads: Arc<UploadManager>,
        oracle: Arc<ConnectivityOracle>,
    ) -> Self {
        Self {
            meta,
            graph,
            provider,
            uploads,
            oracle,
            drain_lock: Mutex::new(()),
        }
    }

    /// Durably appends one deferred mutation.
    pub async fn log(&self, target: &ItemId, op: ChangeOp) -> Result<u64, VfsError> {
        let seq = self.meta.append_change(target, &op).await?;
        debug!(target = %target, op = op.name(), seq, "mutation deferred to offline log");
        Ok(seq)
    }

    /// Number of records waiting.
    pub async fn pending(&self) -> Result<usize, VfsError> {
        Ok(self.meta.list_changes().await?.len())
    }

    /// Replays the log in sequence order.
    ///
    /// Re-draining after a crash mid-drain is safe: every record is
    /// removed only after its replay committed, so a repeat run replays
    /// the same tail and converges to the same server state.
    pub async fn drain(&self) -> Result<DrainReport, VfsError> {
        let _guard = self.drain_lock.lock().await;
        let records = self.meta.list_changes().await?;
        let total = records.len();
        let mut report = DrainReport::default();

        if total > 0 {
            info!(pending = total, "draining offline log");
        }

        for record in records {
            if !self.oracle.is_online() {
                report.remaining = total - report.replayed - report.dropped;
                warn!(remaining = report.remaining, "drain aborted: connectivity lost");
                break;
            }
            match self.replay(&record).await {
                Ok(true) => {
                    self.meta.remove_change(record.seq).await?;
                    report.replayed += 1;
                }
                Ok(false) => {
                    // Target unresolvable or permanently rejected: the
                    // record is dead weight and is dropped.
                    self.meta.remove_change(record.seq).await?;
                    report.dropped += 1;
                }
                Err(e) if e.is_connectivity() => {
                    report.remaining = total - report.replayed - report.dropped;
                    warn!(remaining = report.remaining, error = %e, "drain paused on connectivity error");
                    break;
                }
                Err(e) => {
                    warn!(seq = record.seq, error = %e, "replay failed, dropping record");
                    self.meta.remove_change(record.seq).await?;
                    report.dropped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Replays one record. Ok(true) = committed, Ok(false) = dropped.
    async fn replay(&self, record: &ChangeRecord) -> Result<bool, VfsError> {
        // The target may have been renamed or adopted since logging.
        let target = self.graph.resolve(&record.target);

        match &record.op {
            ChangeOp::Delete => {
                // The inode is already gone locally; the record carries
                // everything needed.
                match self.provider.delete_item(&target).await {
                    Ok(()) => {
                        self.oracle.record_success();
                        Ok(true)
                    }
                    Err(e) if e.kind() == RemoteErrorKind::NotFound => Ok(true),
                    Err(e) if e.kind() == RemoteErrorKind::Conflict => {
                        // Directory refilled remotely; the local
                        // deletion stands, the remote copy survives.
                        warn!(target = %target, "remote delete rejected (not empty); keeping remote copy");
                        Ok(false)
                    }
                    Err(e) => {
                        self.oracle.record_failure(e.kind());
                        Err(e.into())
                    }
                }
            }

            ChangeOp::Write | ChangeOp::Create { .. } => {
                if self.graph.get(&target).is_none() {
                    warn!(target = %target, "deferred write targets a vanished inode, dropping");
                    return Ok(false);
                }
                self.uploads.enqueue(&target, UploadPriority::Background);
                match self.uploads.wait_for(&target).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_connectivity() => Err(e),
                    Err(e) => {
                        warn!(target = %target, error = %e, "deferred upload failed");
                        Ok(false)
                    }
                }
            }

            ChangeOp::Mkdir { parent, name } => {
                if !target.is_local() {
                    // A previous drain already committed this mkdir.
                    return Ok(true);
                }
                let parent = self.graph.resolve(parent);
                if parent.is_local() {
                    // The parent's own mkdir record precedes this one in
                    // sequence order; if it failed, this one cannot land.
                    warn!(target = %target, "mkdir parent still local, dropping record");
                    return Ok(false);
                }
                match self.provider.create_folder(&parent, name).await {
                    Ok(remote) => {
                        self.oracle.record_success();
                        self.graph.adopt_server_id(&target, remote.id)?;
                        Ok(true)
                    }
                    Err(e) if e.kind() == RemoteErrorKind::Conflict => {
                        // The folder exists remotely; adopt it.
                        self.adopt_existing_folder(&target).await
                    }
                    Err(e) => {
                        self.oracle.record_failure(e.kind());
                        Err(e.into())
                    }
                }
            }

            ChangeOp::Rename {
                new_parent,
                new_name,
            } => {
                let new_parent = self.graph.resolve(new_parent);
                let patch = MetadataPatch {
                    name: Some(new_name.clone()),
                    parent_id: Some(new_parent.clone()),
                    mtime: None,
                };
                match self.provider.patch_metadata(&target, &patch).await {
                    Ok(_) => {
                        self.oracle.record_success();
                        Ok(true)
                    }
                    Err(e) if e.kind() == RemoteErrorKind::Conflict => {
                        // Rename target exists remotely: disambiguate.
                        let fallback = disambiguate(new_name);
                        info!(target = %target, name = %fallback, "rename conflict, using suffixed name");
                        let patch = MetadataPatch {
                            name: Some(fallback.clone()),
                            parent_id: Some(new_parent.clone()),
                            mtime: None,
                        };
                        self.provider.patch_metadata(&target, &patch).await?;
                        if let Err(e) = self.graph.rename(&target, &new_parent, &fallback) {
                            warn!(target = %target, error = %e, "could not mirror suffixed rename locally");
                        }
                        Ok(true)
                    }
                    Err(e) if e.kind() == RemoteErrorKind::NotFound => {
                        warn!(target = %target, "rename target unknown to server, dropping");
                        Ok(false)
                    }
                    Err(e) => {
                        self.oracle.record_failure(e.kind());
                        Err(e.into())
                    }
                }
            }

            // Mode bits and user xattrs are local-only state; the
            // record exists purely to keep per-target ordering intact.
            ChangeOp::Chmod { .. } | ChangeOp::SetXattr { .. } => Ok(true),
        }
    }

    /// Adopts a folder that already exists remotely under the same path.
    async fn adopt_existing_folder(&self, local: &ItemId) -> Result<bool, VfsError> {
        let Some(path) = self.graph.path_of(local) else {
            return Ok(false);
        };
        match self.provider.get_item_by_path(&path).await {
            Ok(remote) if remote.is_directory => {
                self.oracle.record_success();
                self.graph.adopt_server_id(local, remote.id)?;
                Ok(true)
            }
            Ok(_) => {
                warn!(path = %path, "path occupied by a file remotely, dropping mkdir");
                Ok(false)
            }
            Err(e) => {
                self.oracle.record_failure(e.kind());
                Err(e.into())
            }
        }
    }
}

/// Appends a ` (1)`-style suffix before the extension.
fn disambiguate(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} (1).{ext}"),
        _ => format!("{name} (1)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disambiguate() {
        assert_eq!(disambiguate("report.txt"), "report (1).txt");
        assert_eq!(disambiguate("Makefile"), "Makefile (1)");
        assert_eq!(disambiguate(".hidden"), ".hidden (1)");
        assert_eq!(disambiguate("a.b.c"), "a.b (1).c");
    }
}
