//! Virtual filesystem engine for NimbusFS.
//!
//! Wires the inode graph, content cache, download and upload managers,
//! delta loop and offline log into one engine the FUSE bridge drives.
//! Background components run as long-lived tokio tasks with explicit
//! start/stop handles ([`VfsTasks`]).

pub mod content;
pub mod delta;
pub mod download;
pub mod error;
pub mod offline;
pub mod oracle;
pub mod persist;
pub mod tree;
pub mod upload;
pub mod volume;

#[cfg(test)]
pub(crate) mod testutil;

use std::path::Path;
use std::sync::Arc;

use nimbus_core::config::Config;
use nimbus_core::domain::ids::ItemId;
use nimbus_core::domain::item::{Inode, ItemState};
use nimbus_core::ports::remote::{CloudProvider, RemoteItem};
use nimbus_store::{BodyStore, DatabasePool, MetadataStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use content::ContentCache;
pub use delta::{ActivityTracker, DeltaLoop};
pub use download::{DownloadManager, DownloadPriority, FetchHandle};
pub use error::VfsError;
pub use offline::{DrainReport, OfflineLog};
pub use oracle::{ConnectivityOracle, ConnectivityState};
pub use persist::{PersistHandle, PersistWriter};
pub use tree::InodeGraph;
pub use upload::{UploadManager, UploadPriority, UploadState};
pub use volume::VOLUME_INFO_NAME;

/// Meta-bucket keys.
const META_ROOT_ID: &str = "root_id";
const META_PRINCIPAL: &str = "principal";

/// The assembled engine.
pub struct Vfs {
    pub graph: Arc<InodeGraph>,
    pub cache: Arc<ContentCache>,
    pub downloads: Arc<DownloadManager>,
    pub uploads: Arc<UploadManager>,
    pub offline: Arc<OfflineLog>,
    pub delta: Arc<DeltaLoop>,
    pub oracle: Arc<ConnectivityOracle>,
    pub activity: Arc<ActivityTracker>,
    pub meta: Arc<MetadataStore>,
    pub bodies: Arc<BodyStore>,
    provider: Arc<dyn CloudProvider>,
}

/// Stop handles for the background tasks.
pub struct VfsTasks {
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl VfsTasks {
    /// Cancels every background task and waits for them to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Vfs {
    /// Builds the engine, replays persisted state, and starts the
    /// background tasks.
    pub async fn bootstrap(
        config: Config,
        provider: Arc<dyn CloudProvider>,
        pool: &DatabasePool,
        cache_dir: &Path,
        oracle: Arc<ConnectivityOracle>,
    ) -> Result<(Arc<Vfs>, VfsTasks), VfsError> {
        let meta = Arc::new(MetadataStore::new(pool.pool().clone()));
        let bodies = Arc::new(BodyStore::new(cache_dir)?);

        // Root id: the stored one wins so offline mounts work; first
        // mount fetches it from the remote.
        let root_id = match meta.meta(META_ROOT_ID).await? {
            Some(id) => ItemId::new(id)?,
            None => {
                let root = provider.get_item_by_path("/").await?;
                meta.set_meta(META_ROOT_ID, root.id.as_str()).await?;
                root.id
            }
        };

        let (writer, persist) = PersistWriter::new(MetadataStore::new(pool.pool().clone()));
        // The writer drains and stops once the graph (last handle) drops.
        tokio::spawn(writer.run());

        let graph = Arc::new(InodeGraph::new(root_id.clone(), persist));

        // Startup replay with crash recovery: partial bodies behind
        // stale Hydrating states are discarded before the reset.
        let replayed = meta.load_all_inodes().await?;
        for inode in &replayed {
            if *inode.state() == ItemState::Hydrating {
                debug!(id = %inode.id(), "discarding partial body from crashed hydration");
                let _ = bodies.delete(inode.id());
            }
        }
        let restored = graph.replay(replayed);
        info!(restored, "inode graph restored from metadata store");

        // Volume info from the account principal; cached for offline
        // mounts.
        let principal = match meta.meta(META_PRINCIPAL).await? {
            Some(cached) => cached,
            None => match provider.principal_name().await {
                Ok(principal) => {
                    meta.set_meta(META_PRINCIPAL, &principal).await?;
                    principal
                }
                Err(e) => {
                    warn!(error = %e, "principal unavailable, using placeholder");
                    "unknown".to_string()
                }
            },
        };
        let volume = volume::volume_info_inode(root_id, &principal)?;
        if let Err(e) = graph.insert(volume) {
            warn!(error = %e, "volume-info inode could not be inserted");
        }

        let activity = Arc::new(ActivityTracker::new());
        let downloads = Arc::new(DownloadManager::new(
            Arc::clone(&provider),
            Arc::clone(&bodies),
            Arc::clone(&graph),
            Arc::clone(&oracle),
            config.transfer.clone(),
        ));
        let cache = Arc::new(ContentCache::new(
            Arc::clone(&graph),
            Arc::clone(&bodies),
            Arc::clone(&downloads),
            Arc::clone(&oracle),
            config.cache.clone(),
        ));
        let uploads = Arc::new(UploadManager::new(
            Arc::clone(&provider),
            Arc::clone(&graph),
            Arc::clone(&bodies),
            Arc::clone(&cache),
            Arc::clone(&meta),
            Arc::clone(&oracle),
            config.transfer.clone(),
        ));
        let offline = Arc::new(OfflineLog::new(
            Arc::clone(&meta),
            Arc::clone(&graph),
            Arc::clone(&provider),
            Arc::clone(&uploads),
            Arc::clone(&oracle),
        ));
        let delta = Arc::new(DeltaLoop::new(
            Arc::clone(&provider),
            Arc::clone(&graph),
            Arc::clone(&bodies),
            Arc::clone(&meta),
            Arc::clone(&oracle),
            config.delta.clone(),
            Arc::clone(&activity),
        ));

        let vfs = Arc::new(Vfs {
            graph,
            cache,
            downloads,
            uploads: Arc::clone(&uploads),
            offline,
            delta: Arc::clone(&delta),
            oracle,
            activity,
            meta,
            bodies,
            provider,
        });

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            Arc::clone(&uploads).run_workers(config.transfer.upload_workers, cancel.clone()),
        ));
        handles.push(tokio::spawn(Arc::clone(&delta).run(cancel.clone())));
        handles.push(tokio::spawn(
            Arc::clone(&vfs.cache).run_sweeper(cancel.clone()),
        ));
        handles.push(tokio::spawn(reconnect_loop(
            Arc::clone(&vfs),
            cancel.clone(),
        )));

        Ok((vfs, VfsTasks { cancel, handles }))
    }

    /// Lazily loads a directory's children from the remote.
    ///
    /// Already-loaded directories return immediately. Offline, a loaded
    /// directory serves its cached listing and an unloaded one fails.
    pub async fn ensure_children_loaded(&self, dir: &ItemId) -> Result<(), VfsError> {
        let dir = self.graph.resolve(dir);
        let inode = self
            .graph
            .get(&dir)
            .ok_or_else(|| VfsError::NotFound(dir.to_string()))?;
        if !inode.is_directory() {
            return Ok(());
        }
        if inode.children_loaded() {
            return Ok(());
        }
        if dir.is_local() {
            // A directory created locally has exactly the children the
            // graph already knows.
            self.graph.update(&dir, |i| {
                i.set_children_loaded(true);
                Ok(())
            })?;
            return Ok(());
        }
        if !self.oracle.is_online() {
            return Err(VfsError::Offline(format!(
                "children of {} were never listed",
                inode.name()
            )));
        }

        let mut token: Option<String> = None;
        loop {
            let page = match self.provider.list_children(&dir, token.as_deref()).await {
                Ok(page) => {
                    self.oracle.record_success();
                    page
                }
                Err(e) => {
                    self.oracle.record_failure(e.kind());
                    return Err(e.into());
                }
            };
            for item in page.items {
                if self.graph.contains(&item.id) {
                    continue;
                }
                match remote_item_to_inode(&item) {
                    Ok(inode) => {
                        if let Err(e) = self.graph.insert(inode) {
                            warn!(id = %item.id, error = %e, "listing entry rejected by graph");
                        }
                    }
                    Err(e) => warn!(id = %item.id, error = %e, "listing entry invalid"),
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        self.graph.update(&dir, |i| {
            i.set_children_loaded(true);
            Ok(())
        })?;
        Ok(())
    }

    /// Eager breadth-first traversal of the whole tree (`--sync-tree`).
    pub async fn sync_tree(&self) -> Result<usize, VfsError> {
        let mut frontier = vec![self.graph.root_id().clone()];
        let mut visited = 0usize;
        while let Some(dir) = frontier.pop() {
            self.ensure_children_loaded(&dir).await?;
            visited += 1;
            for child in self.graph.children_of(&dir) {
                if child.is_directory() {
                    frontier.push(child.id().clone());
                }
            }
        }
        Ok(visited)
    }

    pub fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }
}

/// Converts a remote listing entry into a fresh inode.
fn remote_item_to_inode(item: &RemoteItem) -> Result<Inode, nimbus_core::domain::DomainError> {
    use chrono::Utc;
    let parent = item
        .parent_id
        .clone()
        .ok_or_else(|| nimbus_core::domain::DomainError::Validation(
            "listing entry without parent".to_string(),
        ))?;
    let mut inode = if item.is_directory {
        Inode::new_directory(
            item.id.clone(),
            Some(parent),
            &item.name,
            item.modified.unwrap_or_else(Utc::now),
        )?
    } else {
        Inode::new_file(
            item.id.clone(),
            parent,
            &item.name,
            item.size,
            item.modified.unwrap_or_else(Utc::now),
        )?
    };
    inode.set_remote_hash(item.hash.clone());
    inode.set_etag(item.etag.clone());
    inode.set_child_count(item.child_count);
    Ok(inode)
}

/// Drains the offline log and re-enqueues dirty inodes whenever the
/// oracle reports connectivity restored.
async fn reconnect_loop(vfs: Arc<Vfs>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = vfs.oracle.wait_for_reconnect() => {}
        }
        info!("connectivity restored: draining deferred mutations");
        match vfs.offline.drain().await {
            Ok(report) => {
                if report.replayed > 0 || report.dropped > 0 {
                    info!(
                        replayed = report.replayed,
                        dropped = report.dropped,
                        remaining = report.remaining,
                        "offline log drained"
                    );
                }
            }
            Err(e) => warn!(error = %e, "offline drain failed"),
        }
        for id in vfs.graph.dirty_ids() {
            vfs.uploads.enqueue(&id, UploadPriority::Background);
        }
    }
}
