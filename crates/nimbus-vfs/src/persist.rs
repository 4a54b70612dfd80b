//! Write-behind persistence for the inode graph.
//!
//! The graph exposes only non-blocking operations, so database writes
//! are shipped over a channel to one writer task that applies them
//! sequentially. FUSE dispatch threads and async components can both
//! enqueue; nothing waits on the database while holding a graph lock.

use nimbus_core::domain::ids::ItemId;
use nimbus_core::domain::item::Inode;
use nimbus_store::MetadataStore;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// One persistence operation.
#[derive(Debug)]
pub enum PersistOp {
    /// Insert or replace an inode row.
    SaveInode(Box<Inode>),
    /// Remove an inode row.
    DeleteInode(ItemId),
    /// Rewrite a local id to its server id across all buckets.
    RewriteId { old: ItemId, new: ItemId },
}

/// Cloneable sender half. Enqueueing never blocks.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistHandle {
    pub fn save(&self, inode: &Inode) {
        self.send(PersistOp::SaveInode(Box::new(inode.clone())));
    }

    pub fn delete(&self, id: &ItemId) {
        self.send(PersistOp::DeleteInode(id.clone()));
    }

    pub fn rewrite_id(&self, old: &ItemId, new: &ItemId) {
        self.send(PersistOp::RewriteId {
            old: old.clone(),
            new: new.clone(),
        });
    }

    fn send(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            // Writer gone: only happens during shutdown, when the final
            // state has already been flushed.
            debug!("persist writer stopped; dropping write");
        }
    }

    /// A handle whose writes go nowhere (tests without a database).
    pub fn discard() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { tx }
    }
}

/// The writer task. Runs until every sender is dropped.
pub struct PersistWriter {
    rx: mpsc::UnboundedReceiver<PersistOp>,
    store: MetadataStore,
}

impl PersistWriter {
    /// Creates the writer and its handle.
    pub fn new(store: MetadataStore) -> (Self, PersistHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx, store }, PersistHandle { tx })
    }

    /// Applies operations in order until the channel closes.
    pub async fn run(mut self) {
        while let Some(op) = self.rx.recv().await {
            let result = match &op {
                PersistOp::SaveInode(inode) => self.store.save_inode(inode).await,
                PersistOp::DeleteInode(id) => self.store.delete_inode(id).await,
                PersistOp::RewriteId { old, new } => self.store.rewrite_id(old, new).await,
            };
            if let Err(e) = result {
                error!(?op, error = %e, "persist operation failed");
            }
        }
        debug!("persist writer drained and stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nimbus_store::DatabasePool;

    #[tokio::test]
    async fn test_write_behind_lands_in_store() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = MetadataStore::new(pool.pool().clone());
        let reader = MetadataStore::new(pool.pool().clone());

        let (writer, handle) = PersistWriter::new(store);
        let task = tokio::spawn(writer.run());

        let inode = Inode::new_file(
            ItemId::new("F1").unwrap(),
            ItemId::new("ROOT").unwrap(),
            "a.txt",
            1,
            Utc::now(),
        )
        .unwrap();
        handle.save(&inode);
        handle.delete(&ItemId::new("NEVER-EXISTED").unwrap());
        drop(handle);

        // Writer drains on channel close.
        task.await.unwrap();
        let loaded = reader.load_all_inodes().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name(), "a.txt");
    }
}
