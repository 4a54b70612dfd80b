//! SQLite-backed metadata store.
//!
//! Persists the inode graph, the offline-change log, upload-session
//! checkpoints, and the delta link. All writes are small transactions;
//! nothing holds a transaction across a network call.
//!
//! ## Type mapping
//!
//! | Domain type      | SQL      | Strategy                                 |
//! |------------------|----------|------------------------------------------|
//! | ItemId, ETag     | TEXT     | raw string                               |
//! | ContentHash      | TEXT     | Base64 string                            |
//! | DateTime<Utc>    | TEXT     | RFC 3339                                 |
//! | ItemState        | TEXT     | `ghost` … / `error:<msg>`                |
//! | ItemKind         | TEXT     | `file` / `directory`                     |
//! | ChangeOp         | TEXT     | serde_json                               |
//!
//! Virtual inodes are never persisted; they are regenerated at mount.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use nimbus_core::domain::change::{ChangeOp, ChangeRecord};
use nimbus_core::domain::ids::{DeltaLink, ItemId};
use nimbus_core::domain::item::{Inode, ItemKind, ItemState};

use crate::StoreError;

/// Key in the `meta` bucket holding the delta link.
const META_DELTA_LINK: &str = "delta_link";

/// Resumable upload checkpoint, interrogated after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCheckpoint {
    pub item_id: ItemId,
    pub upload_url: String,
    pub total_size: u64,
    pub next_offset: u64,
    pub expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The metadata store over `metadata.db`.
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Inode bucket
    // ========================================================================

    /// Inserts or replaces one inode row.
    ///
    /// Virtual inodes are skipped: their bytes live in memory only.
    pub async fn save_inode(&self, inode: &Inode) -> Result<(), StoreError> {
        if inode.is_virtual() {
            return Ok(());
        }

        sqlx::query(
            "INSERT OR REPLACE INTO inodes \
             (id, parent_id, name, kind, mode, size, mtime, remote_hash, local_hash, \
              etag, state, has_changes, pending_remote, children_loaded, child_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(inode.id().as_str())
        .bind(inode.parent().map(|p| p.as_str().to_string()))
        .bind(inode.name())
        .bind(kind_to_string(inode.kind()))
        .bind(inode.mode() as i64)
        .bind(inode.size() as i64)
        .bind(inode.mtime().to_rfc3339())
        .bind(inode.remote_hash().map(|h| h.as_str().to_string()))
        .bind(inode.local_hash().map(|h| h.as_str().to_string()))
        .bind(inode.etag().map(|e| e.as_str().to_string()))
        .bind(state_to_string(inode.state()))
        .bind(inode.has_changes() as i64)
        .bind(inode.pending_remote() as i64)
        .bind(inode.children_loaded() as i64)
        .bind(inode.child_count().map(|c| c as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads every persisted inode for the startup replay.
    ///
    /// Ordering is unspecified; the graph defers orphans and re-links
    /// them after one full pass.
    pub async fn load_all_inodes(&self) -> Result<Vec<Inode>, StoreError> {
        let rows = sqlx::query("SELECT * FROM inodes")
            .fetch_all(&self.pool)
            .await?;
        let mut inodes = Vec::with_capacity(rows.len());
        for row in &rows {
            inodes.push(inode_from_row(row)?);
        }
        debug!(count = inodes.len(), "inode replay loaded");
        Ok(inodes)
    }

    /// Deletes one inode row.
    pub async fn delete_inode(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inodes WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrites a local id to its server-issued id everywhere at once:
    /// the inode row, children referencing it as parent, pending offline
    /// changes, and any upload-session checkpoint.
    pub async fn rewrite_id(&self, old: &ItemId, new: &ItemId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE inodes SET id = ? WHERE id = ?")
            .bind(new.as_str())
            .bind(old.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE inodes SET parent_id = ? WHERE parent_id = ?")
            .bind(new.as_str())
            .bind(old.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE offline_changes SET target_id = ? WHERE target_id = ?")
            .bind(new.as_str())
            .bind(old.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE upload_sessions SET item_id = ? WHERE item_id = ?")
            .bind(new.as_str())
            .bind(old.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(old = %old, new = %new, "id rewritten in store");
        Ok(())
    }

    // ========================================================================
    // Offline-change bucket
    // ========================================================================

    /// Appends a change and returns its assigned sequence number.
    pub async fn append_change(
        &self,
        target: &ItemId,
        op: &ChangeOp,
    ) -> Result<u64, StoreError> {
        let op_json =
            serde_json::to_string(op).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO offline_changes (target_id, op, recorded_at) VALUES (?, ?, ?)",
        )
        .bind(target.as_str())
        .bind(op_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid() as u64)
    }

    /// All pending changes in global sequence order.
    pub async fn list_changes(&self) -> Result<Vec<ChangeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM offline_changes ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(change_from_row).collect()
    }

    /// Pending changes for one target, in sequence order.
    pub async fn changes_for(&self, target: &ItemId) -> Result<Vec<ChangeRecord>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM offline_changes WHERE target_id = ? ORDER BY seq ASC")
                .bind(target.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(change_from_row).collect()
    }

    /// Removes one drained change.
    pub async fn remove_change(&self, seq: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM offline_changes WHERE seq = ?")
            .bind(seq as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes every change for a target (after its upload committed).
    pub async fn remove_changes_for(&self, target: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM offline_changes WHERE target_id = ?")
            .bind(target.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Upload-session bucket
    // ========================================================================

    /// Saves (or replaces) a session checkpoint.
    pub async fn save_session(&self, checkpoint: &SessionCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO upload_sessions \
             (item_id, upload_url, total_size, next_offset, expires, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(checkpoint.item_id.as_str())
        .bind(&checkpoint.upload_url)
        .bind(checkpoint.total_size as i64)
        .bind(checkpoint.next_offset as i64)
        .bind(checkpoint.expires.map(|t| t.to_rfc3339()))
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads the checkpoint for an item, if one survives.
    pub async fn load_session(
        &self,
        item_id: &ItemId,
    ) -> Result<Option<SessionCheckpoint>, StoreError> {
        let row = sqlx::query("SELECT * FROM upload_sessions WHERE item_id = ?")
            .bind(item_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    /// Drops a committed or abandoned checkpoint.
    pub async fn delete_session(&self, item_id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM upload_sessions WHERE item_id = ?")
            .bind(item_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Meta bucket
    // ========================================================================

    /// Persists the delta link after a successfully applied batch.
    pub async fn set_delta_link(&self, link: &DeltaLink) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
            .bind(META_DELTA_LINK)
            .bind(link.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The stored delta link, if any.
    pub async fn delta_link(&self) -> Result<Option<DeltaLink>, StoreError> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?")
            .bind(META_DELTA_LINK)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| DeltaLink::new(r.get::<String, _>("value"))))
    }

    /// Generic meta value access (config blob, principal name).
    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn kind_to_string(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::File => "file",
        ItemKind::Directory => "directory",
        ItemKind::Virtual => "virtual",
    }
}

fn state_to_string(state: &ItemState) -> String {
    match state {
        ItemState::Ghost => "ghost".to_string(),
        ItemState::Hydrating => "hydrating".to_string(),
        ItemState::Hydrated => "hydrated".to_string(),
        ItemState::DirtyLocal => "dirty".to_string(),
        ItemState::Error(msg) => format!("error:{}", msg),
    }
}

fn state_to_json(s: &str) -> Result<serde_json::Value, StoreError> {
    Ok(match s {
        "ghost" => serde_json::json!("ghost"),
        "hydrating" => serde_json::json!("hydrating"),
        "hydrated" => serde_json::json!("hydrated"),
        "dirty" => serde_json::json!("dirty_local"),
        s if s.starts_with("error:") => serde_json::json!({ "error": &s[6..] }),
        other => {
            return Err(StoreError::Serialization(format!(
                "unknown item state: {other}"
            )))
        }
    })
}

/// Reconstructs an [`Inode`] from a row via its serde representation,
/// since the entity keeps its fields private.
fn inode_from_row(row: &SqliteRow) -> Result<Inode, StoreError> {
    let state_str: String = row.get("state");
    let kind_str: String = row.get("kind");
    let kind_json = match kind_str.as_str() {
        "file" => "file",
        "directory" => "directory",
        "virtual" => "virtual",
        other => {
            return Err(StoreError::Serialization(format!(
                "unknown item kind: {other}"
            )))
        }
    };

    let value = serde_json::json!({
        "id": row.get::<String, _>("id"),
        "parent": row.get::<Option<String>, _>("parent_id"),
        "name": row.get::<String, _>("name"),
        "kind": kind_json,
        "mode": row.get::<i64, _>("mode") as u32,
        "size": row.get::<i64, _>("size") as u64,
        "mtime": row.get::<String, _>("mtime"),
        "remote_hash": row.get::<Option<String>, _>("remote_hash"),
        "local_hash": row.get::<Option<String>, _>("local_hash"),
        "etag": row.get::<Option<String>, _>("etag"),
        "state": state_to_json(&state_str)?,
        "has_changes": row.get::<i64, _>("has_changes") != 0,
        "pending_remote": row.get::<i64, _>("pending_remote") != 0,
        "children_loaded": row.get::<i64, _>("children_loaded") != 0,
        "child_count": row.get::<Option<i64>, _>("child_count"),
    });

    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn change_from_row(row: &SqliteRow) -> Result<ChangeRecord, StoreError> {
    let op_json: String = row.get("op");
    let op: ChangeOp =
        serde_json::from_str(&op_json).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let target = ItemId::new(row.get::<String, _>("target_id"))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let recorded_at = parse_datetime(&row.get::<String, _>("recorded_at"))?;
    Ok(ChangeRecord {
        seq: row.get::<i64, _>("seq") as u64,
        target,
        op,
        recorded_at,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionCheckpoint, StoreError> {
    let item_id = ItemId::new(row.get::<String, _>("item_id"))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let expires = row
        .get::<Option<String>, _>("expires")
        .map(|s| parse_datetime(&s))
        .transpose()?;
    Ok(SessionCheckpoint {
        item_id,
        upload_url: row.get("upload_url"),
        total_size: row.get::<i64, _>("total_size") as u64,
        next_offset: row.get::<i64, _>("next_offset") as u64,
        expires,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
    })
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad datetime '{s}': {e}")))
}
