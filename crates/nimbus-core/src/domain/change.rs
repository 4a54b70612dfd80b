//! Offline-change records.
//!
//! Every mutation accepted while the connectivity oracle reports offline
//! (or after an online attempt failed permanently for a non-validation
//! reason) is appended to a durable log and replayed when connectivity
//! returns. Records are strictly ordered per target id by a monotonic
//! sequence number; ordering across targets is best-effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ItemId;

/// The mutation a deferred change carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// A file was created locally under `parent` with `name`.
    Create { parent: ItemId, name: String },
    /// A directory was created locally under `parent` with `name`.
    Mkdir { parent: ItemId, name: String },
    /// The body was modified; the bytes live in the body store.
    Write,
    /// Renamed and/or moved.
    Rename { new_parent: ItemId, new_name: String },
    /// Deleted locally.
    Delete,
    /// Mode bits changed (local-only, still logged for replay ordering).
    Chmod { mode: u32 },
    /// Extended attribute set in the user namespace.
    SetXattr { name: String, value: Vec<u8> },
}

impl ChangeOp {
    /// Short operation name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ChangeOp::Create { .. } => "create",
            ChangeOp::Mkdir { .. } => "mkdir",
            ChangeOp::Write => "write",
            ChangeOp::Rename { .. } => "rename",
            ChangeOp::Delete => "delete",
            ChangeOp::Chmod { .. } => "chmod",
            ChangeOp::SetXattr { .. } => "setxattr",
        }
    }
}

/// One durable entry in the offline log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonically increasing sequence number (assigned by the store).
    pub seq: u64,
    /// The inode the mutation targets. May be a `local-` id; the drain
    /// re-resolves through the alias table.
    pub target: ItemId,
    /// The deferred mutation.
    pub op: ChangeOp,
    /// Wall-clock time the mutation was accepted.
    pub recorded_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(seq: u64, target: ItemId, op: ChangeOp) -> Self {
        Self {
            seq,
            target,
            op,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_names() {
        let parent = ItemId::new("p").unwrap();
        assert_eq!(
            ChangeOp::Create {
                parent: parent.clone(),
                name: "f".to_string()
            }
            .name(),
            "create"
        );
        assert_eq!(ChangeOp::Write.name(), "write");
        assert_eq!(ChangeOp::Delete.name(), "delete");
        assert_eq!(ChangeOp::Chmod { mode: 0o600 }.name(), "chmod");
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let rec = ChangeRecord::new(
            7,
            ItemId::new("T1").unwrap(),
            ChangeOp::Rename {
                new_parent: ItemId::new("p2").unwrap(),
                new_name: "renamed.txt".to_string(),
            },
        );
        let json = serde_json::to_string(&rec).unwrap();
        let back: ChangeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
        assert!(json.contains("\"op\":\"rename\""));
    }

    #[test]
    fn test_sequence_ordering() {
        let t = ItemId::new("T1").unwrap();
        let a = ChangeRecord::new(1, t.clone(), ChangeOp::Write);
        let b = ChangeRecord::new(2, t, ChangeOp::Delete);
        assert!(a.seq < b.seq);
    }
}
