//! Wire DTOs for the Graph API.
//!
//! JSON shapes for the DriveItem resource and its facets, plus the
//! conversion into the port-level [`RemoteItem`]. Fields are optional
//! wherever the API omits them: tombstones lack timestamps, folders lack
//! hashes, and some file responses omit the hash facet entirely — a
//! missing hash is tolerated everywhere downstream.

use chrono::{DateTime, Utc};
use nimbus_core::domain::ids::{ContentHash, ETag, ItemId};
use nimbus_core::ports::remote::{RemoteError, RemoteItem};
use serde::Deserialize;

/// A DriveItem as returned by item, children, upload and delta calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItemWire {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub size: Option<u64>,
    pub e_tag: Option<String>,
    pub last_modified_date_time: Option<DateTime<Utc>>,
    pub parent_reference: Option<ParentReferenceWire>,
    pub file: Option<FileFacetWire>,
    pub folder: Option<FolderFacetWire>,
    pub deleted: Option<DeletedFacetWire>,
    pub root: Option<serde_json::Value>,
}

/// Parent folder reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReferenceWire {
    pub id: Option<String>,
    #[allow(dead_code)]
    pub path: Option<String>,
}

/// File facet; presence marks the item as a file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileFacetWire {
    pub hashes: Option<HashesWire>,
}

/// Content hashes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashesWire {
    pub quick_xor_hash: Option<String>,
    #[allow(dead_code)]
    pub sha1_hash: Option<String>,
    #[allow(dead_code)]
    pub sha256_hash: Option<String>,
}

/// Folder facet; presence marks the item as a folder.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacetWire {
    pub child_count: Option<u64>,
}

/// Deleted facet; presence marks a tombstone.
#[derive(Debug, Clone, Deserialize)]
pub struct DeletedFacetWire {
    #[allow(dead_code)]
    pub state: Option<String>,
}

impl DriveItemWire {
    /// Converts the wire shape into the port DTO.
    pub fn into_remote_item(self) -> Result<RemoteItem, RemoteError> {
        let id = ItemId::new(self.id)
            .map_err(|e| RemoteError::fatal(format!("item with invalid id: {e}")))?;

        // The drive root carries a `root` facet and no usable parent.
        let parent_id = if self.root.is_some() {
            None
        } else {
            self.parent_reference
                .as_ref()
                .and_then(|p| p.id.as_deref())
                .and_then(|p| ItemId::new(p).ok())
        };

        // An unparseable hash is treated as absent rather than failing
        // the whole delta batch.
        let hash = self
            .file
            .as_ref()
            .and_then(|f| f.hashes.as_ref())
            .and_then(|h| h.quick_xor_hash.as_deref())
            .and_then(|h| ContentHash::new(h).ok());

        Ok(RemoteItem {
            id,
            name: self.name,
            parent_id,
            size: self.size.unwrap_or(0),
            is_directory: self.folder.is_some(),
            is_deleted: self.deleted.is_some(),
            hash,
            etag: self.e_tag.map(ETag::new),
            modified: self.last_modified_date_time,
            child_count: self.folder.as_ref().and_then(|f| f.child_count),
        })
    }
}

/// Paged collection envelope (children listings, delta batches).
#[derive(Debug, Deserialize)]
pub struct CollectionWire {
    #[serde(default)]
    pub value: Vec<DriveItemWire>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

/// Response to createUploadSession.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionWire {
    pub upload_url: String,
    pub expiration_date_time: Option<DateTime<Utc>>,
}

/// Session status (intermediate chunk ack or status poll).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusWire {
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

impl SessionStatusWire {
    /// Lowest next-expected byte, or `None` for a drained session.
    pub fn next_expected_byte(&self) -> Option<u64> {
        self.next_expected_ranges
            .iter()
            .filter_map(|r| r.split('-').next())
            .filter_map(|s| s.parse::<u64>().ok())
            .min()
    }
}

/// `/me` profile response, reduced to the principal name.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileWire {
    pub user_principal_name: Option<String>,
    pub mail: Option<String>,
    pub display_name: Option<String>,
}

impl ProfileWire {
    /// Principal name with sensible fallbacks.
    pub fn principal(&self) -> String {
        self.user_principal_name
            .clone()
            .or_else(|| self.mail.clone())
            .or_else(|| self.display_name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_item_parsing() {
        let json = r#"{
            "id": "01FILE",
            "name": "report.pdf",
            "size": 2048,
            "eTag": "\"{AAA},2\"",
            "lastModifiedDateTime": "2026-01-04T10:00:00Z",
            "parentReference": {"id": "01PARENT", "path": "/drive/root:/Documents"},
            "file": {"hashes": {"quickXorHash": "ZJEhu8FQU+eZa8AOrk1tYVDENJc="}}
        }"#;
        let wire: DriveItemWire = serde_json::from_str(json).unwrap();
        let item = wire.into_remote_item().unwrap();

        assert_eq!(item.id.as_str(), "01FILE");
        assert_eq!(item.name, "report.pdf");
        assert_eq!(item.size, 2048);
        assert!(!item.is_directory);
        assert!(!item.is_deleted);
        assert_eq!(item.parent_id.unwrap().as_str(), "01PARENT");
        assert_eq!(item.hash.unwrap().as_str(), "ZJEhu8FQU+eZa8AOrk1tYVDENJc=");
        assert!(item.modified.is_some());
    }

    #[test]
    fn test_folder_item_parsing() {
        let json = r#"{
            "id": "01DIR",
            "name": "Documents",
            "parentReference": {"id": "01ROOT"},
            "folder": {"childCount": 12}
        }"#;
        let item: RemoteItem = serde_json::from_str::<DriveItemWire>(json)
            .unwrap()
            .into_remote_item()
            .unwrap();
        assert!(item.is_directory);
        assert_eq!(item.child_count, Some(12));
        assert!(item.hash.is_none());
    }

    #[test]
    fn test_tombstone_parsing() {
        let json = r#"{
            "id": "01GONE",
            "name": "old.txt",
            "parentReference": {"id": "01DIR"},
            "deleted": {"state": "deleted"}
        }"#;
        let item = serde_json::from_str::<DriveItemWire>(json)
            .unwrap()
            .into_remote_item()
            .unwrap();
        assert!(item.is_deleted);
        assert!(item.modified.is_none());
    }

    #[test]
    fn test_missing_hash_tolerated() {
        let json = r#"{"id": "01F", "name": "f", "file": {}}"#;
        let item = serde_json::from_str::<DriveItemWire>(json)
            .unwrap()
            .into_remote_item()
            .unwrap();
        assert!(item.hash.is_none());
        assert!(!item.is_directory);
    }

    #[test]
    fn test_root_has_no_parent() {
        let json = r#"{
            "id": "01ROOT",
            "name": "root",
            "root": {},
            "folder": {"childCount": 3},
            "parentReference": {"id": "driveid"}
        }"#;
        let item = serde_json::from_str::<DriveItemWire>(json)
            .unwrap()
            .into_remote_item()
            .unwrap();
        assert!(item.parent_id.is_none());
    }

    #[test]
    fn test_collection_links() {
        let json = r#"{
            "value": [],
            "@odata.deltaLink": "https://graph.microsoft.com/v1.0/me/drive/root/delta?token=T"
        }"#;
        let page: CollectionWire = serde_json::from_str(json).unwrap();
        assert!(page.next_link.is_none());
        assert!(page.delta_link.unwrap().ends_with("token=T"));
    }

    #[test]
    fn test_next_expected_byte() {
        let status = SessionStatusWire {
            next_expected_ranges: vec!["26214400-".to_string()],
        };
        assert_eq!(status.next_expected_byte(), Some(26_214_400));

        let drained = SessionStatusWire {
            next_expected_ranges: vec![],
        };
        assert_eq!(drained.next_expected_byte(), None);
    }

    #[test]
    fn test_profile_fallbacks() {
        let p: ProfileWire =
            serde_json::from_str(r#"{"userPrincipalName": "ada@example.com"}"#).unwrap();
        assert_eq!(p.principal(), "ada@example.com");

        let p: ProfileWire = serde_json::from_str(r#"{"mail": "bob@example.com"}"#).unwrap();
        assert_eq!(p.principal(), "bob@example.com");

        let p: ProfileWire = serde_json::from_str("{}").unwrap();
        assert_eq!(p.principal(), "unknown");
    }
}
