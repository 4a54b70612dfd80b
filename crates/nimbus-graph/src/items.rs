//! Item metadata operations.

use nimbus_core::domain::ids::ItemId;
use nimbus_core::ports::remote::{ChildrenPage, MetadataPatch, RemoteError, RemoteItem};
use tracing::debug;

use crate::client::DriveClient;
use crate::wire::{CollectionWire, DriveItemWire};

/// Fetches item metadata by id.
pub async fn get_item(client: &DriveClient, id: &ItemId) -> Result<RemoteItem, RemoteError> {
    let url = client.url(&format!("/me/drive/items/{}", id.as_str()));
    let response = client
        .execute("get_item", |c, token| c.get(&url).bearer_auth(token))
        .await?;
    let wire: DriveItemWire = DriveClient::read_json("get_item", response).await?;
    wire.into_remote_item()
}

/// Fetches item metadata by drive-root-relative path (e.g. `/Documents/a.txt`).
pub async fn get_item_by_path(
    client: &DriveClient,
    path: &str,
) -> Result<RemoteItem, RemoteError> {
    let url = if path.is_empty() || path == "/" {
        client.url("/me/drive/root")
    } else {
        client.url(&format!("/me/drive/root:{}", path))
    };
    let response = client
        .execute("get_item_by_path", |c, token| c.get(&url).bearer_auth(token))
        .await?;
    let wire: DriveItemWire = DriveClient::read_json("get_item_by_path", response).await?;
    wire.into_remote_item()
}

/// Lists one page of a folder's children.
///
/// `page_token` is the absolute `@odata.nextLink` from the previous page.
pub async fn list_children(
    client: &DriveClient,
    id: &ItemId,
    page_token: Option<&str>,
) -> Result<ChildrenPage, RemoteError> {
    let url = match page_token {
        Some(link) => link.to_string(),
        None => client.url(&format!("/me/drive/items/{}/children", id.as_str())),
    };
    let response = client
        .execute("list_children", |c, token| c.get(&url).bearer_auth(token))
        .await?;
    let page: CollectionWire = DriveClient::read_json("list_children", response).await?;

    let mut items = Vec::with_capacity(page.value.len());
    for wire in page.value {
        items.push(wire.into_remote_item()?);
    }
    debug!(parent = %id, count = items.len(), more = page.next_link.is_some(), "children page");

    Ok(ChildrenPage {
        items,
        next_token: page.next_link,
    })
}

/// Creates a folder under `parent`.
pub async fn create_folder(
    client: &DriveClient,
    parent: &ItemId,
    name: &str,
) -> Result<RemoteItem, RemoteError> {
    let url = client.url(&format!("/me/drive/items/{}/children", parent.as_str()));
    let body = serde_json::json!({
        "name": name,
        "folder": {},
        "@microsoft.graph.conflictBehavior": "fail",
    });
    let response = client
        .execute("create_folder", |c, token| {
            c.post(&url).bearer_auth(token).json(&body)
        })
        .await?;
    let wire: DriveItemWire = DriveClient::read_json("create_folder", response).await?;
    wire.into_remote_item()
}

/// Patches name / parent / modified time on an item.
///
/// The modified time patch carries the client's timestamp through the
/// fileSystemInfo facet so editors probing mtimes see stable values.
pub async fn patch_metadata(
    client: &DriveClient,
    id: &ItemId,
    patch: &MetadataPatch,
) -> Result<RemoteItem, RemoteError> {
    let url = client.url(&format!("/me/drive/items/{}", id.as_str()));

    let mut body = serde_json::Map::new();
    if let Some(ref name) = patch.name {
        body.insert("name".to_string(), serde_json::json!(name));
    }
    if let Some(ref parent) = patch.parent_id {
        body.insert(
            "parentReference".to_string(),
            serde_json::json!({ "id": parent.as_str() }),
        );
    }
    if let Some(mtime) = patch.mtime {
        body.insert(
            "fileSystemInfo".to_string(),
            serde_json::json!({ "lastModifiedDateTime": mtime.to_rfc3339() }),
        );
    }
    let body = serde_json::Value::Object(body);

    let response = client
        .execute("patch_metadata", |c, token| {
            c.patch(&url).bearer_auth(token).json(&body)
        })
        .await?;
    let wire: DriveItemWire = DriveClient::read_json("patch_metadata", response).await?;
    wire.into_remote_item()
}

/// Deletes an item (moves it to the remote recycle bin).
pub async fn delete_item(client: &DriveClient, id: &ItemId) -> Result<(), RemoteError> {
    let url = client.url(&format!("/me/drive/items/{}", id.as_str()));
    client
        .execute("delete_item", |c, token| c.delete(&url).bearer_auth(token))
        .await?;
    Ok(())
}
