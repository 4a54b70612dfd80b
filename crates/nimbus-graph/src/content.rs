//! Content transfer: ranged downloads and small-file uploads.

use std::ops::Range;

use nimbus_core::domain::ids::ItemId;
use nimbus_core::ports::remote::{RemoteError, RemoteItem};
use tracing::debug;

use crate::client::DriveClient;
use crate::wire::DriveItemWire;

/// Downloads content, optionally restricted to a byte window.
///
/// `GET /me/drive/items/{id}/content` follows the pre-authenticated
/// download redirect automatically (reqwest follows redirects by
/// default). A `range` turns into an HTTP Range header; the server
/// answers 206 with exactly that window.
pub async fn get_content(
    client: &DriveClient,
    id: &ItemId,
    range: Option<Range<u64>>,
) -> Result<Vec<u8>, RemoteError> {
    let url = client.url(&format!("/me/drive/items/{}/content", id.as_str()));

    let header = range
        .as_ref()
        .map(|r| format!("bytes={}-{}", r.start, r.end.saturating_sub(1)));

    let response = client
        .execute("get_content", |c, token| {
            let mut req = c.get(&url).bearer_auth(token);
            if let Some(ref h) = header {
                req = req.header(reqwest::header::RANGE, h);
            }
            req
        })
        .await?;

    let bytes = DriveClient::read_bytes("get_content", response).await?;
    debug!(id = %id, len = bytes.len(), ranged = header.is_some(), "content downloaded");
    Ok(bytes)
}

/// Replaces the content of an existing item in a single PUT.
pub async fn put_small(
    client: &DriveClient,
    id: &ItemId,
    bytes: &[u8],
) -> Result<RemoteItem, RemoteError> {
    let url = client.url(&format!("/me/drive/items/{}/content", id.as_str()));
    let body = bytes.to_vec();
    let response = client
        .execute("put_small", |c, token| {
            c.put(&url)
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body.clone())
        })
        .await?;
    let wire: DriveItemWire = DriveClient::read_json("put_small", response).await?;
    wire.into_remote_item()
}

/// Creates a new file under `parent` in a single PUT.
///
/// Conflict behavior is `fail`: a name collision surfaces as a conflict
/// error rather than silently renaming, because the inode graph already
/// enforced uniqueness and a collision here means the remote moved.
pub async fn put_small_new(
    client: &DriveClient,
    parent: &ItemId,
    name: &str,
    bytes: &[u8],
) -> Result<RemoteItem, RemoteError> {
    let url = client.url(&format!(
        "/me/drive/items/{}:/{}:/content?@microsoft.graph.conflictBehavior=fail",
        parent.as_str(),
        name
    ));
    let body = bytes.to_vec();
    let response = client
        .execute("put_small_new", |c, token| {
            c.put(&url)
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body.clone())
        })
        .await?;
    let wire: DriveItemWire = DriveClient::read_json("put_small_new", response).await?;
    wire.into_remote_item()
}
