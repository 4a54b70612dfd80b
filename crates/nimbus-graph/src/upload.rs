//! Resumable upload sessions.
//!
//! Large bodies go up through a server-negotiated session: chunks are
//! PUT sequentially against the session URL with `Content-Range`
//! headers; intermediate chunks answer 202 with the next expected
//! ranges, and the final chunk answers 200/201 with the committed
//! DriveItem. After a failure the session is interrogated for the next
//! expected byte and the upload resumes there.

use nimbus_core::domain::ids::ItemId;
use nimbus_core::ports::remote::{ChunkOutcome, RemoteError, SessionHandle};
use tracing::debug;

use crate::client::DriveClient;
use crate::wire::{DriveItemWire, SessionStatusWire, UploadSessionWire};

/// Negotiates a session replacing an existing item's content.
pub async fn create_session(
    client: &DriveClient,
    id: &ItemId,
) -> Result<SessionHandle, RemoteError> {
    let url = client.url(&format!(
        "/me/drive/items/{}/createUploadSession",
        id.as_str()
    ));
    create_session_at(client, &url).await
}

/// Negotiates a session creating a new file under `parent`.
pub async fn create_session_new(
    client: &DriveClient,
    parent: &ItemId,
    name: &str,
) -> Result<SessionHandle, RemoteError> {
    let url = client.url(&format!(
        "/me/drive/items/{}:/{}:/createUploadSession",
        parent.as_str(),
        name
    ));
    create_session_at(client, &url).await
}

async fn create_session_at(
    client: &DriveClient,
    url: &str,
) -> Result<SessionHandle, RemoteError> {
    let body = serde_json::json!({
        "item": { "@microsoft.graph.conflictBehavior": "replace" }
    });
    let response = client
        .execute("create_upload_session", |c, token| {
            c.post(url).bearer_auth(token).json(&body)
        })
        .await?;
    let wire: UploadSessionWire =
        DriveClient::read_json("create_upload_session", response).await?;
    debug!(url = %wire.upload_url, "upload session negotiated");
    Ok(SessionHandle {
        upload_url: wire.upload_url,
        expires: wire.expiration_date_time,
    })
}

/// Uploads one chunk.
///
/// `offset` is the first byte of this chunk, `total` the final file
/// size. Session URLs are absolute and pre-authenticated; the bearer is
/// still attached as the session may live on the API host in tests.
pub async fn put_chunk(
    client: &DriveClient,
    session: &SessionHandle,
    offset: u64,
    total: u64,
    bytes: &[u8],
) -> Result<ChunkOutcome, RemoteError> {
    let chunk_len = bytes.len() as u64;
    let content_range = format!("bytes {}-{}/{}", offset, offset + chunk_len - 1, total);
    debug!(range = %content_range, "uploading chunk");

    let body = bytes.to_vec();
    let url = session.upload_url.clone();
    let response = client
        .execute("put_chunk", |c, token| {
            c.put(&url)
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_LENGTH, chunk_len.to_string())
                .header(reqwest::header::CONTENT_RANGE, &content_range)
                .body(body.clone())
        })
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::ACCEPTED {
        let ack: SessionStatusWire = DriveClient::read_json("put_chunk", response).await?;
        let next_expected = ack.next_expected_byte().unwrap_or(offset + chunk_len);
        return Ok(ChunkOutcome::Accepted { next_expected });
    }

    // 200 or 201: the final chunk committed the item.
    let wire: DriveItemWire = DriveClient::read_json("put_chunk", response).await?;
    let item = wire.into_remote_item()?;
    debug!(id = %item.id, "upload session committed");
    Ok(ChunkOutcome::Complete(Box::new(item)))
}

/// Interrogates a session for the resume point.
///
/// Returns the lowest next-expected byte; a drained range list means the
/// server saw everything and 0 is returned so the caller re-sends the
/// final chunk to obtain the commit response.
pub async fn session_status(
    client: &DriveClient,
    session: &SessionHandle,
) -> Result<u64, RemoteError> {
    let url = session.upload_url.clone();
    let response = client
        .execute("session_status", |c, token| c.get(&url).bearer_auth(token))
        .await?;
    let status: SessionStatusWire = DriveClient::read_json("session_status", response).await?;
    Ok(status.next_expected_byte().unwrap_or(0))
}
