//! Resumable upload session tests.

use nimbus_core::domain::ids::ItemId;
use nimbus_core::ports::remote::{ChunkOutcome, CloudProvider};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_create_session_for_new_file() {
    let (server, provider) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/me/drive/items/D1:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": format!("{}/upload/session/abc", server.uri()),
            "expirationDateTime": "2026-02-16T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let session = provider
        .create_upload_session_new(&ItemId::new("D1").unwrap(), "big.bin")
        .await
        .expect("session negotiation failed");
    assert!(session.upload_url.ends_with("/upload/session/abc"));
    assert!(session.expires.is_some());
}

#[tokio::test]
async fn test_chunk_sequence_intermediate_then_commit() {
    let (server, provider) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/me/drive/items/F1/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": format!("{}/upload/session/xyz", server.uri())
        })))
        .mount(&server)
        .await;

    // First chunk: accepted with next expected range.
    Mock::given(method("PUT"))
        .and(path("/upload/session/xyz"))
        .and(header("Content-Range", "bytes 0-4/10"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["5-9"]
        })))
        .mount(&server)
        .await;

    // Final chunk: commit with the created item.
    Mock::given(method("PUT"))
        .and(path("/upload/session/xyz"))
        .and(header("Content-Range", "bytes 5-9/10"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(common::file_item_json("F1", "big.bin", "D1", 10)),
        )
        .mount(&server)
        .await;

    let session = provider
        .create_upload_session(&ItemId::new("F1").unwrap())
        .await
        .unwrap();

    let first = provider
        .put_chunk(&session, 0, 10, b"01234")
        .await
        .expect("chunk 1 failed");
    match first {
        ChunkOutcome::Accepted { next_expected } => assert_eq!(next_expected, 5),
        ChunkOutcome::Complete(_) => panic!("first chunk must not commit"),
    }

    let last = provider
        .put_chunk(&session, 5, 10, b"56789")
        .await
        .expect("chunk 2 failed");
    match last {
        ChunkOutcome::Complete(item) => {
            assert_eq!(item.id.as_str(), "F1");
            assert_eq!(item.size, 10);
        }
        ChunkOutcome::Accepted { .. } => panic!("final chunk must commit"),
    }
}

#[tokio::test]
async fn test_session_status_gives_resume_point() {
    let (server, provider) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/me/drive/items/F1/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": format!("{}/upload/session/resume", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/upload/session/resume"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["26214400-52428799"]
        })))
        .mount(&server)
        .await;

    let session = provider
        .create_upload_session(&ItemId::new("F1").unwrap())
        .await
        .unwrap();
    let next = provider.session_status(&session).await.unwrap();
    assert_eq!(next, 26_214_400);
}

#[tokio::test]
async fn test_mid_upload_failure_then_resume() {
    let (server, provider) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/me/drive/items/F1/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": format!("{}/upload/session/flaky", server.uri())
        })))
        .mount(&server)
        .await;

    // The chunk endpoint fails twice with 503 then succeeds; the client
    // retries transparently.
    Mock::given(method("PUT"))
        .and(path("/upload/session/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/upload/session/flaky"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["5-"]
        })))
        .mount(&server)
        .await;

    let session = provider
        .create_upload_session(&ItemId::new("F1").unwrap())
        .await
        .unwrap();
    let outcome = provider
        .put_chunk(&session, 0, 10, b"01234")
        .await
        .expect("chunk should succeed after retries");
    match outcome {
        ChunkOutcome::Accepted { next_expected } => assert_eq!(next_expected, 5),
        ChunkOutcome::Complete(_) => panic!("unexpected commit"),
    }
}
