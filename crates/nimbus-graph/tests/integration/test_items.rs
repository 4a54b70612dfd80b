//! Item metadata and content operation tests.

use nimbus_core::domain::ids::ItemId;
use nimbus_core::ports::remote::{CloudProvider, MetadataPatch, RemoteErrorKind};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_get_item() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::file_item_json("F1", "notes.txt", "ROOT", 42)),
        )
        .mount(&server)
        .await;

    let item = provider
        .get_item(&ItemId::new("F1").unwrap())
        .await
        .expect("get_item failed");
    assert_eq!(item.name, "notes.txt");
    assert_eq!(item.size, 42);
    assert_eq!(item.etag.unwrap().as_str(), "\"{F1},1\"");
}

#[tokio::test]
async fn test_get_item_not_found_kind() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/MISSING"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = provider
        .get_item(&ItemId::new("MISSING").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RemoteErrorKind::NotFound);
}

#[tokio::test]
async fn test_list_children_paging() {
    let (server, provider) = common::setup().await;
    let dir = ItemId::new("D1").unwrap();

    Mock::given(method("GET"))
        .and(path("/me/drive/items/D1/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [ common::file_item_json("F1", "a.txt", "D1", 1) ],
            "@odata.nextLink": format!("{}/page2/children", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page2/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [ common::file_item_json("F2", "b.txt", "D1", 2) ]
        })))
        .mount(&server)
        .await;

    let first = provider.list_children(&dir, None).await.unwrap();
    assert_eq!(first.items.len(), 1);
    let token = first.next_token.expect("expected next page");

    let second = provider.list_children(&dir, Some(&token)).await.unwrap();
    assert_eq!(second.items[0].id.as_str(), "F2");
    assert!(second.next_token.is_none());
}

#[tokio::test]
async fn test_ranged_download() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1/content"))
        .and(header("Range", "bytes=0-9"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"0123456789".to_vec()))
        .mount(&server)
        .await;

    let bytes = provider
        .get_content(&ItemId::new("F1").unwrap(), Some(0..10))
        .await
        .expect("ranged get failed");
    assert_eq!(bytes, b"0123456789");
}

#[tokio::test]
async fn test_full_download() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"whole body".to_vec()))
        .mount(&server)
        .await;

    let bytes = provider
        .get_content(&ItemId::new("F1").unwrap(), None)
        .await
        .expect("get failed");
    assert_eq!(bytes, b"whole body");
}

#[tokio::test]
async fn test_put_small_new_file() {
    let (server, provider) = common::setup().await;

    Mock::given(method("PUT"))
        .and(path("/me/drive/items/D1:/small.txt:/content"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(common::file_item_json("NEW1", "small.txt", "D1", 22)),
        )
        .mount(&server)
        .await;

    let item = provider
        .put_small_new(
            &ItemId::new("D1").unwrap(),
            "small.txt",
            b"our super special data",
        )
        .await
        .expect("put_small_new failed");
    assert_eq!(item.id.as_str(), "NEW1");
    assert!(!item.id.is_local());
    assert!(item.etag.is_some());
}

#[tokio::test]
async fn test_patch_metadata_rename_and_mtime() {
    let (server, provider) = common::setup().await;

    Mock::given(method("PATCH"))
        .and(path("/me/drive/items/F1"))
        .and(body_partial_json(serde_json::json!({
            "name": "renamed.txt",
            "parentReference": { "id": "D2" }
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::file_item_json("F1", "renamed.txt", "D2", 42)),
        )
        .mount(&server)
        .await;

    let patch = MetadataPatch {
        name: Some("renamed.txt".to_string()),
        parent_id: Some(ItemId::new("D2").unwrap()),
        mtime: Some("2026-02-15T10:00:00Z".parse().unwrap()),
    };
    let item = provider
        .patch_metadata(&ItemId::new("F1").unwrap(), &patch)
        .await
        .expect("patch failed");
    assert_eq!(item.name, "renamed.txt");
    assert_eq!(item.parent_id.unwrap().as_str(), "D2");
}

#[tokio::test]
async fn test_create_folder_conflict_kind() {
    let (server, provider) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/me/drive/items/ROOT/children"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let err = provider
        .create_folder(&ItemId::new("ROOT").unwrap(), "Docs")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RemoteErrorKind::Conflict);
}

#[tokio::test]
async fn test_delete_item() {
    let (server, provider) = common::setup().await;

    Mock::given(method("DELETE"))
        .and(path("/me/drive/items/F1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    provider
        .delete_item(&ItemId::new("F1").unwrap())
        .await
        .expect("delete failed");
}

#[tokio::test]
async fn test_principal_name() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "userPrincipalName": "ada@example.com",
            "displayName": "Ada"
        })))
        .mount(&server)
        .await;

    assert_eq!(provider.principal_name().await.unwrap(), "ada@example.com");
}
