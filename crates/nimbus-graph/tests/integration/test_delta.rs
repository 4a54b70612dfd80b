//! Delta change-feed tests.

use nimbus_core::domain::ids::DeltaLink;
use nimbus_core::ports::remote::CloudProvider;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_initial_delta_returns_items_and_link() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                common::file_item_json("F1", "document.txt", "ROOT", 1024),
                common::folder_item_json("D1", "Documents", "ROOT", 3),
            ],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=T1", server.uri())
        })))
        .mount(&server)
        .await;

    let page = provider.delta(None).await.expect("delta failed");

    assert_eq!(page.items.len(), 2);
    assert!(page.next_link.is_none());
    assert!(page.delta_link.is_some());

    let file = &page.items[0];
    assert_eq!(file.id.as_str(), "F1");
    assert_eq!(file.size, 1024);
    assert!(!file.is_directory);
    assert!(file.hash.is_some());

    let folder = &page.items[1];
    assert!(folder.is_directory);
    assert_eq!(folder.child_count, Some(3));
}

#[tokio::test]
async fn test_delta_resumes_from_stored_link() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("token", "T1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [ common::file_item_json("F2", "new.txt", "ROOT", 55) ],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=T2", server.uri())
        })))
        .mount(&server)
        .await;

    let link = DeltaLink::new(format!("{}/me/drive/root/delta?token=T1", server.uri()));
    let page = provider.delta(Some(&link)).await.expect("delta failed");

    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id.as_str(), "F2");
    assert!(page
        .delta_link
        .unwrap()
        .as_str()
        .ends_with("token=T2"));
}

#[tokio::test]
async fn test_delta_pagination_exposes_next_link() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [ common::file_item_json("F1", "a.txt", "ROOT", 1) ],
            "@odata.nextLink": format!("{}/me/drive/root/delta?skiptoken=page2", server.uri())
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("skiptoken", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [ common::file_item_json("F2", "b.txt", "ROOT", 2) ],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=T9", server.uri())
        })))
        .mount(&server)
        .await;

    let first = provider.delta(None).await.expect("page 1 failed");
    assert_eq!(first.items.len(), 1);
    let next = first.next_link.expect("next link missing");
    assert!(first.delta_link.is_none());

    let second = provider
        .delta(Some(&DeltaLink::new(next)))
        .await
        .expect("page 2 failed");
    assert_eq!(second.items[0].id.as_str(), "F2");
    assert!(second.delta_link.is_some());
}

#[tokio::test]
async fn test_delta_tombstone_and_missing_hash() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [
                {
                    "id": "GONE",
                    "name": "old.txt",
                    "parentReference": { "id": "D1" },
                    "deleted": { "state": "deleted" }
                },
                {
                    "id": "NOHASH",
                    "name": "fresh.txt",
                    "size": 9,
                    "parentReference": { "id": "D1" },
                    "file": {}
                }
            ],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=T3", server.uri())
        })))
        .mount(&server)
        .await;

    let page = provider.delta(None).await.expect("delta failed");
    assert!(page.items[0].is_deleted);
    assert!(page.items[1].hash.is_none());
    assert!(!page.items[1].is_deleted);
}

#[tokio::test]
async fn test_empty_delta_batch() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [],
            "@odata.deltaLink": format!("{}/me/drive/root/delta?token=T4", server.uri())
        })))
        .mount(&server)
        .await;

    let page = provider.delta(None).await.expect("delta failed");
    assert!(page.items.is_empty());
    assert!(page.delta_link.is_some());
}
