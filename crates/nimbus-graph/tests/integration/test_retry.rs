//! Retry, backoff and token-refresh behavior.

use nimbus_core::domain::ids::ItemId;
use nimbus_core::ports::remote::{CloudProvider, RemoteErrorKind};
use nimbus_graph::GraphProvider;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{self, CountingTokens};

#[tokio::test]
async fn test_401_refreshes_token_exactly_once() {
    let server = MockServer::start().await;
    let tokens = CountingTokens::refreshable("stale", "fresh");
    let provider =
        GraphProvider::with_base_url(tokens.clone(), common::test_network_config(), server.uri());

    // The stale bearer is rejected; the fresh one succeeds.
    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .and(header("Authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .and(header("Authorization", "Bearer fresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::file_item_json("F1", "a.txt", "ROOT", 1)),
        )
        .mount(&server)
        .await;

    let item = provider
        .get_item(&ItemId::new("F1").unwrap())
        .await
        .expect("call should succeed after refresh");
    assert_eq!(item.id.as_str(), "F1");
    assert_eq!(tokens.refresh_count(), 1);
}

#[tokio::test]
async fn test_second_401_surfaces_auth_error() {
    let server = MockServer::start().await;
    let tokens = CountingTokens::refreshable("stale", "still-bad");
    let provider =
        GraphProvider::with_base_url(tokens.clone(), common::test_network_config(), server.uri());

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = provider
        .get_item(&ItemId::new("F1").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RemoteErrorKind::Auth);
    assert_eq!(tokens.refresh_count(), 1, "refresh must run exactly once");
}

#[tokio::test]
async fn test_429_backs_off_and_succeeds() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "0"))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::file_item_json("F1", "a.txt", "ROOT", 1)),
        )
        .mount(&server)
        .await;

    let item = provider.get_item(&ItemId::new("F1").unwrap()).await.unwrap();
    assert_eq!(item.id.as_str(), "F1");
}

#[tokio::test]
async fn test_retry_budget_exhaustion_returns_rate_limit() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "0"))
        .mount(&server)
        .await;

    let err = provider
        .get_item(&ItemId::new("F1").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RemoteErrorKind::RateLimit);
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let err = provider
        .get_item(&ItemId::new("F1").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RemoteErrorKind::Validation);
}

#[tokio::test]
async fn test_server_transient_retries_then_succeeds() {
    let (server, provider) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/F1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::file_item_json("F1", "a.txt", "ROOT", 1)),
        )
        .mount(&server)
        .await;

    assert!(provider.get_item(&ItemId::new("F1").unwrap()).await.is_ok());
}
