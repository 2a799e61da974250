// Integration tests for `TapAdmin` using wiremock.

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use atstream::{Error, StatsKind, TapAdmin, TapConfig};

const BASIC_AUTH: &str = "Basic YWRtaW46aHVudGVyMg==";

async fn setup() -> (MockServer, TapAdmin) {
    let server = MockServer::start().await;
    let mut config = TapConfig::new(server.uri());
    config.admin_password = Some("hunter2".to_string().into());
    let admin = TapAdmin::new(&config).unwrap();
    (server, admin)
}

// ── Happy-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn add_repos_posts_dids_with_auth() {
    let (server, admin) = setup().await;

    Mock::given(method("POST"))
        .and(path("/repos/add"))
        .and(header("authorization", BASIC_AUTH))
        .and(body_json(json!({ "dids": ["did:plc:abc", "did:plc:def"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "added": 2 })))
        .mount(&server)
        .await;

    let result = admin
        .add_repos(&["did:plc:abc".into(), "did:plc:def".into()])
        .await
        .unwrap();
    assert_eq!(result["added"], 2);
}

#[tokio::test]
async fn remove_repos_posts_dids() {
    let (server, admin) = setup().await;

    Mock::given(method("POST"))
        .and(path("/repos/remove"))
        .and(body_json(json!({ "dids": ["did:plc:abc"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "removed": 1 })))
        .mount(&server)
        .await;

    let result = admin.remove_repos(&["did:plc:abc".into()]).await.unwrap();
    assert_eq!(result["removed"], 1);
}

#[tokio::test]
async fn resolve_hits_did_scoped_path() {
    let (server, admin) = setup().await;

    Mock::given(method("GET"))
        .and(path("/resolve/did:plc:abc"))
        .and(header("authorization", BASIC_AUTH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "did": "did:plc:abc",
            "handle": "someone.bsky.social",
            "pds": "https://pds.example.com"
        })))
        .mount(&server)
        .await;

    let result = admin.resolve("did:plc:abc").await.unwrap();
    assert_eq!(result["handle"], "someone.bsky.social");
}

#[tokio::test]
async fn info_reports_tracking_state() {
    let (server, admin) = setup().await;

    Mock::given(method("GET"))
        .and(path("/info/did:plc:abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "did": "did:plc:abc",
            "state": "synced",
            "rev": "3l3qo2vutsw2b"
        })))
        .mount(&server)
        .await;

    let result = admin.info("did:plc:abc").await.unwrap();
    assert_eq!(result["state"], "synced");
}

#[tokio::test]
async fn stats_endpoints_use_kind_segment() {
    let (server, admin) = setup().await;

    Mock::given(method("GET"))
        .and(path("/stats/repo-count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": 1234 })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stats/outbox-buffer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "buffered": 0 })))
        .mount(&server)
        .await;

    let result = admin.stats(StatsKind::RepoCount).await.unwrap();
    assert_eq!(result["count"], 1234);

    let result = admin.stats(StatsKind::OutboxBuffer).await.unwrap();
    assert_eq!(result["buffered"], 0);
}

#[tokio::test]
async fn health_returns_body() {
    let (server, admin) = setup().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" })))
        .mount(&server)
        .await;

    let result = admin.health().await.unwrap();
    assert_eq!(result["status"], "ok");
}

#[tokio::test]
async fn no_auth_header_without_password() {
    let server = MockServer::start().await;
    let config = TapConfig::new(server.uri());
    let admin = TapAdmin::new(&config).unwrap();

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" })))
        .mount(&server)
        .await;

    admin.health().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

// ── Error mapping ───────────────────────────────────────────────────

#[tokio::test]
async fn non_2xx_maps_to_admin_api_error() {
    let (server, admin) = setup().await;

    Mock::given(method("GET"))
        .and(path("/info/did:plc:missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("repo not tracked"))
        .mount(&server)
        .await;

    let error = admin.info("did:plc:missing").await.unwrap_err();
    match error {
        Error::AdminApi { status, body } => {
            assert_eq!(status, 404);
            assert_eq!(body, "repo not tracked");
        }
        other => panic!("expected AdminApi error, got {other:?}"),
    }
}

#[tokio::test]
async fn unauthorized_is_not_retried_and_surfaces() {
    let (server, admin) = setup().await;

    Mock::given(method("POST"))
        .and(path("/repos/add"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .expect(1)
        .mount(&server)
        .await;

    let error = admin.add_repos(&["did:plc:abc".into()]).await.unwrap_err();
    assert!(matches!(error, Error::AdminApi { status: 401, .. }));
}

#[tokio::test]
async fn transport_error_maps_to_transport() {
    // Connecting to a closed port fails at the transport layer.
    let config = TapConfig::new("http://127.0.0.1:1");
    let admin = TapAdmin::new(&config).unwrap();

    let error = admin.health().await.unwrap_err();
    assert!(matches!(error, Error::Transport(_)));
}
