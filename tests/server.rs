use std::sync::Arc;

use axum::{
    body::Body,
    http::{self, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt; // for `collect`
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

use leak_monitor::config::IngestConfig;
use leak_monitor::credential::SaltedDigestScheme;
use leak_monitor::server::{router, AppState};
use leak_monitor::store::InMemoryStore;

const MAX_BODY_SIZE: usize = 1_000_000;

fn app(store: &InMemoryStore) -> Router {
    let state = AppState::new(
        Arc::new(store.clone()),
        Arc::new(SaltedDigestScheme::default()),
        IngestConfig::default(),
    );
    router(state, MAX_BODY_SIZE)
}

async fn send(app: Router, method: http::Method, uri: &str, body: Body) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let store = InMemoryStore::new();
    let (status, body) = send(app(&store), http::Method::GET, "/health", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_ingest_then_query() {
    let store = InMemoryStore::new();

    let (status, report) = send(
        app(&store),
        http::Method::POST,
        "/ingest",
        Body::from("alice@test.com,secret1\nalice@test.com,secret1\nbob@test.com,secret2\n"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["inserted"], 2);
    assert_eq!(report["duplicates"], 1);

    let (status, leaks) = send(
        app(&store),
        http::Method::GET,
        "/query?email=Alice%40test.com",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let leaks = leaks.as_array().unwrap();
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0]["obfuscated_password"], "*e*r*t*");
    assert_eq!(leaks[0]["domain"], "test.com");
    assert!(leaks[0].get("password").is_none());
}

#[tokio::test]
async fn test_empty_ingest_and_blank_query_are_bad_requests() {
    let store = InMemoryStore::new();

    let (status, body) = send(app(&store), http::Method::POST, "/ingest", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = send(app(&store), http::Method::GET, "/query?email=", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_customer_lifecycle() {
    let store = InMemoryStore::new();

    let (status, created) = send(
        app(&store),
        http::Method::POST,
        "/customers",
        Body::from(json!({"name": "Acme", "domains": ["Test.com"]}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["domains"], json!(["test.com"]));
    let id = created["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        app(&store),
        http::Method::POST,
        "/customers",
        Body::from(json!({"name": "Acme", "domains": ["x.com"]}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    send(
        app(&store),
        http::Method::POST,
        "/ingest",
        Body::from("bob@test.com,secret2\n"),
    )
    .await;

    let (status, leaks) = send(
        app(&store),
        http::Method::GET,
        &format!("/customers/{}/query", id),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(leaks[0]["customers"][0]["name"], "Acme");

    let (status, updated) = send(
        app(&store),
        http::Method::PUT,
        &format!("/customers/{}", id),
        Body::from(json!({"name": "Acme Corp", "domains": ["acme.io"]}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Acme Corp");

    let (status, list) = send(app(&store), http::Method::GET, "/customers", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = send(
        app(&store),
        http::Method::DELETE,
        &format!("/customers/{}", id),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        app(&store),
        http::Method::GET,
        &format!("/customers/{}", id),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_invalid_customer_payloads() {
    let store = InMemoryStore::new();

    let (status, _) = send(
        app(&store),
        http::Method::GET,
        "/customers/not-a-uuid",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        app(&store),
        http::Method::POST,
        "/customers",
        Body::from(json!({"name": "NoDomains", "domains": []}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = send(
        app(&store),
        http::Method::POST,
        "/customers",
        Body::from("{not json"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}
