#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! HTTP surface tests: requests go through the real axum router with
//! `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use stackfall_server::http::{self, TrustedHeaderIdentity, RUN_TOKEN_HEADER, USER_ID_HEADER};
use stackfall_server::{MemoryRunStore, RunStatus, RunStore, RunTokenSigner, RunVerifier};
use tower::ServiceExt;

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

fn test_app() -> (Router, MemoryRunStore) {
    let store = MemoryRunStore::new();
    let verifier = RunVerifier::new(store.clone(), RunTokenSigner::new("http-secret"));
    (http::router(verifier, TrustedHeaderIdentity::default()), store)
}

async fn json_body(res: Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn request(method: Method, uri: &str, user: Option<u64>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user.to_string());
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

async fn start_run(app: &Router, user: u64, seed: &str) -> Value {
    let res = send(
        app,
        request(Method::POST, "/run/start", Some(user), Some(json!({"seed": seed}))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    json_body(res).await
}

// ════════════════════════════════════════════════════════════════════
// Start / current
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn start_returns_run_and_token() {
    let (app, _) = test_app();
    let body = start_run(&app, 7, "S1").await;

    assert!(body["id"].as_str().is_some());
    assert_eq!(body["userId"], 7);
    assert_eq!(body["seed"], "S1");
    assert_eq!(body["score"], "0");
    assert_eq!(body["lines"], 0);
    assert_eq!(body["level"], 1);
    assert_eq!(body["status"], "IN_PROGRESS");
    assert_eq!(body["state"]["bombsUsed"], 0);
    assert_eq!(body["runToken"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn start_overwrites_client_bombs_used() {
    let (app, _) = test_app();
    let res = send(
        &app,
        request(
            Method::POST,
            "/run/start",
            Some(1),
            Some(json!({"seed": "S1", "state": {"bombsUsed": 99, "queue": "IOT"}})),
        ),
    )
    .await;
    let body = json_body(res).await;
    assert_eq!(body["state"]["bombsUsed"], 0);
    assert_eq!(body["state"]["queue"], "IOT");
}

#[tokio::test]
async fn oversize_state_is_413() {
    let (app, store) = test_app();
    let blob = "x".repeat(60_000);
    let res = send(
        &app,
        request(
            Method::POST,
            "/run/start",
            Some(1),
            Some(json!({"seed": "S1", "state": {"blob": blob}})),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(res).await["code"], "PAYLOAD_TOO_LARGE");
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn current_is_null_then_the_run() {
    let (app, _) = test_app();
    let res = send(&app, request(Method::GET, "/run/current", Some(3), None)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, Value::Null);

    let started = start_run(&app, 3, "S1").await;
    let res = send(&app, request(Method::GET, "/run/current", Some(3), None)).await;
    assert_eq!(json_body(res).await["id"], started["id"]);
}

// ════════════════════════════════════════════════════════════════════
// Checkpoint / end
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn checkpoint_with_header_token() {
    let (app, _) = test_app();
    let started = start_run(&app, 1, "S1").await;
    let id = started["id"].as_str().unwrap();
    let token = started["runToken"].as_str().unwrap();

    let mut req = request(
        Method::POST,
        &format!("/run/{id}/checkpoint"),
        Some(1),
        Some(json!({
            "lines": 10, "perks": [], "mutations": [], "bombs": 1, "bombsUsed": 0,
            "timeFreezeCharges": 0, "chaosMode": false,
            "gravityMultiplier": 1.0, "scoreMultiplier": 1.0
        })),
    );
    req.headers_mut()
        .insert(RUN_TOKEN_HEADER, token.parse().unwrap());
    let res = send(&app, req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        json_body(res).await,
        json!({"success": true, "score": "1000", "lines": 10, "level": 2})
    );
}

#[tokio::test]
async fn checkpoint_and_end_with_body_token() {
    let (app, store) = test_app();
    let started = start_run(&app, 1, "S1").await;
    let id = started["id"].as_str().unwrap();
    let token = started["runToken"].as_str().unwrap();

    let res = send(
        &app,
        request(
            Method::POST,
            &format!("/run/{id}/checkpoint"),
            Some(1),
            Some(json!({"lines": 4, "runToken": token})),
        ),
    )
    .await;
    assert_eq!(json_body(res).await["score"], "400");

    let res = send(
        &app,
        request(
            Method::POST,
            &format!("/run/{id}/end"),
            Some(1),
            Some(json!({"status": "FINISHED", "runToken": token})),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({"success": true}));
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        RunStatus::Finished
    );
}

// ════════════════════════════════════════════════════════════════════
// Errors
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn missing_identity_is_401_before_anything_else() {
    let (app, store) = test_app();
    for (method, uri, body) in [
        (Method::POST, "/run/start", Some(json!({"seed": "S1"}))),
        (Method::GET, "/run/current", None),
        (Method::POST, "/run/abc/checkpoint", Some(json!({"lines": 1}))),
        (Method::POST, "/run/abc/end", Some(json!({"status": "FINISHED"}))),
        // Even a malformed body answers 401 first.
        (Method::POST, "/run/start", Some(json!({"nope": true}))),
    ] {
        let res = send(&app, request(method, uri, None, body)).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{uri}");
        assert_eq!(json_body(res).await["code"], "UNAUTHORIZED");
    }
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn schema_violations_are_400_with_field() {
    let (app, _) = test_app();
    let started = start_run(&app, 1, "S1").await;
    let id = started["id"].as_str().unwrap();
    let token = started["runToken"].as_str().unwrap();

    let res = send(
        &app,
        request(Method::POST, "/run/start", Some(1), Some(json!({}))),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = json_body(res).await;
    assert_eq!(body["code"], "INVALID_INPUT");
    assert_eq!(body["field"], "seed");

    let res = send(
        &app,
        request(
            Method::POST,
            &format!("/run/{id}/checkpoint"),
            Some(1),
            Some(json!({"lines": -3, "runToken": token})),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(res).await["field"], "lines");

    let res = send(
        &app,
        request(
            Method::POST,
            &format!("/run/{id}/end"),
            Some(1),
            Some(json!({"status": "IN_PROGRESS", "runToken": token})),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(res).await["field"], "status");

    let res = send(
        &app,
        Request::builder()
            .method(Method::POST)
            .uri(format!("/run/{id}/checkpoint"))
            .header(USER_ID_HEADER, "1")
            .body(Body::from("{broken"))
            .unwrap(),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn foreign_run_is_404_and_bad_token_is_403() {
    let (app, store) = test_app();
    let started = start_run(&app, 1, "S1").await;
    let id = started["id"].as_str().unwrap();
    let token = started["runToken"].as_str().unwrap();
    let uri = format!("/run/{id}/checkpoint");

    let res = send(
        &app,
        request(
            Method::POST,
            &uri,
            Some(2),
            Some(json!({"lines": 10, "runToken": token})),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(res).await["code"], "RUN_NOT_FOUND");

    let res = send(
        &app,
        request(
            Method::POST,
            &uri,
            Some(1),
            Some(json!({"lines": 10, "runToken": "00".repeat(32)})),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(res).await["code"], "INVALID_RUN_TOKEN");

    let res = send(&app, request(Method::POST, &uri, Some(1), Some(json!({"lines": 10})))).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let run = store.get(id).await.unwrap().unwrap();
    assert_eq!(run.lines, 0);
    assert_eq!(run.score, 0);
}

#[tokio::test]
async fn ended_run_answers_404() {
    let (app, _) = test_app();
    let started = start_run(&app, 1, "S1").await;
    let id = started["id"].as_str().unwrap();
    let token = started["runToken"].as_str().unwrap();

    let end = |status: &str| {
        request(
            Method::POST,
            &format!("/run/{id}/end"),
            Some(1),
            Some(json!({"status": status, "runToken": token})),
        )
    };
    assert_eq!(send(&app, end("ABANDONED")).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app, end("FINISHED")).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn healthz() {
    let (app, _) = test_app();
    let res = send(&app, request(Method::GET, "/healthz", None, None)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
}
