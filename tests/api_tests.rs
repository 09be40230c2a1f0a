use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use workpool::config::{JobConfig, Mode};
use workpool::dashboard::router;
use workpool::node::Dispatcher;
use workpool::source::MemorySource;
use workpool::store::MemoryStore;

const SECRET: &str = "s3cret";
const PEER: ([u8; 4], u16) = ([198, 51, 100, 4], 51000);

/// Router over a freshly reset pool of two rows.
async fn create_test_app(mode: Mode, num_tasks: usize) -> Router {
    let source = MemorySource::new()
        .with_required(["image"])
        .with_value("r1", "image", "http://img/1.jpg")
        .with_value("r1", "hint", "cat")
        .with_value("r2", "image", "http://img/2.jpg");
    let config = JobConfig::new("api", mode, num_tasks).with_admin_secret(SECRET);
    let dispatcher = Dispatcher::new(config, Arc::new(MemoryStore::new()), Arc::new(source));
    dispatcher.reset(&CancellationToken::new()).await.unwrap();
    router(Arc::new(dispatcher))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(
        app,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Vec<u8>) {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

async fn new_user(app: &Router, query: &str) -> String {
    let (status, body) = send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/api/user?{query}"))
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .extension(ConnectInfo(SocketAddr::from(PEER)))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    json["user"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_task_keys_serve_data() {
    let app = create_test_app(Mode::Amt, 2).await;
    let user = new_user(&app, "assignmentId=A1").await;

    let (status, task) = get_json(&app, &format!("/api/task/{user}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "assigned");
    // Row ids never leave the server.
    assert!(task.get("row").is_none());

    let keys = task["keys"].as_object().unwrap();
    let image_key = keys["image"].as_str().unwrap();
    let (status, body) = send(
        &app,
        Request::builder()
            .uri(format!("/api/data/{image_key}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with(b"http://img/"));
}

#[tokio::test]
async fn test_result_and_done_flow() {
    let app = create_test_app(Mode::Amt, 2).await;
    let user = new_user(&app, "assignmentId=A1&turkSubmitTo=https%3A%2F%2Fwww.mturk.com").await;

    let (status, _) = get_json(&app, &format!("/api/task/{user}")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = post_json(
        &app,
        &format!("/api/result/{user}"),
        json!({"correct": true, "response": {"label": "cat"}}),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, done) = get_json(&app, &format!("/api/done/{user}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["finished"], false);
    assert!(done["verdict"].is_null());

    let (_, done) = get_json(&app, &format!("/api/done/{user}?force=true")).await;
    assert_eq!(done["finished"], true);
    assert_eq!(done["verdict"]["tasks_finished"], 1);
    let url = done["verdict"]["submit_url"].as_str().unwrap();
    assert!(url.starts_with("https://www.mturk.com/mturk/externalSubmit?assignmentId=A1"));

    // Forcing the check does not stop dispatch below the quota.
    let (_, task) = get_json(&app, &format!("/api/task/{user}")).await;
    assert_eq!(task["status"], "assigned");
}

#[tokio::test]
async fn test_finished_worker_gets_verdict_instead_of_task() {
    let app = create_test_app(Mode::Amt, 1).await;
    let user = new_user(&app, "").await;

    get_json(&app, &format!("/api/task/{user}")).await;
    post_json(&app, &format!("/api/result/{user}"), json!({})).await;

    let (status, task) = get_json(&app, &format!("/api/task/{user}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "finished");
    assert_eq!(task["verdict"]["tasks_finished"], 1);
}

#[tokio::test]
async fn test_exhausted_pool() {
    let app = create_test_app(Mode::Standalone, 5).await;
    let user = new_user(&app, "").await;

    for _ in 0..2 {
        let (_, task) = get_json(&app, &format!("/api/task/{user}")).await;
        assert_eq!(task["status"], "assigned");
    }
    let (status, task) = get_json(&app, &format!("/api/task/{user}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "exhausted");
}

#[tokio::test]
async fn test_unknown_ids_are_404() {
    let app = create_test_app(Mode::Amt, 2).await;

    let (status, body) = get_json(&app, "/api/data/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = get_json(&app, "/api/task/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_json(&app, "/api/result/ghost", json!({"correct": true})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_routes() {
    let app = create_test_app(Mode::Amt, 2).await;
    let user = new_user(&app, "workerId=W9").await;
    post_json(
        &app,
        &format!("/api/result/{user}"),
        json!({"correct": false, "response": {"label": "dog"}}),
    )
    .await;

    let (status, _) = get_json(&app, "/admin/wrong/users").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, users) = get_json(&app, &format!("/admin/{SECRET}/users")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users[&user]["tasks_finished"], 1);
    // The forwarding header is client-supplied; only the peer is recorded.
    assert_eq!(users[&user]["remote_addr"], "198.51.100.4");
    assert_eq!(users[&user]["params"]["workerId"], "W9");

    let (_, responses) = get_json(&app, &format!("/admin/{SECRET}/responses")).await;
    assert_eq!(responses[&user], json!([{"label": "dog"}]));

    let (status, _) = post_json(&app, "/admin/wrong/flush", json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) = post_json(&app, &format!("/admin/{SECRET}/flush"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let flushed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(flushed["flushed"], 2);

    let (_, users) = get_json(&app, &format!("/admin/{SECRET}/users")).await;
    assert_eq!(users, json!({}));
}
