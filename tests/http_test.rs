use http_body_util::BodyExt;
use tower::ServiceExt;

use cronweb::controller::Controller;
use cronweb::http::{router, AppState};
use cronweb_storage::Storage;
use cronweb_worker::{HookRegistry, WorkerConfig};

const SECRET: &str = "test-secret";

async fn test_app() -> (axum::Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::connect(dir.path().join("cronweb.db").to_str().unwrap(), 2)
        .await
        .unwrap();
    let worker_config = WorkerConfig {
        work_dir: dir.path().join("scripts"),
        times_retry: 0,
        wait_retry_base: 1,
        webhook: None,
        subprocess_env: None,
    };
    let controller = Controller::new(
        storage,
        dir.path().join("logs"),
        worker_config,
        HookRegistry::new(),
    )
    .await
    .unwrap();
    let state = AppState {
        controller,
        secret: SECRET.to_string(),
    };
    (router(state), dir)
}

fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("Authorization", format!("Bearer {SECRET}"))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn connection_requires_bearer_auth() {
    let (app, _dir) = test_app().await;
    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/api/sys/connection")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn connection_succeeds_with_bearer_auth() {
    let (app, _dir) = test_app().await;
    let response = app
        .oneshot(
            authed(axum::http::Request::builder().uri("/api/sys/connection"))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
}

#[tokio::test]
async fn add_job_then_list_jobs_round_trips() {
    let (app, _dir) = test_app().await;

    let add_body = serde_json::json!({
        "cron_exp": "*/5 * * * *",
        "command": "echo hi",
        "name": "demo",
    });
    let response = app
        .clone()
        .oneshot(
            authed(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/job")
                    .header("content-type", "application/json"),
            )
            .body(axum::body::Body::from(add_body.to_string()))
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let added = body_json(response).await;
    let uuid = added["response"]["uuid"].as_str().unwrap().to_string();

    let response = app
        .oneshot(
            authed(axum::http::Request::builder().uri("/api/jobs"))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = body_json(response).await;
    let jobs = listed["response"].as_array().unwrap();
    assert!(jobs.iter().any(|j| j["uuid"] == uuid));
}

#[tokio::test]
async fn kill_running_jobs_on_unknown_shot_is_request_failure() {
    let (app, _dir) = test_app().await;
    let response = app
        .oneshot(
            authed(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/api/running_jobs/no-such-shot"),
            )
            .body(axum::body::Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
}
