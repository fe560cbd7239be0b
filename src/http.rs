//! Thin `axum` router translating bearer auth + JSON into `Controller` calls.
//! Owns no scheduling state of its own; every handler is a one-line bridge.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::controller::Controller;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub secret: String,
}

/// The `{code, response}` envelope every handler replies with. `code`
/// mirrors the taxonomy in the external-interfaces table: 0 success, -1
/// missing auth, -2 bad credentials, 1 internal failure, 2 request failure.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    code: i32,
    response: T,
}

fn ok<T: Serialize>(response: T) -> Json<Envelope<T>> {
    Json(Envelope { code: 0, response })
}

fn request_failure(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(Envelope {
            code: 2,
            response: message.into(),
        }),
    )
        .into_response()
}

fn internal_failure(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Envelope {
            code: 1,
            response: message.into(),
        }),
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sys/connection", get(connection))
        .route("/api/sys/secret", get(secret_probe))
        .route("/api/sys/code", get(code_glossary))
        .route("/api/job", post(add_job))
        .route("/api/job/:uuid", delete(remove_job))
        .route("/api/job/:uuid/trigger", post(trigger_job))
        .route("/api/job/:uuid/active", post(set_job_active))
        .route("/api/jobs", get(list_jobs))
        .route("/api/running_jobs", get(list_running_jobs))
        .route("/api/running_jobs/:shot_id", delete(kill_running_job))
        .route("/api/logs", get(list_logs))
        .route("/api/job/:uuid/logs", get(list_job_logs))
        .route("/api/log/:shot_id", get(read_log))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth))
        .with_state(state)
}

async fn auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(Envelope {
                code: -1,
                response: "missing bearer token",
            }),
        )
            .into_response();
    };
    let Ok(value) = header.to_str() else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(Envelope {
                code: -2,
                response: "malformed authorization header",
            }),
        )
            .into_response();
    };
    if value.strip_prefix("Bearer ") != Some(state.secret.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(Envelope {
                code: -2,
                response: "bad credentials",
            }),
        )
            .into_response();
    }
    next.run(request).await
}

async fn connection() -> impl IntoResponse {
    ok("connected")
}

#[derive(Deserialize)]
struct SecretProbeQuery {
    secret: String,
}

async fn secret_probe(
    State(state): State<AppState>,
    Query(query): Query<SecretProbeQuery>,
) -> impl IntoResponse {
    ok(query.secret == state.secret)
}

async fn code_glossary() -> impl IntoResponse {
    ok(serde_json::json!({
        "0": "success",
        "-1": "unauthorized",
        "-2": "bad credentials",
        "1": "internal failure",
        "2": "request failure",
    }))
}

#[derive(Deserialize)]
struct AddJobRequest {
    cron_exp: String,
    command: String,
    name: String,
    #[serde(default)]
    param: Option<String>,
}

async fn add_job(State(state): State<AppState>, Json(body): Json<AddJobRequest>) -> Response {
    match state
        .controller
        .add_job(body.cron_exp, body.command, body.param, body.name)
        .await
    {
        Ok(job) => ok(job).into_response(),
        Err(e) => request_failure(e.to_string()),
    }
}

async fn remove_job(State(state): State<AppState>, Path(uuid): Path<String>) -> Response {
    match state.controller.remove_job(&uuid).await {
        Ok(Some(uuid)) => ok(uuid).into_response(),
        Ok(None) => request_failure(format!("job {uuid} not found")),
        Err(e) => internal_failure(e.to_string()),
    }
}

async fn trigger_job(State(state): State<AppState>, Path(uuid): Path<String>) -> Response {
    if state.controller.trigger_manual(&uuid).await {
        ok(true).into_response()
    } else {
        request_failure(format!("job {uuid} not found"))
    }
}

#[derive(Deserialize)]
struct SetActiveRequest {
    active: bool,
}

async fn set_job_active(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(body): Json<SetActiveRequest>,
) -> Response {
    match state.controller.update_job_state(&uuid, body.active).await {
        Ok(true) => ok(body.active).into_response(),
        Ok(false) => request_failure(format!("job {uuid} not found")),
        Err(e) => internal_failure(e.to_string()),
    }
}

async fn list_jobs(State(state): State<AppState>) -> Response {
    match state.controller.get_jobs().await {
        Ok(jobs) => ok(jobs).into_response(),
        Err(e) => internal_failure(e.to_string()),
    }
}

async fn list_running_jobs(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.controller.get_running_jobs().await)
}

async fn kill_running_job(State(state): State<AppState>, Path(shot_id): Path<String>) -> Response {
    match state.controller.kill_shot(&shot_id).await {
        Some(shot_id) => ok(shot_id).into_response(),
        None => request_failure(format!("shot {shot_id} not running")),
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_logs(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Response {
    match state.controller.get_logs(query.limit).await {
        Ok(logs) => ok(logs).into_response(),
        Err(e) => internal_failure(e.to_string()),
    }
}

async fn list_job_logs(State(state): State<AppState>, Path(uuid): Path<String>) -> Response {
    match state.controller.get_logs_for_job(&uuid).await {
        Ok(logs) => ok(logs).into_response(),
        Err(e) => internal_failure(e.to_string()),
    }
}

#[derive(Deserialize)]
struct ReadLogQuery {
    #[serde(default = "default_log_lines")]
    limit: usize,
}

fn default_log_lines() -> usize {
    1000
}

async fn read_log(
    State(state): State<AppState>,
    Path(shot_id): Path<String>,
    Query(query): Query<ReadLogQuery>,
) -> Response {
    match state.controller.read_log(&shot_id, query.limit).await {
        Ok(Some(text)) => ([("content-type", "text/plain")], text).into_response(),
        Ok(None) => request_failure(format!("log for shot {shot_id} not found")),
        Err(e) => internal_failure(e.to_string()),
    }
}
