use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tracing::{info, warn};

use super::models::{
    RefreshRequest, RefreshResponse, RunListResponse, RunResponse, StartRequest, StartResponse,
};
use super::supervisor::Supervisor;
use super::webhook::{EVENT_HEADER, SIGNATURE_HEADER, WebhookEvent, parse_event, verify_signature};
use crate::errors::PreviewError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub supervisor: Supervisor,
    pub webhook_secret: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unauthorized(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}

impl From<PreviewError> for ApiError {
    fn from(err: PreviewError) -> Self {
        let msg = err.to_string();
        match err {
            e if e.is_validation() => ApiError::BadRequest(msg),
            PreviewError::RunNotFound { .. } => ApiError::NotFound(msg),
            PreviewError::InvalidTransition { .. } => ApiError::Conflict(msg),
            PreviewError::CapacityExhausted { .. } => ApiError::Unavailable(msg),
            PreviewError::Unauthorized => ApiError::Unauthorized(msg),
            _ => ApiError::Internal(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_run))
        .route("/status/{run_id}", get(get_status))
        .route("/stop/{run_id}", post(stop_run))
        .route("/refresh", post(refresh_run))
        .route("/runs", get(list_runs))
        .route("/webhook/github", post(github_webhook))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"success": true, "status": "ok"}))
}

async fn start_run(
    State(state): State<SharedState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let Json(req) = payload?;
    let run = state.supervisor.start(req)?;
    Ok(Json(StartResponse {
        success: true,
        run_id: run.id,
        status: run.status,
        port: run.port,
        preview_url: run.preview_url,
    }))
}

async fn get_status(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state.supervisor.status(&run_id)?;
    Ok(Json(RunResponse { success: true, run }))
}

async fn stop_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state.supervisor.stop(&run_id)?;
    Ok(Json(RunResponse { success: true, run }))
}

async fn refresh_run(
    State(state): State<SharedState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let Json(req) = payload?;
    let (run, refreshed) = state
        .supervisor
        .refresh(&req.run_id, req.only_if_changed)
        .await?;
    Ok(Json(RefreshResponse {
        success: true,
        run_id: run.id,
        refreshed,
        status: run.status,
    }))
}

async fn list_runs(State(state): State<SharedState>) -> Json<RunListResponse> {
    Json(RunListResponse {
        success: true,
        runs: state.supervisor.list(),
    })
}

async fn github_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if !verify_signature(state.webhook_secret.as_deref(), &body, header(SIGNATURE_HEADER)) {
        warn!("rejected webhook delivery with missing or invalid signature");
        return Err(PreviewError::Unauthorized.into());
    }

    let event = parse_event(header(EVENT_HEADER), &body)
        .map_err(|e| ApiError::BadRequest(format!("invalid push payload: {}", e)))?;

    match event {
        WebhookEvent::Ping => Ok(Json(json!({"success": true, "event": "ping", "result": "pong"}))),
        WebhookEvent::Push { repo, branch } => {
            let run_ids = state
                .supervisor
                .refresh_matching(&repo, branch.as_deref())
                .await;
            info!(repo = %repo, branch = ?branch, refreshed = run_ids.len(), "push webhook handled");
            Ok(Json(json!({
                "success": true,
                "event": "push",
                "repo": repo,
                "branch": branch,
                "refreshed": run_ids.len(),
                "runIds": run_ids,
            })))
        }
        WebhookEvent::Ignored(event) => Ok(Json(json!({
            "success": true,
            "event": event,
            "ignored": true,
        }))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::preview::models::RunStatus;
    use crate::preview::pipeline::StubPipeline;
    use crate::preview::placeholder::fakes::FakePlaceholderHost;
    use crate::preview::supervisor::SupervisorSettings;
    use crate::preview::system::SystemClock;
    use crate::preview::webhook::sign;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(secret: Option<&str>) -> SharedState {
        test_state_with_delay(secret, Duration::from_millis(1))
    }

    fn test_state_with_delay(secret: Option<&str>, delay: Duration) -> SharedState {
        let supervisor = Supervisor::new(
            Arc::new(StubPipeline::new(delay)),
            Arc::new(FakePlaceholderHost::new()),
            Arc::new(SystemClock),
            SupervisorSettings {
                port_min: 4001,
                port_max: 4002,
                url_template: "http://localhost:{port}".into(),
            },
        );
        Arc::new(AppState {
            supervisor,
            webhook_secret: secret.map(str::to_string),
        })
    }

    fn test_app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn wait_ready(state: &SharedState, id: &str) {
        for _ in 0..400 {
            if state.supervisor.status(id).unwrap().status == RunStatus::Ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {id} never became ready");
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = test_app(test_state(None)).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_start_status_stop_flow() {
        let state = test_state(None);
        let app = test_app(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/start", json!({"repo": "acme/app", "projectId": "p1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let started: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(started["success"], true);
        assert_eq!(started["status"], "starting");
        assert_eq!(started["port"], 4001);
        let run_id = started["runId"].as_str().unwrap().to_string();

        wait_ready(&state, &run_id).await;
        let response = app
            .clone()
            .oneshot(get(&format!("/status/{}", run_id)))
            .await
            .unwrap();
        let status: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(status["status"], "ready");
        assert_eq!(status["previewUrl"], "http://localhost:4001");
        assert_eq!(status["attempt"], 1);

        let response = app
            .clone()
            .oneshot(post_json(&format!("/stop/{}", run_id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stopped: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(stopped["status"], "stopped");

        let response = app
            .oneshot(post_json(&format!("/stop/{}", run_id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let response = test_app(test_state(None))
            .oneshot(get("/status/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn test_start_validation_errors() {
        let app = test_app(test_state(None));
        let response = app
            .clone()
            .oneshot(post_json("/start", json!({"repo": "not a repo", "projectId": "p1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json("/start", json!({"projectId": "p1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_start_capacity_exhausted() {
        let app = test_app(test_state(None));
        for project in ["p1", "p2"] {
            let response = app
                .clone()
                .oneshot(post_json("/start", json!({"repo": "acme/app", "projectId": project})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .oneshot(post_json("/start", json!({"repo": "acme/app", "projectId": "p3"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_refresh_and_list() {
        let state = test_state_with_delay(None, Duration::from_millis(100));
        let app = test_app(state.clone());
        let run = state
            .supervisor
            .start(StartRequest {
                repo: "acme/app".into(),
                branch: None,
                commit: None,
                project_id: "p1".into(),
            })
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json("/refresh", json!({"runId": run.id})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        wait_ready(&state, &run.id).await;
        let response = app
            .clone()
            .oneshot(post_json("/refresh", json!({"runId": run.id, "onlyIfChanged": true})))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["refreshed"], false);
        assert_eq!(body["status"], "ready");

        let response = app
            .clone()
            .oneshot(post_json("/refresh", json!({"runId": run.id})))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["refreshed"], true);
        assert_eq!(body["status"], "starting");

        let response = app.oneshot(get("/runs")).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["runs"].as_array().unwrap().len(), 1);
        assert_eq!(body["runs"][0]["attempt"], 2);
    }

    fn webhook_request(event: &str, body: &str, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook/github")
            .header("x-github-event", event);
        if let Some(sig) = signature {
            builder = builder.header("x-hub-signature-256", sig);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    const PUSH: &str = r#"{"ref":"refs/heads/main","repository":{"full_name":"acme/app"}}"#;

    #[tokio::test]
    async fn test_webhook_signature_matrix() {
        let app = test_app(test_state(Some("s3cr3t")));
        let good = sign("s3cr3t", PUSH.as_bytes()).unwrap();

        let response = app
            .clone()
            .oneshot(webhook_request("push", PUSH, Some(&good)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut flipped = good.clone().into_bytes();
        let last = flipped.len() - 1;
        flipped[last] = if flipped[last] == b'0' { b'1' } else { b'0' };
        let flipped = String::from_utf8(flipped).unwrap();
        let shorter = &good[..good.len() - 2];
        for bad in [Some(flipped.as_str()), Some(shorter), None] {
            let response = app
                .clone()
                .oneshot(webhook_request("push", PUSH, bad))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        // Rejected before the body is parsed.
        let response = app
            .oneshot(webhook_request("push", "not json", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_open_mode() {
        let app = test_app(test_state(None));
        for sig in [None, Some("sha256=deadbeef")] {
            let response = app
                .clone()
                .oneshot(webhook_request("ping", "{}", sig))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(body["result"], "pong");
        }
    }

    #[tokio::test]
    async fn test_webhook_push_refreshes_matching_ready_runs() {
        let state = test_state(None);
        let app = test_app(state.clone());
        let run = state
            .supervisor
            .start(StartRequest {
                repo: "https://github.com/acme/app.git".into(),
                branch: Some("main".into()),
                commit: None,
                project_id: "p1".into(),
            })
            .unwrap();
        wait_ready(&state, &run.id).await;

        let response = app
            .clone()
            .oneshot(webhook_request("push", PUSH, None))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["refreshed"], 1);
        assert_eq!(body["runIds"][0], run.id.as_str());

        let response = app
            .clone()
            .oneshot(webhook_request("issues", "{}", None))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["ignored"], true);

        let response = app
            .oneshot(webhook_request("push", "{}", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
