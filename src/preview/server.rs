use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::executor::Executor;
use super::git::GitSynchronizer;
use super::pipeline::{PreviewPipeline, RealPipeline, StubPipeline};
use super::placeholder::AxumPlaceholderHost;
use super::supervisor::Supervisor;
use super::system::System;
use crate::config::{EngineConfig, PreviewMode};

/// Build the full application router: control API with permissive CORS.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wire the supervisor for `config`'s mode.
pub fn build_supervisor(config: &EngineConfig) -> Supervisor {
    let system = System::real();
    let pipeline: Arc<dyn PreviewPipeline> = match config.mode {
        PreviewMode::Stub => Arc::new(StubPipeline::new(config.stub_delay())),
        PreviewMode::Real => Arc::new(RealPipeline::new(
            GitSynchronizer::new(system.clone(), config.git_settings()),
            Executor::new(system.clone(), config.executor_settings()),
            config.workspace_root.clone(),
        )),
    };
    Supervisor::new(
        pipeline,
        Arc::new(AxumPlaceholderHost::new(config.app_host.clone())),
        system.clock,
        config.supervisor_settings(),
    )
}

/// Start the control server and run until Ctrl+C.
pub async fn start_server(config: EngineConfig) -> Result<()> {
    config.validate()?;
    if config.mode == PreviewMode::Real {
        std::fs::create_dir_all(&config.workspace_root).with_context(|| {
            format!(
                "Failed to create workspace root {}",
                config.workspace_root.display()
            )
        })?;
    }
    if config.webhook_secret().is_none() {
        warn!("no webhook secret configured; accepting unsigned webhook deliveries");
    }

    let supervisor = build_supervisor(&config);
    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        webhook_secret: config.webhook_secret().map(str::to_string),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.bind_host, config.control_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        mode = ?config.mode,
        port_min = config.port_min,
        port_max = config.port_max,
        "preview engine listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    supervisor.shutdown();
    info!("preview engine shut down");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
        return;
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let config = EngineConfig::default();
        let state = Arc::new(AppState {
            supervisor: build_supervisor(&config),
            webhook_secret: None,
        });
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_route_is_mounted() {
        let response = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_preflight_allowed() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/start")
                    .header("origin", "http://dashboard.local")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert!(response.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = test_router()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
