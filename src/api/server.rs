use axum::{
    extract::{Request, State},
    http::header,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    clear_history, execute_command, export_subject, get_alert, get_config, get_stats, get_status,
    health_check, import_subject, list_alerts, list_samples, mark_alert_read, mark_all_read,
    process_sample, start_detection, stop_detection, subscribe_events, update_config, ApiError,
    AppState,
};
use crate::alerts::Notifier;
use crate::control::DetectionService;
use crate::detection::SimulatedSampler;
use crate::settings::ServiceSettings;
use crate::storage::{FileBackend, MemoryBackend, PersistenceBackend, SnapshotManager};

/// Reject requests without the configured bearer token
async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.api_token {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        if provided != Some(expected.as_str()) {
            tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated request");
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    let subjects = Router::new()
        // Control
        .route("/subjects/:subject_id/start", post(start_detection))
        .route("/subjects/:subject_id/stop", post(stop_detection))
        .route("/subjects/:subject_id/commands", post(execute_command))
        .route("/subjects/:subject_id/process", post(process_sample))
        .route("/subjects/:subject_id/status", get(get_status))
        .route(
            "/subjects/:subject_id/config",
            get(get_config).put(update_config),
        )
        // History
        .route("/subjects/:subject_id/samples", get(list_samples))
        .route(
            "/subjects/:subject_id/alerts",
            get(list_alerts).delete(clear_history),
        )
        .route("/subjects/:subject_id/alerts/read-all", post(mark_all_read))
        .route("/subjects/:subject_id/alerts/:alert_id", get(get_alert))
        .route("/subjects/:subject_id/alerts/:alert_id/read", post(mark_alert_read))
        .route("/subjects/:subject_id/stats", get(get_stats))
        // Subscription
        .route("/subjects/:subject_id/events", get(subscribe_events))
        // Export / import
        .route("/subjects/:subject_id/export", get(export_subject))
        .route("/subjects/:subject_id/import", post(import_subject))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_token,
        ));

    Router::new()
        // Health check, never authenticated
        .route("/health", get(health_check))
        .merge(subjects)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(settings: ServiceSettings) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize persistence
    let backend: Arc<dyn PersistenceBackend> = match &settings.data_dir {
        Some(dir) => {
            tracing::info!("Persisting subject state to {}", dir.display());
            Arc::new(FileBackend::new(dir)?)
        }
        None => {
            tracing::warn!("No data directory configured, subject state is kept in memory only");
            Arc::new(MemoryBackend::new())
        }
    };

    // Initialize the detection service
    let service = Arc::new(DetectionService::new(
        Arc::new(SimulatedSampler::new(settings.peek_probability)),
        Arc::new(Notifier::new()),
        Arc::new(SnapshotManager::new(backend)),
        settings.service_options(),
    ));
    service.restore()?;

    let state = Arc::new(AppState::new(
        Arc::clone(&service),
        settings.api_token.clone(),
    ));
    if state.api_token.is_none() {
        tracing::warn!("PEEKGUARD_API_TOKEN not set, API is unauthenticated");
    }

    // Build router
    let app = build_router(Arc::clone(&state));

    // Start server
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    tracing::info!("Starting PeekGuard server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await?;

    // Stop every detection loop
    service.shutdown().await;

    tracing::info!("PeekGuard server stopped");
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutdown signal received, closing event streams...");
    state.begin_shutdown();
}
