use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::alerts::{AlertEvent, AlertLevel, Channel};
use crate::config::{ConfigPatch, DetectionConfig};
use crate::control::{
    Command, CommandAck, DetectionService, DetectionStatus, ErrorCode, ErrorEnvelope,
    ImportSummary, ProcessResult, ServiceError,
};
use crate::detection::{Sample, SampleOutcome};
use crate::history::{AlertFilter, Page, PageResult, SubjectStats};
use crate::storage::SubjectSnapshot;

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<DetectionService>,
    /// Bearer token required on every route but `/health`
    pub api_token: Option<String>,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(service: Arc<DetectionService>, api_token: Option<String>) -> Self {
        Self {
            service,
            api_token,
            shutdown: watch::channel(false).0,
        }
    }

    /// Close every open event stream
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn closing(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|closing| *closing).await;
        }
    }
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub running_subjects: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        running_subjects: state.service.running_subjects().len(),
    })
}

// ============================================================================
// Control
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartRequest {
    #[serde(default)]
    pub config: Option<ConfigPatch>,
}

/// Parse a body that may be empty
fn optional_json<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body).map(Some).map_err(|e| {
        if e.is_data() {
            ApiError::Service(ServiceError::validation("body", e.to_string()))
        } else {
            ApiError::BadRequest(format!("Malformed JSON body: {}", e))
        }
    })
}

pub async fn start_detection(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    body: Bytes,
) -> Result<Json<DetectionStatus>, ApiError> {
    let request: StartRequest = optional_json(&body)?.unwrap_or_default();
    let status = state.service.start(&subject_id, request.config).await?;
    Ok(Json(status))
}

pub async fn stop_detection(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<DetectionStatus>, ApiError> {
    Ok(Json(state.service.stop(&subject_id).await?))
}

pub async fn execute_command(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    payload: Result<Json<Command>, JsonRejection>,
) -> Result<Json<CommandAck>, ApiError> {
    let Json(command) = payload?;
    Ok(Json(state.service.execute(&subject_id, command).await?))
}

/// Run one outcome through detection and alerting, running or not
pub async fn process_sample(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    payload: Result<Json<SampleOutcome>, JsonRejection>,
) -> Result<Json<ProcessResult>, ApiError> {
    let Json(outcome) = payload?;
    Ok(Json(state.service.process(&subject_id, outcome).await?))
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<DetectionStatus>, ApiError> {
    Ok(Json(state.service.status(&subject_id)?))
}

// ============================================================================
// Configuration
// ============================================================================

pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<DetectionConfig>, ApiError> {
    Ok(Json(state.service.config(&subject_id)?))
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    payload: Result<Json<ConfigPatch>, JsonRejection>,
) -> Result<Json<DetectionConfig>, ApiError> {
    let Json(patch) = payload?;
    Ok(Json(state.service.update_config(&subject_id, &patch).await?))
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AlertParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub level: Option<AlertLevel>,
    pub channel: Option<Channel>,
    #[serde(default)]
    pub unread_only: bool,
}

pub async fn list_samples(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    params: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<PageResult<Sample>>, ApiError> {
    let Query(params) = params?;
    let page = Page::new(params.limit, params.offset).map_err(ServiceError::from)?;
    Ok(Json(state.service.samples(&subject_id, page)?))
}

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    params: Result<Query<AlertParams>, QueryRejection>,
) -> Result<Json<PageResult<AlertEvent>>, ApiError> {
    let Query(params) = params?;
    let page = Page::new(params.limit, params.offset).map_err(ServiceError::from)?;
    let filter = AlertFilter {
        level: params.level,
        channel: params.channel,
        unread_only: params.unread_only,
    };
    Ok(Json(state.service.alerts(&subject_id, &filter, page)?))
}

pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path((subject_id, alert_id)): Path<(String, u64)>,
) -> Result<Json<AlertEvent>, ApiError> {
    Ok(Json(state.service.alert(&subject_id, alert_id)?))
}

#[derive(Serialize)]
pub struct MarkReadResponse {
    pub alert_id: u64,
    /// False if the alert was already read or does not exist
    pub transitioned: bool,
}

pub async fn mark_alert_read(
    State(state): State<Arc<AppState>>,
    Path((subject_id, alert_id)): Path<(String, u64)>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let transitioned = state.service.mark_alert_read(&subject_id, alert_id).await?;
    Ok(Json(MarkReadResponse {
        alert_id,
        transitioned,
    }))
}

#[derive(Serialize)]
pub struct MarkAllReadResponse {
    pub marked: usize,
}

pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<MarkAllReadResponse>, ApiError> {
    let marked = state.service.mark_all_read(&subject_id).await?;
    Ok(Json(MarkAllReadResponse { marked }))
}

#[derive(Serialize)]
pub struct ClearHistoryResponse {
    pub cleared: usize,
}

pub async fn clear_history(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<ClearHistoryResponse>, ApiError> {
    let cleared = state.service.clear_history(&subject_id).await?;
    Ok(Json(ClearHistoryResponse { cleared }))
}

pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<SubjectStats>, ApiError> {
    Ok(Json(state.service.stats(&subject_id)?))
}

// ============================================================================
// Subscription
// ============================================================================

/// Server-sent events, one per push event, named by event type
pub async fn subscribe_events(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let subscription = state.service.subscribe(&subject_id)?;
    tracing::debug!(subject_id = %subject_id, "Event stream opened");

    let stream = subscription
        .into_stream()
        .take_until(state.closing())
        .map(|event| Event::default().event(event.kind()).json_data(&event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Export / Import
// ============================================================================

pub async fn export_subject(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<SubjectSnapshot>, ApiError> {
    Ok(Json(state.service.export(&subject_id)?))
}

pub async fn import_subject(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    payload: Result<Json<SubjectSnapshot>, JsonRejection>,
) -> Result<Json<ImportSummary>, ApiError> {
    let Json(snapshot) = payload?;
    Ok(Json(state.service.import(&subject_id, snapshot).await?))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    /// Malformed request body or parameters
    BadRequest(String),
    Unauthorized,
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Service(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            // Well-formed JSON of the wrong shape, including unknown fields
            JsonRejection::JsonDataError(e) => {
                ApiError::Service(ServiceError::validation("body", e.body_text()))
            }
            other => ApiError::BadRequest(other.body_text()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Service(ServiceError::validation("query", rejection.body_text()))
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::SamplingFailure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::StorageFailure | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let request_id = uuid::Uuid::new_v4().to_string();

        let (status, envelope) = match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope {
                    code: ErrorCode::ValidationError,
                    message,
                    details: None,
                    timestamp: Utc::now(),
                    request_id,
                },
            ),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorEnvelope {
                    code: ErrorCode::Unauthorized,
                    message: "Missing or invalid bearer token".to_string(),
                    details: None,
                    timestamp: Utc::now(),
                    request_id,
                },
            ),
            ApiError::Service(err) => (status_for(err.code()), err.envelope(request_id)),
        };

        if status.is_server_error() {
            tracing::error!(request_id = %envelope.request_id, "{}", envelope.message);
        }

        (status, Json(envelope)).into_response()
    }
}
