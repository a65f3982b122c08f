use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prowes_contract::{RunId, RunListResponse, RunLog, RunStatus, ServiceInfo};
use serde::Deserialize;

use crate::service::{self, ApiError};
use crate::submission::{RunForm, WORKFLOW_ATTACHMENT_FIELD};

pub use crate::service::AppState;

/// WES API base path.
pub const WES_BASE_PATH: &str = "/ga4gh/wes/v1";
/// Health endpoint path.
pub const HEALTH_PATH: &str = "/health";
pub const SERVICE_INFO_PATH: &str = "/service-info";
pub const RUNS_PATH: &str = "/runs";
pub const RUN_PATH: &str = "/runs/:run_id";
pub const RUN_CANCEL_PATH: &str = "/runs/:run_id/cancel";
pub const RUN_STATUS_PATH: &str = "/runs/:run_id/status";

/// Build health routes.
pub fn health_routes() -> Router<AppState> {
    Router::new().route(HEALTH_PATH, get(health))
}

/// Build WES routes, to be nested under [`WES_BASE_PATH`].
pub fn wes_routes() -> Router<AppState> {
    Router::new()
        .route(SERVICE_INFO_PATH, get(get_service_info).post(post_service_info))
        .route(RUNS_PATH, get(list_runs).post(run_workflow))
        .route(RUN_PATH, get(get_run_log))
        .route(RUN_CANCEL_PATH, post(cancel_run))
        .route(RUN_STATUS_PATH, get(get_run_status))
}

/// Health and WES routes with state attached.
pub fn router(state: AppState) -> Router {
    let body_limit = state.post_runs.max_body_bytes;
    Router::new()
        .merge(health_routes())
        .nest(WES_BASE_PATH, wes_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn get_service_info(State(st): State<AppState>) -> Result<Json<ServiceInfo>, ApiError> {
    service::get_service_info(&st).await.map(Json)
}

async fn post_service_info(
    State(st): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let info: ServiceInfo = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid service info: {e}")))?;
    service::set_service_info(&st, info).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct ListRunsParams {
    #[serde(default)]
    page_size: Option<String>,
    #[serde(default)]
    page_token: Option<String>,
}

async fn list_runs(
    State(st): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<RunListResponse>, ApiError> {
    let page_size = match params.page_size.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<usize>().map_err(|_| {
            ApiError::BadRequest(format!("page_size must be a positive integer, got '{raw}'"))
        })?),
    };
    let page_token = params.page_token.filter(|t| !t.is_empty());
    service::list_runs(&st, page_size, page_token)
        .await
        .map(Json)
}

async fn run_workflow(
    State(st): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<RunId>, ApiError> {
    let mut form = RunForm::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == WORKFLOW_ATTACHMENT_FIELD {
            let filename = field.file_name().unwrap_or_default().to_string();
            let content = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read attachment: {e}")))?;
            form.push_attachment(&filename, content.to_vec())?;
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read field '{name}': {e}")))?;
            form.push_field(name, value);
        }
    }
    let (request, attachments) = form.finish()?;
    service::run_workflow(&st, request, attachments).await.map(Json)
}

async fn get_run_log(
    State(st): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunLog>, ApiError> {
    service::get_run_log(&st, &run_id).await.map(Json)
}

async fn get_run_status(
    State(st): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatus>, ApiError> {
    service::get_run_status(&st, &run_id).await.map(Json)
}

async fn cancel_run(
    State(st): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunId>, ApiError> {
    service::cancel_run(&st, &run_id).await.map(Json)
}
