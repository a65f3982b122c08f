use crate::config::{ListRunsConfig, PostRunsConfig};
use crate::dispatcher::{Dequeue, Dispatcher};
use crate::service_info::ServiceInfoRegistry;
use crate::submission::SubmissionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use prowes_contract::storage::{
    RunListQuery, RunPatch, RunReader, RunStore, RunStoreError, RunWriter, VersionPrecondition,
};
use prowes_contract::{
    Attachment, Backend, ErrorResponse, Run, RunId, RunListResponse, RunLog, RunRequest,
    RunStatus, ServiceInfo, State,
};
use std::sync::Arc;

/// Attempts at a compare-and-set cancel before giving up.
const CANCEL_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub backend: Arc<dyn Backend>,
    pub dispatcher: Dispatcher,
    pub service_info: ServiceInfoRegistry,
    pub post_runs: PostRunsConfig,
    pub list_runs: ListRunsConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RunNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status();
        let msg = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                "An unexpected error occurred.".to_string()
            }
            _ => self.to_string(),
        };
        let body = Json(ErrorResponse {
            msg,
            status_code: code.as_u16(),
        });
        (code, body).into_response()
    }
}

impl From<RunStoreError> for ApiError {
    fn from(e: RunStoreError) -> Self {
        match e {
            RunStoreError::NotFound(id) => ApiError::RunNotFound(id),
            RunStoreError::InvalidPageToken(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SubmissionError> for ApiError {
    fn from(e: SubmissionError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

/// Store a new run and queue it for dispatch.
pub async fn run_workflow(
    st: &AppState,
    request: RunRequest,
    attachments: Vec<Attachment>,
) -> Result<RunId, ApiError> {
    if !st
        .service_info
        .supports(&request.workflow_type, &request.workflow_type_version)
        .await
    {
        return Err(ApiError::BadRequest(format!(
            "workflow type '{}' version '{}' is not supported",
            request.workflow_type, request.workflow_type_version
        )));
    }

    let mut run = Run::new(String::new(), request).with_attachments(attachments);
    let attempts = st.post_runs.id_insert_attempts.max(1);
    for _ in 0..attempts {
        run.run_id = uuid::Uuid::new_v4().simple().to_string();
        match st.store.create(&run).await {
            Ok(_) => {
                tracing::info!(
                    run_id = %run.run_id,
                    workflow_type = %run.request.workflow_type,
                    workflow_url = %run.request.workflow_url,
                    attachments = run.attachments.len(),
                    "run created"
                );
                if !st.dispatcher.enqueue(&run.run_id) {
                    // Stored as QUEUED; picked up by recovery on the next start.
                    tracing::warn!(
                        run_id = %run.run_id,
                        "dispatch unavailable; run stays queued until restart"
                    );
                }
                return Ok(RunId { run_id: run.run_id });
            }
            Err(RunStoreError::AlreadyExists) => {
                tracing::warn!(run_id = %run.run_id, "run id collision; drawing a new id");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ApiError::Internal(format!(
        "no unique run identifier available after {attempts} attempts"
    )))
}

async fn load_run(st: &AppState, run_id: &str) -> Result<Run, ApiError> {
    match st.store.load_run(run_id).await {
        Ok(Some(run)) => Ok(run),
        Ok(None) | Err(RunStoreError::InvalidId(_)) => {
            Err(ApiError::RunNotFound(run_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn get_run_log(st: &AppState, run_id: &str) -> Result<RunLog, ApiError> {
    Ok(RunLog::from(&load_run(st, run_id).await?))
}

pub async fn get_run_status(st: &AppState, run_id: &str) -> Result<RunStatus, ApiError> {
    Ok(RunStatus::from(&load_run(st, run_id).await?))
}

pub async fn list_runs(
    st: &AppState,
    page_size: Option<usize>,
    page_token: Option<String>,
) -> Result<RunListResponse, ApiError> {
    let query = RunListQuery {
        page_size: page_size
            .unwrap_or(st.list_runs.default_page_size)
            .clamp(1, 200),
        page_token,
        states: Vec::new(),
    };
    let page = st.store.list_runs(&query).await?;
    Ok(RunListResponse {
        runs: page.items.iter().map(RunStatus::from).collect(),
        next_page_token: page.next_page_token.unwrap_or_default(),
    })
}

/// Cancel a run. Repeated calls are no-ops once the run is `CANCELING` or
/// finished.
pub async fn cancel_run(st: &AppState, run_id: &str) -> Result<RunId, ApiError> {
    for _ in 0..CANCEL_ATTEMPTS {
        let head = match st.store.load(run_id).await {
            Ok(Some(head)) => head,
            Ok(None) | Err(RunStoreError::InvalidId(_)) => {
                return Err(ApiError::RunNotFound(run_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let run = head.run;
        if !run.state.is_cancelable() {
            tracing::debug!(run_id = %run_id, state = %run.state, "cancel is a no-op");
            return Ok(RunId {
                run_id: run.run_id,
            });
        }

        let target = match (&run.backend_run_id, run.state) {
            (Some(_), _) => State::Canceling,
            (None, State::Queued) => match st.dispatcher.dequeue(run_id) {
                // The dispatcher finishes the cancel once its submit returns.
                Dequeue::InFlight => State::Canceling,
                Dequeue::Removed | Dequeue::NotQueued => State::Canceled,
            },
            (None, _) => State::Canceled,
        };

        match st
            .store
            .update(
                run_id,
                &RunPatch::state(target),
                VersionPrecondition::Exact(head.version),
            )
            .await
        {
            Ok(_) => {}
            Err(
                RunStoreError::VersionConflict { .. } | RunStoreError::InvalidTransition { .. },
            ) => {
                tracing::debug!(run_id = %run_id, "run changed during cancel; retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(run_id = %run_id, from = %run.state, to = %target, "cancel requested");

        if let (State::Canceling, Some(backend_run_id)) = (target, run.backend_run_id.as_deref()) {
            if let Err(e) = st.backend.cancel(backend_run_id).await {
                tracing::warn!(
                    run_id = %run_id,
                    backend_run_id = %backend_run_id,
                    error = %e,
                    "backend cancel failed"
                );
                let patch = RunPatch::default()
                    .with_system_log(format!("cancel of backend run {backend_run_id} failed: {e}"));
                if let Err(e) = st.store.update(run_id, &patch, VersionPrecondition::Any).await {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to record cancel failure");
                }
            }
        }
        return Ok(RunId {
            run_id: run.run_id,
        });
    }
    Err(ApiError::Internal(format!(
        "run {run_id} kept changing during cancel"
    )))
}

/// Current service info with live per-state run counts.
pub async fn get_service_info(st: &AppState) -> Result<ServiceInfo, ApiError> {
    let mut info = st.service_info.get().await;
    info.system_state_counts = st.store.state_counts().await?;
    Ok(info)
}

pub async fn set_service_info(st: &AppState, info: ServiceInfo) -> Result<(), ApiError> {
    if info.workflow_type_versions.is_empty() {
        return Err(ApiError::BadRequest(
            "workflow_type_versions must not be empty".to_string(),
        ));
    }
    st.service_info.set(info).await;
    tracing::info!("service info updated");
    Ok(())
}
