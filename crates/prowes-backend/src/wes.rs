//! Client for a downstream GA4GH WES 1.x service.

use crate::config::{BackendConfig, BackendConfigError};
use crate::http::HttpClient;
use async_trait::async_trait;
use prowes_contract::{
    null_as_default, Backend, BackendError, BackendKind, BackendRunReport, Log, State, Submission,
};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Map, Value};

pub struct WesBackend {
    http: HttpClient,
}

#[derive(Deserialize)]
struct RunIdBody {
    #[serde(default)]
    run_id: Option<String>,
}

/// Lenient view of a downstream `RunLog`.
#[derive(Deserialize)]
struct RunLogBody {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    run_log: Option<Log>,
    #[serde(default, deserialize_with = "null_as_default")]
    task_logs: Vec<Log>,
    #[serde(default)]
    outputs: Option<Value>,
}

impl WesBackend {
    pub fn connect(config: &BackendConfig) -> Result<Self, BackendConfigError> {
        Ok(Self {
            http: HttpClient::connect(config)?,
        })
    }

    fn form(submission: &Submission<'_>) -> Result<Form, BackendError> {
        let request = submission.request;
        let json = |map: &Map<String, Value>| {
            serde_json::to_string(map).map_err(|e| BackendError::Fault {
                status: 0,
                message: format!("failed to encode run request: {e}"),
            })
        };

        let mut form = Form::new()
            .text("workflow_params", json(&request.workflow_params)?)
            .text("workflow_type", request.workflow_type.clone())
            .text("workflow_type_version", request.workflow_type_version.clone())
            .text("tags", json(&request.tags)?)
            .text(
                "workflow_engine_parameters",
                json(&request.workflow_engine_parameters)?,
            )
            .text("workflow_url", request.workflow_url.clone());
        for attachment in submission.attachments {
            let part =
                Part::bytes(attachment.content.clone()).file_name(attachment.filename.clone());
            form = form.part("workflow_attachment", part);
        }
        Ok(form)
    }
}

/// Map a WES state name; anything unrecognised is `UNKNOWN`.
pub(crate) fn parse_state(raw: Option<&str>) -> State {
    raw.and_then(|s| s.trim().to_ascii_uppercase().parse().ok())
        .unwrap_or(State::Unknown)
}

#[async_trait]
impl Backend for WesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wes
    }

    async fn submit(&self, submission: Submission<'_>) -> Result<String, BackendError> {
        let form = Self::form(&submission)?;
        let body: RunIdBody = self
            .http
            .send_json(self.http.post(&["runs"]).multipart(form))
            .await?;
        match body.run_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                tracing::debug!(
                    run_id = %submission.run_id,
                    backend_run_id = %id,
                    "wes accepted run"
                );
                Ok(id)
            }
            None => Err(BackendError::Fault {
                status: 200,
                message: "response has no run_id".to_string(),
            }),
        }
    }

    async fn poll(&self, backend_run_id: &str) -> Result<BackendRunReport, BackendError> {
        let body: RunLogBody = self
            .http
            .send_json(self.http.get(&["runs", backend_run_id]))
            .await?;
        let outputs = match body.outputs {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("outputs".to_string(), other);
                map
            }
        };
        Ok(BackendRunReport {
            state: parse_state(body.state.as_deref()),
            run_log: body.run_log,
            task_logs: body.task_logs,
            outputs,
        })
    }

    async fn cancel(&self, backend_run_id: &str) -> Result<(), BackendError> {
        let request = self.http.post(&["runs", backend_run_id, "cancel"]);
        match self.http.send_empty(request).await {
            Ok(()) => Ok(()),
            Err(err @ BackendError::Rejected { .. }) => {
                // Some services refuse to cancel runs that already finished.
                let report = self.poll(backend_run_id).await?;
                if report.state.is_terminal() || report.state == State::Canceling {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }
}
