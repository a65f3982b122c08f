//! Client for a downstream GA4GH TES 1.x service.
//!
//! Each run becomes one TES task with a single executor that invokes the
//! configured workflow engine on the workflow URL and a params file.

use crate::config::{BackendConfig, BackendConfigError, TesExecutorConfig};
use crate::http::HttpClient;
use async_trait::async_trait;
use prowes_contract::{
    null_as_default, Backend, BackendError, BackendKind, BackendRunReport, Log, State, Submission,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const PARAMS_FILE: &str = "params.json";

pub struct TesBackend {
    http: HttpClient,
    executor: TesExecutorConfig,
}

#[derive(Debug, Serialize)]
struct TesTask {
    name: String,
    description: String,
    inputs: Vec<TesInput>,
    executors: Vec<TesExecutor>,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct TesInput {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct TesExecutor {
    image: String,
    command: Vec<String>,
    workdir: String,
}

#[derive(Deserialize)]
struct CreateTaskBody {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct TaskBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    logs: Vec<TaskLogBody>,
}

#[derive(Deserialize)]
struct TaskLogBody {
    #[serde(default, deserialize_with = "null_as_default")]
    logs: Vec<ExecutorLogBody>,
    #[serde(default, deserialize_with = "null_as_default")]
    outputs: Vec<OutputFileLogBody>,
    #[serde(default, deserialize_with = "null_as_default")]
    system_logs: Vec<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

#[derive(Deserialize)]
struct ExecutorLogBody {
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
}

#[derive(Deserialize)]
struct OutputFileLogBody {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

impl TesBackend {
    pub fn connect(config: &BackendConfig) -> Result<Self, BackendConfigError> {
        if config.tes.command.is_empty() {
            return Err(BackendConfigError::EmptyCommand);
        }
        Ok(Self {
            http: HttpClient::connect(config)?,
            executor: config.tes.clone(),
        })
    }

    fn task(&self, submission: &Submission<'_>) -> Result<TesTask, BackendError> {
        let request = submission.request;
        let workdir = self.executor.workdir.trim_end_matches('/');
        let params_path = format!("{workdir}/{PARAMS_FILE}");
        let params = serde_json::to_string(&request.workflow_params).map_err(|e| {
            BackendError::Fault {
                status: 0,
                message: format!("failed to encode workflow_params: {e}"),
            }
        })?;

        let mut inputs = vec![TesInput {
            name: "workflow_params".to_string(),
            path: params_path.clone(),
            kind: "FILE",
            content: params,
        }];
        for attachment in submission.attachments {
            match std::str::from_utf8(&attachment.content) {
                Ok(text) => inputs.push(TesInput {
                    name: attachment.filename.clone(),
                    path: format!("{workdir}/{}", attachment.filename),
                    kind: "FILE",
                    content: text.to_string(),
                }),
                Err(_) => tracing::warn!(
                    run_id = %submission.run_id,
                    filename = %attachment.filename,
                    "skipping binary attachment; TES inline content must be UTF-8"
                ),
            }
        }

        let mut command = self.executor.command.clone();
        command.extend(engine_arguments(&request.workflow_engine_parameters));
        command.push(request.workflow_url.clone());
        command.push(params_path);

        Ok(TesTask {
            name: format!("prowes-{}", submission.run_id),
            description: format!(
                "{} {} workflow run {}",
                request.workflow_type, request.workflow_type_version, submission.run_id
            ),
            inputs,
            executors: vec![TesExecutor {
                image: self.executor.image.clone(),
                command,
                workdir: workdir.to_string(),
            }],
            tags: request
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), plain_string(v)))
                .collect(),
        })
    }
}

/// Engine parameters become `--name value` flags; `true` becomes a bare flag
/// and `false`/`null` are dropped.
fn engine_arguments(params: &Map<String, Value>) -> Vec<String> {
    let mut args = Vec::new();
    for (name, value) in params {
        match value {
            Value::Bool(false) | Value::Null => {}
            Value::Bool(true) => args.push(format!("--{name}")),
            other => {
                args.push(format!("--{name}"));
                args.push(plain_string(other));
            }
        }
    }
    args
}

fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Map a TES task state onto the WES state set.
pub(crate) fn map_state(raw: Option<&str>) -> State {
    match raw.map(str::trim) {
        Some("QUEUED") | Some("INITIALIZING") => State::Initializing,
        Some("RUNNING") => State::Running,
        Some("PAUSED") => State::Paused,
        Some("COMPLETE") => State::Complete,
        Some("EXECUTOR_ERROR") => State::ExecutorError,
        Some("SYSTEM_ERROR") | Some("PREEMPTED") => State::SystemError,
        Some("CANCELING") => State::Canceling,
        Some("CANCELED") => State::Canceled,
        _ => State::Unknown,
    }
}

fn report(task: TaskBody) -> BackendRunReport {
    let label = task
        .name
        .clone()
        .or_else(|| task.id.clone())
        .unwrap_or_else(|| "task".to_string());
    let mut report = BackendRunReport::new(map_state(task.state.as_deref()));

    let mut system_logs = Vec::new();
    let mut run_start = None;
    let mut run_end = None;
    for (attempt, task_log) in task.logs.into_iter().enumerate() {
        run_start = run_start.or(task_log.start_time);
        if task_log.end_time.is_some() {
            run_end = task_log.end_time;
        }
        system_logs.extend(task_log.system_logs);
        for (i, executor) in task_log.logs.into_iter().enumerate() {
            report.task_logs.push(Log {
                name: Some(format!("{label}-attempt-{attempt}-executor-{i}")),
                start_time: executor.start_time,
                end_time: executor.end_time,
                stdout: executor.stdout,
                stderr: executor.stderr,
                exit_code: executor.exit_code,
                ..Default::default()
            });
        }
        for output in task_log.outputs {
            if let (Some(path), Some(url)) = (output.path, output.url) {
                report.outputs.insert(path, Value::String(url));
            }
        }
    }

    report.run_log = Some(Log {
        name: Some(label),
        start_time: run_start,
        end_time: run_end,
        system_logs,
        ..Default::default()
    });
    report
}

#[async_trait]
impl Backend for TesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tes
    }

    async fn submit(&self, submission: Submission<'_>) -> Result<String, BackendError> {
        let task = self.task(&submission)?;
        let body: CreateTaskBody = self
            .http
            .send_json(self.http.post(&["tasks"]).json(&task))
            .await?;
        match body.id.filter(|id| !id.is_empty()) {
            Some(id) => {
                tracing::debug!(
                    run_id = %submission.run_id,
                    backend_run_id = %id,
                    "tes accepted task"
                );
                Ok(id)
            }
            None => Err(BackendError::Fault {
                status: 200,
                message: "response has no task id".to_string(),
            }),
        }
    }

    async fn poll(&self, backend_run_id: &str) -> Result<BackendRunReport, BackendError> {
        let request = self
            .http
            .get(&["tasks", backend_run_id])
            .query(&[("view", "FULL")]);
        let task: TaskBody = self.http.send_json(request).await?;
        Ok(report(task))
    }

    async fn cancel(&self, backend_run_id: &str) -> Result<(), BackendError> {
        let verb = format!("{backend_run_id}:cancel");
        let request = self.http.post(&["tasks", verb.as_str()]);
        match self.http.send_empty(request).await {
            Ok(()) => Ok(()),
            Err(err @ BackendError::Rejected { .. }) => {
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
