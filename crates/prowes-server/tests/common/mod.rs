#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use prowes_contract::storage::{RunReader, RunStore};
use prowes_contract::testing::ScriptedBackend;
use prowes_contract::{Run, ServiceInfo, State};
use prowes_server::config::{DispatchConfig, ListRunsConfig, PostRunsConfig, ReconcileConfig};
use prowes_server::dispatcher::Dispatcher;
use prowes_server::http;
use prowes_server::reconciler::Reconciler;
use prowes_server::service::AppState;
use prowes_server::service_info::ServiceInfoRegistry;
use prowes_store_adapters::MemoryStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const BOUNDARY: &str = "prowes-test-boundary";

/// Router, store, scripted backend and running dispatch workers.
pub struct TestApp {
    pub app: axum::Router,
    pub store: Arc<dyn RunStore>,
    pub backend: Arc<ScriptedBackend>,
    pub dispatcher: Dispatcher,
    pub reconciler: Reconciler,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), fast_dispatch(3))
    }

    pub fn with_dispatch(dispatch: DispatchConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), dispatch)
    }

    pub fn with_store(store: Arc<dyn RunStore>, dispatch: DispatchConfig) -> Self {
        let backend = Arc::new(ScriptedBackend::new());
        let shutdown = CancellationToken::new();
        let (dispatcher, workers) =
            Dispatcher::start(store.clone(), backend.clone(), dispatch, shutdown.clone());
        let reconciler =
            Reconciler::new(store.clone(), backend.clone(), ReconcileConfig::default());
        let app = http::router(AppState {
            store: store.clone(),
            backend: backend.clone(),
            dispatcher: dispatcher.clone(),
            service_info: ServiceInfoRegistry::new(ServiceInfo::default()),
            post_runs: PostRunsConfig::default(),
            list_runs: ListRunsConfig::default(),
        });
        Self {
            app,
            store,
            backend,
            dispatcher,
            reconciler,
            shutdown,
            workers,
        }
    }

    /// Stop the dispatch workers and wait for them to exit.
    pub async fn stop_dispatch(&mut self) {
        self.shutdown.cancel();
        for worker in std::mem::take(&mut self.workers) {
            worker.await.expect("dispatch worker should exit cleanly");
        }
    }

    pub async fn load(&self, run_id: &str) -> Run {
        self.store
            .load_run(run_id)
            .await
            .expect("store should be readable")
            .expect("run should exist")
    }

    /// Poll the store until `run_id` reaches `state`.
    pub async fn wait_for_state(&self, run_id: &str, state: State) -> Run {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let run = self.load(run_id).await;
            if run.state == state {
                return run;
            }
            assert!(
                Instant::now() < deadline,
                "run {run_id} stuck in {} waiting for {state}",
                run.state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the scripted backend has seen `n` submit attempts.
    pub async fn wait_for_submits(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.backend.submitted().len() < n {
            assert!(Instant::now() < deadline, "backend never saw {n} submits");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn fast_dispatch(max_attempts: usize) -> DispatchConfig {
    DispatchConfig {
        workers: 2,
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

/// Text fields for a supported CWL run.
pub fn cwl_fields() -> Vec<(&'static str, &'static str)> {
    vec![
        ("workflow_params", r#"{"message": "hello"}"#),
        ("workflow_type", "CWL"),
        ("workflow_type_version", "v1.0"),
        ("workflow_url", "wf.cwl"),
    ]
}

/// Encode a `multipart/form-data` body. `files` go to `workflow_attachment`.
pub fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    for (filename, content) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"workflow_attachment\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Send a request and return `(status, json_body)`; empty bodies become `Null`.
pub async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let resp = app
        .clone()
        .oneshot(request)
        .await
        .expect("app should handle request");
    let status = resp.status();
    let body = to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    if body.is_empty() {
        return (status, Value::Null);
    }
    let value = serde_json::from_slice(&body).expect("response body must be JSON");
    (status, value)
}

pub async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request build should succeed");
    send(app, request).await
}

pub async fn post_empty(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .expect("request build should succeed");
    send(app, request).await
}

pub async fn post_json(app: &axum::Router, uri: &str, payload: &Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request build should succeed");
    send(app, request).await
}

pub async fn post_run(
    app: &axum::Router,
    fields: &[(&str, &str)],
    files: &[(&str, &[u8])],
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/ga4gh/wes/v1/runs")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(fields, files)))
        .expect("request build should succeed");
    send(app, request).await
}

/// Submit a supported CWL run and return its id.
pub async fn submit_cwl(app: &axum::Router) -> String {
    let (status, body) = post_run(app, &cwl_fields(), &[]).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["run_id"]
        .as_str()
        .expect("run_id should be a string")
        .to_string()
}
