use mockito::{Matcher, Server};
use prowes_backend::{connect_backend, BackendConfig};
use prowes_contract::{BackendError, BackendKind, RunRequest, State, Submission};
use serde_json::json;

fn config(url: String) -> BackendConfig {
    BackendConfig::new(BackendKind::Tes, url)
}

#[tokio::test]
async fn submit_creates_task() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/ga4gh/tes/v1/tasks")
        .match_header("content-type", "application/json")
        .match_body(Matcher::AllOf(vec![
            Matcher::PartialJson(json!({"name": "prowes-r1"})),
            Matcher::Regex(
                r#""command":\["cwltool","https://example.org/wf.cwl","/tmp/prowes/params.json"\]"#
                    .to_string(),
            ),
            Matcher::Regex(r#""content":"\{\\"x\\":1\}""#.to_string()),
        ]))
        .with_status(200)
        .with_body(r#"{"id": "task-9"}"#)
        .create_async()
        .await;

    let backend = connect_backend(&config(server.url())).unwrap();
    let request = RunRequest {
        workflow_params: json!({"x": 1}).as_object().cloned().unwrap(),
        workflow_type: "CWL".into(),
        workflow_type_version: "v1.0".into(),
        workflow_url: "https://example.org/wf.cwl".into(),
        ..Default::default()
    };
    let id = backend
        .submit(Submission {
            run_id: "r1",
            request: &request,
            attachments: &[],
        })
        .await
        .unwrap();
    assert_eq!(id, "task-9");
    mock.assert_async().await;
}

#[tokio::test]
async fn poll_requests_full_view() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/ga4gh/tes/v1/tasks/task-9")
        .match_query(Matcher::UrlEncoded("view".into(), "FULL".into()))
        .with_status(200)
        .with_body(
            json!({
                "id": "task-9",
                "state": "EXECUTOR_ERROR",
                "logs": [{"logs": [{"stderr": "boom", "exit_code": 1}]}]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let backend = connect_backend(&config(server.url())).unwrap();
    let report = backend.poll("task-9").await.unwrap();
    assert_eq!(report.state, State::ExecutorError);
    assert_eq!(report.task_logs[0].stderr.as_deref(), Some("boom"));
    assert_eq!(report.task_logs[0].exit_code, Some(1));
    mock.assert_async().await;
}

#[tokio::test]
async fn preempted_task_is_system_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/ga4gh/tes/v1/tasks/task-9")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"id": "task-9", "state": "PREEMPTED"}"#)
        .create_async()
        .await;

    let backend = connect_backend(&config(server.url())).unwrap();
    assert_eq!(backend.poll("task-9").await.unwrap().state, State::SystemError);
}

#[tokio::test]
async fn cancel_uses_colon_verb() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/ga4gh/tes/v1/tasks/task-9:cancel")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let backend = connect_backend(&config(server.url())).unwrap();
    backend.cancel("task-9").await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn task_id_with_slash_is_escaped() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/ga4gh/tes/v1/tasks/a%2Fb:cancel")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let backend = connect_backend(&config(server.url())).unwrap();
    backend.cancel("a/b").await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_task_is_rejected() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/ga4gh/tes/v1/tasks/nope")
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(r#"{"msg": "task not found"}"#)
        .create_async()
        .await;

    let backend = connect_backend(&config(server.url())).unwrap();
    assert_eq!(
        backend.poll("nope").await.unwrap_err(),
        BackendError::Rejected {
            status: 404,
            message: "task not found".to_string()
        }
    );
}
