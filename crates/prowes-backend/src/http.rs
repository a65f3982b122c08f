use crate::config::{BackendConfig, BackendConfigError};
use prowes_contract::BackendError;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Shared request plumbing: base URL, bearer token, timeout and error
/// classification.
pub(crate) struct HttpClient {
    endpoint: reqwest::Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpClient {
    pub(crate) fn connect(config: &BackendConfig) -> Result<Self, BackendConfigError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BackendConfigError::Client(e.to_string()))?;
        let endpoint = config.endpoint();
        let endpoint = reqwest::Url::parse(&endpoint)
            .map_err(|e| BackendConfigError::InvalidUrl(format!("{endpoint}: {e}")))?;
        Ok(Self {
            endpoint,
            token: config.token.clone().filter(|t| !t.is_empty()),
            client,
        })
    }

    /// URL of `segments` below the endpoint. Each segment is percent-encoded,
    /// so `/`, `?` and `#` inside an id stay part of that segment.
    pub(crate) fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    pub(crate) fn get(&self, segments: &[&str]) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(self.url(segments)))
    }

    pub(crate) fn post(&self, segments: &[&str]) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(self.url(segments)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send `request` and decode a successful JSON body.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = send(request).await?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;
        serde_json::from_str(&body).map_err(|e| BackendError::Fault {
            status,
            message: format!("undecodable response: {e}"),
        })
    }

    /// Send `request`, ignoring the body of a successful response.
    pub(crate) async fn send_empty(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(), BackendError> {
        send(request).await.map(|_| ())
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), &body))
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Unavailable(format!("request timed out: {err}"))
    } else if err.is_decode() {
        BackendError::Fault {
            status: err.status().map_or(0, |s| s.as_u16()),
            message: err.to_string(),
        }
    } else {
        BackendError::Unavailable(err.to_string())
    }
}

/// Classify a non-success HTTP status.
pub(crate) fn status_error(status: u16, body: &str) -> BackendError {
    let message = error_message(body);
    if (400..500).contains(&status) {
        BackendError::Rejected { status, message }
    } else {
        BackendError::Fault { status, message }
    }
}

/// Prefer the `msg` of a GA4GH `ErrorResponse`, falling back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
