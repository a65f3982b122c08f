use crate::tes::TesBackend;
use crate::wes::WesBackend;
use prowes_contract::{Backend, BackendKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_WES_BASE_PATH: &str = "/ga4gh/wes/v1";
pub const DEFAULT_TES_BASE_PATH: &str = "/ga4gh/tes/v1";

fn default_timeout_secs() -> u64 {
    3
}

/// Where and how to reach the downstream execution service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Service root, without the GA4GH base path.
    #[serde(default)]
    pub url: String,
    /// Overrides the GA4GH base path for `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    /// Bearer token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tes: TesExecutorConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Wes,
            url: String::new(),
            base_path: None,
            token: None,
            timeout_secs: default_timeout_secs(),
            tes: TesExecutorConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn new(kind: BackendKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            ..Default::default()
        }
    }

    /// Service root joined with the base path, without a trailing slash.
    pub fn endpoint(&self) -> String {
        let base_path = self.base_path.as_deref().unwrap_or(match self.kind {
            BackendKind::Wes => DEFAULT_WES_BASE_PATH,
            BackendKind::Tes => DEFAULT_TES_BASE_PATH,
        });
        let root = self.url.trim_end_matches('/');
        let base_path = base_path.trim_matches('/');
        if base_path.is_empty() {
            root.to_string()
        } else {
            format!("{root}/{base_path}")
        }
    }
}

/// Executor used for every TES task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesExecutorConfig {
    pub image: String,
    /// Command prefix; the workflow URL and the params file are appended.
    pub command: Vec<String>,
    /// Working directory inside the container; inputs are placed here.
    pub workdir: String,
}

impl Default for TesExecutorConfig {
    fn default() -> Self {
        Self {
            image: "commonworkflowlanguage/cwltool:latest".to_string(),
            command: vec!["cwltool".to_string()],
            workdir: "/tmp/prowes".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendConfigError {
    #[error("backend url is not set")]
    MissingUrl,
    #[error("backend url must start with http:// or https://: {0}")]
    InvalidUrl(String),
    #[error("tes executor command is empty")]
    EmptyCommand,
    #[error("failed to create HTTP client: {0}")]
    Client(String),
}

/// Build the backend client selected by `config.kind`.
pub fn connect_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendConfigError> {
    if config.url.trim().is_empty() {
        return Err(BackendConfigError::MissingUrl);
    }
    if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
        return Err(BackendConfigError::InvalidUrl(config.url.clone()));
    }
    match config.kind {
        BackendKind::Wes => Ok(Arc::new(WesBackend::connect(config)?)),
        BackendKind::Tes => Ok(Arc::new(TesBackend::connect(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_url_and_default_base_path() {
        let wes = BackendConfig::new(BackendKind::Wes, "https://wes.example.org/api/");
        assert_eq!(wes.endpoint(), "https://wes.example.org/api/ga4gh/wes/v1");

        let tes = BackendConfig::new(BackendKind::Tes, "http://tes:8000");
        assert_eq!(tes.endpoint(), "http://tes:8000/ga4gh/tes/v1");
    }

    #[test]
    fn endpoint_honours_base_path_override() {
        let mut config = BackendConfig::new(BackendKind::Wes, "http://wes:8080");
        config.base_path = Some("/custom/".to_string());
        assert_eq!(config.endpoint(), "http://wes:8080/custom");
        config.base_path = Some(String::new());
        assert_eq!(config.endpoint(), "http://wes:8080");
    }

    #[test]
    fn connect_rejects_missing_or_odd_urls() {
        assert!(matches!(
            connect_backend(&BackendConfig::default()),
            Err(BackendConfigError::MissingUrl)
        ));
        assert!(matches!(
            connect_backend(&BackendConfig::new(BackendKind::Wes, "ftp://wes")),
            Err(BackendConfigError::InvalidUrl(_))
        ));
        let backend = connect_backend(&BackendConfig::new(BackendKind::Tes, "http://tes")).unwrap();
        assert_eq!(backend.kind(), BackendKind::Tes);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"kind": "tes", "url": "http://tes"}"#).unwrap();
        assert_eq!(config.kind, BackendKind::Tes);
        assert_eq!(config.timeout_secs, 3);
        assert_eq!(config.tes.command, vec!["cwltool"]);
    }
}
