//! Validation of `POST /runs` form fields.

use prowes_contract::{Attachment, RunRequest};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

pub const WORKFLOW_ATTACHMENT_FIELD: &str = "workflow_attachment";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' must be a JSON object: {reason}")]
    NotAnObject { field: &'static str, reason: String },
    #[error("invalid attachment filename '{filename}': {reason}")]
    InvalidFilename { filename: String, reason: &'static str },
}

/// Collects multipart fields as they stream in.
#[derive(Debug, Default)]
pub struct RunForm {
    fields: HashMap<String, String>,
    attachments: Vec<Attachment>,
}

impl RunForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a text field. A repeated field keeps its last value.
    pub fn push_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn push_attachment(
        &mut self,
        filename: &str,
        content: impl Into<Vec<u8>>,
    ) -> Result<(), SubmissionError> {
        validate_filename(filename)?;
        self.attachments.push(Attachment::new(filename, content));
        Ok(())
    }

    /// Validate the collected fields into a run request.
    pub fn finish(mut self) -> Result<(RunRequest, Vec<Attachment>), SubmissionError> {
        let workflow_params = match self.take("workflow_params") {
            Some(raw) => parse_object("workflow_params", &raw)?,
            None => return Err(SubmissionError::MissingField("workflow_params")),
        };
        let workflow_type = self.required("workflow_type")?;
        let workflow_type_version = self.required("workflow_type_version")?;
        let workflow_url = self.required("workflow_url")?;
        let tags = self.optional_object("tags")?;
        let workflow_engine_parameters = self.optional_object("workflow_engine_parameters")?;

        for name in self.fields.keys() {
            tracing::debug!(field = %name, "ignoring unknown run submission field");
        }

        let request = RunRequest {
            workflow_params,
            workflow_type,
            workflow_type_version,
            tags,
            workflow_engine_parameters,
            workflow_url,
        };
        Ok((request, self.attachments))
    }

    fn take(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }

    fn required(&mut self, name: &'static str) -> Result<String, SubmissionError> {
        match self.take(name) {
            Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(SubmissionError::MissingField(name)),
        }
    }

    fn optional_object(
        &mut self,
        name: &'static str,
    ) -> Result<Map<String, Value>, SubmissionError> {
        match self.take(name) {
            Some(raw) if !raw.trim().is_empty() => parse_object(name, &raw),
            _ => Ok(Map::new()),
        }
    }
}

fn parse_object(field: &'static str, raw: &str) -> Result<Map<String, Value>, SubmissionError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| SubmissionError::NotAnObject {
        field,
        reason: e.to_string(),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(SubmissionError::NotAnObject {
            field,
            reason: format!("got {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Attachment names must stay relative to the run's working directory.
pub fn validate_filename(filename: &str) -> Result<(), SubmissionError> {
    let reject = |reason| {
        Err(SubmissionError::InvalidFilename {
            filename: filename.to_string(),
            reason,
        })
    };
    if filename.is_empty() {
        return reject("empty");
    }
    if filename.starts_with('/') {
        return reject("absolute path");
    }
    if filename.contains('\\') {
        return reject("backslash");
    }
    if filename.chars().any(char::is_control) {
        return reject("control character");
    }
    if filename.split('/').any(|segment| segment == "..") {
        return reject("parent directory segment");
    }
    Ok(())
}
