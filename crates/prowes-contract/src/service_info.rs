use crate::state::State;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Versions of one workflow type supported by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTypeVersion {
    pub workflow_type_version: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultWorkflowEngineParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceType {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub url: String,
}

/// Gateway capabilities (WES `ServiceInfo`).
///
/// `system_state_counts` is derived from the run store on every read and is
/// ignored when a record is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub organization: Organization,
    pub version: String,
    pub workflow_type_versions: BTreeMap<String, WorkflowTypeVersion>,
    pub supported_wes_versions: Vec<String>,
    pub supported_filesystem_protocols: Vec<String>,
    pub workflow_engine_versions: BTreeMap<String, String>,
    pub default_workflow_engine_parameters: Vec<DefaultWorkflowEngineParameter>,
    pub system_state_counts: BTreeMap<State, u64>,
    pub auth_instructions_url: String,
    pub tags: BTreeMap<String, String>,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            id: "org.ga4gh.prowes".to_string(),
            name: "proWES".to_string(),
            service_type: ServiceType {
                group: "org.ga4gh".to_string(),
                artifact: "wes".to_string(),
                version: "1.0.0".to_string(),
            },
            description: Some("Proxy service for GA4GH WES and TES backends".to_string()),
            organization: Organization {
                name: "ELIXIR Cloud & AAI".to_string(),
                url: "https://elixir-cloud.dcc.sib.swiss".to_string(),
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            workflow_type_versions: BTreeMap::from([(
                "CWL".to_string(),
                WorkflowTypeVersion {
                    workflow_type_version: vec!["v1.0".to_string()],
                },
            )]),
            supported_wes_versions: vec!["1.0.0".to_string()],
            supported_filesystem_protocols: vec!["http".to_string()],
            workflow_engine_versions: BTreeMap::new(),
            default_workflow_engine_parameters: Vec::new(),
            system_state_counts: BTreeMap::new(),
            auth_instructions_url: "https://lifescience-ri.eu/ls-login/".to_string(),
            tags: BTreeMap::from([(
                "service_repo".to_string(),
                "https://github.com/elixir-cloud-aai/proWES".to_string(),
            )]),
        }
    }
}

impl ServiceInfo {
    /// Whether `workflow_type` at `version` is accepted for submission.
    pub fn supports(&self, workflow_type: &str, version: &str) -> bool {
        self.workflow_type_versions
            .get(workflow_type)
            .is_some_and(|v| v.workflow_type_version.iter().any(|x| x == version))
    }
}
