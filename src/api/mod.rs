//! Control plane: provisioning, discovery and teardown of sandboxes.
//!
//! The [`ControlPlane`] trait is the seam between sandbox handles and the
//! service that owns sandbox lifecycles. [`gateway::GatewayControlPlane`] is
//! the built-in API-key implementation; deployments that authenticate with
//! signed cloud requests plug in their own.

pub mod gateway;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Everything needed to reach a provisioned sandbox's data plane.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SandboxAccess {
    #[serde(rename = "sandboxID", alias = "sandbox_id", alias = "instanceId")]
    pub sandbox_id: String,
    #[serde(rename = "templateID", alias = "template_id", default)]
    pub template_id: Option<String>,
    #[serde(rename = "envdAccessToken", alias = "access_token", default)]
    pub access_token: Option<String>,
}

/// Lifecycle state reported for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SandboxStatus {
    Running,
    Paused,
    /// Any state this client does not model, relayed verbatim.
    Unknown(String),
}

impl SandboxStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<String> for SandboxStatus {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<SandboxStatus> for String {
    fn from(status: SandboxStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live sandbox visible to the credential.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SandboxSummary {
    #[serde(rename = "sandboxID", alias = "sandbox_id", alias = "instanceId")]
    pub sandbox_id: String,
    #[serde(rename = "templateID", alias = "template_id", default)]
    pub template_id: Option<String>,
    #[serde(rename = "state", alias = "status", default = "unknown_status")]
    pub status: SandboxStatus,
    #[serde(rename = "startedAt", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "endAt", default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn unknown_status() -> SandboxStatus {
    SandboxStatus::Unknown(String::new())
}

/// Parameters of a provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSandboxRequest {
    /// Server-defined tool profile, e.g. `code-interpreter-v1`.
    pub template_id: String,
    pub timeout: Duration,
    pub metadata: HashMap<String, String>,
    pub envs: HashMap<String, String>,
}

/// Filters for [`ControlPlane::list`]. Empty means "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub status: Option<SandboxStatus>,
    pub metadata: HashMap<String, String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: SandboxStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Sandbox lifecycle service.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Provision a new sandbox.
    async fn create(&self, request: &CreateSandboxRequest) -> Result<SandboxAccess>;

    /// Attach to a running sandbox, refreshing its access token.
    async fn connect(&self, sandbox_id: &str, timeout: Duration) -> Result<SandboxAccess>;

    /// Enumerate live sandboxes.
    async fn list(&self, options: &ListOptions) -> Result<Vec<SandboxSummary>>;

    /// Describe one sandbox.
    async fn info(&self, sandbox_id: &str) -> Result<SandboxSummary>;

    /// Terminate a sandbox. Must succeed when it is already gone.
    async fn kill(&self, sandbox_id: &str) -> Result<()>;

    /// Reset the remaining lifetime of a sandbox.
    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(SandboxStatus::from("RUNNING".to_string()), SandboxStatus::Running);
        assert_eq!(SandboxStatus::from("paused".to_string()), SandboxStatus::Paused);
        assert_eq!(
            SandboxStatus::from("STARTING".to_string()),
            SandboxStatus::Unknown("STARTING".into())
        );
    }

    #[test]
    fn summary_accepts_gateway_shape() {
        let raw = r#"{
            "sandboxID": "sb-1",
            "templateID": "code-interpreter-v1",
            "state": "running",
            "startedAt": "2026-01-02T03:04:05Z",
            "metadata": {"owner": "ci"}
        }"#;
        let summary: SandboxSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.sandbox_id, "sb-1");
        assert_eq!(summary.status, SandboxStatus::Running);
        assert!(summary.started_at.is_some());
        assert!(summary.end_at.is_none());
        assert_eq!(summary.metadata["owner"], "ci");
    }

    #[test]
    fn summary_accepts_instance_shape() {
        let raw = r#"{"instanceId": "ins-9", "status": "STOPPED"}"#;
        let summary: SandboxSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.sandbox_id, "ins-9");
        assert_eq!(summary.status.as_str(), "STOPPED");
    }

    #[test]
    fn access_token_is_optional() {
        let access: SandboxAccess = serde_json::from_str(r#"{"sandboxID":"sb-2"}"#).unwrap();
        assert_eq!(access.sandbox_id, "sb-2");
        assert!(access.access_token.is_none());
    }
}
