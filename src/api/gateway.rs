//! API-key authenticated HTTP control plane.

use super::{ControlPlane, CreateSandboxRequest, ListOptions, SandboxAccess, SandboxSummary};
use crate::config::ClientConfig;
use crate::error::{Result, SandboxError};
use crate::transport::{check, decode_json};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Header carrying the gateway API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// HTTP client for the sandbox gateway.
pub struct GatewayControlPlane {
    api_key: String,
    base_url: String,
    request_timeout: Duration,
    http: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "is_empty")]
    metadata: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "is_empty")]
    env_vars: &'a HashMap<String, String>,
}

fn is_empty(map: &&HashMap<String, String>) -> bool {
    map.is_empty()
}

#[derive(Serialize)]
struct TimeoutBody {
    timeout: u64,
}

impl GatewayControlPlane {
    pub fn new(api_key: impl Into<String>, config: &ClientConfig, http: reqwest::Client) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(SandboxError::Config("gateway API key is empty".into()));
        }
        Ok(Self {
            api_key,
            base_url: config.api_base_url(),
            request_timeout: config.request_timeout(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(self.request_timeout)
    }

    async fn send_access(&self, req: RequestBuilder, what: &str) -> Result<SandboxAccess> {
        let resp = check(req.send().await?).await?;
        let text = resp.text().await?;
        let access: SandboxAccess = decode_json(what, &text)?;
        if access.sandbox_id.is_empty() {
            return Err(SandboxError::Provisioning(format!(
                "gateway returned no sandbox id: {text}"
            )));
        }
        Ok(access)
    }
}

fn sandbox_path(sandbox_id: &str) -> String {
    format!("/sandboxes/{}", urlencoding::encode(sandbox_id))
}

fn list_query(options: &ListOptions) -> String {
    let mut params = Vec::new();
    if let Some(status) = &options.status {
        params.push(format!("state={}", urlencoding::encode(status.as_str())));
    }
    if !options.metadata.is_empty() {
        let mut pairs: Vec<_> = options.metadata.iter().collect();
        pairs.sort();
        let joined = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        params.push(format!("metadata={}", urlencoding::encode(&joined)));
    }
    if params.is_empty() {
        String::new()
    } else {
        format!("?{}", params.join("&"))
    }
}

#[async_trait]
impl ControlPlane for GatewayControlPlane {
    async fn create(&self, request: &CreateSandboxRequest) -> Result<SandboxAccess> {
        let body = CreateBody {
            template_id: &request.template_id,
            timeout: request.timeout.as_secs(),
            metadata: &request.metadata,
            env_vars: &request.envs,
        };
        let req = self.request(Method::POST, "/sandboxes").json(&body);
        self.send_access(req, "create sandbox")
            .await
            .map_err(SandboxError::into_provisioning)
    }

    async fn connect(&self, sandbox_id: &str, timeout: Duration) -> Result<SandboxAccess> {
        let path = format!("{}/connect", sandbox_path(sandbox_id));
        let req = self.request(Method::POST, &path).json(&TimeoutBody {
            timeout: timeout.as_secs(),
        });
        self.send_access(req, "connect sandbox").await
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<SandboxSummary>> {
        let path = format!("/sandboxes{}", list_query(options));
        let resp = check(self.request(Method::GET, &path).send().await?).await?;
        let text = resp.text().await?;
        decode_json("list sandboxes", &text)
    }

    async fn info(&self, sandbox_id: &str) -> Result<SandboxSummary> {
        let resp = check(
            self.request(Method::GET, &sandbox_path(sandbox_id))
                .send()
                .await?,
        )
        .await?;
        let text = resp.text().await?;
        decode_json("sandbox info", &text)
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, &sandbox_path(sandbox_id))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!(sandbox_id, "Sandbox already gone");
            return Ok(());
        }
        check(resp).await?;
        Ok(())
    }

    async fn set_timeout(&self, sandbox_id: &str, timeout: Duration) -> Result<()> {
        let path = format!("{}/timeout", sandbox_path(sandbox_id));
        let req = self.request(Method::POST, &path).json(&TimeoutBody {
            timeout: timeout.as_secs(),
        });
        check(req.send().await?).await?;
        Ok(())
    }
}
