//! Process-wide client: configuration, credential and HTTP transport.

use crate::api::gateway::GatewayControlPlane;
use crate::api::{ControlPlane, SandboxAccess};
use crate::config::{ClientConfig, Credential};
use crate::error::{Result, SandboxError};
use crate::transport::DataPlane;
use std::fmt;
use std::sync::Arc;

const USER_AGENT: &str = concat!("ags-sandbox/", env!("CARGO_PKG_VERSION"));

/// Entry point for every sandbox operation. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    control: Arc<dyn ControlPlane>,
    http: reqwest::Client,
}

impl Client {
    /// Build a client that talks to the gateway with an API key.
    ///
    /// A [`Credential::SecretPair`] needs a signed control plane, which this
    /// crate does not ship; use [`Client::with_control_plane`] for it.
    pub fn new(credential: Credential, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let http = build_http(&config)?;
        let control: Arc<dyn ControlPlane> = match &credential {
            Credential::ApiKey(key) => Arc::new(GatewayControlPlane::new(key.as_str(), &config, http.clone())?),
            Credential::SecretPair { .. } => {
                return Err(SandboxError::Config(
                    "a secret id/key pair requires a custom control plane; set AGS_API_KEY for the gateway"
                        .into(),
                ))
            }
        };
        tracing::debug!(api = %config.api_base_url(), region = %config.region, "Sandbox client ready");
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                control,
                http,
            }),
        })
    }

    /// Configuration and credential from the per-user config file and environment.
    pub fn from_env() -> Result<Self> {
        let config = ClientConfig::load(None)?;
        let credential = Credential::from_env(&config)?;
        Self::new(credential, config)
    }

    /// Use a caller-supplied control plane (signed APIs, tests, proxies).
    pub fn with_control_plane(control: Arc<dyn ControlPlane>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let http = build_http(&config)?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                control,
                http,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub(crate) fn control(&self) -> &dyn ControlPlane {
        self.inner.control.as_ref()
    }

    pub(crate) fn data_plane(&self, access: &SandboxAccess) -> DataPlane {
        DataPlane::new(
            self.inner.http.clone(),
            &self.inner.config,
            &access.sandbox_id,
            access.access_token.clone(),
        )
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Shared HTTP client. No overall timeout: execution and process streams
/// stay open as long as the remote work runs.
fn build_http(config: &ClientConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(config.request_timeout())
        .build()?)
}
