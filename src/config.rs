//! Client configuration and credentials.
//!
//! Configuration is read once at startup from an optional TOML file and the
//! process environment. Every field has a default, so an absent file (or an
//! empty one) is the same as the defaults.

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cloud region.
pub const DEFAULT_REGION: &str = "ap-guangzhou";

/// Public sandbox domain.
pub const DEFAULT_DOMAIN: &str = "tencentags.com";

/// Domain used from inside the provider's network.
pub const INTERNAL_DOMAIN: &str = "internal.tencentags.com";

/// Port of the code interpreter inside every sandbox.
pub const CODE_INTERPRETER_PORT: u16 = 49999;

/// Port of the in-sandbox daemon serving filesystem and process RPCs.
pub const ENVD_PORT: u16 = 49983;

/// In-sandbox user applied when the caller does not pick one.
pub const DEFAULT_USER: &str = "user";

/// Tool profile used by the tutorials.
pub const DEFAULT_TOOL: &str = "code-interpreter-v1";

/// Runtime configuration for [`crate::Client`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Cloud region hosting the sandboxes.
    pub region: String,
    /// Base domain of the sandbox hosts.
    pub domain: String,
    /// Control-plane base URL. Derived from region and domain when unset.
    pub api_url: Option<String>,
    /// Data-plane base URL override for every sandbox port (proxies, debugging).
    pub sandbox_url: Option<String>,
    /// Per-request timeout for control-plane calls.
    pub request_timeout_secs: u64,
    /// Lifetime requested for new sandboxes.
    pub sandbox_timeout_secs: u64,
    /// API key for the gateway. Environment variables take precedence.
    pub api_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.into(),
            domain: DEFAULT_DOMAIN.into(),
            api_url: None,
            sandbox_url: None,
            request_timeout_secs: 30,
            sandbox_timeout_secs: 300,
            api_key: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from `path` (or the per-user config file when
    /// `None`), then apply environment overrides.
    ///
    /// A missing default file is not an error; a missing explicit path is.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(raw) => {
                let expanded = PathBuf::from(shellexpand::tilde(raw).into_owned());
                Self::from_file(&expanded)?
            }
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Configuration from the environment only.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| SandboxError::Config(format!("invalid config: {e}")))
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(region) = non_empty("AGS_REGION") {
            self.region = region;
        }
        if non_empty("AGS_USE_INTERNAL").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
            self.domain = INTERNAL_DOMAIN.into();
        }
        if let Some(domain) = non_empty("AGS_DOMAIN") {
            self.domain = domain;
        }
        if let Some(url) = non_empty("AGS_API_URL") {
            self.api_url = Some(url);
        }
        if let Some(url) = non_empty("AGS_SANDBOX_URL") {
            self.sandbox_url = Some(url);
        }
    }

    /// Reject values no request could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            return Err(SandboxError::Config("region must not be empty".into()));
        }
        if self.domain.trim().is_empty() {
            return Err(SandboxError::Config("domain must not be empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SandboxError::Config(
                "request_timeout_secs must be > 0".into(),
            ));
        }
        if self.sandbox_timeout_secs == 0 {
            return Err(SandboxError::Config(
                "sandbox_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Control-plane base URL without a trailing slash.
    pub fn api_base_url(&self) -> String {
        match &self.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://api.{}.{}", self.region, self.domain),
        }
    }

    /// Host name serving `port` of a sandbox.
    pub fn sandbox_host(&self, sandbox_id: &str, port: u16) -> String {
        format!("{port}-{sandbox_id}.{}.{}", self.region, self.domain)
    }

    /// Data-plane base URL for `port` of a sandbox.
    pub fn sandbox_base_url(&self, sandbox_id: &str, port: u16) -> String {
        match &self.sandbox_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.sandbox_host(sandbox_id, port)),
        }
    }

    /// Control-plane request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Default lifetime of new sandboxes.
    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_secs)
    }
}

/// `<config dir>/ags-sandbox/config.toml` for the current user.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "ags-sandbox")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Credentials consumed once when the client is built.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Gateway API key, sent as `X-API-Key`.
    ApiKey(String),
    /// Cloud secret id/key pair, for a caller-supplied signed control plane.
    SecretPair {
        /// Secret id
        secret_id: String,
        /// Secret key
        secret_key: String,
    },
}

impl Credential {
    /// Resolve credentials from the environment, falling back to `config.api_key`.
    ///
    /// Lookup order: `AGS_API_KEY`, `E2B_API_KEY`, the config file key, then
    /// `TENCENTCLOUD_SECRET_ID` + `TENCENTCLOUD_SECRET_KEY`.
    pub fn from_env(config: &ClientConfig) -> Result<Self> {
        Self::resolve(config, |key| std::env::var(key).ok())
    }

    /// Same as [`Credential::from_env`] with an injectable lookup.
    pub fn resolve(config: &ClientConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("AGS_API_KEY").or_else(|| non_empty("E2B_API_KEY")) {
            return Ok(Self::ApiKey(key));
        }
        if let Some(key) = config.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(Self::ApiKey(key.clone()));
        }
        match (
            non_empty("TENCENTCLOUD_SECRET_ID"),
            non_empty("TENCENTCLOUD_SECRET_KEY"),
        ) {
            (Some(secret_id), Some(secret_key)) => Ok(Self::SecretPair {
                secret_id,
                secret_key,
            }),
            _ => Err(SandboxError::Config(
                "no credential found: set AGS_API_KEY or TENCENTCLOUD_SECRET_ID/TENCENTCLOUD_SECRET_KEY"
                    .into(),
            )),
        }
    }

    /// The gateway API key, if this credential is one.
    pub fn api_key(&self) -> Option<&str> {
        match self {
            Self::ApiKey(key) => Some(key),
            Self::SecretPair { .. } => None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("region", &self.region)
            .field("domain", &self.domain)
            .field("api_url", &self.api_url)
            .field("sandbox_url", &self.sandbox_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("sandbox_timeout_secs", &self.sandbox_timeout_secs)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.debug_tuple("ApiKey").field(&"<redacted>").finish(),
            Self::SecretPair { secret_id, .. } => f
                .debug_struct("SecretPair")
                .field("secret_id", secret_id)
                .field("secret_key", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        assert_eq!(config.region, "ap-guangzhou");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn urls_follow_region_and_domain() {
        let config = ClientConfig::default();
        assert_eq!(config.api_base_url(), "https://api.ap-guangzhou.tencentags.com");
        assert_eq!(
            config.sandbox_base_url("sb1", CODE_INTERPRETER_PORT),
            "https://49999-sb1.ap-guangzhou.tencentags.com"
        );
        assert_eq!(config.sandbox_host("sb1", 9000), "9000-sb1.ap-guangzhou.tencentags.com");
    }

    #[test]
    fn overrides_strip_trailing_slash() {
        let config = ClientConfig {
            api_url: Some("http://127.0.0.1:9/".into()),
            sandbox_url: Some("http://127.0.0.1:10/".into()),
            ..Default::default()
        };
        assert_eq!(config.api_base_url(), "http://127.0.0.1:9");
        assert_eq!(config.sandbox_base_url("x", ENVD_PORT), "http://127.0.0.1:10");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ClientConfig::default();
        config.apply_env(env(&[
            ("AGS_REGION", "ap-shanghai"),
            ("AGS_USE_INTERNAL", "true"),
            ("AGS_SANDBOX_URL", "http://proxy"),
        ]));
        assert_eq!(config.region, "ap-shanghai");
        assert_eq!(config.domain, INTERNAL_DOMAIN);
        assert_eq!(config.sandbox_url.as_deref(), Some("http://proxy"));
    }

    #[test]
    fn toml_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "region = \"ap-beijing\"\nsandbox_timeout_secs = 60\n").unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.region, "ap-beijing");
        assert_eq!(config.sandbox_timeout(), Duration::from_secs(60));
        assert_eq!(config.domain, DEFAULT_DOMAIN);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = ClientConfig::from_toml("region = 5").unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn zero_timeout_rejected() {
        let config = ClientConfig {
            request_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn credential_lookup_order() {
        let config = ClientConfig {
            api_key: Some("from-file".into()),
            ..Default::default()
        };
        let cred = Credential::resolve(&config, env(&[("E2B_API_KEY", "e2b")])).unwrap();
        assert_eq!(cred.api_key(), Some("e2b"));

        let cred = Credential::resolve(&config, env(&[])).unwrap();
        assert_eq!(cred.api_key(), Some("from-file"));

        let cred = Credential::resolve(
            &ClientConfig::default(),
            env(&[
                ("TENCENTCLOUD_SECRET_ID", "id"),
                ("TENCENTCLOUD_SECRET_KEY", "key"),
            ]),
        )
        .unwrap();
        assert!(cred.api_key().is_none());
    }

    #[test]
    fn missing_credential_is_config_error() {
        let err = Credential::resolve(&ClientConfig::default(), env(&[])).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn debug_redacts_secrets() {
        let cred = Credential::SecretPair {
            secret_id: "AKID".into(),
            secret_key: "very-secret".into(),
        };
        let shown = format!("{cred:?}");
        assert!(shown.contains("AKID"));
        assert!(!shown.contains("very-secret"));
        assert!(!format!("{:?}", Credential::ApiKey("k-123".into())).contains("k-123"));
    }
}
