//! Sandbox handles and their lifecycle.
//!
//! A [`Sandbox`] is a connection to one remote instance. It is never released
//! implicitly: call [`Sandbox::kill`], hold it in a [`SandboxGuard`], or run
//! the work inside [`Sandbox::scoped`].

use crate::api::{CreateSandboxRequest, ListOptions, SandboxAccess, SandboxSummary};
use crate::client::Client;
use crate::code::CodeInterpreter;
use crate::commands::Commands;
use crate::error::{Result, SandboxError};
use crate::filesystem::Filesystem;
use crate::transport::DataPlane;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Options for [`Sandbox::create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Sandbox lifetime; the client config default when unset.
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, String>,
    /// Environment variables visible to every process in the sandbox.
    pub envs: HashMap<String, String>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }
}

/// Options for [`Sandbox::connect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// New remaining lifetime; the client config default when unset.
    pub timeout: Option<Duration>,
}

/// Handle to one remote sandbox. Clones share the same connection.
#[derive(Clone)]
pub struct Sandbox {
    client: Client,
    template_id: Option<String>,
    data: Arc<DataPlane>,
}

impl Sandbox {
    /// Provision a new sandbox from a tool profile such as `code-interpreter-v1`.
    pub async fn create(client: &Client, tool_id: &str, options: CreateOptions) -> Result<Self> {
        if tool_id.trim().is_empty() {
            return Err(SandboxError::Config("tool id must not be empty".into()));
        }
        let started = Instant::now();
        let request = CreateSandboxRequest {
            template_id: tool_id.to_string(),
            timeout: options
                .timeout
                .unwrap_or_else(|| client.config().sandbox_timeout()),
            metadata: options.metadata,
            envs: options.envs,
        };
        let access = client.control().create(&request).await?;
        tracing::info!(
            sandbox_id = %access.sandbox_id,
            tool_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sandbox created"
        );
        Ok(Self::from_access(client, access))
    }

    /// Attach to a running sandbox without re-provisioning it.
    pub async fn connect(client: &Client, sandbox_id: &str, options: ConnectOptions) -> Result<Self> {
        if sandbox_id.trim().is_empty() {
            return Err(SandboxError::Config("sandbox id must not be empty".into()));
        }
        let timeout = options
            .timeout
            .unwrap_or_else(|| client.config().sandbox_timeout());
        let access = client.control().connect(sandbox_id, timeout).await?;
        tracing::info!(sandbox_id = %access.sandbox_id, "Connected to sandbox");
        Ok(Self::from_access(client, access))
    }

    /// Live sandboxes visible to the client's credential.
    pub async fn list(client: &Client, options: &ListOptions) -> Result<Vec<SandboxSummary>> {
        client.control().list(options).await
    }

    /// Describe a sandbox by id without attaching to it.
    pub async fn info_by_id(client: &Client, sandbox_id: &str) -> Result<SandboxSummary> {
        client.control().info(sandbox_id).await
    }

    /// Terminate a sandbox by id. Succeeds when it is already gone.
    pub async fn kill_by_id(client: &Client, sandbox_id: &str) -> Result<()> {
        client.control().kill(sandbox_id).await?;
        tracing::info!(sandbox_id, "Sandbox killed");
        Ok(())
    }

    /// Create a sandbox, run `f` with it, and kill it on every exit path.
    ///
    /// An error from `f` takes precedence over a failed kill, which is then
    /// only logged. If the returned future is dropped early or `f` panics,
    /// the kill is spawned on the current runtime.
    pub async fn scoped<T, E, F, Fut>(
        client: &Client,
        tool_id: &str,
        options: CreateOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(Sandbox) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<SandboxError>,
    {
        let guard = Self::create(client, tool_id, options).await?.guard();
        let outcome = f(guard.sandbox.clone()).await;
        let sandbox_id = guard.id().to_string();
        let killed = guard.kill().await;
        match (outcome, killed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(kill_err)) => {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    error = %kill_err,
                    "Failed to kill sandbox after error"
                );
                Err(err)
            }
        }
    }

    fn from_access(client: &Client, access: SandboxAccess) -> Self {
        Self {
            client: client.clone(),
            template_id: access.template_id.clone(),
            data: Arc::new(client.data_plane(&access)),
        }
    }

    pub fn id(&self) -> &str {
        self.data.sandbox_id()
    }

    /// Tool profile the sandbox was created from, when the service reports it.
    pub fn template_id(&self) -> Option<&str> {
        self.template_id.as_deref()
    }

    /// Token sent as `X-Access-Token` on data-plane requests.
    pub fn access_token(&self) -> Option<&str> {
        self.data.access_token()
    }

    /// Public host name for a port exposed by the sandbox.
    pub fn get_host(&self, port: u16) -> String {
        self.client.config().sandbox_host(self.id(), port)
    }

    /// Current state as reported by the control plane.
    pub async fn info(&self) -> Result<SandboxSummary> {
        self.client.control().info(self.id()).await
    }

    /// Reset the remaining lifetime.
    pub async fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.client.control().set_timeout(self.id(), timeout).await?;
        tracing::debug!(sandbox_id = %self.id(), timeout_secs = timeout.as_secs(), "Sandbox timeout updated");
        Ok(())
    }

    /// Terminate and release the sandbox. Idempotent.
    pub async fn kill(&self) -> Result<()> {
        Self::kill_by_id(&self.client, self.id()).await
    }

    /// Code interpreter of this sandbox.
    pub fn code(&self) -> CodeInterpreter {
        CodeInterpreter::new(self.data.clone())
    }

    /// Process management of this sandbox.
    pub fn commands(&self) -> Commands {
        Commands::new(self.data.clone())
    }

    /// Filesystem of this sandbox.
    pub fn files(&self) -> Filesystem {
        Filesystem::new(self.data.clone())
    }

    /// Kill the sandbox when the returned guard is dropped.
    pub fn guard(self) -> SandboxGuard {
        SandboxGuard {
            sandbox: self,
            armed: true,
        }
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id())
            .field("template_id", &self.template_id)
            .finish_non_exhaustive()
    }
}

/// Owns a sandbox and kills it on drop.
///
/// Dropping spawns the kill on the current tokio runtime; outside a runtime
/// the sandbox is left to expire and a warning is logged. Prefer
/// [`SandboxGuard::kill`] where the outcome matters.
#[derive(Debug)]
pub struct SandboxGuard {
    sandbox: Sandbox,
    armed: bool,
}

impl SandboxGuard {
    /// Kill now and report the outcome.
    ///
    /// Stays armed until the call finishes, so dropping it midway still
    /// spawns a kill.
    pub async fn kill(mut self) -> Result<()> {
        let result = self.sandbox.kill().await;
        self.armed = false;
        result
    }

    /// Disarm the guard and hand back the sandbox.
    pub fn release(mut self) -> Sandbox {
        self.armed = false;
        self.sandbox.clone()
    }
}

impl Deref for SandboxGuard {
    type Target = Sandbox;

    fn deref(&self) -> &Sandbox {
        &self.sandbox
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let sandbox = self.sandbox.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sandbox.kill().await {
                        tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "Failed to kill sandbox on drop");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %sandbox.id(),
                    "Sandbox guard dropped outside a runtime; sandbox left to expire"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ControlPlane;
    use crate::config::{ClientConfig, Credential};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records lifecycle calls without any network.
    #[derive(Default)]
    struct RecordingPlane {
        killed: Mutex<Vec<String>>,
        fail_kill: bool,
    }

    #[async_trait]
    impl ControlPlane for RecordingPlane {
        async fn create(&self, request: &CreateSandboxRequest) -> Result<SandboxAccess> {
            Ok(SandboxAccess {
                sandbox_id: format!("sb-{}", request.template_id),
                template_id: Some(request.template_id.clone()),
                access_token: Some("tok".into()),
            })
        }

        async fn connect(&self, sandbox_id: &str, _timeout: Duration) -> Result<SandboxAccess> {
            Ok(SandboxAccess {
                sandbox_id: sandbox_id.into(),
                template_id: None,
                access_token: None,
            })
        }

        async fn list(&self, _options: &ListOptions) -> Result<Vec<SandboxSummary>> {
            Ok(Vec::new())
        }

        async fn info(&self, sandbox_id: &str) -> Result<SandboxSummary> {
            Err(SandboxError::NotFound(sandbox_id.into()))
        }

        async fn kill(&self, sandbox_id: &str) -> Result<()> {
            self.killed.lock().push(sandbox_id.to_string());
            if self.fail_kill {
                return Err(SandboxError::Transport("gateway down".into()));
            }
            Ok(())
        }

        async fn set_timeout(&self, _sandbox_id: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn recording_client(plane: Arc<RecordingPlane>) -> Client {
        Client::with_control_plane(plane, ClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn scoped_kills_on_success() {
        let plane = Arc::new(RecordingPlane::default());
        let client = recording_client(plane.clone());

        let id = Sandbox::scoped(&client, "tool", CreateOptions::new(), |sb| async move {
            Ok::<_, SandboxError>(sb.id().to_string())
        })
        .await
        .unwrap();

        assert_eq!(id, "sb-tool");
        assert_eq!(*plane.killed.lock(), vec!["sb-tool".to_string()]);
    }

    #[tokio::test]
    async fn scoped_kills_on_error_and_keeps_original_error() {
        let plane = Arc::new(RecordingPlane {
            fail_kill: true,
            ..Default::default()
        });
        let client = recording_client(plane.clone());

        let err = Sandbox::scoped(&client, "tool", CreateOptions::new(), |_sb| async move {
            Err::<(), _>(SandboxError::Config("boom".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SandboxError::Config(m) if m == "boom"));
        assert_eq!(plane.killed.lock().len(), 1);
    }

    #[tokio::test]
    async fn scoped_reports_kill_failure_after_success() {
        let plane = Arc::new(RecordingPlane {
            fail_kill: true,
            ..Default::default()
        });
        let client = recording_client(plane);

        let err = Sandbox::scoped(&client, "tool", CreateOptions::new(), |_sb| async move {
            Ok::<_, SandboxError>(())
        })
        .await
        .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn guard_kills_on_drop() {
        let plane = Arc::new(RecordingPlane::default());
        let client = recording_client(plane.clone());

        {
            let sandbox = Sandbox::create(&client, "tool", CreateOptions::new()).await.unwrap();
            let _guard = sandbox.guard();
        }
        for _ in 0..50 {
            if !plane.killed.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*plane.killed.lock(), vec!["sb-tool".to_string()]);
    }

    async fn wait_for_kills(plane: &RecordingPlane, n: usize) {
        for _ in 0..50 {
            if plane.killed.lock().len() >= n {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn scoped_kills_when_abandoned() {
        let plane = Arc::new(RecordingPlane::default());
        let client = recording_client(plane.clone());

        let res = tokio::time::timeout(
            Duration::from_millis(50),
            Sandbox::scoped(&client, "tool", CreateOptions::new(), |_sb| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, SandboxError>(())
            }),
        )
        .await;
        assert!(res.is_err());

        wait_for_kills(&plane, 1).await;
        assert_eq!(*plane.killed.lock(), vec!["sb-tool".to_string()]);
    }

    #[tokio::test]
    async fn scoped_kills_when_body_panics() {
        let plane = Arc::new(RecordingPlane::default());
        let client = recording_client(plane.clone());

        let task = tokio::spawn(async move {
            Sandbox::scoped(&client, "tool", CreateOptions::new(), |_sb| async move {
                if true {
                    panic!("body failed");
                }
                Ok::<_, SandboxError>(())
            })
            .await
        });
        assert!(task.await.unwrap_err().is_panic());

        wait_for_kills(&plane, 1).await;
        assert_eq!(plane.killed.lock().len(), 1);
    }

    #[tokio::test]
    async fn guard_kill_then_drop_kills_once() {
        let plane = Arc::new(RecordingPlane::default());
        let client = recording_client(plane.clone());

        let guard = Sandbox::create(&client, "tool", CreateOptions::new())
            .await
            .unwrap()
            .guard();
        guard.kill().await.unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*plane.killed.lock(), vec!["sb-tool".to_string()]);
    }

    #[tokio::test]
    async fn released_guard_does_not_kill() {
        let plane = Arc::new(RecordingPlane::default());
        let client = recording_client(plane.clone());

        let sandbox = Sandbox::create(&client, "tool", CreateOptions::new()).await.unwrap();
        let sandbox = sandbox.guard().release();
        tokio::task::yield_now().await;
        assert!(plane.killed.lock().is_empty());
        assert_eq!(sandbox.id(), "sb-tool");
    }

    #[tokio::test]
    async fn empty_tool_id_rejected() {
        let client = recording_client(Arc::new(RecordingPlane::default()));
        let err = Sandbox::create(&client, "  ", CreateOptions::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[tokio::test]
    async fn get_host_uses_region_and_domain() {
        let client = recording_client(Arc::new(RecordingPlane::default()));
        let sandbox = Sandbox::connect(&client, "abc", ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(sandbox.get_host(8080), "8080-abc.ap-guangzhou.tencentags.com");
        assert!(sandbox.access_token().is_none());
    }

    #[tokio::test]
    async fn create_connect_kill_through_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandboxes"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "sandboxID": "sb-42",
                "templateID": "code-interpreter-v1",
                "envdAccessToken": "first"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sandboxes/sb-42/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sandboxID": "sb-42",
                "envdAccessToken": "second"
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/sandboxes/sb-42"))
            .respond_with(ResponseTemplate::new(204))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/sandboxes/sb-42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = ClientConfig {
            api_url: Some(server.uri()),
            ..Default::default()
        };
        let client = Client::new(Credential::ApiKey("k".into()), config).unwrap();

        let created = Sandbox::create(&client, "code-interpreter-v1", CreateOptions::new())
            .await
            .unwrap();
        assert!(!created.id().is_empty());
        assert_eq!(created.template_id(), Some("code-interpreter-v1"));

        let attached = Sandbox::connect(&client, created.id(), ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(attached.id(), created.id());
        assert_eq!(attached.access_token(), Some("second"));

        created.kill().await.unwrap();
        created.kill().await.unwrap();
    }
}
