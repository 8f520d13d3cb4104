//! Code execution inside a sandbox's interpreter.
//!
//! [`CodeInterpreter::run_code`] submits a snippet and consumes the
//! interpreter's newline-delimited event stream. Output chunks reach the
//! caller's [`OutputHandler`](crate::output::OutputHandler) in arrival order
//! before the call returns. Failures of the executed code are data
//! ([`Execution::error`]), not `Err`.

use crate::error::{Result, SandboxError};
use crate::output::{emit, OutputSink, OutputStream};
use crate::transport::codec::LineDecoder;
use crate::transport::{bounded, DataPlane};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Persistent interpreter state that `run_code` calls can share.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CodeContext {
    pub id: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub cwd: String,
}

/// Options for [`CodeInterpreter::create_code_context`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateCodeContextConfig {
    /// Working directory; the interpreter default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Interpreter language; Python when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl CreateCodeContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Options for [`CodeInterpreter::run_code`].
///
/// `context_id` binds the run to a [`CodeContext`]; `language` picks the
/// default context of a language instead. Setting both is rejected.
#[derive(Debug, Clone, Default)]
pub struct RunCodeConfig {
    pub context_id: Option<String>,
    pub language: Option<String>,
    pub envs: HashMap<String, String>,
    /// Client-side deadline for the whole execution.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RunCodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: &CodeContext) -> Self {
        self.context_id = Some(context.id.clone());
        self
    }

    pub fn context_id(mut self, id: impl Into<String>) -> Self {
        self.context_id = Some(id.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.context_id.is_some() && self.language.is_some() {
            return Err(SandboxError::Config(
                "context_id and language are mutually exclusive".into(),
            ));
        }
        if self.language.as_deref().is_some_and(|l| l.trim().is_empty()) {
            return Err(SandboxError::Config("language must not be empty".into()));
        }
        Ok(())
    }
}

/// One structured output of an expression, in every format the interpreter produced.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExecutionOutput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub markdown: Option<String>,
    #[serde(default)]
    pub svg: Option<String>,
    /// Base64 PNG.
    #[serde(default)]
    pub png: Option<String>,
    /// Base64 JPEG.
    #[serde(default)]
    pub jpeg: Option<String>,
    #[serde(default)]
    pub pdf: Option<String>,
    #[serde(default)]
    pub latex: Option<String>,
    #[serde(default)]
    pub json: Option<serde_json::Value>,
    #[serde(default)]
    pub javascript: Option<String>,
    /// True for the value of the last expression of the cell.
    #[serde(default)]
    pub is_main_result: bool,
    /// Formats this client does not model.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ExecutionOutput {
    /// Names of the formats present.
    pub fn formats(&self) -> Vec<&str> {
        let known = [
            ("text", self.text.is_some()),
            ("html", self.html.is_some()),
            ("markdown", self.markdown.is_some()),
            ("svg", self.svg.is_some()),
            ("png", self.png.is_some()),
            ("jpeg", self.jpeg.is_some()),
            ("pdf", self.pdf.is_some()),
            ("latex", self.latex.is_some()),
            ("json", self.json.is_some()),
            ("javascript", self.javascript.is_some()),
        ];
        known
            .into_iter()
            .filter_map(|(name, present)| present.then_some(name))
            .chain(self.extra.keys().map(String::as_str))
            .collect()
    }
}

/// Runtime failure of the executed code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecutionError {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub traceback: String,
}

/// Captured stdout/stderr chunks, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Logs {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Result of one `run_code` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub results: Vec<ExecutionOutput>,
    pub logs: Logs,
    pub error: Option<ExecutionError>,
    pub execution_count: Option<u64>,
}

impl Execution {
    /// Text of the main result, if any.
    pub fn text(&self) -> Option<&str> {
        self.results
            .iter()
            .find(|r| r.is_main_result)
            .and_then(|r| r.text.as_deref())
    }

    /// All stdout chunks joined.
    pub fn stdout(&self) -> String {
        self.logs.stdout.concat()
    }

    /// All stderr chunks joined.
    pub fn stderr(&self) -> String {
        self.logs.stderr.concat()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ExecutionEvent {
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    Result(ExecutionOutput),
    Error(ExecutionError),
    NumberOfExecutions {
        execution_count: u64,
    },
    EndOfExecution,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    #[serde(skip_serializing_if = "no_envs")]
    env_vars: &'a HashMap<String, String>,
}

fn no_envs(envs: &&HashMap<String, String>) -> bool {
    envs.is_empty()
}

/// Folds interpreter events into an [`Execution`].
struct ExecutionBuilder<'a> {
    execution: Execution,
    sink: Option<&'a OutputSink>,
    finished: bool,
}

impl<'a> ExecutionBuilder<'a> {
    fn new(sink: Option<&'a OutputSink>) -> Self {
        Self {
            execution: Execution::default(),
            sink,
            finished: false,
        }
    }

    fn apply(&mut self, line: &str) -> Result<()> {
        let event: ExecutionEvent = serde_json::from_str(line)
            .map_err(|e| SandboxError::Protocol(format!("bad execution event: {e}; line: {line}")))?;
        match event {
            ExecutionEvent::Stdout { text } => {
                emit(self.sink, OutputStream::Stdout, text.as_bytes());
                self.execution.logs.stdout.push(text);
            }
            ExecutionEvent::Stderr { text } => {
                emit(self.sink, OutputStream::Stderr, text.as_bytes());
                self.execution.logs.stderr.push(text);
            }
            ExecutionEvent::Result(output) => self.execution.results.push(output),
            ExecutionEvent::Error(error) => self.execution.error = Some(error),
            ExecutionEvent::NumberOfExecutions { execution_count } => {
                self.execution.execution_count = Some(execution_count);
            }
            ExecutionEvent::EndOfExecution => self.finished = true,
            ExecutionEvent::Unknown => tracing::trace!(line, "Ignoring unknown execution event"),
        }
        Ok(())
    }
}

/// Code interpreter of one sandbox.
#[derive(Debug, Clone)]
pub struct CodeInterpreter {
    data: Arc<DataPlane>,
}

impl CodeInterpreter {
    pub(crate) fn new(data: Arc<DataPlane>) -> Self {
        Self { data }
    }

    /// Allocate persistent interpreter state.
    pub async fn create_code_context(&self, config: CreateCodeContextConfig) -> Result<CodeContext> {
        let resp = self
            .data
            .code_post("/contexts", &config)
            .await
            .map_err(SandboxError::into_config_error)?;
        let text = resp.text().await?;
        let context: CodeContext = crate::transport::decode_json("create context", &text)?;
        tracing::debug!(
            sandbox_id = %self.data.sandbox_id(),
            context_id = %context.id,
            language = %context.language,
            "Code context created"
        );
        Ok(context)
    }

    /// Contexts currently alive in the interpreter.
    pub async fn list_code_contexts(&self) -> Result<Vec<CodeContext>> {
        self.data.code_get("/contexts").await
    }

    /// Discard a context and its state.
    pub async fn remove_code_context(&self, context_id: &str) -> Result<()> {
        self.data
            .code_delete(&format!("/contexts/{}", urlencoding::encode(context_id)))
            .await
    }

    /// Reset a context's state, keeping its id.
    pub async fn restart_code_context(&self, context_id: &str) -> Result<()> {
        let path = format!("/contexts/{}/restart", urlencoding::encode(context_id));
        self.data.code_post(&path, &serde_json::json!({})).await?;
        Ok(())
    }

    /// Execute `code` and wait for it to finish.
    ///
    /// Every stdout/stderr chunk is handed to `output` (when given) before
    /// this returns.
    pub async fn run_code(
        &self,
        code: &str,
        config: RunCodeConfig,
        output: Option<OutputSink>,
    ) -> Result<Execution> {
        config.validate()?;
        let started = Instant::now();
        let body = ExecuteBody {
            code,
            context_id: config.context_id.as_deref(),
            language: config.language.as_deref(),
            env_vars: &config.envs,
        };
        let run = async {
            let mut resp = self
                .data
                .code_post("/execute", &body)
                .await
                .map_err(SandboxError::into_config_error)?;
            let mut decoder = LineDecoder::new();
            let mut builder = ExecutionBuilder::new(output.as_ref());
            while let Some(chunk) = resp.chunk().await? {
                for line in decoder.push(&chunk) {
                    builder.apply(&line)?;
                }
            }
            if let Some(line) = decoder.finish() {
                builder.apply(&line)?;
            }
            if !builder.finished {
                return Err(SandboxError::Protocol(
                    "execution stream ended before completion".into(),
                ));
            }
            Ok(builder.execution)
        };
        let execution = bounded(config.timeout, config.cancel.as_ref(), run).await?;
        tracing::debug!(
            sandbox_id = %self.data.sandbox_id(),
            context_id = config.context_id.as_deref().unwrap_or("default"),
            failed = execution.error.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Code executed"
        );
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{channel, Callbacks};
    use crate::transport::mock_data_plane;
    use parking_lot::Mutex;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ndjson(events: &[serde_json::Value]) -> String {
        events.iter().map(|e| format!("{e}\n")).collect()
    }

    async fn interpreter(server: &MockServer) -> CodeInterpreter {
        CodeInterpreter::new(mock_data_plane(&server.uri()))
    }

    #[tokio::test]
    async fn stdout_callbacks_follow_print_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(header("X-Access-Token", "access-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                json!({"type": "stdout", "text": "a\n"}),
                json!({"type": "stderr", "text": "warn\n"}),
                json!({"type": "stdout", "text": "b\n"}),
                json!({"type": "number_of_executions", "execution_count": 1}),
                json!({"type": "end_of_execution"}),
            ])))
            .mount(&server)
            .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sink = Callbacks::new()
            .on_stdout(move |b| s.lock().push(String::from_utf8_lossy(b).into_owned()))
            .into_sink();

        let exec = interpreter(&server)
            .await
            .run_code("print('a'); print('b')", RunCodeConfig::new(), Some(sink))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["a\n", "b\n"]);
        assert_eq!(exec.stdout(), "a\nb\n");
        assert_eq!(exec.logs.stderr, vec!["warn\n"]);
        assert_eq!(exec.execution_count, Some(1));
        assert!(exec.error.is_none());
    }

    #[tokio::test]
    async fn context_id_is_relayed_and_state_comes_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contexts"))
            .and(body_partial_json(json!({"language": "python", "cwd": "/tmp"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ctx-1", "language": "python", "cwd": "/tmp"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(json!({"code": "print(x)", "context_id": "ctx-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                json!({"type": "stdout", "text": "1\n"}),
                json!({"type": "end_of_execution"}),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let code = interpreter(&server).await;
        let ctx = code
            .create_code_context(CreateCodeContextConfig::new().cwd("/tmp").language("python"))
            .await
            .unwrap();
        assert_eq!(ctx.id, "ctx-1");

        let exec = code
            .run_code("print(x)", RunCodeConfig::new().context(&ctx), None)
            .await
            .unwrap();
        assert_eq!(exec.stdout(), "1\n");
    }

    #[tokio::test]
    async fn runtime_error_is_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                json!({"type": "error", "name": "NameError", "value": "name 'y' is not defined", "traceback": "..."}),
                json!({"type": "end_of_execution"}),
            ])))
            .mount(&server)
            .await;

        let exec = interpreter(&server)
            .await
            .run_code("y", RunCodeConfig::new(), None)
            .await
            .unwrap();
        let err = exec.error.unwrap();
        assert_eq!(err.name, "NameError");
        assert!(err.value.contains("'y'"));
    }

    #[tokio::test]
    async fn results_keep_all_formats() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                json!({"type": "result", "text": "2", "is_main_result": true, "vega": {"k": 1}}),
                json!({"type": "end_of_execution"}),
            ])))
            .mount(&server)
            .await;

        let exec = interpreter(&server)
            .await
            .run_code("1+1", RunCodeConfig::new().language("python"), None)
            .await
            .unwrap();
        assert_eq!(exec.text(), Some("2"));
        assert_eq!(exec.results[0].formats(), vec!["text", "vega"]);
    }

    #[tokio::test]
    async fn unsupported_language_is_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contexts"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"message": "unsupported language: cobol"})),
            )
            .mount(&server)
            .await;

        let err = interpreter(&server)
            .await
            .create_code_context(CreateCodeContextConfig::new().language("cobol"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(m) if m.contains("cobol")));
    }

    #[tokio::test]
    async fn context_and_language_are_exclusive() {
        let server = MockServer::start().await;
        let err = interpreter(&server)
            .await
            .run_code(
                "1",
                RunCodeConfig::new().context_id("c").language("python"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[tokio::test]
    async fn truncated_stream_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
                json!({"type": "stdout", "text": "partial"}),
            ])))
            .mount(&server)
            .await;

        let (sink, mut rx) = channel();
        let err = interpreter(&server)
            .await
            .run_code("loop()", RunCodeConfig::new(), Some(sink))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)));
        assert_eq!(rx.recv().await.unwrap().text(), "partial");
    }

    #[tokio::test]
    async fn timeout_surfaces_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(ndjson(&[json!({"type": "end_of_execution"})]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let err = interpreter(&server)
            .await
            .run_code(
                "import time; time.sleep(60)",
                RunCodeConfig::new().timeout(Duration::from_millis(50)),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn context_management_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contexts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "default-python", "language": "python", "cwd": "/home/user"},
                {"id": "ctx-1", "language": "python", "cwd": "/tmp"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/contexts/ctx-1/restart"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/contexts/ctx-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let code = interpreter(&server).await;
        let contexts = code.list_code_contexts().await.unwrap();
        assert_eq!(contexts.len(), 2);
        code.restart_code_context("ctx-1").await.unwrap();
        code.remove_code_context("ctx-1").await.unwrap();
    }
}
