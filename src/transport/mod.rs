//! Data-plane HTTP plumbing shared by the code, command and filesystem clients.
//!
//! Every sandbox exposes two HTTP services: the code interpreter and the
//! in-sandbox daemon (filesystem + processes). [`DataPlane`] holds the base
//! URLs and access token for one sandbox and knows how to issue unary calls,
//! open server streams and move file bytes.

pub mod codec;

use crate::config::{ClientConfig, CODE_INTERPRETER_PORT, ENVD_PORT};
use crate::error::{ErrorBody, Result, SandboxError};
use codec::{encode_envelope, Envelope, EnvelopeDecoder};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Header carrying the per-sandbox access token.
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

const CONNECT_PROTOCOL_HEADER: &str = "Connect-Protocol-Version";
const CONNECT_TIMEOUT_HEADER: &str = "Connect-Timeout-Ms";

/// HTTP endpoints and credentials of one sandbox.
#[derive(Debug)]
pub(crate) struct DataPlane {
    http: reqwest::Client,
    sandbox_id: String,
    envd_url: String,
    code_url: String,
    access_token: Option<String>,
}

impl DataPlane {
    pub(crate) fn new(
        http: reqwest::Client,
        config: &ClientConfig,
        sandbox_id: &str,
        access_token: Option<String>,
    ) -> Self {
        Self {
            http,
            sandbox_id: sandbox_id.to_string(),
            envd_url: config.sandbox_base_url(sandbox_id, ENVD_PORT),
            code_url: config.sandbox_base_url(sandbox_id, CODE_INTERPRETER_PORT),
            access_token,
        }
    }

    pub(crate) fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub(crate) fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    fn authorize(&self, mut req: RequestBuilder, user: Option<&str>) -> RequestBuilder {
        if let Some(token) = &self.access_token {
            req = req.header(ACCESS_TOKEN_HEADER, token);
        }
        if let Some(user) = user {
            req = req.basic_auth(user, None::<&str>);
        }
        req
    }

    /// Unary daemon RPC: JSON in, JSON out.
    pub(crate) async fn unary<Req, Resp>(
        &self,
        method: &str,
        body: &Req,
        user: Option<&str>,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{method}", self.envd_url);
        tracing::debug!(sandbox_id = %self.sandbox_id, method, "Daemon RPC");
        let req = self
            .http
            .post(&url)
            .header(CONNECT_PROTOCOL_HEADER, "1")
            .json(body);
        let resp = check(self.authorize(req, user).send().await?).await?;
        let text = resp.text().await?;
        decode_json(method, if text.trim().is_empty() { "{}" } else { text.as_str() })
    }

    /// Server-streaming daemon RPC.
    pub(crate) async fn server_stream<Req>(
        &self,
        method: &str,
        body: &Req,
        user: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ServerStream>
    where
        Req: Serialize + ?Sized,
    {
        let url = format!("{}/{method}", self.envd_url);
        let payload = serde_json::to_vec(body)?;
        tracing::debug!(sandbox_id = %self.sandbox_id, method, "Opening daemon stream");
        let mut req = self
            .http
            .post(&url)
            .header(CONNECT_PROTOCOL_HEADER, "1")
            .header(reqwest::header::CONTENT_TYPE, "application/connect+json")
            .body(encode_envelope(0, &payload));
        if let Some(limit) = timeout {
            req = req.header(CONNECT_TIMEOUT_HEADER, limit.as_millis().to_string());
        }
        let resp = check(self.authorize(req, user).send().await?).await?;
        Ok(ServerStream::new(method, resp))
    }

    /// POST JSON to the code interpreter; the caller reads the body.
    pub(crate) async fn code_post<Req>(&self, path: &str, body: &Req) -> Result<Response>
    where
        Req: Serialize + ?Sized,
    {
        let url = format!("{}{path}", self.code_url);
        tracing::debug!(sandbox_id = %self.sandbox_id, path, "Code interpreter request");
        let req = self.http.post(&url).json(body);
        check(self.authorize(req, None).send().await?).await
    }

    /// GET JSON from the code interpreter.
    pub(crate) async fn code_get<Resp: DeserializeOwned>(&self, path: &str) -> Result<Resp> {
        let url = format!("{}{path}", self.code_url);
        let req = self.http.get(&url);
        let resp = check(self.authorize(req, None).send().await?).await?;
        let text = resp.text().await?;
        decode_json(path, &text)
    }

    /// DELETE on the code interpreter.
    pub(crate) async fn code_delete(&self, path: &str) -> Result<()> {
        let url = format!("{}{path}", self.code_url);
        let req = self.http.delete(&url);
        check(self.authorize(req, None).send().await?).await?;
        Ok(())
    }

    fn files_url(&self, path: &str, user: &str) -> String {
        format!(
            "{}/files?path={}&username={}",
            self.envd_url,
            urlencoding::encode(path),
            urlencoding::encode(user)
        )
    }

    /// Open a file for reading; the body is the raw file content.
    pub(crate) async fn download(&self, path: &str, user: &str) -> Result<Response> {
        tracing::debug!(sandbox_id = %self.sandbox_id, path, "Downloading file");
        let req = self.http.get(self.files_url(path, user));
        check(self.authorize(req, Some(user)).send().await?).await
    }

    /// Upload file content as a multipart form.
    pub(crate) async fn upload(&self, path: &str, user: &str, content: Vec<u8>) -> Result<Response> {
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            path,
            content_len = content.len(),
            "Uploading file"
        );
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let req = self.http.post(self.files_url(path, user)).multipart(form);
        check(self.authorize(req, Some(user)).send().await?).await
    }
}

/// Turn a non-success response into a [`SandboxError`].
pub(crate) async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable>".to_string());
    tracing::debug!(%status, body = %body, "Service returned error status");
    Err(SandboxError::from_status(status, &body))
}

pub(crate) fn decode_json<T: DeserializeOwned>(what: &str, text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| SandboxError::Protocol(format!("cannot decode {what} response: {e}; body: {text}")))
}

#[derive(Debug, Deserialize)]
struct EndStream {
    #[serde(default)]
    error: Option<ErrorBody>,
}

/// A Connect server stream of JSON messages.
pub(crate) struct ServerStream {
    method: String,
    response: Response,
    decoder: EnvelopeDecoder,
    queue: VecDeque<Envelope>,
    finished: bool,
}

impl ServerStream {
    fn new(method: &str, response: Response) -> Self {
        Self {
            method: method.to_string(),
            response,
            decoder: EnvelopeDecoder::new(),
            queue: VecDeque::new(),
            finished: false,
        }
    }

    /// Next message, `None` once the stream ended cleanly.
    ///
    /// An error trailer becomes an `Err`.
    pub(crate) async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(envelope) = self.queue.pop_front() {
                if envelope.is_end_stream() {
                    self.finished = true;
                    self.queue.clear();
                    return end_of_stream(&envelope.payload).map(|()| None);
                }
                tracing::trace!(method = %self.method, len = envelope.payload.len(), "Stream frame");
                return serde_json::from_slice(&envelope.payload)
                    .map(Some)
                    .map_err(|e| {
                        SandboxError::Protocol(format!("bad {} frame: {e}", self.method))
                    });
            }
            if self.finished {
                return Ok(None);
            }
            match self.response.chunk().await? {
                Some(chunk) => self.queue.extend(self.decoder.push(&chunk)?),
                None => {
                    self.finished = true;
                    if self.decoder.pending() > 0 {
                        return Err(SandboxError::Protocol(format!(
                            "{} stream ended inside a frame",
                            self.method
                        )));
                    }
                }
            }
        }
    }
}

fn end_of_stream(payload: &[u8]) -> Result<()> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    let trailer: EndStream = serde_json::from_slice(payload)
        .map_err(|e| SandboxError::Protocol(format!("bad end-of-stream trailer: {e}")))?;
    match trailer.error {
        Some(err) => Err(SandboxError::from_rpc(
            err.code.as_deref().unwrap_or("unknown"),
            err.message.unwrap_or_default(),
        )),
        None => Ok(()),
    }
}

/// Run `fut` under an optional deadline and cancellation token.
///
/// Neither outcome stops remote work; that takes an explicit kill.
pub(crate) async fn bounded<T, F>(
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timed = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| SandboxError::Timeout(limit))?,
            None => fut.await,
        }
    };
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(SandboxError::Cancelled),
                res = timed => res,
            }
        }
        None => timed.await,
    }
}

/// Data plane whose every port is served by `base_url` (a mock server).
#[cfg(test)]
pub(crate) fn mock_data_plane(base_url: &str) -> std::sync::Arc<DataPlane> {
    let config = ClientConfig {
        sandbox_url: Some(base_url.to_string()),
        ..Default::default()
    };
    std::sync::Arc::new(DataPlane::new(
        reqwest::Client::new(),
        &config,
        "sb-test",
        Some("access-token".into()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_trailer_is_ok() {
        assert!(end_of_stream(b"").is_ok());
        assert!(end_of_stream(b"{}").is_ok());
        assert!(end_of_stream(br#"{"metadata":{}}"#).is_ok());
    }

    #[test]
    fn error_trailer_maps_code() {
        let err = end_of_stream(br#"{"error":{"code":"not_found","message":"process 9 not found"}}"#)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let err = bounded(Some(Duration::from_millis(10)), None, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn bounded_cancels() {
        let token = CancellationToken::new();
        token.cancel();
        let err = bounded(None, Some(&token), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled));
    }

    #[tokio::test]
    async fn bounded_passes_result_through() {
        let token = CancellationToken::new();
        let v = bounded(Some(Duration::from_secs(5)), Some(&token), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }
}
