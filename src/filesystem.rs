//! Files and directories inside a sandbox.

use crate::config::DEFAULT_USER;
use crate::error::{Result, SandboxError};
use crate::transport::{decode_json, DataPlane};
use chrono::{DateTime, Utc};
use reqwest::Response;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

/// Options shared by every filesystem call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOptions {
    /// In-sandbox user for permission checks.
    pub user: String,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
        }
    }
}

impl FileOptions {
    pub fn user(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

/// Options for [`Filesystem::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDirOptions {
    /// Levels to descend; 1 lists only the directory itself.
    pub depth: u32,
    pub user: String,
}

impl Default for ListDirOptions {
    fn default() -> Self {
        Self {
            depth: 1,
            user: DEFAULT_USER.to_string(),
        }
    }
}

impl ListDirOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum FileType {
    File,
    Dir,
    #[default]
    Unknown,
}

impl From<String> for FileType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "FILE_TYPE_FILE" | "file" => Self::File,
            "FILE_TYPE_DIRECTORY" | "dir" | "directory" => Self::Dir,
            _ => Self::Unknown,
        }
    }
}

/// Metadata about one filesystem object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub file_type: FileType,
    #[serde(default)]
    pub path: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub size: u64,
    /// Unix mode bits.
    #[serde(default)]
    pub mode: u32,
    /// Symbolic permissions, e.g. `-rw-r--r--`.
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub symlink_target: Option<String>,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }
}

/// What a write created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WriteInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub file_type: FileType,
    #[serde(default)]
    pub path: String,
}

/// 64-bit integers arrive as JSON strings from the daemon.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Serialize)]
struct PathRequest<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct ListDirRequest<'a> {
    path: &'a str,
    depth: u32,
}

#[derive(Serialize)]
struct MoveRequest<'a> {
    source: &'a str,
    destination: &'a str,
}

#[derive(Deserialize)]
struct ListDirResponse {
    #[serde(default)]
    entries: Vec<EntryInfo>,
}

#[derive(Deserialize)]
struct EntryResponse {
    entry: EntryInfo,
}

#[derive(Deserialize)]
struct Empty {}

/// File content being received.
#[derive(Debug)]
pub struct FileStream {
    response: Response,
}

impl FileStream {
    /// Next chunk of content, `None` at end of file.
    pub async fn chunk(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.response.chunk().await?.map(|c| c.to_vec()))
    }

    /// Size announced by the server, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }
}

/// Filesystem of one sandbox.
#[derive(Debug, Clone)]
pub struct Filesystem {
    data: Arc<DataPlane>,
}

impl Filesystem {
    pub(crate) fn new(data: Arc<DataPlane>) -> Self {
        Self { data }
    }

    /// Stream a file's content.
    pub async fn read_stream(&self, path: &str, options: &FileOptions) -> Result<FileStream> {
        let response = self
            .data
            .download(path, &options.user)
            .await
            .map_err(SandboxError::into_path_error)?;
        Ok(FileStream { response })
    }

    /// Whole file content.
    pub async fn read(&self, path: &str, options: &FileOptions) -> Result<Vec<u8>> {
        let mut stream = self.read_stream(path, options).await?;
        let mut content = Vec::new();
        while let Some(chunk) = stream.chunk().await? {
            content.extend_from_slice(&chunk);
        }
        tracing::debug!(sandbox_id = %self.data.sandbox_id(), path, len = content.len(), "File read");
        Ok(content)
    }

    /// Whole file content as UTF-8 text, lossily decoded.
    pub async fn read_to_string(&self, path: &str, options: &FileOptions) -> Result<String> {
        let content = self.read(path, options).await?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Create or overwrite a file.
    pub async fn write(
        &self,
        path: &str,
        content: impl Into<Vec<u8>>,
        options: &FileOptions,
    ) -> Result<WriteInfo> {
        let resp = self
            .data
            .upload(path, &options.user, content.into())
            .await
            .map_err(SandboxError::into_path_error)?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(WriteInfo {
                name: file_name(path),
                file_type: FileType::File,
                path: path.to_string(),
            });
        }
        let mut written: Vec<WriteInfo> = decode_json("write file", &text)?;
        if written.is_empty() {
            return Err(SandboxError::Protocol(format!("write of {path} reported no file")));
        }
        Ok(written.swap_remove(0))
    }

    /// Directory entries up to `options.depth` levels deep.
    pub async fn list(&self, path: &str, options: &ListDirOptions) -> Result<Vec<EntryInfo>> {
        if options.depth == 0 {
            return Err(SandboxError::Config("depth must be at least 1".into()));
        }
        let request = ListDirRequest {
            path,
            depth: options.depth,
        };
        let resp: ListDirResponse = self
            .data
            .unary("filesystem.Filesystem/ListDir", &request, Some(&options.user))
            .await
            .map_err(SandboxError::into_path_error)?;
        Ok(resp.entries)
    }

    /// Metadata of one path.
    pub async fn get_info(&self, path: &str, options: &FileOptions) -> Result<EntryInfo> {
        let resp: EntryResponse = self
            .data
            .unary("filesystem.Filesystem/Stat", &PathRequest { path }, Some(&options.user))
            .await
            .map_err(SandboxError::into_path_error)?;
        Ok(resp.entry)
    }

    /// Whether `path` exists. Absence is `Ok(false)`, never an error.
    pub async fn exists(&self, path: &str, options: &FileOptions) -> Result<bool> {
        match self.get_info(path, options).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move `old_path` to `new_path`.
    pub async fn rename(&self, old_path: &str, new_path: &str, options: &FileOptions) -> Result<()> {
        let request = MoveRequest {
            source: old_path,
            destination: new_path,
        };
        let _: Empty = self
            .data
            .unary("filesystem.Filesystem/Move", &request, Some(&options.user))
            .await
            .map_err(SandboxError::into_path_error)?;
        tracing::debug!(sandbox_id = %self.data.sandbox_id(), from = old_path, to = new_path, "Path moved");
        Ok(())
    }

    /// Create a directory and its parents. `false` when it already existed.
    pub async fn make_dir(&self, path: &str, options: &FileOptions) -> Result<bool> {
        let created = self
            .data
            .unary::<_, Empty>(
                "filesystem.Filesystem/MakeDir",
                &PathRequest { path },
                Some(&options.user),
            )
            .await;
        match created {
            Ok(_) => Ok(true),
            Err(e) if e.rpc_code() == Some("already_exists") => Ok(false),
            Err(e) => Err(e.into_path_error()),
        }
    }

    /// Delete a file or directory.
    pub async fn remove(&self, path: &str, options: &FileOptions) -> Result<()> {
        let _: Empty = self
            .data
            .unary("filesystem.Filesystem/Remove", &PathRequest { path }, Some(&options.user))
            .await
            .map_err(SandboxError::into_path_error)?;
        tracing::debug!(sandbox_id = %self.data.sandbox_id(), path, "Path removed");
        Ok(())
    }
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string()
}
