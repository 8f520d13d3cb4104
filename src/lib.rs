//! Typed client for remote agent sandboxes.
//!
//! ```no_run
//! use ags_sandbox::{Client, CreateOptions, RunCodeConfig, Sandbox, SandboxError};
//!
//! # async fn demo() -> Result<(), SandboxError> {
//! let client = Client::from_env()?;
//! let text = Sandbox::scoped(&client, "code-interpreter-v1", CreateOptions::new(), |sb| async move {
//!     let exec = sb.code().run_code("print('hi')", RunCodeConfig::new(), None).await?;
//!     Ok::<_, SandboxError>(exec.stdout())
//! })
//! .await?;
//! assert_eq!(text, "hi\n");
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod code;
pub mod commands;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod output;
pub mod sandbox;
pub mod transport;

pub use api::{ControlPlane, ListOptions, SandboxStatus, SandboxSummary};
pub use client::Client;
pub use code::{
    CodeContext, CodeInterpreter, CreateCodeContextConfig, Execution, ExecutionError,
    ExecutionOutput, RunCodeConfig,
};
pub use commands::{
    Commands, ProcessConfig, ProcessHandle, ProcessInfo, ProcessOptions, ProcessResult, ProcessState, SIGINT,
    SIGKILL, SIGTERM,
};
pub use config::{ClientConfig, Credential};
pub use error::{Result, SandboxError};
pub use filesystem::{EntryInfo, FileOptions, FileStream, FileType, Filesystem, ListDirOptions, WriteInfo};
pub use output::{Callbacks, OutputChunk, OutputHandler, OutputSink, OutputStream};
pub use sandbox::{ConnectOptions, CreateOptions, Sandbox, SandboxGuard};
pub use tokio_util::sync::CancellationToken;
