//! Streaming output delivery.
//!
//! Code execution and command output reach the caller through an
//! [`OutputHandler`], invoked once per received chunk in arrival order.
//! Ordering holds per stream; stdout and stderr are independent sequences.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which output stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Observer for streamed output.
///
/// Called synchronously on the task driving the stream, so a slow handler
/// slows delivery rather than reordering it.
pub trait OutputHandler: Send + Sync {
    fn on_output(&self, stream: OutputStream, chunk: &[u8]);
}

impl<F> OutputHandler for F
where
    F: Fn(OutputStream, &[u8]) + Send + Sync,
{
    fn on_output(&self, stream: OutputStream, chunk: &[u8]) {
        self(stream, chunk)
    }
}

/// Shared handle to an output observer.
pub type OutputSink = Arc<dyn OutputHandler>;

type ChunkFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Separate stdout/stderr callbacks. Either may be left unset.
#[derive(Default)]
pub struct Callbacks {
    on_stdout: Option<ChunkFn>,
    on_stderr: Option<ChunkFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stdout callback.
    pub fn on_stdout(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_stdout = Some(Box::new(f));
        self
    }

    /// Set the stderr callback.
    pub fn on_stderr(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_stderr = Some(Box::new(f));
        self
    }

    /// Wrap into a shareable sink.
    pub fn into_sink(self) -> OutputSink {
        Arc::new(self)
    }
}

impl OutputHandler for Callbacks {
    fn on_output(&self, stream: OutputStream, chunk: &[u8]) {
        let callback = match stream {
            OutputStream::Stdout => &self.on_stdout,
            OutputStream::Stderr => &self.on_stderr,
        };
        if let Some(f) = callback {
            f(chunk);
        }
    }
}

/// An owned output chunk, for channel-based delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

impl OutputChunk {
    /// Chunk bytes as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Forward chunks into a channel the caller drains. A closed receiver drops chunks.
impl OutputHandler for mpsc::UnboundedSender<OutputChunk> {
    fn on_output(&self, stream: OutputStream, chunk: &[u8]) {
        let _ = self.send(OutputChunk {
            stream,
            data: chunk.to_vec(),
        });
    }
}

/// Create a channel-backed sink and its receiver.
pub fn channel() -> (OutputSink, mpsc::UnboundedReceiver<OutputChunk>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

/// Deliver a chunk to an optional sink.
pub(crate) fn emit(sink: Option<&OutputSink>, stream: OutputStream, chunk: &[u8]) {
    if let Some(sink) = sink {
        sink.on_output(stream, chunk);
    }
}
