//! Incremental decoders for the two streaming encodings the sandbox speaks.
//!
//! - The code interpreter answers newline-delimited JSON.
//! - The in-sandbox daemon answers Connect server-streams: each message is a
//!   5-byte prefix (flags, big-endian u32 length) followed by a JSON payload.
//!
//! Both decoders accept arbitrary chunk boundaries from the HTTP body.

use crate::error::{Result, SandboxError};

/// Envelope flag: payload is compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Envelope flag: end-of-stream trailer.
pub const FLAG_END_STREAM: u8 = 0x02;

/// Largest envelope payload accepted.
pub const MAX_ENVELOPE_LEN: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 5;

/// Splits a byte stream into lines, tolerating `\r\n` and split UTF-8.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them, without terminators.
    /// Blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = to_line(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing line that had no terminator.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        to_line(&raw)
    }
}

fn to_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    let trimmed = line.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// One decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// Reassembles envelopes from arbitrary chunks.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: Vec<u8>,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every envelope completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.buf.len() < PREFIX_LEN {
                break;
            }
            let flags = self.buf[0];
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                as usize;
            if len > MAX_ENVELOPE_LEN {
                return Err(SandboxError::Protocol(format!(
                    "envelope of {len} bytes exceeds {MAX_ENVELOPE_LEN}"
                )));
            }
            if flags & FLAG_COMPRESSED != 0 {
                return Err(SandboxError::Protocol(
                    "compressed envelopes are not supported".into(),
                ));
            }
            if self.buf.len() < PREFIX_LEN + len {
                break;
            }
            let payload = self.buf[PREFIX_LEN..PREFIX_LEN + len].to_vec();
            self.buf.drain(..PREFIX_LEN + len);
            out.push(Envelope { flags, payload });
        }
        Ok(out)
    }

    /// Bytes received but not yet forming a whole envelope.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Frame one request message.
pub fn encode_envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
