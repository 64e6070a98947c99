//! Wire protocol between the parent process and a kernel process.
//!
//! Uses newline-delimited JSON over stdin/stdout. Requests carry a `msg_id`;
//! every message the kernel emits on behalf of a request carries that id as
//! its `parent_id`, which is how output is correlated with the submission
//! that produced it.

use std::io::{BufRead, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

use super::output::{CellOutput, MimeBundle};

/// Largest single line accepted from a kernel (16MB).
const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Request sent from the parent to the kernel process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum KernelRequest {
    /// Readiness probe, answered with `kernel_info_reply`.
    KernelInfoRequest {
        /// Correlation id.
        msg_id: String,
    },

    /// Evaluate code in the kernel's persistent namespace.
    ExecuteRequest {
        /// Correlation id echoed back as `parent_id`.
        msg_id: String,
        /// Source code to run.
        code: String,
    },

    /// Ask the kernel to exit cleanly.
    ShutdownRequest {
        /// Correlation id.
        msg_id: String,
    },
}

impl KernelRequest {
    /// Correlation id of this request.
    pub fn msg_id(&self) -> &str {
        match self {
            Self::KernelInfoRequest { msg_id }
            | Self::ExecuteRequest { msg_id, .. }
            | Self::ShutdownRequest { msg_id } => msg_id,
        }
    }
}

/// Raw message emitted by the kernel process.
///
/// `content` is decoded lazily by [`KernelMessage::event`] so that unknown
/// message types never break the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    /// Message kind, e.g. `stream` or `status`.
    pub msg_type: String,
    /// Id of the request this message belongs to.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Type-specific payload.
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    /// Build a message (used by kernels implemented in Rust and by tests).
    pub fn new(msg_type: &str, parent_id: Option<&str>, content: Value) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            parent_id: parent_id.map(str::to_string),
            content,
        }
    }

    /// Whether this message answers the request with the given id.
    pub fn is_reply_to(&self, msg_id: &str) -> bool {
        self.parent_id.as_deref() == Some(msg_id)
    }

    /// Decode the payload into a typed event.
    pub fn event(&self) -> Result<KernelEvent> {
        let event = match self.msg_type.as_str() {
            "stream" => {
                let StreamContent { name, text } = serde_json::from_value(self.content.clone())?;
                KernelEvent::Stream { name, text }
            }
            "execute_result" => {
                let ResultContent {
                    data,
                    execution_count,
                } = serde_json::from_value(self.content.clone())?;
                KernelEvent::Result {
                    data,
                    execution_count,
                }
            }
            "display_data" => {
                let DisplayContent { data } = serde_json::from_value(self.content.clone())?;
                KernelEvent::Display { data }
            }
            "error" => {
                let ErrorContent {
                    ename,
                    evalue,
                    traceback,
                } = serde_json::from_value(self.content.clone())?;
                KernelEvent::Error {
                    ename,
                    evalue,
                    traceback,
                }
            }
            "status" => {
                let StatusContent { execution_state } =
                    serde_json::from_value(self.content.clone())?;
                KernelEvent::Status {
                    idle: execution_state == "idle",
                }
            }
            "kernel_info_reply" => KernelEvent::KernelInfo,
            "shutdown_reply" => KernelEvent::ShutdownReply,
            other => KernelEvent::Other(other.to_string()),
        };
        Ok(event)
    }
}

/// Typed view of a kernel message.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    /// Text written to a standard stream.
    Stream { name: String, text: String },
    /// Value of the last expression in a cell.
    Result {
        data: MimeBundle,
        execution_count: Option<i64>,
    },
    /// Rich output published explicitly by user code.
    Display { data: MimeBundle },
    /// Exception raised by user code.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// Busy/idle transition. Idle terminates a submission.
    Status { idle: bool },
    /// Reply to the readiness probe.
    KernelInfo,
    /// Acknowledgement of a shutdown request.
    ShutdownReply,
    /// Message type this side does not understand.
    Other(String),
}

impl KernelEvent {
    /// Whether this is the terminal idle signal.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Status { idle: true })
    }

    /// Convert into a client-facing output, if the event carries one.
    pub fn into_output(self) -> Option<CellOutput> {
        match self {
            Self::Stream { name, text } => Some(CellOutput::Stream { name, text }),
            Self::Result {
                data,
                execution_count,
            } => Some(CellOutput::ExecuteResult {
                data,
                execution_count,
            }),
            Self::Display { data } => Some(CellOutput::DisplayData { data }),
            Self::Error {
                ename,
                evalue,
                traceback,
            } => Some(CellOutput::Error {
                ename,
                evalue,
                traceback,
            }),
            Self::Status { .. } | Self::KernelInfo | Self::ShutdownReply | Self::Other(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct StreamContent {
    name: String,
    text: String,
}

#[derive(Deserialize)]
struct ResultContent {
    #[serde(default)]
    data: MimeBundle,
    #[serde(default)]
    execution_count: Option<i64>,
}

#[derive(Deserialize)]
struct DisplayContent {
    #[serde(default)]
    data: MimeBundle,
}

#[derive(Deserialize)]
struct ErrorContent {
    ename: String,
    #[serde(default)]
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: String,
}

/// Write one message as a single JSON line and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .map_err(|e| Error::Channel(format!("Failed to write kernel message: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Channel(format!("Failed to flush kernel stream: {}", e)))?;
    Ok(())
}

/// Read the next message from a line-oriented reader.
///
/// Returns `Ok(None)` on a clean end of stream. Blank lines are skipped.
/// Oversized, non-UTF-8 and malformed lines are `Error::Protocol`, after
/// which the reader is positioned at the start of the next line.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<KernelMessage>> {
    read_bounded(reader, MAX_MESSAGE_BYTES)
}

fn read_bounded<R: BufRead>(reader: &mut R, limit: usize) -> Result<Option<KernelMessage>> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .by_ref()
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut line)
            .map_err(|e| Error::Channel(format!("Failed to read kernel message: {}", e)))?;
        if read == 0 {
            return Ok(None);
        }
        if line.len() > limit {
            if line.last() != Some(&b'\n') {
                skip_line(reader)?;
            }
            return Err(Error::Protocol(format!(
                "kernel message exceeds {} bytes",
                limit
            )));
        }
        let text = std::str::from_utf8(&line)
            .map_err(|e| Error::Protocol(format!("kernel message is not valid UTF-8: {}", e)))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed).map(Some).map_err(Error::from);
    }
}

/// Discard input up to and including the next newline.
fn skip_line<R: BufRead>(reader: &mut R) -> Result<()> {
    loop {
        let buf = reader
            .fill_buf()
            .map_err(|e| Error::Channel(format!("Failed to read kernel message: {}", e)))?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}
