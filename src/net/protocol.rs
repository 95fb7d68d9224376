//! Client commands and their replies.
//!
//! Clients send one JSON object per line, tagged by `op`. Every command
//! gets exactly one reply line; push events are interleaved on the same
//! connection and distinguished by carrying a `type` tag instead of `ok`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_history_limit() -> usize {
    100
}

/// A client command.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Start the acquisition pipeline.
    StartAcquisition,
    /// Stop the acquisition pipeline.
    StopAcquisition,
    /// Open a save session.
    StartSaving {
        /// Folder name prefix.
        name: String,
    },
    /// Close the save session.
    StopSaving,
    /// Start (or restart) the temporary capture.
    BeginCapture {
        /// Caller-chosen capture identifier.
        id: String,
    },
    /// Write the capture out permanently.
    PromoteCapture {
        /// Folder name prefix.
        name: String,
    },
    /// Discard the capture.
    CancelCapture,
    /// Query the capture.
    CaptureInfo,
    /// Most recent aggregated record.
    Latest,
    /// Most recent records, oldest first.
    History {
        /// Maximum records returned.
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
    /// System status.
    Status,
    /// Persistence status.
    SaveStatus,
}

/// Reply to one command.
#[derive(Debug, Serialize)]
pub struct Response {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Description on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Successful reply carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Successful reply with no payload.
    pub fn ok_empty() -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
        }
    }

    /// Failed reply.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
