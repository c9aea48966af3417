//! Frame definitions and the inbound decoder.
//!
//! All frames are newline-free JSON objects. A command expects exactly
//! one correlated response; events are unsolicited and carry no `id`.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{CommandId, SessionId};

// ============================================================================
// CommandFrame
// ============================================================================

/// A command request from client to server.
///
/// # Format
///
/// ```json
/// {
///   "id": 7,
///   "method": "Page.navigate",
///   "params": { "url": "https://example.com" },
///   "sessionId": "8A6B48C1"
/// }
/// ```
///
/// `sessionId` is omitted for connection-scoped commands such as
/// `Target.attachToTarget`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandFrame {
    /// Identifier for request/response correlation.
    pub id: CommandId,

    /// Method name in `Domain.method` format.
    pub method: String,

    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Target session, if session-scoped.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl CommandFrame {
    /// Creates a new command frame.
    #[inline]
    #[must_use]
    pub fn new(
        id: CommandId,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            session_id,
        }
    }

    /// Serializes the frame to its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// ResponseFrame
// ============================================================================

/// A response from server to client.
///
/// Exactly one of `result` or `error` is populated. `error` means the
/// far end executed the command and failed; it is not a transport fault.
///
/// # Format
///
/// ```json
/// { "id": 7, "result": { "frameId": "F1" } }
/// { "id": 7, "error": { "code": -32000, "message": "Target closed" } }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    /// Matches an outstanding command's `id`.
    pub id: CommandId,

    /// Result payload (success).
    #[serde(default)]
    pub result: Option<Value>,

    /// Remote failure (the command reached the far end).
    #[serde(default)]
    pub error: Option<RemoteError>,

    /// Session the response belongs to, when session-scoped.
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

impl ResponseFrame {
    /// Converts the response into a result payload.
    ///
    /// A missing `result` on a success response decodes as `null`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the response carries an error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(remote) => Err(Error::remote(remote.code, remote.message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ============================================================================
// RemoteError
// ============================================================================

/// Structured failure carried inside a response frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteError {
    /// Server-assigned error code.
    #[serde(default)]
    pub code: i64,

    /// Error message from the server.
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// EventFrame
// ============================================================================

/// An unsolicited event pushed by the server.
///
/// # Format
///
/// ```json
/// {
///   "method": "Console.messageAdded",
///   "params": { "level": "error", "text": "boom" },
///   "sessionId": "8A6B48C1"
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct EventFrame {
    /// Event name in `Domain.event` format.
    pub method: String,

    /// Event payload.
    #[serde(default)]
    pub params: Value,

    /// Session the event belongs to, when session-scoped.
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

impl EventFrame {
    /// Returns the domain prefix of the method.
    #[inline]
    #[must_use]
    pub fn domain(&self) -> &str {
        self.method.split('.').next().unwrap_or_default()
    }
}

// ============================================================================
// InboundFrame
// ============================================================================

/// A decoded server-to-client frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Correlated response to an outstanding command.
    Response(ResponseFrame),
    /// Unsolicited event.
    Event(EventFrame),
}

impl InboundFrame {
    /// Classifies and decodes a raw text frame.
    ///
    /// Frames with an `id` are responses regardless of any other fields;
    /// frames with a `method` and no `id` are events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for unparsable text or for objects
    /// that are neither shape. Callers log and drop these; the
    /// connection stays up.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("unparsable frame: {e}")))?;

        let Some(object) = value.as_object() else {
            return Err(Error::protocol("frame is not a JSON object"));
        };

        if object.contains_key("id") {
            let response: ResponseFrame = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed response frame: {e}")))?;
            return Ok(Self::Response(response));
        }

        if object.contains_key("method") {
            let event: EventFrame = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed event frame: {e}")))?;
            return Ok(Self::Event(event));
        }

        Err(Error::protocol("frame has neither id nor method"))
    }
}

// ============================================================================
// Tests
// ============================================================================
