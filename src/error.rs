//! Error types for the DevTools multiplexer.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use devtools_mux::{Result, Error};
//!
//! async fn example(client: &DevtoolsClient) -> Result<()> {
//!     let session = client.default_session()?;
//!     client.send("Page.reload", None, Some(&session)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Discovery | [`Error::Unreachable`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionLost`] |
//! | Command | [`Error::CommandTimeout`], [`Error::Remote`] |
//! | Protocol | [`Error::Protocol`] |
//! | Session | [`Error::SessionNotFound`], [`Error::NoActiveSession`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! Transport faults and remote failures are deliberately distinct:
//! [`Error::Remote`] means the far end received and executed the command
//! but reported a failure, while [`Error::ConnectionLost`] and
//! [`Error::CommandTimeout`] mean the command never completed at all.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{CommandId, SessionId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Discovery Errors
    // ========================================================================
    /// Discovery endpoint unreachable.
    ///
    /// Returned when `GET /json/version` does not respond within the probe
    /// timeout. Fatal to variant detection, not to an existing connection.
    #[error("Discovery endpoint unreachable: {endpoint}")]
    Unreachable {
        /// The endpoint that failed to respond.
        endpoint: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport failed to establish after exhausting retries.
    ///
    /// The message carries the last underlying cause for diagnostics.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the last connection failure.
        message: String,
    },

    /// Transport dropped mid-flight.
    ///
    /// Broadcast to every command pending under the stale epoch.
    #[error("Connection lost")]
    ConnectionLost,

    // ========================================================================
    // Command Errors
    // ========================================================================
    /// No matching response within the command deadline.
    #[error("Command {id} timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// The command id that timed out.
        id: CommandId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The far end executed the command and reported a failure.
    ///
    /// Carried in the error channel of a normal response frame.
    /// Never a transport fault.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Server-assigned error code.
        code: i64,
        /// Error message from the server.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed or unparsable frame.
    ///
    /// Logged and dropped by the router; the connection stays up.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Operation referenced an unknown or torn-down session.
    #[error("Session not found: {id}")]
    SessionNotFound {
        /// The missing session id.
        id: SessionId,
    },

    /// No active session exists to select as default.
    #[error("No active session")]
    NoActiveSession,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an unreachable-endpoint error.
    #[inline]
    pub fn unreachable(endpoint: impl Into<String>) -> Self {
        Self::Unreachable {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a command timeout error.
    #[inline]
    pub fn command_timeout(id: CommandId, timeout_ms: u64) -> Self {
        Self::CommandTimeout { id, timeout_ms }
    }

    /// Creates a remote error.
    #[inline]
    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a session not found error.
    #[inline]
    pub fn session_not_found(id: SessionId) -> Self {
        Self::SessionNotFound { id }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimeout { .. })
    }

    /// Returns `true` if this is a transport-level fault.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the command reached the far end and failed there.
    ///
    /// Callers use this to distinguish "the call reached the target and
    /// failed" from "the call never completed".
    #[inline]
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CommandTimeout { .. } | Self::ConnectionLost | Self::Unreachable { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
