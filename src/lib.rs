//! Devtools multiplexer - shared-connection debugger client library.
//!
//! This library multiplexes many logical debugging sessions over one
//! WebSocket connection to a devtools-protocol server, with automatic
//! server-variant detection.
//!
//! # Architecture
//!
//! The client follows a layered model:
//!
//! - **Detection**: classifies the server from version metadata before
//!   connecting, falling back to active capability probes
//! - **Transport**: one supervised socket with reconnect, backoff and an
//!   epoch counter; all writes serialized through a single channel
//! - **Correlation**: id-keyed pending table; responses resolve in any
//!   order, and only under the epoch they were issued in
//! - **Sessions**: registry plus router fanning inbound frames out to
//!   the correlator and per-session event buffers
//!
//! Key design principles:
//!
//! - One physical connection carries every session; a `sessionId` field
//!   scopes commands and events
//! - Reconnects bump an epoch; frames from a dead socket can never
//!   resolve commands issued after it
//! - Event buffers are bounded per session with strict FIFO eviction
//! - Remote exceptions from evaluation are data, not errors
//!
//! # Quick Start
//!
//! ```no_run
//! use devtools_mux::{DevtoolsClient, EvalOutcome, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Detect the server variant and connect to its debugger socket
//!     let client = DevtoolsClient::connect("127.0.0.1", 9222).await?;
//!
//!     // Attach a session to the first advertised target
//!     let targets = client.list_targets().await?;
//!     let session = client.create_session(&targets[0].id).await?;
//!
//!     // Evaluate in that session
//!     match client.evaluate_in(&session, "document.title").await? {
//!         EvalOutcome::Value { preview, .. } => println!("title: {preview}"),
//!         EvalOutcome::Exception { message, .. } => eprintln!("threw: {message}"),
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | High-level façade: [`DevtoolsClient`], [`EvalOutcome`] |
//! | [`detect`] | Server variant detection and target discovery |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`events`] | Bounded per-session event buffering |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire frame types (internal) |
//! | [`session`] | Session registry and frame routing (internal) |
//! | [`transport`] | Connection supervisor and correlator (internal) |

// ============================================================================
// Modules
// ============================================================================

/// High-level client façade.
///
/// Use [`DevtoolsClient::connect`] to detect the server and build a
/// fully wired client.
pub mod client;

/// Server variant detection and target discovery.
///
/// Classifies the far end from `GET /json/version` metadata, with
/// active capability probes as the fallback.
pub mod detect;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Bounded per-session event buffering.
pub mod events;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire frame types.
///
/// Internal module defining command/response/event structures.
pub mod protocol;

/// Session registry and frame routing.
///
/// Internal module tracking live sessions and dispatching transport
/// signals.
pub mod session;

/// Connection supervisor and command correlator.
///
/// Internal module handling the shared socket, reconnect policy and
/// the pending command table.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{ClientStats, DevtoolsClient, EvalOutcome};

// Detection types
pub use detect::{Detector, ServerVariant, ServerVariantInfo, TargetInfo};

// Error types
pub use error::{Error, Result};

// Event types
pub use events::{BufferedEvent, EventClass, EventFilter, EventLevel};

// Identifier types
pub use identifiers::{CommandId, Epoch, SessionId, TargetId};

// Session types
pub use session::{RegistryHealth, SessionRecord, SessionRegistry};

// Transport types
pub use transport::{ConnectOptions, ConnectionState};
