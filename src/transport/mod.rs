//! Transport layer: the shared WebSocket connection and the correlator.
//!
//! One physical connection carries every session. The connection owns
//! the socket and its epoch counter; the correlator owns the pending
//! command table keyed by id.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  CommandFrame   ┌─────────────────┐
//! │  Correlator  │────────────────►│   Connection    │   WebSocket
//! │ pending{id → │                 │  supervisor +   │◄────────────►  server
//! │  epoch, tx}  │◄────────────────│  socket task    │
//! └──────────────┘  TransportEvent └─────────────────┘
//! ```
//!
//! # Epochs
//!
//! Every successful (re)connect bumps the epoch. Inbound frames are
//! tagged with the epoch of the socket they arrived on, and a pending
//! command only resolves when both the id and the epoch match. A late
//! frame flushed from a dead socket after reconnect can therefore never
//! pair with a command issued under the new epoch.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Socket ownership, reconnect with backoff, epoch counter |
//! | `correlator` | Pending command table, timeout and loss handling |

// ============================================================================
// Submodules
// ============================================================================

/// Socket ownership, reconnect with backoff, epoch counter.
pub mod connection;

/// Pending command table, timeout and loss handling.
pub mod correlator;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{ConnectOptions, Connection, ConnectionState, TransportEvent};
pub use correlator::Correlator;
