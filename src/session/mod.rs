//! Session bookkeeping and frame routing.
//!
//! A session is one logical debugging conversation multiplexed over the
//! shared connection. The registry tracks live sessions; the router
//! fans inbound transport signals out to the correlator and the event
//! buffers.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `registry` | Live session table, default-session selection, health |
//! | `router` | TransportEvent dispatch: responses, events, loss |

// ============================================================================
// Submodules
// ============================================================================

/// Live session table, default-session selection, health.
pub mod registry;

/// TransportEvent dispatch: responses, events, loss.
pub mod router;

// ============================================================================
// Re-exports
// ============================================================================

pub use registry::{RegistryHealth, SessionRecord, SessionRegistry};
pub use router::SessionRouter;
