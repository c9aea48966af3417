//! Wire protocol message types.
//!
//! This module defines the JSON frame format shared by every session on
//! the multiplexed connection.
//!
//! # Frame Shapes
//!
//! | Frame | Direction | Discriminator |
//! |-------|-----------|---------------|
//! | [`CommandFrame`] | client → server | has `id` and `method` |
//! | [`ResponseFrame`] | server → client | has `id`, no `method` |
//! | [`EventFrame`] | server → client | has `method`, no `id` |
//!
//! Inbound text is classified by [`InboundFrame::decode`]: the presence
//! of an `id` field marks a response, a `method` without `id` marks an
//! unsolicited event. Anything else is a protocol violation.

// ============================================================================
// Submodules
// ============================================================================

/// Frame definitions and the inbound decoder.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::{CommandFrame, EventFrame, InboundFrame, RemoteError, ResponseFrame};
