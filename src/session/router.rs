//! Transport signal dispatch.
//!
//! One router consumes the connection's signal stream and fans it out:
//! responses go to the correlator, events go to the owning session's
//! buffer, a loss signal sweeps pending commands and tears every
//! session down. Routing is synchronous; nothing here awaits.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::events::{BufferedEvent, EventBufferService};
use crate::protocol::InboundFrame;
use crate::session::SessionRegistry;
use crate::transport::{Correlator, TransportEvent};

// ============================================================================
// SessionRouter
// ============================================================================

/// Routes transport signals to the correlator, registry and buffers.
pub struct SessionRouter {
    correlator: Arc<Correlator>,
    registry: Arc<SessionRegistry>,
    buffers: Arc<EventBufferService>,
}

impl SessionRouter {
    /// Creates a router over shared state.
    #[must_use]
    pub fn new(
        correlator: Arc<Correlator>,
        registry: Arc<SessionRegistry>,
        buffers: Arc<EventBufferService>,
    ) -> Self {
        Self {
            correlator,
            registry,
            buffers,
        }
    }

    /// Dispatches one transport signal.
    pub fn route(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { epoch } => {
                debug!(%epoch, "socket in service");
            }

            TransportEvent::Frame { epoch, frame } => match frame {
                InboundFrame::Response(response) => {
                    self.correlator.resolve(epoch, response);
                }
                InboundFrame::Event(event) => {
                    let Some(session_id) = event.session_id.clone() else {
                        trace!(method = %event.method, "connection-scoped event dropped");
                        return;
                    };
                    self.buffers
                        .add_event(BufferedEvent::from_frame(session_id, &event));
                }
            },

            // Loss invalidates everything issued under the stale epoch:
            // pending commands fail, sessions are gone server-side, and
            // their buffered events go with them.
            TransportEvent::Lost { epoch } => {
                info!(%epoch, "connection lost, sweeping sessions");
                self.correlator.fail_epoch(epoch);
                for session_id in self.registry.clear() {
                    self.buffers.remove_session(&session_id);
                }
            }
        }
    }

    /// Drains the signal stream until the connection shuts down.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = signals.recv().await {
            self.route(event);
        }
        debug!("transport signal stream closed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;

    use crate::error::Error;
    use crate::events::EventFilter;
    use crate::identifiers::{Epoch, SessionId, TargetId};
    use crate::session::SessionRecord;
    use crate::transport::Connection;
    use crate::transport::connection::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_PENDING};

    fn router() -> (Arc<SessionRouter>, Connection) {
        let (connection, _outbound) = Connection::stub();
        let correlator = Arc::new(Correlator::new(
            connection.clone(),
            DEFAULT_COMMAND_TIMEOUT,
            DEFAULT_MAX_PENDING,
        ));
        let registry = Arc::new(SessionRegistry::new());
        let buffers = Arc::new(EventBufferService::new());
        let router = Arc::new(SessionRouter::new(correlator, registry, buffers));
        (router, connection)
    }

    fn decode(text: &str) -> InboundFrame {
        InboundFrame::decode(text).expect("frame")
    }

    #[tokio::test]
    async fn test_session_event_lands_in_its_buffer() {
        let (router, connection) = router();
        let session_id = SessionId::from("S1");
        router
            .registry
            .register(SessionRecord::new(session_id.clone(), TargetId::from("T1")));
        router.buffers.ensure_session(&session_id);

        router.route(TransportEvent::Frame {
            epoch: connection.epoch(),
            frame: decode(
                r#"{"method":"Console.messageAdded","params":{"level":"error","text":"boom"},"sessionId":"S1"}"#,
            ),
        });

        let events = router
            .buffers
            .get_events(&EventFilter::new().with_session(session_id));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].method, "Console.messageAdded");
        assert_eq!(events[0].payload["text"], json!("boom"));
    }

    #[tokio::test]
    async fn test_connection_scoped_event_is_dropped() {
        let (router, connection) = router();

        router.route(TransportEvent::Frame {
            epoch: connection.epoch(),
            frame: decode(r#"{"method":"Target.targetCreated","params":{}}"#),
        });

        assert_eq!(router.buffers.buffered_count(None), 0);
    }

    #[tokio::test]
    async fn test_loss_sweeps_pending_sessions_and_buffers() {
        let (router, connection) = router();
        let session_id = SessionId::from("S1");
        router
            .registry
            .register(SessionRecord::new(session_id.clone(), TargetId::from("T1")));
        router.buffers.ensure_session(&session_id);
        router.route(TransportEvent::Frame {
            epoch: connection.epoch(),
            frame: decode(r#"{"method":"Page.loadEventFired","params":{},"sessionId":"S1"}"#),
        });

        let epoch = connection.epoch();
        let send = router.correlator.send("Page.navigate", None, None);
        let sweep = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            router.route(TransportEvent::Lost { epoch });
        };
        let (outcome, ()) = tokio::join!(send, sweep);

        assert!(matches!(outcome, Err(Error::ConnectionLost)));
        assert!(router.registry.is_empty());
        assert_eq!(router.buffers.buffered_count(None), 0);
        assert_eq!(router.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_resolves_via_correlator() {
        let (router, connection) = router();
        let epoch = connection.epoch();

        let send = router.correlator.send("Page.navigate", None, None);
        let resolve = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            // The stub allocates ids from 1.
            router.route(TransportEvent::Frame {
                epoch,
                frame: decode(r#"{"id":1,"result":{"frameId":"F1"}}"#),
            });
        };
        let (outcome, ()) = tokio::join!(send, resolve);

        assert_eq!(outcome.expect("result")["frameId"], json!("F1"));
    }

    #[tokio::test]
    async fn test_stale_epoch_frame_does_not_resolve() {
        let (router, connection) = router();
        let stale = Epoch::new(connection.epoch().value() - 1);

        let send = router
            .correlator
            .send_with_timeout("Page.navigate", None, None, Duration::from_millis(60));
        let resolve = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            router.route(TransportEvent::Frame {
                epoch: stale,
                frame: decode(r#"{"id":1,"result":{}}"#),
            });
        };
        let (outcome, ()) = tokio::join!(send, resolve);

        assert!(matches!(outcome, Err(Error::CommandTimeout { .. })));
    }
}
