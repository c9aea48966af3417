//! Command correlation.
//!
//! Every outgoing command gets the next id and a pending-table entry
//! carrying the epoch it was issued under and a oneshot resolution
//! handle. Responses resolve by id, in any arrival order. Three things
//! can end a pending command:
//!
//! - a matching response frame (same id AND same epoch),
//! - the per-command deadline,
//! - a connection-loss signal, which fails every command of the stale
//!   epoch in one sweep.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{CommandId, Epoch, SessionId};
use crate::protocol::{CommandFrame, ResponseFrame};
use crate::transport::Connection;

// ============================================================================
// Types
// ============================================================================

/// One in-flight command.
struct PendingCommand {
    /// Method name, kept for diagnostics.
    method: String,
    /// Epoch the command was issued under.
    epoch: Epoch,
    /// Deadline after which the waiter gives up.
    deadline: Instant,
    /// Resolution handle.
    tx: oneshot::Sender<Result<Value>>,
}

/// Pending commands keyed by id.
type PendingTable = FxHashMap<CommandId, PendingCommand>;

// ============================================================================
// Correlator
// ============================================================================

/// Assigns command ids and pairs responses with their commands.
///
/// # Thread Safety
///
/// `Correlator` is `Send + Sync`. The pending table is guarded by a
/// single mutex; hold times are short and contention is low since all
/// socket I/O is serialized elsewhere.
pub struct Correlator {
    /// Shared connection handle.
    connection: Connection,
    /// Next command id; never reset, so ids are unique across epochs too.
    next_id: AtomicU64,
    /// In-flight commands.
    pending: Mutex<PendingTable>,
    /// Default per-command deadline.
    command_timeout: Duration,
    /// Cap on concurrently pending commands.
    max_pending: usize,
}

impl Correlator {
    /// Creates a correlator over the given connection.
    #[must_use]
    pub fn new(connection: Connection, command_timeout: Duration, max_pending: usize) -> Self {
        Self {
            connection,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            command_timeout,
            max_pending,
        }
    }

    /// Sends a command and waits for its response with the default
    /// deadline.
    ///
    /// # Errors
    ///
    /// - [`Error::Remote`] if the far end executed the command and failed
    /// - [`Error::CommandTimeout`] if no response arrives in time
    /// - [`Error::ConnectionLost`] if the transport drops mid-flight
    /// - [`Error::Protocol`] if the pending table is full
    pub async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        self.send_with_timeout(method, params, session_id, self.command_timeout)
            .await
    }

    /// Sends a command and waits for its response with a custom deadline.
    ///
    /// # Errors
    ///
    /// Same as [`Correlator::send`].
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<SessionId>,
        command_timeout: Duration,
    ) -> Result<Value> {
        {
            let pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                warn!(
                    pending = pending.len(),
                    max = self.max_pending,
                    "too many pending commands"
                );
                return Err(Error::protocol(format!(
                    "too many pending commands: {}/{}",
                    pending.len(),
                    self.max_pending
                )));
            }
        }

        let id = CommandId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let epoch = self.connection.epoch();
        let frame = CommandFrame::new(id, method, params, session_id);
        let text = frame.encode()?;

        let (tx, rx) = oneshot::channel();

        // Register before writing so a fast response always finds the
        // entry.
        self.pending.lock().insert(
            id,
            PendingCommand {
                method: method.to_string(),
                epoch,
                deadline: Instant::now() + command_timeout,
                tx,
            },
        );

        if let Err(e) = self.connection.send_frame(text) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        trace!(%id, method, %epoch, "command sent");

        match timeout(command_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Resolution handle dropped without a verdict: the table was
            // swept by a loss event.
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                self.pending.lock().remove(&id);
                debug!(%id, method, "command timed out");
                Err(Error::command_timeout(
                    id,
                    command_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Resolves a pending command from a response frame.
    ///
    /// The frame's socket epoch must match the epoch the command was
    /// issued under; cross-epoch ids never resolve. Unknown ids and
    /// stale-epoch frames are logged and dropped.
    pub fn resolve(&self, epoch: Epoch, response: ResponseFrame) {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(&response.id) {
                Some(command) if command.epoch == epoch => pending.remove(&response.id),
                Some(command) => {
                    warn!(
                        id = %response.id,
                        issued_epoch = %command.epoch,
                        frame_epoch = %epoch,
                        "stale-epoch response ignored"
                    );
                    None
                }
                None => {
                    warn!(id = %response.id, "response for unknown command");
                    None
                }
            }
        };

        if let Some(command) = entry {
            trace!(id = %response.id, method = %command.method, "command resolved");
            let _ = command.tx.send(response.into_result());
        }
    }

    /// Fails every command pending under the stale epoch.
    ///
    /// Runs exactly once per loss event, driven by the transport's loss
    /// signal. Commands issued under a newer epoch (a racing send during
    /// reconnect) are left untouched.
    pub fn fail_epoch(&self, epoch: Epoch) {
        let failed: Vec<PendingCommand> = {
            let mut pending = self.pending.lock();
            let stale: Vec<CommandId> = pending
                .iter()
                .filter(|(_, command)| command.epoch == epoch)
                .map(|(id, _)| *id)
                .collect();

            stale.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = failed.len();
        for command in failed {
            let _ = command.tx.send(Err(Error::ConnectionLost));
        }

        if count > 0 {
            debug!(count, %epoch, "pending commands failed on connection loss");
        }
    }

    /// Returns the number of in-flight commands.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns the number of in-flight commands past their deadline.
    ///
    /// Normally zero; a persistent nonzero value means waiters are not
    /// being polled.
    #[must_use]
    pub fn overdue_count(&self) -> usize {
        let now = Instant::now();
        self.pending
            .lock()
            .values()
            .filter(|command| command.deadline < now)
            .count()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::sync::mpsc;

    fn correlator() -> (Correlator, mpsc::UnboundedReceiver<String>) {
        let (connection, frames) = Connection::stub();
        (
            Correlator::new(connection, Duration::from_secs(2), 16),
            frames,
        )
    }

    /// Parses the id out of an encoded command frame.
    fn sent_id(text: &str) -> CommandId {
        let value: Value = serde_json::from_str(text).expect("parse sent frame");
        CommandId::new(value["id"].as_u64().expect("id"))
    }

    fn response(id: CommandId, result: Value) -> ResponseFrame {
        serde_json::from_value(json!({ "id": id, "result": result })).expect("response frame")
    }

    #[tokio::test]
    async fn test_ids_allocated_in_issuance_order() {
        let (correlator, mut frames) = correlator();
        let epoch = Epoch::initial();

        // Drive two commands sequentially through the stub wire; the
        // second must carry a larger id.
        let send_a = correlator.send("Browser.getVersion", None, None);
        let resolve_a = async {
            let id = sent_id(&frames.recv().await.expect("first frame"));
            correlator.resolve(epoch, response(id, json!({"ok": 1})));
            id
        };
        let (result_a, id_a) = tokio::join!(send_a, resolve_a);
        result_a.expect("resolved");

        let send_b = correlator.send("Browser.getVersion", None, None);
        let resolve_b = async {
            let id = sent_id(&frames.recv().await.expect("second frame"));
            assert!(id > id_a);
            correlator.resolve(epoch, response(id, json!({"ok": 2})));
        };
        let (result_b, ()) = tokio::join!(send_b, resolve_b);
        result_b.expect("resolved");
    }

    #[tokio::test]
    async fn test_out_of_order_resolution_by_id() {
        let (correlator, mut frames) = correlator();
        let epoch = Epoch::initial();

        // Issue N commands concurrently, then resolve them in reverse
        // arrival order; each must receive exactly its own payload.
        let mut waiters = Vec::new();
        for n in 0..5 {
            let fut = correlator.send("Runtime.evaluate", Some(json!({"n": n})), None);
            waiters.push(fut);
        }

        let resolver = async {
            let mut ids = Vec::new();
            for _ in 0..5 {
                ids.push(sent_id(&frames.recv().await.expect("frame")));
            }
            for id in ids.iter().rev() {
                correlator.resolve(epoch, response(*id, json!({"echo": id.value()})));
            }
            ids
        };

        let (results, ids) = tokio::join!(futures_util::future::join_all(waiters), resolver);

        for (result, id) in results.into_iter().zip(ids) {
            let value = result.expect("resolved");
            assert_eq!(value["echo"], id.value());
        }
    }

    #[tokio::test]
    async fn test_remote_error_is_not_transport_failure() {
        let (correlator, mut frames) = correlator();
        let epoch = Epoch::initial();

        let send = correlator.send("Page.navigate", Some(json!({"url": "x"})), None);
        let resolve = async {
            let id = sent_id(&frames.recv().await.expect("frame"));
            let frame: ResponseFrame = serde_json::from_value(json!({
                "id": id,
                "error": { "code": -32000, "message": "Cannot navigate" }
            }))
            .expect("frame");
            correlator.resolve(epoch, frame);
        };

        let (result, ()) = tokio::join!(send, resolve);
        let err = result.expect_err("remote failure");
        assert!(err.is_remote());
        assert!(!err.is_connection_error());
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let (correlator, mut frames) = correlator();

        let err = correlator
            .send_with_timeout("Page.navigate", None, None, Duration::from_millis(20))
            .await
            .expect_err("timeout");

        assert!(err.is_timeout());
        assert_eq!(correlator.pending_count(), 0);

        // The frame did go out.
        assert!(frames.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_loss_fails_all_pending_of_stale_epoch() {
        let (correlator, mut frames) = correlator();
        let epoch = Epoch::initial();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            waiters.push(correlator.send("Runtime.evaluate", None, None));
        }

        let sweeper = async {
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(sent_id(&frames.recv().await.expect("frame")));
            }
            correlator.fail_epoch(epoch);
            ids
        };

        let (results, _ids) = tokio::join!(futures_util::future::join_all(waiters), sweeper);

        for result in results {
            let err = result.expect_err("lost");
            assert!(matches!(err, Error::ConnectionLost));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_epoch_frame_does_not_resolve() {
        let (correlator, mut frames) = correlator();
        let connection_epoch = Epoch::initial();

        let send = correlator.send_with_timeout(
            "Runtime.evaluate",
            None,
            None,
            Duration::from_millis(80),
        );

        let resolver = async {
            let id = sent_id(&frames.recv().await.expect("frame"));
            // A frame from a different socket generation must be ignored
            // even though the id matches.
            correlator.resolve(connection_epoch.next(), response(id, json!({"late": true})));
        };

        let (result, ()) = tokio::join!(send, resolver);
        // The command was never resolved, so it times out.
        assert!(result.expect_err("unresolved").is_timeout());
    }

    #[tokio::test]
    async fn test_fail_epoch_spares_newer_commands() {
        let (correlator, mut frames) = correlator();
        let old_epoch = Epoch::initial();

        let send_old = correlator.send_with_timeout(
            "Runtime.evaluate",
            None,
            None,
            Duration::from_millis(200),
        );

        let driver = async {
            let _old_id = sent_id(&frames.recv().await.expect("frame"));
            correlator.connection.stub_bump_epoch();

            let send_new = correlator.send_with_timeout(
                "Runtime.evaluate",
                None,
                None,
                Duration::from_millis(200),
            );
            let resolve_new = async {
                let new_id = sent_id(&frames.recv().await.expect("frame"));

                // Sweep the old epoch; the new command must survive.
                correlator.fail_epoch(old_epoch);
                assert_eq!(correlator.pending_count(), 1);

                correlator.resolve(
                    correlator.connection.epoch(),
                    response(new_id, json!({"ok": true})),
                );
            };

            let (new_result, ()) = tokio::join!(send_new, resolve_new);
            new_result.expect("new-epoch command resolved");
        };

        let (old_result, ()) = tokio::join!(send_old, driver);
        assert!(matches!(
            old_result.expect_err("old epoch swept"),
            Error::ConnectionLost
        ));
    }

    #[tokio::test]
    async fn test_pending_cap() {
        let (connection, mut frames) = Connection::stub();
        let correlator = Correlator::new(connection, Duration::from_millis(150), 2);

        let first = correlator.send("A.a", None, None);
        let second = correlator.send("B.b", None, None);

        let checker = async {
            // Wait until both entries are registered on the wire.
            let _ = frames.recv().await.expect("frame");
            let _ = frames.recv().await.expect("frame");

            let err = correlator
                .send("C.c", None, None)
                .await
                .expect_err("over cap");
            assert!(matches!(err, Error::Protocol { .. }));
        };

        let (first, second, ()) = tokio::join!(first, second, checker);
        assert!(first.expect_err("timed out").is_timeout());
        assert!(second.expect_err("timed out").is_timeout());
    }
}
