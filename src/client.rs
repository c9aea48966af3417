//! High-level client façade.
//!
//! One [`DevtoolsClient`] owns the whole stack: variant detection, the
//! shared connection, the correlator, the session registry and the
//! event buffers. The caller holds an explicit client value; there is
//! no process-wide instance.
//!
//! # Example
//!
//! ```ignore
//! let client = DevtoolsClient::connect("127.0.0.1", 9229).await?;
//! let targets = client.list_targets().await?;
//! let session = client.create_session(&targets[0].id).await?;
//! client.send_to(&session, "Page.enable", None).await?;
//! match client.evaluate_in(&session, "1 + 1").await? {
//!     EvalOutcome::Value { preview, .. } => println!("{preview}"),
//!     EvalOutcome::Exception { message, .. } => eprintln!("threw: {message}"),
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::detect::{Detector, ServerVariantInfo, TargetInfo};
use crate::error::{Error, Result};
use crate::events::{BufferedEvent, EventBufferService, EventClass, EventFilter};
use crate::identifiers::{Epoch, SessionId, TargetId};
use crate::session::{RegistryHealth, SessionRecord, SessionRegistry, SessionRouter};
use crate::transport::{ConnectOptions, Connection, ConnectionState, Correlator};

// ============================================================================
// ClientStats
// ============================================================================

/// Point-in-time snapshot of client internals.
#[derive(Debug, Clone)]
pub struct ClientStats {
    /// Connection lifecycle state.
    pub state: ConnectionState,

    /// Current socket epoch.
    pub epoch: Epoch,

    /// Commands awaiting a response.
    pub pending_commands: usize,

    /// Live sessions.
    pub live_sessions: usize,

    /// Events retained across all session buffers.
    pub buffered_events: usize,
}

// ============================================================================
// EvalOutcome
// ============================================================================

/// Outcome of a remote evaluation.
///
/// A thrown exception is a successful round trip with a discriminated
/// payload, not an [`Error`]; transport and protocol faults stay in the
/// `Result` layer.
#[derive(Debug, Clone)]
pub enum EvalOutcome {
    /// The expression completed and produced a value.
    Value {
        /// The value itself, `null` for undefined results.
        value: Value,
        /// Human-readable rendering.
        preview: String,
        /// Remote type tag, e.g. `number` or `object`.
        object_type: String,
    },

    /// The expression threw.
    Exception {
        /// Exception description.
        message: String,
        /// Zero-based line of the throw site, when reported.
        line: Option<u64>,
        /// Zero-based column of the throw site, when reported.
        column: Option<u64>,
        /// Rendered stack trace, when reported.
        stack: Option<String>,
    },
}

impl EvalOutcome {
    /// Returns `true` for the exception arm.
    #[inline]
    #[must_use]
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception { .. })
    }
}

/// Parses a `Runtime.evaluate` result payload into an outcome.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the payload has neither a result
/// object nor exception details.
fn parse_eval_outcome(payload: &Value) -> Result<EvalOutcome> {
    if let Some(details) = payload.get("exceptionDetails") {
        let message = details
            .get("exception")
            .and_then(|e| e.get("description"))
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("uncaught exception")
            .to_string();

        let stack = details
            .get("stackTrace")
            .and_then(|t| t.get("callFrames"))
            .and_then(Value::as_array)
            .map(|frames| {
                frames
                    .iter()
                    .map(|frame| {
                        format!(
                            "at {} ({}:{}:{})",
                            frame["functionName"]
                                .as_str()
                                .filter(|name| !name.is_empty())
                                .unwrap_or("<anonymous>"),
                            frame["url"].as_str().unwrap_or(""),
                            frame["lineNumber"].as_u64().unwrap_or_default(),
                            frame["columnNumber"].as_u64().unwrap_or_default(),
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            });

        return Ok(EvalOutcome::Exception {
            message,
            line: details.get("lineNumber").and_then(Value::as_u64),
            column: details.get("columnNumber").and_then(Value::as_u64),
            stack,
        });
    }

    let Some(result) = payload.get("result") else {
        return Err(Error::protocol("evaluate response carries no result"));
    };

    let value = result.get("value").cloned().unwrap_or(Value::Null);
    let object_type = result["type"].as_str().unwrap_or("undefined").to_string();
    let preview = result["description"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string());

    Ok(EvalOutcome::Value {
        value,
        preview,
        object_type,
    })
}

// ============================================================================
// DevtoolsClient
// ============================================================================

/// Multiplexing debugger client over one shared connection.
///
/// # Thread Safety
///
/// The client is `Send + Sync`; every method takes `&self`. Commands
/// from concurrent tasks interleave safely through the serialized
/// outbound path.
pub struct DevtoolsClient {
    connection: Connection,
    correlator: Arc<Correlator>,
    registry: Arc<SessionRegistry>,
    buffers: Arc<EventBufferService>,
    detector: Detector,
    endpoint: Option<(String, u16)>,
    variant: Option<ServerVariantInfo>,
}

impl DevtoolsClient {
    /// Detects the server variant and connects to its debugger socket.
    ///
    /// # Errors
    ///
    /// - [`Error::Unreachable`] if the discovery endpoint is down
    /// - [`Error::Protocol`] if no debugger URL can be discovered
    /// - [`Error::Connection`] if the socket cannot be established
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with(host, port, None).await
    }

    /// Like [`DevtoolsClient::connect`], with explicit connect policy.
    ///
    /// The URL on `options` is ignored; detection supplies it.
    ///
    /// # Errors
    ///
    /// Same as [`DevtoolsClient::connect`].
    pub async fn connect_with(
        host: &str,
        port: u16,
        options: Option<ConnectOptions>,
    ) -> Result<Self> {
        let detector = Detector::new();
        let variant = detector.detect(host, port).await?;
        info!(
            variant = ?variant.variant,
            decided_by = variant.decided_by,
            "server variant detected"
        );

        let url = match &variant.debugger_url {
            Some(url) => url.clone(),
            // Some servers only advertise per-target sockets.
            None => detector
                .fetch_targets(host, port)
                .await?
                .into_iter()
                .find_map(|target| target.debugger_url)
                .ok_or_else(|| Error::protocol("no debugger URL advertised"))?,
        };

        let options = match options {
            Some(options) => ConnectOptions { url, ..options },
            None => ConnectOptions::new(url),
        };

        let mut client = Self::connect_url_inner(options, detector).await?;
        client.endpoint = Some((host.to_string(), port));
        client.variant = Some(variant);
        Ok(client)
    }

    /// Connects directly to a known debugger URL, skipping detection.
    ///
    /// Target listing is unavailable on clients built this way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the socket cannot be established.
    pub async fn connect_url(options: ConnectOptions) -> Result<Self> {
        Self::connect_url_inner(options, Detector::new()).await
    }

    async fn connect_url_inner(options: ConnectOptions, detector: Detector) -> Result<Self> {
        let command_timeout = options.command_timeout;
        let max_pending = options.max_pending;

        let (connection, signals) = Connection::connect(options).await?;

        let correlator = Arc::new(Correlator::new(
            connection.clone(),
            command_timeout,
            max_pending,
        ));
        let registry = Arc::new(SessionRegistry::new());
        let buffers = Arc::new(EventBufferService::new());

        let router = Arc::new(SessionRouter::new(
            Arc::clone(&correlator),
            Arc::clone(&registry),
            Arc::clone(&buffers),
        ));
        tokio::spawn(router.run(signals));

        Ok(Self {
            connection,
            correlator,
            registry,
            buffers,
            detector,
            endpoint: None,
            variant: None,
        })
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Sends a connection-scoped command and waits for its result.
    ///
    /// # Errors
    ///
    /// See [`Correlator::send`].
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.correlator.send(method, params, None).await
    }

    /// Sends a command scoped to the given session.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] for an unregistered session id, plus
    /// everything [`Correlator::send`] can return.
    pub async fn send_to(
        &self,
        session_id: &SessionId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        if !self.registry.contains(session_id) {
            return Err(Error::session_not_found(session_id.clone()));
        }
        self.correlator
            .send(method, params, Some(session_id.clone()))
            .await
    }

    /// Sends a command scoped to the default session.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveSession`] when no session exists, plus
    /// everything [`Correlator::send`] can return.
    pub async fn send_to_default(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let session = self.registry.default_session()?;
        self.correlator
            .send(method, params, Some(session.id))
            .await
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Lists debuggable targets from the discovery endpoint.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] on clients connected by URL, since they have
    /// no discovery endpoint; [`Error::Unreachable`] if it is down.
    pub async fn list_targets(&self) -> Result<Vec<TargetInfo>> {
        let Some((host, port)) = &self.endpoint else {
            return Err(Error::protocol(
                "no discovery endpoint on a URL-connected client",
            ));
        };
        self.detector.fetch_targets(host, *port).await
    }

    /// Attaches to a target, creating a new session.
    ///
    /// The session shares the one connection; its id scopes every
    /// subsequent command and event.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the server returns no session id, plus
    /// everything [`Correlator::send`] can return.
    pub async fn create_session(&self, target_id: &TargetId) -> Result<SessionId> {
        let result = self
            .send(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id.as_str(), "flatten": true })),
            )
            .await?;

        let session_id = result["sessionId"]
            .as_str()
            .map(SessionId::from)
            .ok_or_else(|| Error::protocol("attach response carries no session id"))?;

        self.registry
            .register(SessionRecord::new(session_id.clone(), target_id.clone()));
        self.buffers.ensure_session(&session_id);

        Ok(session_id)
    }

    /// Returns the default (most recently created) session id.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveSession`] when no session exists.
    pub fn default_session(&self) -> Result<SessionId> {
        Ok(self.registry.default_session()?.id)
    }

    /// Detaches and forgets a session, dropping its buffered events.
    ///
    /// The wire detach is best effort; local teardown proceeds even if
    /// the far end refuses.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] for an unregistered session id.
    pub async fn teardown_session(&self, session_id: &SessionId) -> Result<()> {
        if !self.registry.contains(session_id) {
            return Err(Error::session_not_found(session_id.clone()));
        }

        if let Err(e) = self
            .send(
                "Target.detachFromTarget",
                Some(json!({ "sessionId": session_id.as_str() })),
            )
            .await
        {
            warn!(session_id = %session_id, error = %e, "detach failed, tearing down locally");
        }

        self.registry.remove(session_id)?;
        self.buffers.remove_session(session_id);
        Ok(())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluates an expression in the default session.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveSession`] when no session exists, plus
    /// everything [`DevtoolsClient::evaluate_in`] can return.
    pub async fn evaluate(&self, expression: &str) -> Result<EvalOutcome> {
        let session = self.registry.default_session()?;
        self.evaluate_in(&session.id, expression).await
    }

    /// Evaluates an expression in the given session.
    ///
    /// A thrown exception comes back as [`EvalOutcome::Exception`], not
    /// as an error; the `Result` layer is reserved for transport and
    /// protocol faults.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`], [`Error::Protocol`] on a malformed
    /// payload, plus everything [`Correlator::send`] can return.
    pub async fn evaluate_in(
        &self,
        session_id: &SessionId,
        expression: &str,
    ) -> Result<EvalOutcome> {
        let payload = self
            .send_to(
                session_id,
                "Runtime.evaluate",
                Some(json!({ "expression": expression, "returnByValue": true })),
            )
            .await?;

        parse_eval_outcome(&payload)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Returns buffered events matching the filter, newest first.
    #[must_use]
    pub fn get_events(&self, filter: &EventFilter) -> Vec<BufferedEvent> {
        self.buffers.get_events(filter)
    }

    /// Clears one session's buffered events, or all of them.
    pub fn clear_events(&self, session_id: Option<&SessionId>) {
        self.buffers.clear(session_id);
    }

    /// Enables event buffering for a session, starting empty.
    pub fn enable_session_events(&self, session_id: &SessionId) {
        self.buffers.enable_session(session_id);
    }

    /// Disables event buffering for a session and clears its content.
    pub fn disable_session_events(&self, session_id: &SessionId) {
        self.buffers.disable_session(session_id);
    }

    /// Toggles buffering for one event class of a session.
    pub fn set_event_class_enabled(
        &self,
        session_id: &SessionId,
        class: EventClass,
        enabled: bool,
    ) {
        self.buffers.set_class_enabled(session_id, class, enabled);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Detection result, when the client was built by discovery.
    #[inline]
    #[must_use]
    pub fn variant(&self) -> Option<&ServerVariantInfo> {
        self.variant.as_ref()
    }

    /// Current connection lifecycle state.
    #[inline]
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Snapshot of client internals.
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            state: self.connection.state(),
            epoch: self.connection.epoch(),
            pending_commands: self.correlator.pending_count(),
            live_sessions: self.registry.len(),
            buffered_events: self.buffers.buffered_count(None),
        }
    }

    /// Health assessment of the session table.
    #[must_use]
    pub fn health(&self) -> RegistryHealth {
        self.registry.assess_health()
    }

    /// Disconnects and forgets every session.
    pub fn disconnect(&self) {
        debug!("client disconnect requested");
        self.connection.disconnect();
        for session_id in self.registry.clear() {
            self.buffers.remove_session(&session_id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_parse_eval_value() {
        let payload = json!({
            "result": { "type": "number", "value": 4, "description": "4" }
        });

        let outcome = parse_eval_outcome(&payload).expect("outcome");
        match outcome {
            EvalOutcome::Value {
                value,
                preview,
                object_type,
            } => {
                assert_eq!(value, json!(4));
                assert_eq!(preview, "4");
                assert_eq!(object_type, "number");
            }
            EvalOutcome::Exception { .. } => panic!("expected value"),
        }
    }

    #[test]
    fn test_parse_eval_undefined() {
        let payload = json!({ "result": { "type": "undefined" } });

        let outcome = parse_eval_outcome(&payload).expect("outcome");
        match outcome {
            EvalOutcome::Value {
                value, object_type, ..
            } => {
                assert_eq!(value, Value::Null);
                assert_eq!(object_type, "undefined");
            }
            EvalOutcome::Exception { .. } => panic!("expected value"),
        }
    }

    #[test]
    fn test_parse_eval_exception_is_not_an_error() {
        let payload = json!({
            "result": { "type": "object", "subtype": "error" },
            "exceptionDetails": {
                "text": "Uncaught",
                "lineNumber": 0,
                "columnNumber": 6,
                "exception": { "description": "Error: boom\n    at <anonymous>:1:7" },
                "stackTrace": {
                    "callFrames": [
                        { "functionName": "", "url": "", "lineNumber": 0, "columnNumber": 6 }
                    ]
                }
            }
        });

        let outcome = parse_eval_outcome(&payload).expect("outcome");
        assert!(outcome.is_exception());
        match outcome {
            EvalOutcome::Exception {
                message,
                line,
                column,
                stack,
            } => {
                assert!(message.starts_with("Error: boom"));
                assert_eq!(line, Some(0));
                assert_eq!(column, Some(6));
                assert!(stack.expect("stack").contains("at <anonymous> (:0:6)"));
            }
            EvalOutcome::Value { .. } => panic!("expected exception"),
        }
    }

    #[test]
    fn test_parse_eval_exception_falls_back_to_text() {
        let payload = json!({
            "exceptionDetails": { "text": "Uncaught SyntaxError" }
        });

        let outcome = parse_eval_outcome(&payload).expect("outcome");
        match outcome {
            EvalOutcome::Exception { message, stack, .. } => {
                assert_eq!(message, "Uncaught SyntaxError");
                assert!(stack.is_none());
            }
            EvalOutcome::Value { .. } => panic!("expected exception"),
        }
    }

    #[test]
    fn test_parse_eval_rejects_empty_payload() {
        let err = parse_eval_outcome(&json!({})).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    // ------------------------------------------------------------------
    // End-to-end against a mock server
    // ------------------------------------------------------------------

    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use crate::events::EventLevel;

    /// Captures tracing output for the test run; `RUST_LOG` filters it.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Serves one WebSocket connection with canned debugger behavior:
    /// attach yields session `S1`, navigation emits a console error
    /// event, evaluation distinguishes values from throws.
    async fn spawn_mock_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("handshake");

            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let frame: Value = serde_json::from_str(text.as_str()).expect("frame");
                let id = frame["id"].clone();

                let mut outbound = Vec::new();
                match frame["method"].as_str().unwrap_or_default() {
                    "Target.attachToTarget" => {
                        outbound.push(json!({ "id": id, "result": { "sessionId": "S1" } }));
                    }
                    "Page.navigate" => {
                        outbound.push(json!({
                            "id": id,
                            "result": { "frameId": "F1" },
                            "sessionId": frame["sessionId"],
                        }));
                        outbound.push(json!({
                            "method": "Console.messageAdded",
                            "params": { "level": "error", "text": "boom" },
                            "sessionId": frame["sessionId"],
                        }));
                    }
                    "Runtime.evaluate" => {
                        let expression =
                            frame["params"]["expression"].as_str().unwrap_or_default();
                        let payload = if expression.contains("throw") {
                            json!({
                                "result": { "type": "object", "subtype": "error" },
                                "exceptionDetails": {
                                    "text": "Uncaught",
                                    "lineNumber": 0,
                                    "columnNumber": 0,
                                    "exception": { "description": "Error: nope" },
                                }
                            })
                        } else {
                            json!({
                                "result": { "type": "number", "value": 4, "description": "4" }
                            })
                        };
                        outbound.push(json!({
                            "id": id,
                            "result": payload,
                            "sessionId": frame["sessionId"],
                        }));
                    }
                    _ => {
                        outbound.push(json!({ "id": id, "result": {} }));
                    }
                }

                for value in outbound {
                    let text = value.to_string();
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
            }
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_end_to_end_session_flow() {
        init_tracing();
        let url = spawn_mock_server().await;
        let client = DevtoolsClient::connect_url(ConnectOptions::new(url))
            .await
            .expect("connect");

        // Attach a session over the shared connection.
        let session = client
            .create_session(&TargetId::from("T1"))
            .await
            .expect("attach");
        assert_eq!(session, SessionId::from("S1"));
        assert_eq!(client.session_count(), 1);
        assert_eq!(client.default_session().expect("default"), session);

        // A session-scoped command resolves with its own result.
        let result = client
            .send_to(
                &session,
                "Page.navigate",
                Some(json!({ "url": "https://example.com" })),
            )
            .await
            .expect("navigate");
        assert_eq!(result["frameId"], json!("F1"));

        // The console event the navigation emitted lands in the
        // session's buffer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = client.get_events(
            &EventFilter::new()
                .with_session(session.clone())
                .with_level(EventLevel::Error),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].method, "Console.messageAdded");
        assert_eq!(events[0].payload["text"], json!("boom"));

        // Teardown forgets the session and its events.
        client.teardown_session(&session).await.expect("teardown");
        assert_eq!(client.session_count(), 0);
        assert!(client.get_events(&EventFilter::new()).is_empty());
        assert!(matches!(
            client.default_session(),
            Err(Error::NoActiveSession)
        ));

        client.disconnect();
    }

    #[tokio::test]
    async fn test_end_to_end_evaluate_value_and_exception() {
        init_tracing();
        let url = spawn_mock_server().await;
        let client = DevtoolsClient::connect_url(ConnectOptions::new(url))
            .await
            .expect("connect");

        let session = client
            .create_session(&TargetId::from("T1"))
            .await
            .expect("attach");

        match client.evaluate_in(&session, "2 + 2").await.expect("eval") {
            EvalOutcome::Value { value, .. } => assert_eq!(value, json!(4)),
            EvalOutcome::Exception { .. } => panic!("expected value"),
        }

        // A throw is a discriminated outcome, not an Err.
        let outcome = client
            .evaluate_in(&session, "throw new Error('nope')")
            .await
            .expect("eval");
        match outcome {
            EvalOutcome::Exception { message, .. } => assert_eq!(message, "Error: nope"),
            EvalOutcome::Value { .. } => panic!("expected exception"),
        }

        client.disconnect();
    }

    #[tokio::test]
    async fn test_commands_to_unknown_session_fail_fast() {
        init_tracing();
        let url = spawn_mock_server().await;
        let client = DevtoolsClient::connect_url(ConnectOptions::new(url))
            .await
            .expect("connect");

        let err = client
            .send_to(&SessionId::from("ghost"), "Page.enable", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));

        let err = client.list_targets().await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));

        client.disconnect();
    }
}
