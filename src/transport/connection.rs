//! WebSocket connection supervisor.
//!
//! The connection owns the single bidirectional channel shared by all
//! sessions. A supervisor task runs one socket at a time: when the
//! socket drops, the supervisor marks the current epoch stale, emits a
//! loss signal, and reconnects with bounded exponential backoff. Each
//! successful reconnect bumps the epoch.
//!
//! All outbound writes are serialized through one mpsc channel into the
//! socket task, so no lock guards the sink.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::Epoch;
use crate::protocol::InboundFrame;

// ============================================================================
// Constants
// ============================================================================

/// Default command deadline (a few seconds per command).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on concurrently pending commands.
pub const DEFAULT_MAX_PENDING: usize = 256;

/// Default connect attempts per establish (initial connect and each loss).
const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default backoff schedule bounds.
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(250);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

// ============================================================================
// Types
// ============================================================================

/// Client-side WebSocket stream type.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound instructions for the socket task.
enum Outbound {
    /// Write an already-encoded frame.
    Frame(String),
    /// Close the socket and stop the supervisor.
    Shutdown,
}

/// Why a socket task ended.
enum SocketExit {
    /// Remote closed the stream.
    RemoteClosed,
    /// Read or write error.
    Failed(String),
    /// Local disconnect request.
    LocalShutdown,
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Signals pushed by the connection to its single consumer.
///
/// Frames are tagged with the epoch of the socket they arrived on so the
/// correlator can reject stale-epoch responses after a reconnect.
#[derive(Debug)]
pub enum TransportEvent {
    /// A socket entered service under the given epoch.
    Connected {
        /// Epoch of the new socket.
        epoch: Epoch,
    },

    /// A decoded inbound frame.
    Frame {
        /// Epoch of the socket the frame arrived on.
        epoch: Epoch,
        /// The decoded frame.
        frame: InboundFrame,
    },

    /// The socket for the given epoch dropped.
    ///
    /// The connection state is updated before this signal is emitted, so
    /// consumers observing it always see the epoch as already stale.
    Lost {
        /// Epoch of the dropped socket.
        epoch: Epoch,
    },
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; not trying to connect.
    Disconnected,
    /// Establish or reconnect in progress.
    Connecting,
    /// Socket in service.
    Connected,
    /// Retry budget exhausted; terminal until a fresh connect.
    Error,
}

// ============================================================================
// ConnectOptions
// ============================================================================

/// Connection configuration.
///
/// # Example
///
/// ```ignore
/// let options = ConnectOptions::new("ws://127.0.0.1:9222/devtools/browser/abc")
///     .with_max_attempts(5)
///     .with_command_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Debugger WebSocket URL.
    pub url: String,

    /// Connect attempts per establish (initial connect and each loss).
    pub max_attempts: u32,

    /// First backoff delay; doubles per failed attempt.
    pub backoff_base: Duration,

    /// Upper bound on a single backoff delay.
    pub backoff_max: Duration,

    /// Default per-command response deadline.
    pub command_timeout: Duration,

    /// Cap on concurrently pending commands.
    pub max_pending: usize,
}

impl ConnectOptions {
    /// Creates options for the given debugger URL with default policy.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Sets the connect attempt budget.
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff schedule bounds.
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Sets the default per-command deadline.
    #[inline]
    #[must_use]
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Sets the pending command cap.
    #[inline]
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Backoff delay before the given attempt (attempt 0 has none).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

// ============================================================================
// ConnectionShared
// ============================================================================

/// State shared between the handle and the supervisor task.
#[derive(Debug)]
struct ConnectionShared {
    state: Mutex<ConnectionState>,
    epoch: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            epoch: AtomicU64::new(Epoch::initial().value()),
            last_error: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn set_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
        *self.state.lock() = ConnectionState::Error;
    }

    fn epoch(&self) -> Epoch {
        Epoch::new(self.epoch.load(Ordering::SeqCst))
    }

    fn bump_epoch(&self) -> Epoch {
        Epoch::new(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to the shared connection.
///
/// Cloneable; all clones write through the same serialized outbound
/// path. The supervisor task lives as long as the socket or any
/// reconnect attempt does.
#[derive(Debug)]
pub struct Connection {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    shared: Arc<ConnectionShared>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            outbound_tx: self.outbound_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Connection {
    /// Connects to the debugger URL and starts the supervisor.
    ///
    /// Returns the handle and the transport event stream. The event
    /// stream has exactly one consumer; the router drains it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the socket cannot be established
    /// within the attempt budget, with the last cause attached.
    pub async fn connect(
        options: ConnectOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let shared = Arc::new(ConnectionShared::new());

        let ws = establish(&options, &shared).await?;
        shared.set_state(ConnectionState::Connected);
        info!(url = %options.url, "connection established");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(supervise(
            options,
            Arc::clone(&shared),
            outbound_rx,
            events_tx,
            ws,
        ));

        Ok((
            Self {
                outbound_tx,
                shared,
            },
            events_rx,
        ))
    }

    /// Writes an encoded frame through the serialized outbound path.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the retry budget is exhausted
    /// - [`Error::ConnectionLost`] if no socket is currently in service
    pub fn send_frame(&self, text: String) -> Result<()> {
        match self.shared.state() {
            ConnectionState::Connected => {}
            ConnectionState::Error => {
                let message = self
                    .shared
                    .last_error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "connection failed".to_string());
                return Err(Error::connection(message));
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(Error::ConnectionLost);
            }
        }

        self.outbound_tx
            .send(Outbound::Frame(text))
            .map_err(|_| Error::ConnectionLost)
    }

    /// Returns the current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns the current epoch.
    #[inline]
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.shared.epoch()
    }

    /// Returns the last recorded connection failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Requests a graceful disconnect.
    ///
    /// The supervisor closes the socket, emits a final loss signal, and
    /// terminates without reconnecting.
    pub fn disconnect(&self) {
        let _ = self.outbound_tx.send(Outbound::Shutdown);
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
impl Connection {
    /// Creates a connected handle with no socket behind it.
    ///
    /// Outbound frames land on the returned receiver. Used by correlator
    /// tests to observe the wire without a server.
    pub(crate) fn stub() -> (Self, mpsc::UnboundedReceiver<String>) {
        let shared = Arc::new(ConnectionShared::new());
        shared.set_state(ConnectionState::Connected);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                if let Outbound::Frame(text) = outbound
                    && frames_tx.send(text).is_err()
                {
                    break;
                }
            }
        });

        (
            Self {
                outbound_tx,
                shared,
            },
            frames_rx,
        )
    }

    /// Bumps the epoch on a stub connection.
    pub(crate) fn stub_bump_epoch(&self) -> Epoch {
        self.shared.bump_epoch()
    }
}

// ============================================================================
// Establish
// ============================================================================

/// Dials the debugger URL with bounded exponential backoff.
///
/// On exhaustion the shared state is set to `Error` with the last cause
/// recorded, and [`Error::Connection`] is returned.
async fn establish(options: &ConnectOptions, shared: &ConnectionShared) -> Result<WsStream> {
    let mut last_error: Option<String> = None;

    for attempt in 0..options.max_attempts.max(1) {
        if attempt > 0 {
            let delay = options.backoff_delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
            sleep(delay).await;
        }

        shared.set_state(ConnectionState::Connecting);

        match connect_async(options.url.as_str()).await {
            Ok((ws, _)) => return Ok(ws),
            Err(e) => {
                warn!(attempt, error = %e, "connect attempt failed");
                last_error = Some(e.to_string());
            }
        }
    }

    let message = last_error.unwrap_or_else(|| "no connect attempts made".to_string());
    shared.set_error(message.clone());
    Err(Error::connection(message))
}

// ============================================================================
// Supervisor
// ============================================================================

/// Runs one socket at a time; reconnects on loss until the budget runs
/// out or a local shutdown is requested.
async fn supervise(
    options: ConnectOptions,
    shared: Arc<ConnectionShared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    mut ws: WsStream,
) {
    loop {
        let epoch = shared.epoch();
        let _ = events_tx.send(TransportEvent::Connected { epoch });

        let exit = run_socket(ws, &mut outbound_rx, &events_tx, epoch).await;

        // The epoch must be observably stale before the loss signal goes
        // out: state first, then the signal.
        shared.set_state(ConnectionState::Disconnected);
        let _ = events_tx.send(TransportEvent::Lost { epoch });

        // Frames accepted in the window between the socket failing and
        // the state flip above belong to the dead epoch; their callers
        // are rejected by the loss sweep. They must not be replayed on
        // the next socket.
        if discard_stale_outbound(&mut outbound_rx) {
            debug!(%epoch, "local shutdown queued during loss");
            break;
        }

        match exit {
            SocketExit::LocalShutdown => {
                debug!(%epoch, "local shutdown");
                break;
            }
            SocketExit::RemoteClosed => {
                warn!(%epoch, "socket closed by remote");
            }
            SocketExit::Failed(cause) => {
                warn!(%epoch, cause, "socket failed");
            }
        }

        match establish(&options, &shared).await {
            Ok(new_ws) => {
                let new_epoch = shared.bump_epoch();
                shared.set_state(ConnectionState::Connected);
                info!(epoch = %new_epoch, "reconnected");
                ws = new_ws;
            }
            Err(e) => {
                error!(error = %e, "reconnect budget exhausted");
                break;
            }
        }
    }

    debug!("connection supervisor terminated");
}

/// Discards frames queued for a socket that no longer exists.
///
/// Returns `true` if a shutdown request was queued, which the
/// supervisor honors instead of reconnecting.
fn discard_stale_outbound(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) -> bool {
    let mut discarded = 0usize;
    loop {
        match outbound_rx.try_recv() {
            Ok(Outbound::Frame(_)) => discarded += 1,
            Ok(Outbound::Shutdown) => return true,
            Err(_) => break,
        }
    }
    if discarded > 0 {
        warn!(discarded, "stale outbound frames discarded");
    }
    false
}

/// Drives one socket until it drops or a shutdown is requested.
async fn run_socket(
    ws: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
    epoch: Epoch,
) -> SocketExit {
    let (mut ws_write, mut ws_read) = ws.split();

    loop {
        tokio::select! {
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match InboundFrame::decode(text.as_str()) {
                            Ok(frame) => {
                                let _ = events_tx.send(TransportEvent::Frame { epoch, frame });
                            }
                            Err(e) => {
                                // Malformed frames are dropped; the
                                // connection stays up.
                                warn!(error = %e, "dropping malformed frame");
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) => {
                        return SocketExit::RemoteClosed;
                    }

                    Some(Err(e)) => {
                        return SocketExit::Failed(e.to_string());
                    }

                    None => {
                        return SocketExit::RemoteClosed;
                    }

                    // Ignore Binary, Ping, Pong
                    _ => {}
                }
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(text)) => {
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            return SocketExit::Failed(e.to_string());
                        }
                    }

                    Some(Outbound::Shutdown) | None => {
                        let _ = ws_write.close().await;
                        return SocketExit::LocalShutdown;
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ConnectOptions::new("ws://127.0.0.1:9222/abc");
        assert_eq!(options.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(options.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(options.max_pending, DEFAULT_MAX_PENDING);
    }

    #[test]
    fn test_backoff_schedule_doubles_and_caps() {
        let options = ConnectOptions::new("ws://x")
            .with_backoff(Duration::from_millis(100), Duration::from_millis(450));

        assert_eq!(options.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(options.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(options.backoff_delay(3), Duration::from_millis(400));
        // Capped at the maximum.
        assert_eq!(options.backoff_delay(4), Duration::from_millis(450));
        assert_eq!(options.backoff_delay(20), Duration::from_millis(450));
    }

    #[test]
    fn test_shared_epoch_bump() {
        let shared = ConnectionShared::new();
        assert_eq!(shared.epoch(), Epoch::initial());
        assert_eq!(shared.bump_epoch(), Epoch::new(2));
        assert_eq!(shared.epoch(), Epoch::new(2));
    }

    #[tokio::test]
    async fn test_connect_refused_exhausts_budget() {
        // Nothing listens on port 1; every attempt fails fast.
        let options = ConnectOptions::new("ws://127.0.0.1:1")
            .with_max_attempts(2)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));

        let err = Connection::connect(options).await.expect_err("refused");
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_stub_rejects_after_error_state() {
        let (connection, _frames) = Connection::stub();
        assert_eq!(connection.state(), ConnectionState::Connected);

        connection.shared.set_error("dial failed".to_string());
        let err = connection
            .send_frame("{}".to_string())
            .expect_err("error state");
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(connection.last_error().as_deref(), Some("dial failed"));
    }

    #[tokio::test]
    async fn test_stub_rejects_when_disconnected() {
        let (connection, _frames) = Connection::stub();
        connection.shared.set_state(ConnectionState::Disconnected);

        let err = connection
            .send_frame("{}".to_string())
            .expect_err("disconnected");
        assert!(matches!(err, Error::ConnectionLost));
    }

    #[tokio::test]
    async fn test_queued_frames_do_not_survive_socket_loss() {
        // A frame can be accepted in the window between a socket dying
        // and the state flipping to Disconnected. Its caller is rejected
        // by the loss sweep, so the frame must never reach the next
        // socket.
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Outbound::Frame(r#"{"id":1,"method":"Page.navigate"}"#.to_string()))
            .expect("queue");
        tx.send(Outbound::Frame(r#"{"id":2,"method":"Page.reload"}"#.to_string()))
            .expect("queue");

        assert!(!discard_stale_outbound(&mut rx));
        // The next epoch's socket starts with an empty queue.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_discard_stale_outbound_honors_queued_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Outbound::Frame("{}".to_string())).expect("queue");
        tx.send(Outbound::Shutdown).expect("queue");

        // A shutdown queued during the loss window stops the supervisor
        // instead of reconnecting.
        assert!(discard_stale_outbound(&mut rx));
    }
}
