//! Bounded per-session event buffering.
//!
//! Unsolicited events are retained per session, per event class, in
//! arrival order. Capacity is fixed per session; overflow silently
//! evicts the oldest entries first (strict FIFO, never by severity or
//! size). There is no ordering guarantee across sessions.
//!
//! Disabling a session is immediate: its buffered content is cleared
//! and nothing further is retained until it is re-enabled, at which
//! point the buffer starts empty.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::identifiers::SessionId;
use crate::protocol::EventFrame;

// ============================================================================
// Constants
// ============================================================================

/// Default per-session buffer capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

// ============================================================================
// EventClass
// ============================================================================

/// Coarse classification of unsolicited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// Console and log output.
    Console,
    /// Network activity.
    Network,
    /// Page lifecycle.
    Page,
    /// Everything else.
    Other,
}

impl EventClass {
    /// All classes, for whole-session toggles.
    pub const ALL: [Self; 4] = [Self::Console, Self::Network, Self::Page, Self::Other];

    /// Classifies an event by its method name.
    #[must_use]
    pub fn from_method(method: &str) -> Self {
        let domain = method.split('.').next().unwrap_or_default();
        match domain {
            "Console" | "Log" => Self::Console,
            "Runtime" if method == "Runtime.consoleAPICalled" => Self::Console,
            "Network" => Self::Network,
            "Page" => Self::Page,
            _ => Self::Other,
        }
    }
}

// ============================================================================
// EventLevel
// ============================================================================

/// Severity reported by the event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    /// Verbose and debug output.
    Verbose,
    /// Informational output.
    Info,
    /// Warnings.
    Warning,
    /// Errors.
    Error,
}

impl EventLevel {
    /// Parses a wire-format level string.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "verbose" | "debug" => Some(Self::Verbose),
            "info" | "log" => Some(Self::Info),
            "warning" | "warn" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

// ============================================================================
// BufferedEvent
// ============================================================================

/// One retained event.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    /// Owning session.
    pub session_id: SessionId,

    /// Event class.
    pub class: EventClass,

    /// Severity, when the payload reports one.
    pub level: Option<EventLevel>,

    /// Event name in `Domain.event` format.
    pub method: String,

    /// Event payload.
    pub payload: Value,

    /// Arrival time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl BufferedEvent {
    /// Builds a buffered event from a wire frame.
    ///
    /// The severity is read from `params.level`, falling back to
    /// `params.message.level` for wrapped console payloads.
    #[must_use]
    pub fn from_frame(session_id: SessionId, frame: &EventFrame) -> Self {
        let level = frame
            .params
            .get("level")
            .or_else(|| frame.params.get("message").and_then(|m| m.get("level")))
            .and_then(Value::as_str)
            .and_then(EventLevel::parse);

        Self {
            session_id,
            class: EventClass::from_method(&frame.method),
            level,
            method: frame.method.clone(),
            payload: frame.params.clone(),
            timestamp_ms: now_ms(),
        }
    }
}

/// Milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// EventFilter
// ============================================================================

/// Query filter for [`EventBufferService::get_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one session.
    pub session_id: Option<SessionId>,

    /// Restrict to one event class.
    pub class: Option<EventClass>,

    /// Restrict to one severity.
    pub level: Option<EventLevel>,

    /// Only events at or after this timestamp.
    pub since_ms: Option<u64>,

    /// Maximum number of entries returned.
    pub limit: Option<usize>,
}

impl EventFilter {
    /// Creates an empty filter matching everything.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the filter to one session.
    #[inline]
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Restricts the filter to one event class.
    #[inline]
    #[must_use]
    pub fn with_class(mut self, class: EventClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Restricts the filter to one severity.
    #[inline]
    #[must_use]
    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Restricts the filter to events at or after the timestamp.
    #[inline]
    #[must_use]
    pub fn since(mut self, since_ms: u64) -> Self {
        self.since_ms = Some(since_ms);
        self
    }

    /// Caps the number of entries returned.
    #[inline]
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &BufferedEvent) -> bool {
        if let Some(class) = self.class
            && event.class != class
        {
            return false;
        }
        if let Some(level) = self.level
            && event.level != Some(level)
        {
            return false;
        }
        if let Some(since) = self.since_ms
            && event.timestamp_ms < since
        {
            return false;
        }
        true
    }
}

// ============================================================================
// ClassFlags
// ============================================================================

/// Per-class retention toggles for one session.
#[derive(Debug, Clone, Copy)]
struct ClassFlags {
    console: bool,
    network: bool,
    page: bool,
    other: bool,
}

impl ClassFlags {
    const fn all(enabled: bool) -> Self {
        Self {
            console: enabled,
            network: enabled,
            page: enabled,
            other: enabled,
        }
    }

    const fn is_enabled(self, class: EventClass) -> bool {
        match class {
            EventClass::Console => self.console,
            EventClass::Network => self.network,
            EventClass::Page => self.page,
            EventClass::Other => self.other,
        }
    }

    fn set(&mut self, class: EventClass, enabled: bool) {
        match class {
            EventClass::Console => self.console = enabled,
            EventClass::Network => self.network = enabled,
            EventClass::Page => self.page = enabled,
            EventClass::Other => self.other = enabled,
        }
    }
}

// ============================================================================
// SessionBuffer
// ============================================================================

/// Retained events and flags for one session.
///
/// Entries carry their arrival sequence number; the wall-clock
/// timestamp alone cannot break ties between events retained in the
/// same millisecond.
struct SessionBuffer {
    flags: ClassFlags,
    events: VecDeque<(u64, BufferedEvent)>,
}

impl SessionBuffer {
    fn new() -> Self {
        Self {
            flags: ClassFlags::all(true),
            events: VecDeque::new(),
        }
    }
}

// ============================================================================
// EventBufferService
// ============================================================================

/// Bounded, per-session, per-class event store with FIFO eviction.
///
/// # Thread Safety
///
/// `EventBufferService` is `Send + Sync`; one mutex guards the buffer
/// table. Hold times are short.
pub struct EventBufferService {
    capacity: usize,
    /// Arrival sequence counter, shared by every buffer.
    next_seq: AtomicU64,
    buffers: Mutex<FxHashMap<SessionId, SessionBuffer>>,
}

impl Default for EventBufferService {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBufferService {
    /// Creates a service with the default per-session capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a service with a custom per-session capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(0),
            buffers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registers a session with buffering enabled for every class.
    ///
    /// Idempotent; an existing buffer is left untouched.
    pub fn ensure_session(&self, session_id: &SessionId) {
        self.buffers
            .lock()
            .entry(session_id.clone())
            .or_insert_with(SessionBuffer::new);
    }

    /// Drops a session's buffer entirely.
    ///
    /// Called from session teardown; buffer ownership stays here.
    pub fn remove_session(&self, session_id: &SessionId) {
        if self.buffers.lock().remove(session_id).is_some() {
            debug!(session_id = %session_id, "event buffer removed");
        }
    }

    /// Drops every session buffer.
    pub fn remove_all(&self) {
        self.buffers.lock().clear();
    }

    /// Retains an event, evicting the oldest entries past capacity.
    ///
    /// No-op when the owning session is unknown or has the event's
    /// class disabled. Overflow is never an error.
    pub fn add_event(&self, event: BufferedEvent) {
        let mut buffers = self.buffers.lock();

        let Some(buffer) = buffers.get_mut(&event.session_id) else {
            trace!(session_id = %event.session_id, method = %event.method, "event for unknown session dropped");
            return;
        };

        if !buffer.flags.is_enabled(event.class) {
            return;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        buffer.events.push_back((seq, event));
        while buffer.events.len() > self.capacity {
            buffer.events.pop_front();
        }
    }

    /// Returns matching events, newest first.
    #[must_use]
    pub fn get_events(&self, filter: &EventFilter) -> Vec<BufferedEvent> {
        let buffers = self.buffers.lock();

        let mut matched: Vec<(u64, BufferedEvent)> = match &filter.session_id {
            Some(session_id) => buffers
                .get(session_id)
                .map(|buffer| {
                    buffer
                        .events
                        .iter()
                        .filter(|(_, e)| filter.matches(e))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => buffers
                .values()
                .flat_map(|buffer| buffer.events.iter())
                .filter(|(_, e)| filter.matches(e))
                .cloned()
                .collect(),
        };

        // Newest first; the arrival sequence breaks ties between events
        // retained in the same millisecond.
        matched.sort_by(|(a_seq, a), (b_seq, b)| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then(b_seq.cmp(a_seq))
        });

        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }

        matched.into_iter().map(|(_, event)| event).collect()
    }

    /// Clears one session's buffer, or every buffer.
    ///
    /// Flags are untouched; only retained content is dropped.
    pub fn clear(&self, session_id: Option<&SessionId>) {
        let mut buffers = self.buffers.lock();
        match session_id {
            Some(session_id) => {
                if let Some(buffer) = buffers.get_mut(session_id) {
                    buffer.events.clear();
                }
            }
            None => {
                for buffer in buffers.values_mut() {
                    buffer.events.clear();
                }
            }
        }
    }

    /// Enables buffering for every class of a session.
    ///
    /// A re-enabled session starts empty, not resumed.
    pub fn enable_session(&self, session_id: &SessionId) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry(session_id.clone())
            .or_insert_with(SessionBuffer::new);
        buffer.flags = ClassFlags::all(true);
    }

    /// Disables buffering for every class of a session.
    ///
    /// Immediate: existing content is cleared and nothing further is
    /// retained until re-enabled.
    pub fn disable_session(&self, session_id: &SessionId) {
        let mut buffers = self.buffers.lock();
        if let Some(buffer) = buffers.get_mut(session_id) {
            buffer.flags = ClassFlags::all(false);
            buffer.events.clear();
        }
    }

    /// Toggles buffering for one class of a session.
    ///
    /// Disabling a class purges its retained entries.
    pub fn set_class_enabled(&self, session_id: &SessionId, class: EventClass, enabled: bool) {
        let mut buffers = self.buffers.lock();
        let Some(buffer) = buffers.get_mut(session_id) else {
            return;
        };

        buffer.flags.set(class, enabled);
        if !enabled {
            buffer.events.retain(|(_, e)| e.class != class);
        }
    }

    /// Returns `true` if the session retains events of the class.
    #[must_use]
    pub fn is_enabled(&self, session_id: &SessionId, class: EventClass) -> bool {
        self.buffers
            .lock()
            .get(session_id)
            .is_some_and(|buffer| buffer.flags.is_enabled(class))
    }

    /// Returns the number of retained events.
    #[must_use]
    pub fn buffered_count(&self, session_id: Option<&SessionId>) -> usize {
        let buffers = self.buffers.lock();
        match session_id {
            Some(session_id) => buffers
                .get(session_id)
                .map(|buffer| buffer.events.len())
                .unwrap_or_default(),
            None => buffers.values().map(|buffer| buffer.events.len()).sum(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
