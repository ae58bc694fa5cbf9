//! Event capture
//!
//! Backends deliver observable occurrences (commands started, connections
//! checked out, ...) from their own threads. Each event observer owns an
//! append-only [`EventLog`]; the backend writes through an [`EventSink`]
//! while the foreground test run reads point-in-time snapshots.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{Document, Value};

use crate::core::cancellation::CancellationSignal;

pub const COMMAND_STARTED_EVENT: &str = "commandStartedEvent";
pub const COMMAND_SUCCEEDED_EVENT: &str = "commandSucceededEvent";
pub const COMMAND_FAILED_EVENT: &str = "commandFailedEvent";

/// Event types an observer may subscribe to
pub const SUPPORTED_EVENT_TYPES: &[&str] = &[
    COMMAND_STARTED_EVENT,
    COMMAND_SUCCEEDED_EVENT,
    COMMAND_FAILED_EVENT,
    "poolCreatedEvent",
    "poolReadyEvent",
    "poolClearedEvent",
    "poolClosedEvent",
    "connectionCreatedEvent",
    "connectionReadyEvent",
    "connectionClosedEvent",
    "connectionCheckOutStartedEvent",
    "connectionCheckOutFailedEvent",
    "connectionCheckedOutEvent",
    "connectionCheckedInEvent",
    "serverDescriptionChangedEvent",
    "topologyDescriptionChangedEvent",
];

/// Polling interval used while waiting for events
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn is_command_event(event_type: &str) -> bool {
    matches!(
        event_type,
        COMMAND_STARTED_EVENT | COMMAND_SUCCEEDED_EVENT | COMMAND_FAILED_EVENT
    )
}

/// One recorded occurrence in an observer's log
#[derive(Debug, Clone, Serialize)]
pub struct CapturedEvent {
    pub observer: String,
    pub sequence: u64,
    pub event_type: String,
    pub body: Document,
    pub captured_at: DateTime<Utc>,
}

impl CapturedEvent {
    /// Document form matched by event filters: `{ <event_type>: <body> }`
    pub fn projection(&self) -> Value {
        let mut projection = Document::new();
        projection.insert(self.event_type.clone(), Value::Object(self.body.clone()));
        Value::Object(projection)
    }

    pub fn command_name(&self) -> Option<&str> {
        self.body.get("commandName").and_then(Value::as_str)
    }
}

/// Result of waiting for events to arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached(usize),
    TimedOut(usize),
    Cancelled(usize),
}

/// Append-only, synchronized event sequence
#[derive(Debug)]
pub struct EventLog {
    observer: String,
    events: Mutex<Vec<CapturedEvent>>,
}

impl EventLog {
    pub fn new<S: Into<String>>(observer: S) -> Self {
        Self {
            observer: observer.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn observer(&self) -> &str {
        &self.observer
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CapturedEvent>> {
        // Appends never leave the vector half-written, so a poisoned lock is still usable
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event and return its sequence number
    pub fn record(&self, event_type: &str, body: Document) -> u64 {
        let mut events = self.lock();
        let sequence = events.len() as u64;
        events.push(CapturedEvent {
            observer: self.observer.clone(),
            sequence,
            event_type: event_type.to_string(),
            body,
            captured_at: Utc::now(),
        });
        sequence
    }

    /// Point-in-time copy of every event recorded so far
    pub fn snapshot(&self) -> Vec<CapturedEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count matching events in a snapshot taken at call time
    pub fn count_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CapturedEvent) -> bool,
    {
        self.snapshot().iter().filter(|event| predicate(event)).count()
    }

    /// Wait until at least `count` events satisfy `predicate`
    pub async fn wait_for<F>(
        &self,
        predicate: F,
        count: usize,
        timeout: Duration,
        cancellation: &CancellationSignal,
    ) -> WaitOutcome
    where
        F: Fn(&CapturedEvent) -> bool,
    {
        let start_time = Instant::now();

        loop {
            let found = self.count_matching(&predicate);
            if found >= count {
                tracing::debug!("✅ Observer '{}' reached {} matching events", self.observer, found);
                return WaitOutcome::Reached(found);
            }
            if cancellation.is_cancelled() {
                return WaitOutcome::Cancelled(found);
            }
            if start_time.elapsed() >= timeout {
                tracing::warn!(
                    "⏰ Timeout waiting for {} events on observer '{}' (found {})",
                    count,
                    self.observer,
                    found
                );
                return WaitOutcome::TimedOut(found);
            }

            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

/// Writer half of an observer, handed to the backend
///
/// Drops events the observer did not ask for before they reach the log.
#[derive(Debug, Clone)]
pub struct EventSink {
    log: Arc<EventLog>,
    observed: Arc<HashSet<String>>,
    ignored_commands: Arc<HashSet<String>>,
}

impl EventSink {
    pub fn new<O, I>(log: Arc<EventLog>, observed: O, ignored_commands: I) -> Self
    where
        O: IntoIterator<Item = String>,
        I: IntoIterator<Item = String>,
    {
        Self {
            log,
            observed: Arc::new(observed.into_iter().collect()),
            ignored_commands: Arc::new(ignored_commands.into_iter().collect()),
        }
    }

    pub fn observer(&self) -> &str {
        self.log.observer()
    }

    pub fn accepts(&self, event_type: &str, body: &Document) -> bool {
        if !self.observed.contains(event_type) {
            return false;
        }
        if is_command_event(event_type) {
            if let Some(command_name) = body.get("commandName").and_then(Value::as_str) {
                return !self.ignored_commands.contains(command_name);
            }
        }
        true
    }

    /// Record the event if the observer wants it; returns whether it was kept
    pub fn deliver(&self, event_type: &str, body: Document) -> bool {
        if !self.accepts(event_type, &body) {
            return false;
        }
        self.log.record(event_type, body);
        true
    }
}
