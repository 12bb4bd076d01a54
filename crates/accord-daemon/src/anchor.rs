//! Anchor access: the pluggable log transport, the bounded-retry writer,
//! and the subscriber worker.
//!
//! The anchor transport is pluggable behind [`AnchorLog`]: production
//! deployments poll an anchor service over HTTP, tests use the in-memory
//! log. The subscriber worker demultiplexes raw records into
//! [`Event::Anchor`] bus events; the same record may be observed more
//! than once, and downstream handling tolerates that by checking
//! agreement state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use accord_core::anchor::{AnchorEvent, AnchorEventKind, RawAnchorRecord};
use accord_core::config::AnchorConfig;
use accord_core::events::{Event, EventKind};

use crate::runtime::{Disposition, MessageBus, Worker};

/// Errors from anchor transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AnchorLogError {
    /// The anchor service could not be reached.
    #[error("anchor unreachable: {0}")]
    Transport(String),

    /// The anchor answered with an unexpected status.
    #[error("anchor returned status {status}")]
    Status {
        /// HTTP status received.
        status: u16,
    },

    /// Anchoring is disabled by configuration.
    #[error("no anchor configured")]
    Disabled,
}

/// The anchor transport surface.
pub trait AnchorLog: Send + Sync {
    /// Appends one record.
    ///
    /// # Errors
    ///
    /// [`AnchorLogError`] on transport failure.
    fn append(&self, record: &RawAnchorRecord) -> Result<(), AnchorLogError>;

    /// Returns records after the cursor, plus the new cursor.
    ///
    /// # Errors
    ///
    /// [`AnchorLogError`] on transport failure.
    fn poll(&self, after: u64) -> Result<(Vec<RawAnchorRecord>, u64), AnchorLogError>;
}

#[derive(Debug, Serialize)]
struct AppendBody<'a> {
    record: &'a RawAnchorRecord,
}

#[derive(Debug, Default, Deserialize)]
struct PollResponse {
    #[serde(default)]
    records: Vec<RawAnchorRecord>,
    #[serde(default)]
    cursor: u64,
}

/// HTTP polling client for an anchor service.
pub struct HttpAnchorLog {
    client: Client,
    base_url: String,
}

impl HttpAnchorLog {
    /// Builds the client; errors when no URL is configured.
    ///
    /// # Errors
    ///
    /// [`AnchorLogError::Disabled`] when the config has no URL,
    /// [`AnchorLogError::Transport`] when the client cannot be built.
    pub fn new(config: &AnchorConfig) -> Result<Self, AnchorLogError> {
        if config.url.is_empty() {
            return Err(AnchorLogError::Disabled);
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AnchorLogError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }
}

impl AnchorLog for HttpAnchorLog {
    fn append(&self, record: &RawAnchorRecord) -> Result<(), AnchorLogError> {
        let response = self
            .client
            .post(format!("{}/events", self.base_url))
            .json(&AppendBody { record })
            .send()
            .map_err(|e| AnchorLogError::Transport(e.to_string()))?;
        if response.status() != StatusCode::CREATED {
            return Err(AnchorLogError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    fn poll(&self, after: u64) -> Result<(Vec<RawAnchorRecord>, u64), AnchorLogError> {
        let response = self
            .client
            .get(format!("{}/events?since={after}", self.base_url))
            .send()
            .map_err(|e| AnchorLogError::Transport(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(AnchorLogError::Status {
                status: response.status().as_u16(),
            });
        }
        let body: PollResponse = response
            .json()
            .map_err(|e| AnchorLogError::Transport(e.to_string()))?;
        let cursor = if body.cursor == 0 { after } else { body.cursor };
        Ok((body.records, cursor))
    }
}

/// In-memory anchor log for tests and self-contained runs.
#[derive(Default)]
pub struct MemAnchorLog {
    records: Mutex<Vec<RawAnchorRecord>>,
}

impl MemAnchorLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record appended so far.
    #[must_use]
    pub fn records(&self) -> Vec<RawAnchorRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl AnchorLog for MemAnchorLog {
    fn append(&self, record: &RawAnchorRecord) -> Result<(), AnchorLogError> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn poll(&self, after: u64) -> Result<(Vec<RawAnchorRecord>, u64), AnchorLogError> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        #[allow(clippy::cast_possible_truncation)]
        let from = (after as usize).min(records.len());
        Ok((records[from..].to_vec(), records.len() as u64))
    }
}

/// Bounded-retry writer used by the agreement owners.
pub struct AnchorWriter {
    log: Arc<dyn AnchorLog>,
    retries: u32,
}

impl AnchorWriter {
    /// Creates a writer with the configured retry bound.
    #[must_use]
    pub fn new(log: Arc<dyn AnchorLog>, retries: u32) -> Self {
        Self { log, retries }
    }

    /// Witnesses agreement creation.
    ///
    /// # Errors
    ///
    /// The final [`AnchorLogError`] after the retry budget is spent.
    pub fn write_create(&self, agreement_id: &str) -> Result<(), AnchorLogError> {
        self.write(&RawAnchorRecord::create(agreement_id))
    }

    /// Witnesses agreement termination.
    ///
    /// # Errors
    ///
    /// The final [`AnchorLogError`] after the retry budget is spent.
    pub fn write_terminate(
        &self,
        kind: AnchorEventKind,
        agreement_id: &str,
        reason: u32,
    ) -> Result<(), AnchorLogError> {
        self.write(&RawAnchorRecord::terminate(kind, agreement_id, reason))
    }

    fn write(&self, record: &RawAnchorRecord) -> Result<(), AnchorLogError> {
        let mut last = None;
        for attempt in 0..=self.retries {
            match self.log.append(record) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, %err, "anchor write failed");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or(AnchorLogError::Disabled))
    }
}

/// The subscriber worker: polls the log and posts bus events.
pub struct AnchorWorker {
    log: Arc<dyn AnchorLog>,
    bus: Arc<MessageBus>,
    cursor: AtomicU64,
    poll_interval: Duration,
}

impl AnchorWorker {
    /// Creates the worker.
    #[must_use]
    pub fn new(log: Arc<dyn AnchorLog>, bus: Arc<MessageBus>, poll_interval: Duration) -> Self {
        Self {
            log,
            bus,
            cursor: AtomicU64::new(0),
            poll_interval,
        }
    }

    fn poll_once(&self) {
        let after = self.cursor.load(Ordering::SeqCst);
        match self.log.poll(after) {
            Ok((records, cursor)) => {
                self.cursor.store(cursor, Ordering::SeqCst);
                for raw in &records {
                    match AnchorEvent::demarshal(raw) {
                        Ok(event) => {
                            debug!(agreement_id = %event.agreement_id, kind = ?event.kind, "anchor event");
                            self.bus.publish(Event::Anchor(event));
                        }
                        Err(err) => {
                            // Unknown kinds are someone else's records.
                            debug!(%err, "skipping undecodable anchor record");
                        }
                    }
                }
            }
            Err(err) => warn!(%err, "anchor poll failed"),
        }
    }
}

impl Worker for AnchorWorker {
    type Command = ();

    fn name(&self) -> &'static str {
        "anchor"
    }

    fn subscriptions(&self) -> Vec<EventKind> {
        Vec::new()
    }

    fn commands_for(&mut self, _event: &Event) -> Vec<()> {
        Vec::new()
    }

    fn handle_command(&mut self, (): ()) -> Disposition<()> {
        Disposition::Done
    }

    fn no_command_work(&mut self) -> Vec<()> {
        self.poll_once();
        Vec::new()
    }

    fn tick_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_retries_then_succeeds() {
        struct Flaky {
            failures: Mutex<u32>,
            inner: MemAnchorLog,
        }
        impl AnchorLog for Flaky {
            fn append(&self, record: &RawAnchorRecord) -> Result<(), AnchorLogError> {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(AnchorLogError::Transport("flaky".into()));
                }
                self.inner.append(record)
            }
            fn poll(&self, after: u64) -> Result<(Vec<RawAnchorRecord>, u64), AnchorLogError> {
                self.inner.poll(after)
            }
        }

        let log = Arc::new(Flaky {
            failures: Mutex::new(2),
            inner: MemAnchorLog::new(),
        });
        let writer = AnchorWriter::new(log.clone(), 3);
        writer.write_create(&"ab".repeat(16)).unwrap();
        assert_eq!(log.inner.records().len(), 1);
    }

    #[test]
    fn test_writer_gives_up_after_budget() {
        struct AlwaysDown;
        impl AnchorLog for AlwaysDown {
            fn append(&self, _record: &RawAnchorRecord) -> Result<(), AnchorLogError> {
                Err(AnchorLogError::Transport("down".into()))
            }
            fn poll(&self, _after: u64) -> Result<(Vec<RawAnchorRecord>, u64), AnchorLogError> {
                Ok((vec![], 0))
            }
        }
        let writer = AnchorWriter::new(Arc::new(AlwaysDown), 2);
        assert!(writer.write_create(&"ab".repeat(16)).is_err());
    }

    #[test]
    fn test_subscriber_publishes_and_advances_cursor() {
        let log = Arc::new(MemAnchorLog::new());
        let bus = MessageBus::new();
        let queue = bus.subscribe("observer", &[EventKind::Anchor]);

        log.append(&RawAnchorRecord::create(&"ab".repeat(16))).unwrap();
        let mut worker = AnchorWorker::new(log.clone(), bus.clone(), Duration::from_millis(10));
        worker.no_command_work();
        // Polling again without new records must not republish.
        worker.no_command_work();

        let first = queue.pop(Duration::from_millis(50)).unwrap();
        assert!(matches!(&*first, Event::Anchor(ev) if ev.kind == AnchorEventKind::AgreementCreate));
        assert!(queue.pop(Duration::from_millis(50)).is_none());
    }
}
