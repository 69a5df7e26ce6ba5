//! Status event broadcasting.
//!
//! Execution supervisors hand events to the [`Broadcaster`], which forwards
//! them to a pluggable [`EventSink`] from a dedicated task. The hand-off is
//! a bounded queue: progress events are shed when it is full (subscribers
//! see the gap in `seq`), while the single terminal event per execution is
//! always enqueued. Delivery to the sink is attempted a configured number of
//! times, each attempt bounded by a timeout, so one wedged subscriber can
//! never stall command execution.
//!
//! Sequence numbers are assigned by the per-execution supervisor, which is
//! the only writer for its id; the forwarding task preserves queue order, so
//! events for one execution always reach the sink in `seq` order with the
//! terminal event last.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::types::BroadcastConfig;
use crate::error::{Result, RunletError};
use crate::registry::execution::{ExecutionId, ExecutionState, StreamTag};

/// One event on an execution's real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub execution_id: ExecutionId,
    /// Monotonically increasing per execution; gaps mean shed progress
    /// events, duplicates mean redelivery.
    pub seq: u64,
    pub state: ExecutionState,
    /// Set on output events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    /// Set on the terminal event of completed/failed executions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Exactly one event per execution carries `true`, and it is the last.
    pub terminal: bool,
    pub emitted_at: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn state_change(execution_id: ExecutionId, seq: u64, state: ExecutionState) -> Self {
        Self {
            execution_id,
            seq,
            state,
            stream: None,
            chunk: None,
            exit_code: None,
            detail: None,
            terminal: false,
            emitted_at: Utc::now(),
        }
    }

    pub fn output(
        execution_id: ExecutionId,
        seq: u64,
        state: ExecutionState,
        stream: StreamTag,
        chunk: String,
    ) -> Self {
        Self {
            execution_id,
            seq,
            state,
            stream: Some(stream),
            chunk: Some(chunk),
            exit_code: None,
            detail: None,
            terminal: false,
            emitted_at: Utc::now(),
        }
    }

    pub fn terminal(
        execution_id: ExecutionId,
        seq: u64,
        state: ExecutionState,
        exit_code: Option<i32>,
        detail: Option<String>,
    ) -> Self {
        Self {
            execution_id,
            seq,
            state,
            stream: None,
            chunk: None,
            exit_code,
            detail,
            terminal: true,
            emitted_at: Utc::now(),
        }
    }
}

/// Where events go. The engine only emits; subscriber fan-out lives behind
/// this trait.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &ExecutionEvent) -> Result<()>;
}

/// Sink that forwards events into a tokio channel, for in-process
/// subscribers and tests.
pub struct ChannelSink {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn deliver(&self, event: &ExecutionEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| RunletError::SinkDelivery("event channel closed".to_string()))
    }
}

/// Sink that writes one JSON object per line, for driving the engine from
/// the command line.
pub struct JsonLineSink {
    out: std::sync::Mutex<Box<dyn std::io::Write + Send>>,
}

impl JsonLineSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(writer: Box<dyn std::io::Write + Send>) -> Self {
        Self {
            out: std::sync::Mutex::new(writer),
        }
    }
}

#[async_trait]
impl EventSink for JsonLineSink {
    fn name(&self) -> &str {
        "json-lines"
    }

    async fn deliver(&self, event: &ExecutionEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| RunletError::SinkDelivery("writer lock poisoned".to_string()))?;
        writeln!(out, "{}", line)
            .map_err(|e| RunletError::SinkDelivery(format!("write failed: {}", e)))?;
        out.flush()
            .map_err(|e| RunletError::SinkDelivery(format!("flush failed: {}", e)))?;
        Ok(())
    }
}

struct BroadcasterInner {
    tx: mpsc::Sender<ExecutionEvent>,
    shed_events: AtomicU64,
}

/// Cheap-to-clone handle used by execution supervisors.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    /// Start the forwarding task and return the publish handle.
    pub fn start(config: &BroadcastConfig, sink: Arc<dyn EventSink>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let attempts = config.delivery_attempts.max(1);
        let timeout = Duration::from_millis(config.delivery_timeout_ms.max(1));
        tokio::spawn(forward_events(rx, sink, attempts, timeout));
        Self {
            inner: Arc::new(BroadcasterInner {
                tx,
                shed_events: AtomicU64::new(0),
            }),
        }
    }

    /// Non-blocking publish for progress events. When the queue is full the
    /// event is shed and counted; the runner is never delayed.
    pub fn publish_progress(&self, event: ExecutionEvent) {
        match self.inner.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.inner.shed_events.fetch_add(1, Ordering::Relaxed);
                debug!(
                    execution_id = %event.execution_id,
                    seq = event.seq,
                    "event queue full, progress event shed"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(
                    execution_id = %event.execution_id,
                    seq = event.seq,
                    "event queue closed, event lost"
                );
            }
        }
    }

    /// Enqueue a terminal event, waiting for queue space if needed. The
    /// forwarding task bounds every delivery, so this wait is bounded too.
    pub async fn publish_terminal(&self, event: ExecutionEvent) {
        let id = event.execution_id;
        let seq = event.seq;
        if self.inner.tx.send(event).await.is_err() {
            warn!(execution_id = %id, seq = seq, "event queue closed, terminal event lost");
        }
    }

    /// How many progress events have been shed since start.
    pub fn shed_events(&self) -> u64 {
        self.inner.shed_events.load(Ordering::Relaxed)
    }
}

async fn forward_events(
    mut rx: mpsc::Receiver<ExecutionEvent>,
    sink: Arc<dyn EventSink>,
    attempts: u32,
    timeout: Duration,
) {
    while let Some(event) = rx.recv().await {
        let mut delivered = false;
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, sink.deliver(&event)).await {
                Ok(Ok(())) => {
                    delivered = true;
                    break;
                }
                Ok(Err(e)) => {
                    debug!(
                        sink = sink.name(),
                        execution_id = %event.execution_id,
                        seq = event.seq,
                        attempt,
                        error = %e,
                        "event delivery failed"
                    );
                }
                Err(_) => {
                    debug!(
                        sink = sink.name(),
                        execution_id = %event.execution_id,
                        seq = event.seq,
                        attempt,
                        "event delivery timed out"
                    );
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
        }
        if !delivered {
            warn!(
                sink = sink.name(),
                execution_id = %event.execution_id,
                seq = event.seq,
                terminal = event.terminal,
                "event dropped after delivery attempts exhausted"
            );
        }
    }
    debug!(sink = sink.name(), "event forwarding finished (queue closed)");
}
