use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::PublishError;
use crate::kernel::event::{Observation, SystemEvent};
use crate::kernel::snapshot::WorldModel;
use crate::navigation::GuidanceCommand;

/// Everything the node puts on the message bus, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    Observation(Observation),
    WorldModelSnapshot(Arc<WorldModel>),
    GuidanceCommand(GuidanceCommand),
    SystemEvent(SystemEvent),
}

impl BusMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::Observation(_) => "Observation",
            BusMessage::WorldModelSnapshot(_) => "WorldModelSnapshot",
            BusMessage::GuidanceCommand(_) => "GuidanceCommand",
            BusMessage::SystemEvent(_) => "SystemEvent",
        }
    }
}

/// Transport seam for the bus. One call is one delivery attempt.
#[async_trait]
pub trait BusSink: Send {
    async fn publish(&mut self, message: &BusMessage) -> Result<(), PublishError>;

    fn name(&self) -> &str;
}

/// Newline-delimited JSON onto any async writer (stdout in the node).
pub struct JsonLinesSink<W> {
    writer: W,
    name: String,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W, name: impl Into<String>) -> Self {
        Self {
            writer,
            name: name.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> BusSink for JsonLinesSink<W> {
    async fn publish(&mut self, message: &BusMessage) -> Result<(), PublishError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-process bus. Clones share the same message log, so a test can keep one
/// clone and hand the other to the publisher.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<BusMessage>>>,
    failures_left: Arc<AtomicU32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` delivery attempts.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BusSink for MemorySink {
    async fn publish(&mut self, message: &BusMessage) -> Result<(), PublishError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PublishError::Rejected("injected failure".to_string()));
        }
        self.messages
            .lock()
            .map_err(|_| PublishError::Rejected("message log poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
