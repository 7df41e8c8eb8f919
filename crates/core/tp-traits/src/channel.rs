//! Channel adapter boundary.
//!
//! The real transport (broker, binder) lives outside this workspace. These
//! traits are the seam it plugs into; [`bounded`] provides an in-memory
//! implementation on top of tokio channels.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tp_error::{ChannelError, Result, StageError, TpError};
use tp_types::Message;

/// Supplies inbound messages to a stage.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Receives the next message.
    ///
    /// Returns `Ok(None)` once the source is exhausted.
    async fn receive(&self) -> Result<Option<Message>>;
}

/// Accepts outbound messages from a stage.
///
/// `send` may wait; a bounded sink applies backpressure to the caller.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Delivers a message downstream.
    async fn send(&self, message: Message) -> Result<()>;
}

/// Receives messages a stage failed to transform.
///
/// Retry, dead-lettering or halting the pipeline is the implementation's
/// decision.
#[async_trait]
pub trait FailureSink: Send + Sync {
    /// Hands over a failed message with its error.
    async fn reject(&self, message: Message, error: StageError) -> Result<()>;
}

/// Creates an in-memory channel holding at most `capacity` messages.
pub fn bounded(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink { tx },
        ChannelSource {
            rx: tokio::sync::Mutex::new(rx),
        },
    )
}

/// Sending half of an in-memory channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TpError::from(ChannelError::Closed))
    }
}

/// Receiving half of an in-memory channel.
///
/// Exhausted once every [`ChannelSink`] clone has been dropped and the
/// buffer is drained.
#[derive(Debug)]
pub struct ChannelSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn receive(&self) -> Result<Option<Message>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// A failure sink that keeps every rejected message in memory.
#[derive(Debug, Default)]
pub struct CollectingFailureSink {
    rejected: Mutex<Vec<(Message, StageError)>>,
}

impl CollectingFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rejected messages so far.
    pub fn len(&self) -> usize {
        self.rejected.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes all rejected messages collected so far.
    pub fn drain(&self) -> Vec<(Message, StageError)> {
        std::mem::take(&mut *self.rejected.lock())
    }
}

#[async_trait]
impl FailureSink for CollectingFailureSink {
    async fn reject(&self, message: Message, error: StageError) -> Result<()> {
        self.rejected.lock().push((message, error));
        Ok(())
    }
}
