//! Message delivery from the scheduler to check workers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};

use crate::processor::CheckProcessor;
use crate::resource::ResourceId;

/// Work item consumed by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum Message {
    /// Periodic check enqueued by the scheduler.
    CheckResource(ResourceId),
    /// Explicit request to converge one resource now.
    ConvergeResource(ResourceId),
}

impl Message {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Message::CheckResource(id) | Message::ConvergeResource(id) => id,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch queue closed")]
    Closed,
}

/// Queue the scheduler pushes work onto.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn push(&self, message: Message) -> Result<(), DispatchError>;
}

/// In-process queue backed by an unbounded channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn push(&self, message: Message) -> Result<(), DispatchError> {
        self.tx.send(message).map_err(|_| DispatchError::Closed)
    }
}

/// Consumes messages and runs each on its own task.
pub struct Workers {
    processor: Arc<CheckProcessor>,
}

impl Workers {
    pub fn new(processor: Arc<CheckProcessor>) -> Self {
        Self { processor }
    }

    /// Run until the queue closes or `stop_rx` fires, then wait for
    /// in-flight checks to finish.
    pub async fn run(&self, rx: mpsc::UnboundedReceiver<Message>, mut stop_rx: mpsc::Receiver<()>) {
        let mut messages = UnboundedReceiverStream::new(rx);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                message = messages.next() => {
                    let Some(message) = message else {
                        debug!("Dispatch queue closed");
                        break;
                    };
                    let processor = Arc::clone(&self.processor);
                    in_flight.spawn(async move { processor.handle(message).await });
                }
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        error!("Check task panicked: {}", e);
                    }
                }
                _ = stop_rx.recv() => {
                    info!("Workers stopping");
                    break;
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Check task panicked: {}", e);
            }
        }
    }
}
