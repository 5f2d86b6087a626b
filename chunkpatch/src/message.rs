//! Messages from the installer worker to the calling thread.
//!
//! Components on the worker thread post [`InstallerMessage`]s through a
//! cloneable [`MessageSender`]. The caller drains them with
//! [`MessagePump::pump`], which hands each message to every registered
//! [`MessageHandler`] on the caller's thread.

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::installer::InstallState;
use crate::manifest::ChunkId;

/// Which chunk source raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkSourceKind {
    ChunkDb,
    Install,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkSourceEvent {
    /// Chunk data failed hash verification.
    CorruptChunk,
    /// Chunk data could not be read.
    ReadFailed,
    /// A backing file could not be opened.
    AccessLost,
    /// A chunk download failed and will be retried.
    DownloadRetry,
    /// A chunk download failed permanently.
    DownloadFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstallerMessage {
    ChunkSource {
        source: ChunkSourceKind,
        event: ChunkSourceEvent,
        chunk: Option<ChunkId>,
    },
    /// The installer entered a new stage.
    StageStarted(InstallState),
}

/// Receives messages on the thread calling [`MessagePump::pump`].
pub trait MessageHandler: Send {
    fn handle_message(&mut self, message: &InstallerMessage);
}

/// Posting side of the message pump.
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: UnboundedSender<InstallerMessage>,
}

impl MessageSender {
    /// Post a message. Messages posted after the pump is dropped are discarded.
    pub fn send(&self, message: InstallerMessage) {
        let _ = self.tx.send(message);
    }

    pub fn chunk_source(&self, source: ChunkSourceKind, event: ChunkSourceEvent, chunk: Option<ChunkId>) {
        self.send(InstallerMessage::ChunkSource {
            source,
            event,
            chunk,
        });
    }
}

/// Queue of pending installer messages.
#[derive(Debug)]
pub struct MessagePump {
    tx: UnboundedSender<InstallerMessage>,
    rx: Mutex<UnboundedReceiver<InstallerMessage>>,
}

impl Default for MessagePump {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePump {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn sender(&self) -> MessageSender {
        MessageSender {
            tx: self.tx.clone(),
        }
    }

    /// Deliver every queued message to `handlers`, returning how many were
    /// delivered.
    pub fn pump(&self, handlers: &mut [Box<dyn MessageHandler>]) -> usize {
        let mut rx = self.rx.lock();
        let mut delivered = 0;
        while let Ok(message) = rx.try_recv() {
            for handler in handlers.iter_mut() {
                handler.handle_message(&message);
            }
            delivered += 1;
        }
        delivered
    }
}
