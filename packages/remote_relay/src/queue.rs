//! The pending command queue shared by every client reader and the pacer.
//!
//! Unbounded on purpose: a burst from the clients is absorbed here and the
//! pacer drains it at its own rate. Insertion order is delivery order.

use std::net::SocketAddr;

use tokio::sync::mpsc;

/// One chunk read from a client, relayed to the device verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandFrame {
    pub payload: Vec<u8>,
    /// Where the chunk came from. Only used in logs.
    pub origin: SocketAddr,
}

impl CommandFrame {
    pub fn new(payload: impl Into<Vec<u8>>, origin: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            origin,
        }
    }
}

enum QueueEntry {
    Command(CommandFrame),
    /// Sentinel: the pacer stops when it dequeues this.
    Shutdown,
}

/// Producer side. Cheap to clone, one per client reader.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<QueueEntry>,
}

/// Consumer side. Exactly one, owned by the pacer.
pub struct PendingQueue {
    rx: mpsc::UnboundedReceiver<QueueEntry>,
}

/// Create a connected producer/consumer pair.
pub fn pending_queue() -> (CommandQueue, PendingQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandQueue { tx }, PendingQueue { rx })
}

impl CommandQueue {
    /// Append a frame. Returns false once the consumer is gone.
    pub fn push(&self, frame: CommandFrame) -> bool {
        debug_assert!(!frame.payload.is_empty(), "empty frames are never queued");
        self.tx.send(QueueEntry::Command(frame)).is_ok()
    }

    /// Append the shutdown sentinel behind everything already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueEntry::Shutdown);
    }
}

impl PendingQueue {
    /// Wait for the next frame.
    ///
    /// Returns `None` on the sentinel, or when every producer has been
    /// dropped and the queue is empty.
    pub async fn next(&mut self) -> Option<CommandFrame> {
        match self.rx.recv().await? {
            QueueEntry::Command(frame) => Some(frame),
            QueueEntry::Shutdown => None,
        }
    }

    /// Stop accepting frames and drop whatever is still queued.
    /// Returns how many command frames were thrown away.
    pub fn discard(&mut self) -> usize {
        self.rx.close();
        let mut dropped = 0;
        while let Ok(entry) = self.rx.try_recv() {
            if matches!(entry, QueueEntry::Command(_)) {
                dropped += 1;
            }
        }
        dropped
    }
}

/// Render a raw chunk for the log: printable ASCII as-is, the rest escaped.
pub(crate) fn printable(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}
