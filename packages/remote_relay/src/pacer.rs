use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::RelayError;
use crate::link::LinkSender;
use crate::queue::{PendingQueue, printable};

/// Minimum gap between two commands written to the device.
pub const DEFAULT_PACE_INTERVAL: Duration = Duration::from_millis(100);

/// Why the pacer stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacerExit {
    /// Dequeued the shutdown sentinel
    Shutdown,
    /// A write to the device failed
    LinkFailed,
    /// The link was closed elsewhere (device hung up, session teardown)
    LinkClosed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacerReport {
    pub sent: usize,
    /// Frames still queued when the pacer stopped; never delivered
    pub discarded: usize,
    pub exit: PacerExit,
}

/// Sole writer to the device. Drains the pending queue one frame at a time,
/// sleeping `interval` after each write completes.
pub struct CommandPacer {
    queue: PendingQueue,
    link: LinkSender,
    interval: Duration,
    verbose: bool,
}

impl CommandPacer {
    pub fn new(queue: PendingQueue, link: LinkSender, interval: Duration) -> Self {
        Self {
            queue,
            link,
            interval,
            verbose: false,
        }
    }

    /// Log every relayed command at info level instead of trace.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn spawn(self) -> JoinHandle<PacerReport> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> PacerReport {
        debug!(
            "Pacer started for device {} (interval {:?})",
            self.link.peer(),
            self.interval
        );

        let mut sent = 0;
        let exit = loop {
            let frame = tokio::select! {
                biased;
                _ = self.link.closed() => break PacerExit::LinkClosed,
                entry = self.queue.next() => match entry {
                    Some(frame) => frame,
                    None => break PacerExit::Shutdown,
                },
            };

            if self.verbose {
                info!(origin = %frame.origin, bytes = frame.payload.len(), "=> {}", printable(&frame.payload));
            } else {
                trace!(origin = %frame.origin, bytes = frame.payload.len(), "=> {}", printable(&frame.payload));
            }

            if let Err(e) = self.link.send(&frame.payload).await {
                warn!("Pacer stopping, command from {} not delivered: {}", frame.origin, e);
                break match e {
                    RelayError::LinkClosed => PacerExit::LinkClosed,
                    _ => PacerExit::LinkFailed,
                };
            }
            sent += 1;

            tokio::time::sleep(self.interval).await;
        };

        let discarded = self.queue.discard();
        if discarded > 0 {
            info!("Discarded {} queued command(s) that were never sent", discarded);
        }
        debug!("Pacer exiting ({:?}) after {} command(s)", exit, sent);

        PacerReport {
            sent,
            discarded,
            exit,
        }
    }
}
