use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Bytes requested per read from the device (and from each client).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Lifecycle of the device connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared handle to the single connection to the device.
///
/// The socket itself is split on connect: the write half goes to the pacer
/// (`LinkSender`), the read half to the broadcast relay (`LinkReceiver`).
/// This handle only carries the state and the close signal, so it can be
/// cloned freely and closed from anywhere.
#[derive(Clone)]
pub struct UpstreamLink {
    state: Arc<watch::Sender<LinkState>>,
    closed: CancellationToken,
}

impl Default for UpstreamLink {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamLink {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            state: Arc::new(state),
            closed: CancellationToken::new(),
        }
    }

    /// Open the device connection. The timeout applies to the connect only;
    /// reads and writes on the established link never time out.
    ///
    /// Any failure leaves the link `Closed`. A link connects at most once.
    pub async fn connect(
        &self,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<(LinkSender, LinkReceiver), RelayError> {
        let mut previous = LinkState::Disconnected;
        let started = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == LinkState::Disconnected {
                *state = LinkState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(RelayError::LinkReused(previous));
        }

        debug!("Connecting to device at {} (timeout {:?})", target, timeout);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.close();
                return Err(RelayError::Connect { target, source });
            }
            Err(_) => {
                self.close();
                return Err(RelayError::ConnectTimeout { target, timeout });
            }
        };

        if self.closed.is_cancelled() {
            return Err(RelayError::LinkClosed);
        }

        // Commands are small and latency matters more than packing.
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on device socket: {}", e);
        }

        let (reader, writer) = stream.into_split();
        self.state.send_replace(LinkState::Connected);
        info!("Connected to device at {}", target);

        Ok((
            LinkSender {
                writer,
                peer: target,
                link: self.clone(),
            },
            LinkReceiver {
                reader,
                peer: target,
                buffer: vec![0u8; DEFAULT_READ_BUFFER_SIZE],
                link: self.clone(),
            },
        ))
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Mark the link closed and wake any task blocked on it. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
        let changed = self.state.send_if_modified(|state| {
            if *state == LinkState::Closed {
                false
            } else {
                *state = LinkState::Closed;
                true
            }
        });
        if changed {
            debug!("Device link closed");
        }
    }

    /// Resolves once the link has been closed.
    pub fn closed(&self) -> impl Future<Output = ()> + '_ {
        self.closed.cancelled()
    }
}

/// Write half of the device connection. Owned by the pacer.
pub struct LinkSender {
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    link: UpstreamLink,
}

impl LinkSender {
    /// Write the whole payload to the device.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        if self.link.is_closed() {
            return Err(RelayError::LinkClosed);
        }

        tokio::select! {
            biased;
            _ = self.link.closed.cancelled() => Err(RelayError::LinkClosed),
            result = self.writer.write_all(bytes) => result.map_err(|e| {
                warn!("Write to device at {} failed: {}", self.peer, e);
                self.link.close();
                RelayError::Link(e)
            }),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Resolves once the link has been closed by any holder.
    pub fn closed(&self) -> impl Future<Output = ()> + '_ {
        self.link.closed()
    }
}

/// Read half of the device connection. Owned by the broadcast relay.
pub struct LinkReceiver {
    reader: OwnedReadHalf,
    peer: SocketAddr,
    buffer: Vec<u8>,
    link: UpstreamLink,
}

impl LinkReceiver {
    /// Change how many bytes a single `receive` may return.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer = vec![0u8; size.max(1)];
        self
    }

    /// Wait for the next chunk from the device.
    ///
    /// `Ok(None)` means the device closed the connection in an orderly way.
    /// Either way the link is `Closed` once this returns anything but data.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        if self.link.is_closed() {
            return Err(RelayError::LinkClosed);
        }

        let result = tokio::select! {
            biased;
            _ = self.link.closed.cancelled() => return Err(RelayError::LinkClosed),
            result = self.reader.read(&mut self.buffer) => result,
        };

        match result {
            Ok(0) => {
                info!("Device at {} closed the connection", self.peer);
                self.link.close();
                Ok(None)
            }
            Ok(n) => Ok(Some(self.buffer[..n].to_vec())),
            Err(e) => {
                warn!("Read from device at {} failed: {}", self.peer, e);
                self.link.close();
                Err(RelayError::Link(e))
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}
