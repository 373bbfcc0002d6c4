use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::RelayError;
use crate::link::LinkReceiver;
use crate::queue::printable;
use crate::registry::ListenerRegistry;

/// Why the relay stopped reading from the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayExit {
    /// The device closed the connection
    DeviceClosed,
    /// A read from the device failed
    LinkFailed,
    /// The link was closed by this session
    LinkClosed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayReport {
    pub chunks: usize,
    pub evicted: usize,
    pub exit: RelayExit,
}

/// Sole reader of the device. Every chunk it receives is fanned out to the
/// whole listener registry.
pub struct BroadcastRelay {
    link: LinkReceiver,
    registry: ListenerRegistry,
    verbose: bool,
}

impl BroadcastRelay {
    pub fn new(link: LinkReceiver, registry: ListenerRegistry) -> Self {
        Self {
            link,
            registry,
            verbose: false,
        }
    }

    /// Log every relayed status chunk at info level instead of trace.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn spawn(self) -> JoinHandle<RelayReport> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> RelayReport {
        let device = self.link.peer();
        let mut chunks = 0;
        let mut evicted = 0;

        let exit = loop {
            let chunk = match self.link.receive().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break RelayExit::DeviceClosed,
                Err(RelayError::LinkClosed) => break RelayExit::LinkClosed,
                Err(e) => {
                    debug!("Relay read error: {}", e);
                    break RelayExit::LinkFailed;
                }
            };

            if self.verbose {
                info!(origin = %device, bytes = chunk.len(), "<= {}", printable(&chunk));
            } else {
                trace!(origin = %device, bytes = chunk.len(), "<= {}", printable(&chunk));
            }

            let outcome = self.registry.broadcast(&chunk).await;
            chunks += 1;
            evicted += outcome.evicted.len();
        };

        match exit {
            RelayExit::LinkClosed => debug!("Relay stopped: link closed"),
            _ => warn!("Lost device at {}; no further commands can be delivered", device),
        }

        RelayReport {
            chunks,
            evicted,
            exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkSender, LinkState, UpstreamLink};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn connect_device() -> (UpstreamLink, LinkSender, LinkReceiver, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let link = UpstreamLink::new();
        let (connect, accept) = tokio::join!(link.connect(addr, WAIT), listener.accept());
        let (tx, rx) = connect.unwrap();
        (link, tx, rx, accept.unwrap().0)
    }

    #[tokio::test]
    async fn test_chunks_reach_registered_clients() {
        let (_link, _tx, rx, mut device) = connect_device().await;
        let registry = ListenerRegistry::new();

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, accepted) = tokio::join!(
            TcpStream::connect(server.local_addr().unwrap()),
            server.accept()
        );
        let mut client = client.unwrap();
        let (stream, peer) = accepted.unwrap();
        let (_server_read, write) = stream.into_split();
        registry.register(peer, write).await;

        let relay = BroadcastRelay::new(rx, registry.clone()).verbose(true).spawn();

        device.write_all(b"CH_STATUS 0200 LOCAL\r\n").await.unwrap();
        let mut buf = [0u8; 22];
        timeout(WAIT, client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"CH_STATUS 0200 LOCAL\r\n");

        drop(device);
        let report = timeout(WAIT, relay).await.unwrap().unwrap();
        assert_eq!(report.exit, RelayExit::DeviceClosed);
        assert!(report.chunks >= 1);
    }

    #[tokio::test]
    async fn test_device_close_closes_link() {
        let (link, _tx, rx, device) = connect_device().await;
        let relay = BroadcastRelay::new(rx, ListenerRegistry::new()).spawn();

        drop(device);
        let report = timeout(WAIT, relay).await.unwrap().unwrap();
        assert_eq!(report.exit, RelayExit::DeviceClosed);
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_local_close_stops_relay() {
        let (link, _tx, rx, _device) = connect_device().await;
        let relay = BroadcastRelay::new(rx, ListenerRegistry::new()).spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        link.close();
        let report = timeout(WAIT, relay).await.unwrap().unwrap();
        assert_eq!(report.exit, RelayExit::LinkClosed);
        assert_eq!(report.chunks, 0);
    }
}
