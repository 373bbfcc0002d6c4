use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::DEFAULT_READ_BUFFER_SIZE;
use crate::queue::{CommandFrame, CommandQueue};
use crate::registry::{Listener, ListenerRegistry};

/// Back-off after a failed `accept()` (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts downstream clients until `shutdown` fires.
///
/// Each client is registered as a listener, then gets its own reader task
/// that turns every chunk it sends into a `CommandFrame` on the queue.
pub struct ClientAcceptor {
    listener: TcpListener,
    registry: ListenerRegistry,
    queue: CommandQueue,
    read_buffer_size: usize,
    shutdown: CancellationToken,
}

impl ClientAcceptor {
    pub fn new(
        listener: TcpListener,
        registry: ListenerRegistry,
        queue: CommandQueue,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            registry,
            queue,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            shutdown,
        }
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Run the accept loop. Returns how many clients were accepted.
    /// The listening socket is closed when this returns.
    pub async fn run(self) -> usize {
        let mut accepted = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.listener.accept() => result,
            };

            match result {
                Ok((stream, addr)) => {
                    accepted += 1;
                    self.attach(stream, addr).await;
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        debug!("Acceptor stopped after {} client(s)", accepted);
        accepted
    }

    async fn attach(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", addr, e);
        }
        let (reader, writer) = stream.into_split();
        let listener = self.registry.register(addr, writer).await;
        info!("Client {} connected as {}", addr, listener.id());

        tokio::spawn(read_client(
            reader,
            listener,
            self.queue.clone(),
            self.read_buffer_size,
            self.shutdown.clone(),
        ));
    }
}

/// Forward everything one client sends to the pending queue.
///
/// Once the pacer is gone (device lost) input is read and dropped; the
/// client stays connected. Ends on EOF, read error or shutdown, then
/// closes the client's socket.
/// The registry entry is left behind; the next broadcast that fails to
/// reach it evicts it. Returns the number of frames enqueued.
async fn read_client(
    mut reader: OwnedReadHalf,
    listener: Listener,
    queue: CommandQueue,
    buffer_size: usize,
    shutdown: CancellationToken,
) -> usize {
    let addr = listener.addr();
    let mut buffer = vec![0u8; buffer_size];
    let mut frames = 0;
    let mut dropping = false;

    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = reader.read(&mut buffer) => result,
        };

        match result {
            Ok(0) => {
                debug!("Client {} hung up", addr);
                break;
            }
            Ok(n) => {
                if queue.push(CommandFrame::new(&buffer[..n], addr)) {
                    frames += 1;
                } else if !dropping {
                    debug!("Pacer gone, dropping input from {}", addr);
                    dropping = true;
                }
            }
            Err(e) => {
                debug!("Client {} read failed: {}", addr, e);
                break;
            }
        }
    }

    listener.close();
    info!("Client {} disconnected ({} command(s))", addr, frames);
    frames
}
