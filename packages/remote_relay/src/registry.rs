use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RelayError;

/// Chunks a listener may have queued but not yet written before it is
/// considered stalled and dropped.
pub const DEFAULT_LISTENER_BACKLOG: usize = 256;

/// Unique identifier for a connected client
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Write side of one downstream client.
///
/// The socket itself is owned by a writer task that drains a bounded
/// outbox. Cloning shares the outbox. Once closed (by the client's reader,
/// a failed write, or shutdown) every further `send` fails, which is what
/// gets the listener evicted at the next broadcast.
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    addr: SocketAddr,
    outbox: mpsc::Sender<Arc<[u8]>>,
    closed: CancellationToken,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a chunk for this client. Never waits on the socket.
    pub fn send(&self, chunk: Arc<[u8]>) -> Result<(), RelayError> {
        if self.closed.is_cancelled() {
            return Err(RelayError::ClientClosed(self.addr));
        }
        self.outbox.try_send(chunk).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::ClientLagged {
                addr: self.addr,
                backlog: self.outbox.max_capacity(),
            },
            TrySendError::Closed(_) => RelayError::ClientClosed(self.addr),
        })
    }

    /// Stop writing and shut down the write side. Idempotent; a write in
    /// progress is abandoned.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Drain one listener's outbox into its socket until closed.
async fn write_listener(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Arc<[u8]>>,
    id: ListenerId,
    addr: SocketAddr,
    closed: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            chunk = outbox.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            result = writer.write_all(&chunk) => result,
        };
        if let Err(source) = result {
            debug!("{} write failed: {}", id, RelayError::Client { addr, source });
            break;
        }
    }

    closed.cancel();
    let _ = writer.shutdown().await;
    debug!("{} writer stopped", id);
}

/// Result of one fan-out
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: Vec<ListenerId>,
}

/// The set of clients currently eligible to receive device output.
#[derive(Clone)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<HashMap<ListenerId, Listener>>>,
    next_id: Arc<AtomicU64>,
    backlog: usize,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::with_backlog(DEFAULT_LISTENER_BACKLOG)
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose listeners may fall `backlog` chunks behind.
    pub fn with_backlog(backlog: usize) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            backlog: backlog.max(1),
        }
    }

    /// Add a freshly accepted client and start its writer task
    pub async fn register(&self, addr: SocketAddr, writer: OwnedWriteHalf) -> Listener {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (outbox, rx) = mpsc::channel(self.backlog);
        let closed = CancellationToken::new();
        tokio::spawn(write_listener(writer, rx, id, addr, closed.clone()));

        let listener = Listener {
            id,
            addr,
            outbox,
            closed,
        };
        self.listeners.write().await.insert(id, listener.clone());
        debug!("Registered {} for {}", id, addr);
        listener
    }

    /// Remove a listener without closing it
    pub async fn remove(&self, id: ListenerId) -> bool {
        self.listeners.write().await.remove(&id).is_some()
    }

    /// Copy of the current membership, safe to iterate while others mutate
    pub async fn snapshot(&self) -> Vec<Listener> {
        self.listeners.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listeners.read().await.is_empty()
    }

    pub async fn contains(&self, id: ListenerId) -> bool {
        self.listeners.read().await.contains_key(&id)
    }

    /// Hand `chunk` to every listener's outbox.
    ///
    /// Only queues; the sockets are written by each listener's own task, so
    /// a stalled client never holds up the rest. Listeners that are closed
    /// or whose outbox is full are dropped from the registry for good.
    pub async fn broadcast(&self, chunk: &[u8]) -> BroadcastOutcome {
        let chunk: Arc<[u8]> = Arc::from(chunk);
        let mut outcome = BroadcastOutcome::default();

        for listener in self.snapshot().await {
            match listener.send(chunk.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    info!("Dropping {} ({}): {}", listener.id, listener.addr, e);
                    self.remove(listener.id).await;
                    listener.close();
                    outcome.evicted.push(listener.id);
                }
            }
        }
        outcome
    }

    /// Empty the registry and close every member
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Listener> = self.listeners.write().await.drain().map(|(_, l)| l).collect();
        for listener in &drained {
            listener.close();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Client end of an accepted connection, plus the server's read half
    /// so the socket stays open for as long as the test holds it.
    struct Client {
        stream: TcpStream,
        _server_read: OwnedReadHalf,
    }

    async fn attach(registry: &ListenerRegistry, server: &TcpListener) -> (Listener, Client) {
        let addr = server.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), server.accept());
        let (stream, peer) = accepted.unwrap();
        let (read, write) = stream.into_split();
        let listener = registry.register(peer, write).await;
        (
            listener,
            Client {
                stream: client.unwrap(),
                _server_read: read,
            },
        )
    }

    #[test]
    fn test_listener_id_display() {
        assert_eq!(ListenerId(7).to_string(), "listener-7");
    }

    #[tokio::test]
    async fn test_register_assigns_unique_ids() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ListenerRegistry::new();

        let (a, _ca) = attach(&registry, &server).await;
        let (b, _cb) = attach(&registry, &server).await;

        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len().await, 2);
        assert!(registry.contains(a.id()).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ListenerRegistry::new();
        let (_a, mut ca) = attach(&registry, &server).await;
        let (_b, mut cb) = attach(&registry, &server).await;

        let outcome = registry.broadcast(b"STATUS\r\n").await;
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.evicted.is_empty());

        for client in [&mut ca, &mut cb] {
            let mut buf = [0u8; 8];
            timeout(WAIT, client.stream.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf, b"STATUS\r\n");
        }
    }

    #[tokio::test]
    async fn test_closed_listener_is_evicted_and_others_still_served() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ListenerRegistry::new();
        let (a, _ca) = attach(&registry, &server).await;
        let (b, mut cb) = attach(&registry, &server).await;

        a.close();
        assert!(a.is_closed());
        // Still registered until the next broadcast notices.
        assert_eq!(registry.len().await, 2);

        let outcome = registry.broadcast(b"STATUS\r\n").await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.evicted, vec![a.id()]);
        assert!(!registry.contains(a.id()).await);
        assert!(registry.contains(b.id()).await);

        let mut buf = [0u8; 8];
        timeout(WAIT, cb.stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"STATUS\r\n");

        // Evicted for good: later broadcasts do not count it again.
        let outcome = registry.broadcast(b"X").await;
        assert_eq!(outcome.delivered, 1);
        assert!(outcome.evicted.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_empties_and_closes() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ListenerRegistry::new();
        let (a, mut ca) = attach(&registry, &server).await;

        assert_eq!(registry.close_all().await, 1);
        assert!(registry.is_empty().await);
        assert!(a.is_closed());

        // Client sees the write side shut down.
        let mut buf = Vec::new();
        let n = timeout(WAIT, ca.stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_stalled_listener_overflows_and_is_evicted() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ListenerRegistry::with_backlog(2);
        // Never reads, so once the socket buffers fill its outbox does too.
        let (stalled, _client) = attach(&registry, &server).await;

        let chunk = vec![b'x'; 64 * 1024];
        let evicted = timeout(WAIT, async {
            loop {
                let outcome = registry.broadcast(&chunk).await;
                if !outcome.evicted.is_empty() {
                    break outcome.evicted;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stalled listener was never dropped");

        assert_eq!(evicted, vec![stalled.id()]);
        assert!(stalled.is_closed());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_stalled_write() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ListenerRegistry::with_backlog(4);
        let (stalled, mut client) = attach(&registry, &server).await;

        // Enough to leave the writer task blocked mid-write.
        let chunk = vec![b'x'; 16 * 1024 * 1024];
        registry.broadcast(&chunk).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(timeout(WAIT, registry.close_all()).await.unwrap(), 1);
        assert!(stalled.is_closed());

        // The abandoned write ends in EOF rather than the full chunk.
        let mut buf = Vec::new();
        let n = timeout(WAIT, client.stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n < chunk.len());
    }
}
