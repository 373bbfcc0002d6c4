use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

use crate::acceptor::ClientAcceptor;
use crate::broadcast::{BroadcastRelay, RelayReport};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::link::{LinkState, UpstreamLink};
use crate::pacer::{CommandPacer, PacerReport};
use crate::queue::{CommandQueue, pending_queue};
use crate::registry::ListenerRegistry;

/// Told where the relay ended up listening, once the socket is bound.
pub trait Announcer: Send + Sync {
    fn announce(&self, listen_addr: SocketAddr);
}

impl<F> Announcer for F
where
    F: Fn(SocketAddr) + Send + Sync,
{
    fn announce(&self, listen_addr: SocketAddr) {
        self(listen_addr)
    }
}

/// Announces by logging; what the binary uses.
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn announce(&self, listen_addr: SocketAddr) {
        info!("Relay listening on {}", listen_addr);
    }
}

/// One run of the relay against one device connection.
pub struct Session {
    config: RelayConfig,
    announcer: Option<Box<dyn Announcer>>,
}

impl Session {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            announcer: None,
        }
    }

    pub fn with_announcer(mut self, announcer: impl Announcer + 'static) -> Self {
        self.announcer = Some(Box::new(announcer));
        self
    }

    /// Connect to the device, bind the listen socket and start the pacer
    /// and broadcast relay.
    ///
    /// The device comes first: if it cannot be reached nothing is bound.
    pub async fn start(self) -> Result<SessionHandle, RelayError> {
        let config = self.config;
        let link = UpstreamLink::new();

        let (sender, receiver) = link.connect(config.target, config.connect_timeout).await?;

        let listener = match TcpListener::bind(config.listen).await {
            Ok(listener) => listener,
            Err(source) => {
                link.close();
                return Err(RelayError::Bind {
                    addr: config.listen,
                    source,
                });
            }
        };
        let listen_addr = listener.local_addr().map_err(|source| {
            link.close();
            RelayError::Bind {
                addr: config.listen,
                source,
            }
        })?;

        if let Some(announcer) = &self.announcer {
            announcer.announce(listen_addr);
        }

        let span = info_span!("session", device = %config.target, listen = %listen_addr);
        let registry = ListenerRegistry::new();
        let (queue, pending) = pending_queue();

        let pacer = tokio::spawn(
            CommandPacer::new(pending, sender, config.pace_interval)
                .verbose(config.verbose)
                .run()
                .instrument(span.clone()),
        );
        let relay = tokio::spawn(
            BroadcastRelay::new(
                receiver.with_buffer_size(config.read_buffer_size),
                registry.clone(),
            )
            .verbose(config.verbose)
            .run()
            .instrument(span.clone()),
        );

        Ok(SessionHandle {
            listen_addr,
            listener,
            link,
            registry,
            queue,
            read_buffer_size: config.read_buffer_size,
            shutdown: CancellationToken::new(),
            pacer,
            relay,
            span,
        })
    }
}

/// A started session, ready to accept clients.
pub struct SessionHandle {
    listen_addr: SocketAddr,
    listener: TcpListener,
    link: UpstreamLink,
    registry: ListenerRegistry,
    queue: CommandQueue,
    read_buffer_size: usize,
    shutdown: CancellationToken,
    pacer: JoinHandle<PacerReport>,
    relay: JoinHandle<RelayReport>,
    span: tracing::Span,
}

/// What `serve` hands back after teardown.
///
/// The pacer and relay are not awaited by the session; callers that care
/// how they ended can await these.
pub struct SessionSummary {
    pub accepted: usize,
    pub closed_listeners: usize,
    pub pacer: JoinHandle<PacerReport>,
    pub relay: JoinHandle<RelayReport>,
}

impl SessionHandle {
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.watch()
    }

    pub fn registry(&self) -> ListenerRegistry {
        self.registry.clone()
    }

    /// Accept clients until `signal` resolves, then tear down: close the
    /// device link, close every listener and queue the pacer's sentinel.
    ///
    /// Closing the link is what stops the pacer here; it exits with
    /// `PacerExit::LinkClosed` and discards whatever was still queued. The
    /// sentinel only matters to a pacer that is not watching this link.
    pub async fn serve<F>(self, signal: F) -> SessionSummary
    where
        F: Future<Output = ()>,
    {
        let SessionHandle {
            listener,
            link,
            registry,
            queue,
            read_buffer_size,
            shutdown,
            pacer,
            relay,
            span,
            ..
        } = self;

        let acceptor =
            ClientAcceptor::new(listener, registry.clone(), queue.clone(), shutdown.clone())
                .read_buffer_size(read_buffer_size);

        let accepting = acceptor.run().instrument(span.clone());
        tokio::pin!(accepting);

        let accepted = tokio::select! {
            accepted = &mut accepting => accepted,
            _ = signal => {
                shutdown.cancel();
                accepting.await
            }
        };

        let closed_listeners = async {
            info!("Shutting down relay");
            link.close();
            let closed = registry.close_all().await;
            queue.shutdown();
            shutdown.cancel();
            closed
        }
        .instrument(span)
        .await;

        SessionSummary {
            accepted,
            closed_listeners,
            pacer,
            relay,
        }
    }
}
