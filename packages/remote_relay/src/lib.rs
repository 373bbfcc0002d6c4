//! Remote Relay - share a single-connection control port between many clients
//!
//! Some devices (a TiVo's remote-control port, for one) accept exactly one
//! control connection at a time. This crate holds that connection and
//! reflects it back out on a listening socket:
//!
//! - every chunk a client sends is queued and written to the device, one at
//!   a time, no closer together than the pacing interval (100 ms default);
//! - every chunk the device sends is written to every connected client.
//!
//! Payloads are opaque. Nothing is parsed, authenticated or persisted.
//!
//! # Example
//!
//! ```no_run
//! use remote_relay::{LogAnnouncer, RelayConfig, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), remote_relay::RelayError> {
//!     let device = "192.168.1.20:31339".parse().unwrap();
//!     let handle = Session::new(RelayConfig::new(device))
//!         .with_announcer(LogAnnouncer)
//!         .start()
//!         .await?;
//!
//!     handle
//!         .serve(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!     Ok(())
//! }
//! ```

mod acceptor;
mod broadcast;
pub mod config;
mod error;
pub mod link;
mod pacer;
pub mod queue;
pub mod registry;
mod session;
pub mod target;

pub use acceptor::ClientAcceptor;
pub use broadcast::{BroadcastRelay, RelayExit, RelayReport};
pub use config::{DEVICE_CONTROL_PORT, RelayConfig, RelayFileConfig, load_config};
pub use error::RelayError;
pub use link::{LinkReceiver, LinkSender, LinkState, UpstreamLink};
pub use pacer::{CommandPacer, DEFAULT_PACE_INTERVAL, PacerExit, PacerReport};
pub use queue::{CommandFrame, CommandQueue, PendingQueue, pending_queue};
pub use registry::{
    BroadcastOutcome, DEFAULT_LISTENER_BACKLOG, Listener, ListenerId, ListenerRegistry,
};
pub use session::{Announcer, LogAnnouncer, Session, SessionHandle, SessionSummary};
pub use target::TargetAddr;
