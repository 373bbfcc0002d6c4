use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur while relaying between the device and its clients.
///
/// Device-side variants (`Connect*`, `Link*`) are fatal to the session.
/// `Client` is isolated to the one connection it names. `Bind`, `Resolve`
/// and `Config` only happen during startup.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The device refused the connection or the connect failed outright
    #[error("failed to connect to device at {target}: {source}")]
    Connect {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The device did not answer within the connect timeout
    #[error("timed out after {timeout:?} connecting to device at {target}")]
    ConnectTimeout { target: SocketAddr, timeout: Duration },

    /// Read or write failure on an established device connection
    #[error("device link failed: {0}")]
    Link(#[source] io::Error),

    /// The device link was already closed by this session
    #[error("device link is closed")]
    LinkClosed,

    /// A link may only be connected once
    #[error("device link already used (state: {0})")]
    LinkReused(crate::link::LinkState),

    /// A downstream client socket failed
    #[error("client {addr} failed: {source}")]
    Client {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Write to a listener whose socket was already closed
    #[error("client {0} is closed")]
    ClientClosed(SocketAddr),

    /// A client fell too far behind on device output
    #[error("client {addr} fell {backlog} chunks behind")]
    ClientLagged { addr: SocketAddr, backlog: usize },

    /// The listen address could not be bound
    #[error("failed to bind listen address {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The target name did not resolve to any address
    #[error("could not resolve device address {target}: {reason}")]
    Resolve { target: String, reason: String },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// True for failures that end the whole session rather than one client.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RelayError::Client { .. }
                | RelayError::ClientClosed(_)
                | RelayError::ClientLagged { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_fatal() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = RelayError::Client {
            addr,
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert!(!err.is_fatal());
        assert!(!RelayError::ClientClosed(addr).is_fatal());
        assert!(!RelayError::ClientLagged { addr, backlog: 256 }.is_fatal());
    }

    #[test]
    fn device_errors_are_fatal() {
        let target: SocketAddr = "127.0.0.1:31339".parse().unwrap();
        assert!(RelayError::LinkClosed.is_fatal());
        assert!(
            RelayError::ConnectTimeout {
                target,
                timeout: Duration::from_secs(5)
            }
            .is_fatal()
        );
    }

    #[test]
    fn connect_timeout_message_names_target() {
        let target: SocketAddr = "10.0.0.5:31339".parse().unwrap();
        let err = RelayError::ConnectTimeout {
            target,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 5s connecting to device at 10.0.0.5:31339"
        );
    }
}
