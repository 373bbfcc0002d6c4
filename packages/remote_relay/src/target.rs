//! Turning the operator's `host[:port]` argument into a device address.

use std::fmt;
use std::net::SocketAddr;

use tracing::debug;

use crate::error::RelayError;

/// A device address as typed by the operator, before resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`. A bare IPv6
    /// address without brackets is taken whole, with `default_port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, RelayError> {
        let input = input.trim();
        let invalid = |reason: &str| RelayError::Resolve {
            target: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("empty address"));
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid("missing closing bracket"))?;
            match after {
                "" => (host, None),
                _ => match after.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(invalid("unexpected text after bracket")),
                },
            }
        } else if input.matches(':').count() == 1 {
            let (host, port) = input.split_once(':').ok_or_else(|| invalid("bad port"))?;
            (host, Some(port))
        } else {
            (input, None)
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve through the system resolver; the first address wins.
    pub async fn resolve(&self) -> Result<SocketAddr, RelayError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| RelayError::Resolve {
                target: self.to_string(),
                reason: e.to_string(),
            })?;
        let addr = addrs.next().ok_or_else(|| RelayError::Resolve {
            target: self.to_string(),
            reason: "no addresses found".to_string(),
        })?;
        debug!("Resolved {} to {}", self, addr);
        Ok(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT: u16 = 31339;

    #[test]
    fn test_host_only_uses_default_port() {
        let t = TargetAddr::parse("192.168.1.20", PORT).unwrap();
        assert_eq!(t.host, "192.168.1.20");
        assert_eq!(t.port, PORT);
    }

    #[test]
    fn test_host_with_port() {
        let t = TargetAddr::parse("tivo.local:4000", PORT).unwrap();
        assert_eq!(t.host, "tivo.local");
        assert_eq!(t.port, 4000);
        assert_eq!(t.to_string(), "tivo.local:4000");
    }

    #[test]
    fn test_ipv6_forms() {
        let bare = TargetAddr::parse("fe80::1", PORT).unwrap();
        assert_eq!(bare.host, "fe80::1");
        assert_eq!(bare.port, PORT);

        let bracketed = TargetAddr::parse("[::1]:4000", PORT).unwrap();
        assert_eq!(bracketed.host, "::1");
        assert_eq!(bracketed.port, 4000);
        assert_eq!(bracketed.to_string(), "[::1]:4000");

        let no_port = TargetAddr::parse("[::1]", PORT).unwrap();
        assert_eq!(no_port.port, PORT);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(TargetAddr::parse("", PORT).is_err());
        assert!(TargetAddr::parse(":31339", PORT).is_err());
        assert!(TargetAddr::parse("host:notaport", PORT).is_err());
        assert!(TargetAddr::parse("host:70000", PORT).is_err());
        assert!(TargetAddr::parse("[::1", PORT).is_err());
        assert!(TargetAddr::parse("[::1]x", PORT).is_err());
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let t = TargetAddr::parse("127.0.0.1:4000", PORT).unwrap();
        let addr = t.resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse::<SocketAddr>().unwrap());
    }
}
