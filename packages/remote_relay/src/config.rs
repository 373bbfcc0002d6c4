use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::link::DEFAULT_READ_BUFFER_SIZE;
use crate::pacer::DEFAULT_PACE_INTERVAL;

/// The device's standard control port, used for both the device and the
/// relay's own listen socket unless told otherwise.
pub const DEVICE_CONTROL_PORT: u16 = 31339;

// =============================================================================
// File config (figment-deserialized from defaults / rproxy.toml / env vars)
// =============================================================================
//
//   rproxy.toml:     [listen]
//                    port = 31340
//
//   env var:         RPROXY_LISTEN__PORT=31340   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default)]
    pub listen: ListenFileConfig,
    #[serde(default)]
    pub upstream: UpstreamFileConfig,
    #[serde(default)]
    pub pacer: PacerFileConfig,
    /// Echo every relayed command and status chunk
    #[serde(default)]
    pub verbose: bool,
}

/// Where clients connect (lives under `[listen]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenFileConfig {
    /// Interface to bind. Empty means all interfaces.
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenFileConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_port(),
        }
    }
}

/// Device connection tunables (lives under `[upstream]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamFileConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for UpstreamFileConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Command pacing (lives under `[pacer]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PacerFileConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PacerFileConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEVICE_CONTROL_PORT
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}
fn default_interval_ms() -> u64 {
    DEFAULT_PACE_INTERVAL.as_millis() as u64
}

/// Build a figment that layers: defaults → config file (if any) → RPROXY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RPROXY_PACER__INTERVAL_MS=150`  →  `pacer.interval_ms = 150`
///   `RPROXY_VERBOSE=true`            →  `verbose = true`
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(RelayFileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("RPROXY_").split("__"))
}

/// Resolved session configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// The device
    pub target: SocketAddr,
    /// Where clients connect
    pub listen: SocketAddr,
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    pub pace_interval: Duration,
    pub verbose: bool,
}

impl RelayConfig {
    /// Defaults for everything but the device address.
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEVICE_CONTROL_PORT),
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            pace_interval: DEFAULT_PACE_INTERVAL,
            verbose: false,
        }
    }

    pub fn from_file(fc: &RelayFileConfig, target: SocketAddr) -> Result<Self, RelayError> {
        if fc.upstream.read_buffer_size == 0 {
            return Err(RelayError::Config(
                "upstream.read_buffer_size must be greater than zero".into(),
            ));
        }

        let host = fc.listen.host.trim();
        let ip: IpAddr = if host.is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            host.parse()
                .map_err(|_| RelayError::Config(format!("listen.host is not an IP address: {host}")))?
        };

        Ok(Self {
            target,
            listen: SocketAddr::new(ip, fc.listen.port),
            connect_timeout: Duration::from_millis(fc.upstream.connect_timeout_ms),
            read_buffer_size: fc.upstream.read_buffer_size,
            pace_interval: Duration::from_millis(fc.pacer.interval_ms),
            verbose: fc.verbose,
        })
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
}
