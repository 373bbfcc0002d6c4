use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use remote_relay::{
    DEVICE_CONTROL_PORT, LogAnnouncer, RelayConfig, RelayFileConfig, Session, TargetAddr,
    load_config,
};

#[derive(Parser)]
#[command(name = "rproxy")]
#[command(about = "Share a device's single control connection with many clients")]
struct Args {
    /// Device to connect to: host or IP, with optional :port
    target: String,

    /// Address to serve from (default: all interfaces)
    #[arg(short, long)]
    address: Option<String>,

    /// Port to serve from (default: 31339)
    #[arg(short, long)]
    port: Option<u16>,

    /// Echo messages to and from the device
    #[arg(short, long)]
    verbose: bool,

    /// TOML file with [listen], [upstream] and [pacer] settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device connect timeout in milliseconds
    #[arg(long)]
    connect_timeout: Option<u64>,
}

/// Flags beat the config file and environment.
fn apply_overrides(fc: &mut RelayFileConfig, args: &Args) {
    if let Some(address) = &args.address {
        fc.listen.host = address.clone();
    }
    if let Some(port) = args.port {
        fc.listen.port = port;
    }
    if args.verbose {
        fc.verbose = true;
    }
    if let Some(ms) = args.connect_timeout {
        fc.upstream.connect_timeout_ms = ms;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("remote_relay=info,rproxy=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut fc: RelayFileConfig = load_config(args.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    apply_overrides(&mut fc, &args);

    let target = TargetAddr::parse(&args.target, DEVICE_CONTROL_PORT)?;
    let device = target
        .resolve()
        .await
        .with_context(|| format!("Failed to resolve {}", target))?;

    let config = RelayConfig::from_file(&fc, device)?;
    info!("Starting relay for device {} ({})", target, device);

    let handle = Session::new(config)
        .with_announcer(LogAnnouncer)
        .start()
        .await
        .context("Failed to start relay")?;

    let summary = handle
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Relay stopped after serving {} client(s)", summary.accepted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_short_flags() {
        let args = Args::parse_from(["rproxy", "-a", "127.0.0.1", "-p", "4000", "-v", "tivo:31339"]);
        assert_eq!(args.target, "tivo:31339");
        assert_eq!(args.address.as_deref(), Some("127.0.0.1"));
        assert_eq!(args.port, Some(4000));
        assert!(args.verbose);
    }

    #[test]
    fn test_target_is_required() {
        assert!(Args::try_parse_from(["rproxy"]).is_err());
    }

    #[test]
    fn test_overrides_beat_file_values() {
        let args = Args::parse_from([
            "rproxy",
            "--port",
            "4000",
            "--connect-timeout",
            "750",
            "10.0.0.5",
        ]);
        let mut fc = RelayFileConfig::default();
        fc.listen.host = "127.0.0.1".into();
        apply_overrides(&mut fc, &args);

        assert_eq!(fc.listen.host, "127.0.0.1");
        assert_eq!(fc.listen.port, 4000);
        assert_eq!(fc.upstream.connect_timeout_ms, 750);
        assert!(!fc.verbose);
    }
}
