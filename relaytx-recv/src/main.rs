//! RelayTx Receiver — entry point.
//!
//! ```text
//! relaytx-recv --listen <host:port> --out <dir>   Accept one transfer and write the file
//! relaytx-recv --config <path> ...                Load a custom config TOML
//! relaytx-recv --gen-config                       Print default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use relaytx_core::spool::DiskSpool;
use relaytx_core::{DeviceClass, RelayConfig, ReceiverController, TcpChannel};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relaytx-recv", about = "RelayTx file-transfer receiver")]
struct Cli {
    /// Address to listen on, "host:port".
    #[arg(short, long, default_value = "127.0.0.1:4321")]
    listen: String,

    /// Directory the received file is written into.
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Device class this receiver presents (mobile, tablet, desktop).
    #[arg(long, value_parser = parse_device_class, default_value = "desktop")]
    device_class: DeviceClass,

    /// Chunk size this receiver prefers, in bytes.
    #[arg(long, default_value_t = 32 * 1024)]
    preferred_chunk_size: u32,

    /// Path to configuration TOML file.
    #[arg(long, default_value = "relaytx-recv.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

fn parse_device_class(s: &str) -> Result<DeviceClass, String> {
    match s.to_lowercase().as_str() {
        "mobile" => Ok(DeviceClass::Mobile),
        "tablet" => Ok(DeviceClass::Tablet),
        "desktop" => Ok(DeviceClass::Desktop),
        other => Err(format!("unknown device class '{other}' (expected mobile, tablet, or desktop)")),
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&RelayConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = RelayConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("relaytx-recv v{}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.spool.directory)?;
    let spool = DiskSpool::new(PathBuf::from(&config.spool.directory));

    info!(listen = %cli.listen, "waiting for sender");
    let listener = TcpListener::bind(&cli.listen).await?;
    let (stream, peer) = listener.accept().await?;
    info!(%peer, "sender connected");

    let channel = TcpChannel::new(stream);
    let mut receiver = ReceiverController::new(
        channel,
        spool,
        cli.device_class,
        cli.preferred_chunk_size,
        true,
        config,
    );

    let outcome = receiver.run(now_millis()).await?;

    match outcome {
        relaytx_core::transfer::receiver::ReceiverOutcome::Completed { bytes, calculated_hash } => {
            info!(bytes = bytes.len(), hash = %calculated_hash, "transfer complete");
            let name = format!("received-{}.bin", now_millis());
            let dest = cli.out.join(name);
            tokio::fs::write(&dest, &bytes).await?;
            info!(path = %dest.display(), "file written");
            Ok(())
        }
        relaytx_core::transfer::receiver::ReceiverOutcome::Failed { reason } => {
            error!(?reason, "transfer failed");
            std::process::exit(1);
        }
    }
}
