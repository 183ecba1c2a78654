//! RelayTx Sender — entry point.
//!
//! ```text
//! relaytx-send <file> --connect <host:port>   Send a file to a listening receiver
//! relaytx-send --config <path> ...            Load a custom config TOML
//! relaytx-send --gen-config                   Print default config to stdout
//! ```

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use relaytx_core::{DeviceClass, RelayConfig, SenderController, TcpChannel};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relaytx-send", about = "RelayTx file-transfer sender")]
struct Cli {
    /// Path to the file to send.
    file: Option<PathBuf>,

    /// Receiver address to connect to, "host:port".
    #[arg(short, long, default_value = "127.0.0.1:4321")]
    connect: String,

    /// Device class this sender presents (mobile, tablet, desktop).
    #[arg(long, value_parser = parse_device_class, default_value = "desktop")]
    device_class: DeviceClass,

    /// Path to configuration TOML file.
    #[arg(long, default_value = "relaytx-send.toml")]
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

fn guess_file_type(path: &std::path::Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn now_millis() -> u64 {
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

    info!("relaytx-send v{}", env!("CARGO_PKG_VERSION"));

    let Some(file) = cli.file else {
        eprintln!("usage: relaytx-send <file> --connect <host:port>");
        std::process::exit(1);
    };

    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file.bin")
        .to_string();
    let file_type = guess_file_type(&file);
    let file_data = tokio::fs::read(&file).await?;

    info!(
        file = %file.display(),
        size = file_data.len(),
        connect = %cli.connect,
        device_class = ?cli.device_class,
        "starting transfer"
    );

    let channel = TcpChannel::connect(&cli.connect).await?;
    let transfer_id = format!("relaytx-{}", now_millis());

    let mut sender = SenderController::new(
        channel,
        transfer_id,
        file_name,
        file_type,
        file_data,
        cli.device_class,
        config,
        now_millis(),
    );

    let outcome = sender.run().await?;
    info!(?outcome, "transfer finished");

    match outcome {
        relaytx_core::transfer::sender::SenderOutcome::Completed => Ok(()),
        relaytx_core::transfer::sender::SenderOutcome::Failed { reason } => {
            eprintln!("transfer failed: {:?}", reason);
            std::process::exit(1);
        }
    }
}
