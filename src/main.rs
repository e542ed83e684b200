//! relaycast - Pusher-compatible event multicast server

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relaycast::config::Config;
use relaycast::server;
use relaycast::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(about = "Pusher-compatible event multicast server")]
#[command(version)]
struct Args {
    /// Config file name
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    info!("relaycast v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(args.config.as_deref())?;

    let supervisor = Supervisor::new(config).await?;
    supervisor.start_event_subscriber();

    server::run(supervisor.clone()).await?;

    supervisor.shutdown();
    info!("relaycast shutdown");
    Ok(())
}
