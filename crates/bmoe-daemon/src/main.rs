//! Biomine object exchange server.
//!
//! Run a standalone server:
//!   bmoe-server --listen 127.0.0.1:7890
//!
//! Link it to another one:
//!   bmoe-server --listen 127.0.0.1:7891 --connect 127.0.0.1:7890

use bmoe_daemon::{Daemon, DaemonConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bmoe-server", about = "Biomine object exchange server", version)]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "BMOE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "BMOE_LISTEN")]
    listen: Option<String>,

    /// Server to link to, as host:port (repeatable)
    #[arg(short = 'C', long = "connect", value_name = "HOST:PORT")]
    connect: Vec<String>,

    /// Name announced to other servers
    #[arg(short, long, env = "BMOE_NAME")]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bmoe=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if cli.name.is_some() {
        config.name = cli.name;
    }
    config.connect.extend(cli.connect);

    let daemon = Daemon::bind(config).await?;
    daemon
        .run(async {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("Cannot listen for Ctrl-C; stop the process to exit");
                std::future::pending::<()>().await;
            }
        })
        .await
}
