//! Line-oriented object exchange client.
//!
//! Every line typed on stdin is sent as a `text/plain` object; every object
//! routed to us is logged. Exits when the server closes the connection.
//!
//!   bmoe-client --server 127.0.0.1:7890 --subscribe 'text/*'

use bmoe_client::{Client, SubscribeRequest};
use bmoe_core::{Rule, Subscriptions, keys};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bmoe-client",
    about = "Send and receive objects through a Biomine object exchange server",
    version
)]
struct Cli {
    /// Server address
    #[arg(long, env = "BMOE_SERVER", default_value = "127.0.0.1:7890")]
    server: String,

    /// Subscription rule (repeatable)
    #[arg(short = 's', long = "subscribe", value_name = "RULE", default_value = "*")]
    subscribe: Vec<String>,

    /// Client name shown to the server
    #[arg(short, long)]
    name: Option<String>,

    /// User name reported to the server
    #[arg(short, long, env = "USER")]
    username: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bmoe=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut client = Client::connect(&cli.server).await?;
    tracing::info!("Connected to {}", cli.server);

    let subscriptions: Subscriptions = cli
        .subscribe
        .iter()
        .map(|r| Rule::from(r.as_str()))
        .collect();
    let mut request = SubscribeRequest::new(subscriptions);
    request.name = cli.name;
    request.username = cli.username;
    client.subscribe(request).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        client.send_text(line).await?;
                    }
                }
                None => stdin_open = false,
            },
            object = client.next_object() => match object? {
                Some(frame) => {
                    let content_type = frame
                        .metadata
                        .str(keys::TYPE)
                        .or_else(|| frame.metadata.str(keys::EVENT))
                        .unwrap_or_default();
                    let size = frame.payload.as_ref().map_or(0, Vec::len);
                    tracing::info!("Received \"{}\" ({} bytes)", content_type, size);
                    if let Some(routing_id) = frame.metadata.routing_id() {
                        tracing::debug!(routing_id, "From");
                    }
                }
                None => {
                    tracing::info!("Server closed the connection");
                    break;
                }
            },
        }
    }
    Ok(())
}
