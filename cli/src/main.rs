use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jigboard_core::discovery::DEFAULT_DISCOVERY_PORT;
use jigboard_core::{seek, seek_at, WireFormat};
use tracing_subscriber::EnvFilter;

use crate::peer::PeerError;

mod bot;
mod peer;
mod watch;

#[derive(Parser)]
#[command(name = "jigboard-cli", version, about = "Peer tools for jigboard servers")]
struct Cli {
    /// Log filter; logs go to stderr.
    #[arg(long, env = "JIGBOARD_LOG", default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look for servers on the local network.
    Seek {
        #[arg(long, env = "JIGBOARD_DISCOVERY_PORT", default_value_t = DEFAULT_DISCOVERY_PORT)]
        port: u16,
        /// Ask one address instead of broadcasting.
        #[arg(long)]
        target: Option<SocketAddr>,
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
    /// Print every call the server sends, one JSON document per line.
    Watch(watch::WatchArgs),
    /// Play the puzzle automatically.
    Bot(bot::BotArgs),
}

#[derive(clap::Args)]
pub(crate) struct ServerArgs {
    #[arg(long = "server", env = "JIGBOARD_SERVER", default_value = "127.0.0.1:7777")]
    addr: String,
    /// Framing the server was started with.
    #[arg(long, env = "JIGBOARD_WIRE", default_value = "json-lines")]
    wire: WireFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    run(cli.command)
        .await
        .map_err(|err| err as Box<dyn std::error::Error>)
}

async fn run(command: Commands) -> Result<(), PeerError> {
    match command {
        Commands::Seek {
            port,
            target,
            wait_ms,
        } => {
            let wait = Duration::from_millis(wait_ms);
            let found = match target {
                Some(target) => seek_at(target, wait).await?,
                None => seek(port, wait).await?,
            };
            if found.is_empty() {
                eprintln!("no servers answered");
            }
            for server in found {
                println!("{}\t{}", server.server_addr(), server.announcement.servername);
            }
            Ok(())
        }
        Commands::Watch(args) => watch::run(args).await,
        Commands::Bot(args) => bot::run(args).await,
    }
}
