use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use jigboard_core::discovery::{Announcement, DiscoveryResponder};
use jigboard_core::dispatch::{CallTable, Remote};
use jigboard_core::transport::{Inbox, Multiplexer, StdioTransport, TcpTransport, Transport};
use jigboard_server::{Actor, Args, PuzzleFolder, PuzzleService, Settings};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MUX_CHANNEL: &str = "server";
const TCP_CHANNEL: &str = "tcp";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let settings = Settings::resolve(&args)?;
    init_tracing(&settings)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(settings));
    // a pending stdin read cannot be cancelled
    runtime.shutdown_timeout(Duration::from_millis(200));
    result
}

fn init_tracing(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.log)?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // stdout carries the local-control protocol, so logs never go there
    match &settings.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

async fn serve(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    info!("### new run of jigboard-server ###");
    info!("wire format {}", settings.wire);

    let mut mux = Multiplexer::new(MUX_CHANNEL);
    if settings.stdio {
        mux.add(Arc::new(StdioTransport::new()))?;
    }
    let tcp = TcpTransport::bind(TCP_CHANNEL, settings.listen).await?;
    let tcp_port = tcp.local_addr().port();
    mux.add(Arc::new(tcp))?;
    let mux = Arc::new(mux);

    let remote = Remote::new(
        Arc::clone(&mux) as Arc<dyn Transport>,
        settings.wire,
        CallTable::server(),
    );
    let mut service = PuzzleService::new(remote, settings.service_options());
    if let Some(path) = &settings.puzzle {
        let folder = PuzzleFolder::new(path);
        let board = folder.load()?;
        service = service.with_board(board, Some(folder));
    }
    let actor = Actor::new(service, settings.wire)?;

    let discovery = if settings.discovery_port == 0 {
        None
    } else {
        let announcement = Announcement::new(settings.servername.clone(), tcp_port);
        let mut responder = DiscoveryResponder::bind(
            (Ipv4Addr::UNSPECIFIED, settings.discovery_port),
            announcement,
        )
        .await?;
        if let Some((every, target)) = settings.periodic_announcement() {
            info!("announcing to {target} every {every:?}");
            responder = responder.with_periodic(every, target);
        }
        Some(Arc::new(responder))
    };
    let discovery_task = discovery.clone().map(|responder| {
        tokio::spawn(async move {
            if let Err(err) = responder.run().await {
                warn!("discovery stopped: {err}");
            }
        })
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let transports = tokio::spawn(Arc::clone(&mux).run(Inbox::new(MUX_CHANNEL, tx)));
    let result = actor.run(rx).await;

    mux.stop();
    if let Some(responder) = &discovery {
        responder.stop();
    }
    match transports.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("transport failed: {err}"),
        Err(err) => warn!("transport task failed: {err}"),
    }
    if let Some(task) = discovery_task {
        let _ = task.await;
    }
    match result {
        Ok(_) => {
            info!("server stopped");
            Ok(())
        }
        Err(err) => {
            error!("server terminated: {err}");
            Err(err.into())
        }
    }
}
