use std::time::Duration;

use jigboard_core::{CallTable, ClientMsg, SenderId, ServerMsg};
use tracing::info;

use crate::peer::{PeerError, PeerHandler, Session};
use crate::ServerArgs;

#[derive(clap::Args)]
pub(crate) struct WatchArgs {
    #[command(flatten)]
    server: ServerArgs,
    /// Display name announced to the other players.
    #[arg(long, default_value = "watcher")]
    name: String,
    /// Ask for the full puzzle before streaming.
    #[arg(long)]
    snapshot: bool,
    /// Stop after this many seconds; runs until the server hangs up otherwise.
    #[arg(long)]
    duration_secs: Option<u64>,
    /// Stop once the puzzle is announced solved.
    #[arg(long)]
    until_solved: bool,
}

#[derive(Debug, Default)]
struct Watch {
    seen: usize,
    solved: bool,
}

fn print_call(watch: &mut Watch, _sender: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    println!("{}", serde_json::to_string(&call)?);
    watch.seen += 1;
    if call == ServerMsg::Solved {
        watch.solved = true;
    }
    Ok(())
}

fn handlers() -> Vec<(&'static str, PeerHandler<Watch>)> {
    CallTable::client()
        .incoming()
        .map(|spec| (spec.name, print_call as PeerHandler<Watch>))
        .collect()
}

pub(crate) async fn run(args: WatchArgs) -> Result<(), PeerError> {
    let mut session = Session::connect(&args.server.addr, args.server.wire, &handlers()).await?;
    session.call(ClientMsg::Connect { name: args.name })?;
    if args.snapshot {
        session.call(ClientMsg::GetPuzzle)?;
    }

    let mut watch = Watch::default();
    // a day stands in for "until hung up"
    let wait = Duration::from_secs(args.duration_secs.unwrap_or(24 * 60 * 60));
    let until_solved = args.until_solved;
    session
        .pump_until(&mut watch, wait, |watch| until_solved && watch.solved)
        .await?;
    info!("watched {} calls", watch.seen);
    session.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_server_call_is_printed() {
        let names: Vec<&str> = handlers().iter().map(|(name, _)| *name).collect();
        assert!(names.contains(&"joined"));
        assert!(names.contains(&"piece_pixmaps"));
        assert!(!names.contains(&"grab"));
    }

    #[test]
    fn solved_is_remembered() {
        let mut watch = Watch::default();
        let sender = SenderId::new("tcp", "server");
        print_call(&mut watch, &sender, ServerMsg::Dropped { clusters: vec![1] }).unwrap();
        assert!(!watch.solved);
        print_call(&mut watch, &sender, ServerMsg::Solved).unwrap();
        assert!(watch.solved);
        assert_eq!(watch.seen, 2);
    }
}
