use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use jigboard_core::{
    ClientMsg, Cluster, ClusterId, ClusterState, PlayerId, Position, PuzzleBoard, PuzzleLayout,
    SenderId, ServerMsg, SNAP_DISTANCE,
};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::peer::{PeerError, PeerHandler, Session};
use crate::ServerArgs;

#[derive(clap::Args)]
pub(crate) struct BotArgs {
    #[command(flatten)]
    server: ServerArgs,
    #[arg(long, default_value = "bot")]
    name: String,
    #[arg(long, default_value_t = 60)]
    duration_secs: u64,
    #[arg(long, env = "JIGBOARD_BOT_SEED")]
    seed: Option<u64>,
    #[arg(long, default_value_t = 300)]
    think_min_ms: u64,
    #[arg(long, default_value_t = 1200)]
    think_max_ms: u64,
    #[arg(long, default_value_t = 400)]
    drag_ms: u64,
    #[arg(long, default_value_t = 4)]
    drag_steps: u32,
    /// Landing error around the exact spot; must stay under the snap distance.
    #[arg(long, default_value_t = 2.0)]
    jitter_px: f64,
    #[arg(long, default_value_t = 2000)]
    reply_timeout_ms: u64,
}

fn validate(args: &BotArgs) -> Result<(), PeerError> {
    if args.think_min_ms > args.think_max_ms {
        return Err("think_min_ms must be <= think_max_ms".into());
    }
    if !(0.0..SNAP_DISTANCE).contains(&args.jitter_px) {
        return Err(format!("jitter_px must be in [0, {SNAP_DISTANCE})").into());
    }
    if args.drag_steps == 0 {
        return Err("drag_steps must be at least 1".into());
    }
    Ok(())
}

/// The bot's copy of the shared board, kept current from server calls.
#[derive(Debug, Default)]
struct BotState {
    board: Option<PuzzleBoard>,
    holders: HashMap<ClusterId, PlayerId>,
    me: Option<PlayerId>,
    pending_grab: Option<ClusterId>,
    granted: Option<bool>,
    solved: bool,
}

impl BotState {
    fn holds(&self, cluster: ClusterId) -> bool {
        match (&self.me, self.holders.get(&cluster)) {
            (Some(me), Some(holder)) => me == holder,
            _ => false,
        }
    }

    fn finished(&self) -> bool {
        self.solved || self.board.as_ref().is_some_and(PuzzleBoard::is_solved)
    }
}

fn install(
    state: &mut BotState,
    layout: PuzzleLayout,
    clusters: ClusterState,
) -> Result<(), PeerError> {
    let mut board = PuzzleBoard::from_layout(layout)?;
    board.clusters_from_state(clusters)?;
    info!(
        "puzzle {:?}: {} pieces in {} clusters",
        board.name(),
        board.piece_ids().len(),
        board.clusters().len()
    );
    state.board = Some(board);
    state.holders.clear();
    state.solved = false;
    Ok(())
}

fn on_puzzle(state: &mut BotState, _: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    let ServerMsg::Puzzle {
        puzzle_data,
        cluster_data,
    } = call
    else {
        return Ok(());
    };
    install(state, puzzle_data, cluster_data)
}

fn on_clusters(state: &mut BotState, _: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    let ServerMsg::Clusters { cluster_data } = call else {
        return Ok(());
    };
    let Some(board) = state.board.as_mut() else {
        debug!("clusters ignored: no puzzle yet");
        return Ok(());
    };
    board.clusters_from_state(cluster_data)?;
    state.holders.clear();
    state.solved = false;
    Ok(())
}

fn on_grabbed(state: &mut BotState, _: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    let ServerMsg::Grabbed { clusters, playerid } = call else {
        return Ok(());
    };
    if let Some(wanted) = state.pending_grab {
        if clusters.contains(&wanted) {
            state.me = Some(playerid.clone());
            state.granted = Some(true);
        } else if clusters.is_empty() {
            // an empty grant only ever goes to the requester
            state.granted = Some(false);
        }
    }
    for id in clusters {
        state.holders.insert(id, playerid.clone());
    }
    Ok(())
}

fn on_dropped(state: &mut BotState, _: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    let ServerMsg::Dropped { clusters } = call else {
        return Ok(());
    };
    for id in clusters {
        state.holders.remove(&id);
    }
    Ok(())
}

fn on_moved(state: &mut BotState, _: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    let ServerMsg::Moved { cluster_positions } = call else {
        return Ok(());
    };
    if let Some(board) = state.board.as_mut() {
        for (id, position) in cluster_positions {
            board.move_cluster(id, position);
        }
    }
    Ok(())
}

fn on_joined(state: &mut BotState, _: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    let ServerMsg::Joined {
        cluster,
        joined_clusters,
        position,
    } = call
    else {
        return Ok(());
    };
    let Some(board) = state.board.as_mut() else {
        return Ok(());
    };
    if board.join(&joined_clusters, cluster).is_none() {
        debug!("joined ignored: unknown clusters (cluster={cluster} joined={joined_clusters:?})");
        return Ok(());
    }
    board.move_cluster(cluster, position);
    for id in &joined_clusters {
        state.holders.remove(id);
    }
    Ok(())
}

fn on_solved(state: &mut BotState, _: &SenderId, _: ServerMsg) -> Result<(), PeerError> {
    info!("puzzle solved");
    state.solved = true;
    Ok(())
}

fn on_connected(_: &mut BotState, _: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    if let ServerMsg::Connected { playerid, name } = call {
        info!("player joined (player={playerid} name={name})");
    }
    Ok(())
}

fn on_disconnected(state: &mut BotState, _: &SenderId, call: ServerMsg) -> Result<(), PeerError> {
    if let ServerMsg::Disconnected { playerid } = call {
        info!("player left (player={playerid})");
        state.holders.retain(|_, holder| *holder != playerid);
    }
    Ok(())
}

const HANDLERS: &[(&str, PeerHandler<BotState>)] = &[
    ("puzzle", on_puzzle),
    ("clusters", on_clusters),
    ("grabbed", on_grabbed),
    ("dropped", on_dropped),
    ("moved", on_moved),
    ("joined", on_joined),
    ("solved", on_solved),
    ("connected", on_connected),
    ("disconnected", on_disconnected),
];

/// Picks a free cluster linked to another free cluster and the placement
/// that lands it on that neighbour. The smaller of the two is carried.
fn choose_target<R: Rng>(
    board: &PuzzleBoard,
    holders: &HashMap<ClusterId, PlayerId>,
    rng: &mut R,
) -> Option<(ClusterId, Position)> {
    let mut candidates = Vec::new();
    for link in board.links() {
        let (Some(a), Some(b)) = (
            board.cluster_of_piece(link.id1),
            board.cluster_of_piece(link.id2),
        ) else {
            continue;
        };
        if a.id() == b.id() || holders.contains_key(&a.id()) || holders.contains_key(&b.id()) {
            continue;
        }
        let (moving, target) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        candidates.push((moving.id(), target.position()));
    }
    candidates.choose(rng).copied()
}

fn jittered<R: Rng>(target: Position, jitter: f64, rng: &mut R) -> Position {
    if jitter <= 0.0 {
        return target;
    }
    Position::new(
        target.x + rng.random_range(-jitter..jitter),
        target.y + rng.random_range(-jitter..jitter),
        target.rotation,
    )
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

#[derive(Debug, Default)]
struct BotStats {
    drops: usize,
    refused: usize,
    lost: usize,
}

enum MoveOutcome {
    Dropped,
    Refused,
    Lost,
}

/// Grab, drag in a few steps, drop.
async fn play_move(
    session: &mut Session<BotState>,
    state: &mut BotState,
    args: &BotArgs,
    cluster: ClusterId,
    target: Position,
    rng: &mut StdRng,
) -> Result<MoveOutcome, PeerError> {
    let reply = Duration::from_millis(args.reply_timeout_ms);
    state.pending_grab = Some(cluster);
    state.granted = None;
    session.call(ClientMsg::Grab {
        clusters: vec![cluster],
    })?;
    session
        .pump_until(state, reply, |state| state.granted.is_some())
        .await?;
    state.pending_grab = None;
    if state.granted != Some(true) {
        debug!("grab refused (cluster={cluster})");
        return Ok(MoveOutcome::Refused);
    }

    let start = state
        .board
        .as_ref()
        .and_then(|board| board.cluster(cluster))
        .map(Cluster::position)
        .unwrap_or(target);
    let landing = jittered(target, args.jitter_px, rng);
    let pause = Duration::from_millis(args.drag_ms) / args.drag_steps;
    for step in 1..=args.drag_steps {
        let t = f64::from(step) / f64::from(args.drag_steps);
        let position = Position::new(
            lerp(start.x, landing.x, t),
            lerp(start.y, landing.y, t),
            landing.rotation,
        );
        session.call(ClientMsg::Move {
            cluster_positions: BTreeMap::from([(cluster, position)]),
        })?;
        session.pump(state, pause).await?;
        if !state.holds(cluster) {
            debug!("lost cluster mid-drag (cluster={cluster})");
            return Ok(MoveOutcome::Lost);
        }
    }

    session.call(ClientMsg::Drop {
        clusters: vec![cluster],
    })?;
    session
        .pump_until(state, reply, |state| !state.holders.contains_key(&cluster))
        .await?;
    Ok(MoveOutcome::Dropped)
}

pub(crate) async fn run(args: BotArgs) -> Result<(), PeerError> {
    validate(&args)?;
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());
    info!("bot seed {seed}");
    let mut rng = StdRng::seed_from_u64(seed);

    let mut session = Session::connect(&args.server.addr, args.server.wire, HANDLERS).await?;
    let mut state = BotState::default();
    session.call(ClientMsg::Connect {
        name: args.name.clone(),
    })?;
    session.call(ClientMsg::GetPuzzle)?;
    let reply = Duration::from_millis(args.reply_timeout_ms);
    if !session
        .pump_until(&mut state, reply, |state| state.board.is_some())
        .await?
    {
        session.finish().await?;
        return Err("server sent no puzzle".into());
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut stats = BotStats::default();
    while session.is_open() && Instant::now() < deadline && !state.finished() {
        let think = rng.random_range(args.think_min_ms..=args.think_max_ms);
        session
            .pump(&mut state, Duration::from_millis(think))
            .await?;
        let Some(board) = state.board.as_ref() else {
            break;
        };
        let Some((cluster, target)) = choose_target(board, &state.holders, &mut rng) else {
            debug!("nothing free to join");
            continue;
        };
        match play_move(&mut session, &mut state, &args, cluster, target, &mut rng).await? {
            MoveOutcome::Dropped => stats.drops += 1,
            MoveOutcome::Refused => stats.refused += 1,
            MoveOutcome::Lost => stats.lost += 1,
        }
    }

    let clusters = state.board.as_ref().map_or(0, |board| board.clusters().len());
    info!(
        "bot finished (drops={} refused={} lost={} clusters={} solved={})",
        stats.drops,
        stats.refused,
        stats.lost,
        clusters,
        state.finished()
    );
    session.finish().await
}
