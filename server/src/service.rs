use std::collections::{BTreeMap, BTreeSet, HashMap};

use jigboard_core::board::PuzzleBoard;
use jigboard_core::codec::Codec;
use jigboard_core::dispatch::{CallTable, DispatchError, Dispatcher, Remote};
use jigboard_core::geometry::{ClusterId, PieceId, Position};
use jigboard_core::protocol::{Call, ClientMsg, Pixmap, ServerMsg};
use jigboard_core::transport::SenderId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::storage::{PuzzleFolder, StorageError};

pub const DEFAULT_MAX_NAME_LEN: usize = 32;
pub const FALLBACK_NAME: &str = "player";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// How `connect` treats display names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NamePolicy {
    /// Any name, duplicates allowed.
    #[default]
    Any,
    /// Refuse a name another connected player already uses.
    Unique,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub name_policy: NamePolicy,
    pub max_name_len: usize,
    pub seed: Option<u64>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            name_policy: NamePolicy::Any,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            seed: None,
        }
    }
}

/// Trims, strips control characters and caps the length. Never empty.
pub fn sanitize_name(raw: &str, max_len: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .trim()
        .chars()
        .take(max_len.max(1))
        .collect();
    let cleaned = cleaned.trim_end().to_string();
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone)]
struct Player {
    name: String,
    grabbed: BTreeSet<ClusterId>,
}

/// Authoritative session state: the board, who is connected, and which
/// clusters each player holds. Every method runs on the single actor.
pub struct PuzzleService<C: Codec> {
    board: PuzzleBoard,
    folder: Option<PuzzleFolder>,
    players: HashMap<SenderId, Player>,
    remote: Remote<ServerMsg, C>,
    options: ServiceOptions,
    solved: bool,
    rng: StdRng,
    span: Span,
}

macro_rules! route {
    ($dispatcher:ident, $name:literal, |$svc:ident, $sender:ident| $pat:pat => $body:expr) => {
        $dispatcher.register($name, |$svc, $sender, call| match call {
            $pat => $body,
            other => {
                warn!("{} routed to {} handler", other.name(), $name);
                Ok(())
            }
        })?
    };
}

impl<C: Codec> PuzzleService<C> {
    pub fn new(remote: Remote<ServerMsg, C>, options: ServiceOptions) -> Self {
        let seed = options.seed.unwrap_or_else(|| rand::rng().random());
        Self {
            board: PuzzleBoard::default(),
            folder: None,
            players: HashMap::new(),
            remote,
            options,
            solved: false,
            rng: StdRng::seed_from_u64(seed),
            span: info_span!("service"),
        }
    }

    pub fn with_board(mut self, board: PuzzleBoard, folder: Option<PuzzleFolder>) -> Self {
        self.install(board, folder);
        self
    }

    /// Builds the handler table for every incoming call. Fails if the table
    /// and the handlers disagree.
    pub fn dispatcher(
        codec: C,
    ) -> Result<Dispatcher<Self, ClientMsg, C, ServiceError>, DispatchError> {
        let mut d: Dispatcher<Self, ClientMsg, C, ServiceError> =
            Dispatcher::new(CallTable::server(), codec);
        route!(d, "quit", |svc, sender| ClientMsg::Quit => svc.quit(sender));
        route!(d, "connect", |svc, sender| ClientMsg::Connect { name } => svc.connect(sender, &name));
        route!(d, "disconnect", |svc, sender| ClientMsg::Disconnect => svc.disconnect(sender));
        route!(d, "load_puzzle", |svc, sender| ClientMsg::LoadPuzzle { path } => svc.load_puzzle(sender, &path));
        route!(d, "save_puzzle", |svc, sender| ClientMsg::SavePuzzle => svc.save_puzzle(sender));
        route!(d, "restart_puzzle", |svc, sender| ClientMsg::RestartPuzzle => svc.restart_puzzle(sender));
        route!(d, "get_puzzle", |svc, sender| ClientMsg::GetPuzzle => svc.get_puzzle(sender));
        route!(d, "get_pieces", |svc, sender| ClientMsg::GetPieces { pieces } => svc.get_pieces(sender, pieces));
        route!(d, "grab", |svc, sender| ClientMsg::Grab { clusters } => svc.grab(sender, &clusters));
        route!(d, "drop", |svc, sender| ClientMsg::Drop { clusters } => svc.drop_clusters(sender, &clusters));
        route!(d, "move", |svc, sender| ClientMsg::Move { cluster_positions } => svc.move_clusters(sender, cluster_positions));
        route!(d, "rearrange", |svc, sender| ClientMsg::Rearrange { clusters, x, y } => {
            svc.rearrange(sender, &clusters, x.zip(y))
        });
        d.ensure_complete()?;
        Ok(d)
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn board(&self) -> &PuzzleBoard {
        &self.board
    }

    pub fn folder(&self) -> Option<&PuzzleFolder> {
        self.folder.as_ref()
    }

    pub fn is_connected(&self, sender: &SenderId) -> bool {
        self.players.contains_key(sender)
    }

    pub fn player_name(&self, sender: &SenderId) -> Option<&str> {
        self.players.get(sender).map(|player| player.name.as_str())
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn grabbed_by(&self, sender: &SenderId) -> Vec<ClusterId> {
        self.players
            .get(sender)
            .map(|player| player.grabbed.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn holder_of(&self, cluster: ClusterId) -> Option<&SenderId> {
        self.players
            .iter()
            .find(|(_, player)| player.grabbed.contains(&cluster))
            .map(|(sender, _)| sender)
    }

    pub fn is_solved(&self) -> bool {
        self.solved
    }

    fn broadcast(&self, call: ServerMsg) -> Result<(), ServiceError> {
        self.remote.broadcast(&call)?;
        Ok(())
    }

    fn reply(&self, sender: &SenderId, call: ServerMsg) -> Result<(), ServiceError> {
        self.remote.send_to(sender, &call)?;
        Ok(())
    }

    fn install(&mut self, board: PuzzleBoard, folder: Option<PuzzleFolder>) {
        self.board = board;
        self.folder = folder;
        self.release_all();
        self.solved = false;
    }

    /// Every lock refers to the previous cluster set, so all of them go.
    fn release_all(&mut self) {
        for player in self.players.values_mut() {
            player.grabbed.clear();
        }
    }

    fn admin_allowed(&self, call: &str, sender: &SenderId) -> bool {
        if sender.is_local() {
            return true;
        }
        warn!("{call} ignored: only allowed from the local channel (sender={sender})");
        false
    }

    fn require_player(&self, call: &str, sender: &SenderId) -> bool {
        if self.players.contains_key(sender) {
            return true;
        }
        warn!("{call} ignored: not connected (sender={sender})");
        false
    }

    pub fn quit(&mut self, sender: &SenderId) -> Result<(), ServiceError> {
        if !self.admin_allowed("quit", sender) {
            return Ok(());
        }
        info!("quit requested, stopping transports");
        self.remote.stop();
        Ok(())
    }

    pub fn connect(&mut self, sender: &SenderId, name: &str) -> Result<(), ServiceError> {
        let name = sanitize_name(name, self.options.max_name_len);
        if self.options.name_policy == NamePolicy::Unique
            && self
                .players
                .iter()
                .any(|(other, player)| other != sender && player.name == name)
        {
            warn!("connect ignored: name in use (sender={sender} name={name:?})");
            return Ok(());
        }
        match self.players.get_mut(sender) {
            Some(player) => {
                info!("player renamed (sender={sender} from={:?} to={name:?})", player.name);
                player.name = name.clone();
            }
            None => {
                info!("player connected (sender={sender} name={name:?})");
                self.players.insert(
                    sender.clone(),
                    Player {
                        name: name.clone(),
                        grabbed: BTreeSet::new(),
                    },
                );
            }
        }
        let others: Vec<SenderId> = self
            .players
            .keys()
            .filter(|other| *other != sender)
            .cloned()
            .collect();
        self.remote.invoke(
            &ServerMsg::Connected {
                playerid: sender.to_string(),
                name,
            },
            Some(others.as_slice()),
        )?;
        Ok(())
    }

    pub fn disconnect(&mut self, sender: &SenderId) -> Result<(), ServiceError> {
        self.leave(sender)?;
        self.remote.close(sender);
        Ok(())
    }

    /// The transport lost `sender`; same as an explicit disconnect.
    pub fn connection_closed(&mut self, sender: &SenderId) -> Result<(), ServiceError> {
        if self.players.contains_key(sender) {
            debug!("connection closed, disconnecting (sender={sender})");
            self.leave(sender)?;
        }
        Ok(())
    }

    fn leave(&mut self, sender: &SenderId) -> Result<(), ServiceError> {
        let Some(player) = self.players.get(sender) else {
            debug!("disconnect ignored: not connected (sender={sender})");
            return Ok(());
        };
        let held: Vec<ClusterId> = player.grabbed.iter().copied().collect();
        if !held.is_empty() {
            self.drop_clusters(sender, &held)?;
        }
        self.players.remove(sender);
        info!("player disconnected (sender={sender})");
        self.broadcast(ServerMsg::Disconnected {
            playerid: sender.to_string(),
        })
    }

    pub fn load_puzzle(&mut self, sender: &SenderId, path: &str) -> Result<(), ServiceError> {
        if !self.admin_allowed("load_puzzle", sender) {
            return Ok(());
        }
        let folder = PuzzleFolder::new(path);
        let board = match folder.load() {
            Ok(board) => board,
            Err(err) => {
                error!("load_puzzle failed: {err}");
                return Ok(());
            }
        };
        info!("new puzzle loaded from {path}");
        self.install(board, Some(folder));
        self.broadcast(ServerMsg::Puzzle {
            puzzle_data: self.board.layout(),
            cluster_data: self.board.cluster_state(),
        })
    }

    pub fn save_puzzle(&mut self, sender: &SenderId) -> Result<(), ServiceError> {
        if !self.admin_allowed("save_puzzle", sender) {
            return Ok(());
        }
        let result = match &self.folder {
            Some(folder) => folder
                .save_layout(&self.board)
                .and_then(|()| folder.save_state(&self.board)),
            None => Err(StorageError::NoBaseFolder),
        };
        if let Err(err) = result {
            error!("save_puzzle failed: {err}");
        }
        Ok(())
    }

    pub fn restart_puzzle(&mut self, sender: &SenderId) -> Result<(), ServiceError> {
        if !self.admin_allowed("restart_puzzle", sender) {
            return Ok(());
        }
        self.board.reset_puzzle(&mut self.rng);
        self.release_all();
        self.solved = false;
        info!("puzzle restarted ({} clusters)", self.board.clusters().len());
        self.broadcast(ServerMsg::Clusters {
            cluster_data: self.board.cluster_state(),
        })
    }

    pub fn get_puzzle(&mut self, sender: &SenderId) -> Result<(), ServiceError> {
        self.reply(
            sender,
            ServerMsg::Puzzle {
                puzzle_data: self.board.layout(),
                cluster_data: self.board.cluster_state(),
            },
        )
    }

    pub fn get_pieces(
        &mut self,
        sender: &SenderId,
        pieces: Option<Vec<PieceId>>,
    ) -> Result<(), ServiceError> {
        let ids = pieces.unwrap_or_else(|| self.board.piece_ids());
        let mut pixmaps = BTreeMap::new();
        for id in ids {
            let Some(piece) = self.board.piece(id) else {
                warn!("get_pieces skipped: unknown piece (sender={sender} piece={id})");
                continue;
            };
            let image = match &self.folder {
                Some(folder) => folder.piece_image(piece),
                None => Err(StorageError::NoBaseFolder),
            };
            match image {
                Ok(bytes) => {
                    pixmaps.insert(id.to_string(), Pixmap(bytes));
                }
                Err(err) => warn!("get_pieces skipped: {err} (piece={id})"),
            }
        }
        self.reply(sender, ServerMsg::PiecePixmaps { pixmaps })
    }

    pub fn grab(&mut self, sender: &SenderId, clusters: &[ClusterId]) -> Result<(), ServiceError> {
        if !self.require_player("grab", sender) {
            return Ok(());
        }
        let mut granted = Vec::new();
        for &id in clusters {
            if granted.contains(&id) || !self.board.contains_cluster(id) {
                continue;
            }
            if let Some(holder) = self.holder_of(id) {
                debug!("grab ignored: already held (sender={sender} cluster={id} holder={holder})");
                continue;
            }
            granted.push(id);
        }
        if let Some(player) = self.players.get_mut(sender) {
            player.grabbed.extend(granted.iter().copied());
        }
        let refused = granted.is_empty();
        let call = ServerMsg::Grabbed {
            clusters: granted,
            playerid: sender.to_string(),
        };
        if refused {
            // nothing changed for the others
            self.reply(sender, call)
        } else {
            self.broadcast(call)
        }
    }

    pub fn drop_clusters(
        &mut self,
        sender: &SenderId,
        clusters: &[ClusterId],
    ) -> Result<(), ServiceError> {
        let Some(player) = self.players.get_mut(sender) else {
            warn!("drop ignored: not connected (sender={sender})");
            return Ok(());
        };
        let mut released = Vec::new();
        for &id in clusters {
            if player.grabbed.remove(&id) {
                released.push(id);
            } else {
                debug!("drop ignored: not owner (sender={sender} cluster={id})");
            }
        }
        if released.is_empty() {
            return Ok(());
        }
        self.broadcast(ServerMsg::Dropped {
            clusters: released.clone(),
        })?;
        self.join_dropped(released)
    }

    /// One pass over a freshly dropped batch: each surviving cluster absorbs
    /// its joinable neighbours. A neighbour that someone still holds is
    /// released first.
    fn join_dropped(&mut self, mut pending: Vec<ClusterId>) -> Result<(), ServiceError> {
        pending.reverse();
        while let Some(id) = pending.pop() {
            if !self.board.contains_cluster(id) {
                continue;
            }
            let candidates = self.board.joinable_clusters(id);
            if candidates.is_empty() {
                continue;
            }
            for &neighbour in &candidates {
                pending.retain(|&queued| queued != neighbour);
                let Some(holder) = self.holder_of(neighbour).cloned() else {
                    continue;
                };
                if let Some(player) = self.players.get_mut(&holder) {
                    player.grabbed.remove(&neighbour);
                }
                info!("force drop for join (holder={holder} cluster={neighbour} into={id})");
                self.broadcast(ServerMsg::Dropped {
                    clusters: vec![neighbour],
                })?;
            }
            let Some(outcome) = self.board.join(&candidates, id) else {
                continue;
            };
            info!(
                "joined clusters (cluster={} joined={:?})",
                outcome.cluster, outcome.joined
            );
            self.broadcast(ServerMsg::Joined {
                cluster: outcome.cluster,
                joined_clusters: outcome.joined,
                position: outcome.position,
            })?;
        }
        self.check_solved()
    }

    fn check_solved(&mut self) -> Result<(), ServiceError> {
        if self.solved || !self.board.is_solved() {
            return Ok(());
        }
        self.solved = true;
        info!("puzzle solved");
        self.broadcast(ServerMsg::Solved)
    }

    pub fn move_clusters(
        &mut self,
        sender: &SenderId,
        positions: BTreeMap<ClusterId, Position>,
    ) -> Result<(), ServiceError> {
        let Some(player) = self.players.get(sender) else {
            warn!("move ignored: not connected (sender={sender})");
            return Ok(());
        };
        let owned: Vec<(ClusterId, Position)> = positions
            .into_iter()
            .filter(|(id, _)| {
                let held = player.grabbed.contains(id);
                if !held {
                    debug!("move ignored: not owner (sender={sender} cluster={id})");
                }
                held
            })
            .collect();
        let mut moved = BTreeMap::new();
        for (id, position) in owned {
            if let Some(stored) = self.board.move_cluster(id, position) {
                moved.insert(id, stored);
            }
        }
        if moved.is_empty() {
            return Ok(());
        }
        self.broadcast(ServerMsg::Moved {
            cluster_positions: moved,
        })
    }

    pub fn rearrange(
        &mut self,
        sender: &SenderId,
        clusters: &[ClusterId],
        pos: Option<(f64, f64)>,
    ) -> Result<(), ServiceError> {
        if !self.require_player("rearrange", sender) {
            return Ok(());
        }
        let free: Vec<ClusterId> = clusters
            .iter()
            .copied()
            .filter(|&id| match self.holder_of(id) {
                Some(holder) if holder != sender => {
                    debug!("rearrange ignored: held by other (sender={sender} cluster={id})");
                    false
                }
                _ => true,
            })
            .collect();
        let moved: BTreeMap<ClusterId, Position> =
            self.board.rearrange(&free, pos).into_iter().collect();
        if moved.is_empty() {
            return Ok(());
        }
        self.broadcast(ServerMsg::Moved {
            cluster_positions: moved,
        })
    }
}
