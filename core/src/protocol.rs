use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::document::{ClusterState, PuzzleLayout};
use crate::geometry::{ClusterId, PieceId, Position};

pub type PlayerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn invert(self) -> Self {
        match self {
            Direction::Incoming => Direction::Outgoing,
            Direction::Outgoing => Direction::Incoming,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSpec {
    pub name: &'static str,
    pub direction: Direction,
    pub params: &'static [&'static str],
}

const fn incoming(name: &'static str, params: &'static [&'static str]) -> CallSpec {
    CallSpec {
        name,
        direction: Direction::Incoming,
        params,
    }
}

const fn outgoing(name: &'static str, params: &'static [&'static str]) -> CallSpec {
    CallSpec {
        name,
        direction: Direction::Outgoing,
        params,
    }
}

pub const CALLS: &[CallSpec] = &[
    incoming("quit", &[]),
    incoming("connect", &["name"]),
    outgoing("connected", &["playerid", "name"]),
    incoming("disconnect", &[]),
    outgoing("disconnected", &["playerid"]),
    incoming("load_puzzle", &["path"]),
    incoming("save_puzzle", &[]),
    incoming("restart_puzzle", &[]),
    incoming("get_puzzle", &[]),
    outgoing("puzzle", &["puzzle_data", "cluster_data"]),
    outgoing("clusters", &["cluster_data"]),
    incoming("get_pieces", &["pieces"]),
    outgoing("piece_pixmaps", &["pixmaps"]),
    incoming("grab", &["clusters"]),
    outgoing("grabbed", &["clusters", "playerid"]),
    incoming("drop", &["clusters"]),
    outgoing("dropped", &["clusters"]),
    incoming("move", &["cluster_positions"]),
    incoming("rearrange", &["clusters", "x", "y"]),
    outgoing("moved", &["cluster_positions"]),
    outgoing("joined", &["cluster", "joined_clusters", "position"]),
    outgoing("solved", &[]),
];

pub trait Call: Serialize + DeserializeOwned + Send + 'static {
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", content = "args", rename_all = "snake_case")]
pub enum ClientMsg {
    Quit,
    Connect {
        name: String,
    },
    Disconnect,
    LoadPuzzle {
        path: String,
    },
    SavePuzzle,
    RestartPuzzle,
    GetPuzzle,
    GetPieces {
        #[serde(default)]
        pieces: Option<Vec<PieceId>>,
    },
    Grab {
        clusters: Vec<ClusterId>,
    },
    Drop {
        clusters: Vec<ClusterId>,
    },
    Move {
        cluster_positions: BTreeMap<ClusterId, Position>,
    },
    Rearrange {
        clusters: Vec<ClusterId>,
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
    },
}

impl Call for ClientMsg {
    fn name(&self) -> &'static str {
        match self {
            ClientMsg::Quit => "quit",
            ClientMsg::Connect { .. } => "connect",
            ClientMsg::Disconnect => "disconnect",
            ClientMsg::LoadPuzzle { .. } => "load_puzzle",
            ClientMsg::SavePuzzle => "save_puzzle",
            ClientMsg::RestartPuzzle => "restart_puzzle",
            ClientMsg::GetPuzzle => "get_puzzle",
            ClientMsg::GetPieces { .. } => "get_pieces",
            ClientMsg::Grab { .. } => "grab",
            ClientMsg::Drop { .. } => "drop",
            ClientMsg::Move { .. } => "move",
            ClientMsg::Rearrange { .. } => "rearrange",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", content = "args", rename_all = "snake_case")]
pub enum ServerMsg {
    Connected {
        playerid: PlayerId,
        name: String,
    },
    Disconnected {
        playerid: PlayerId,
    },
    Puzzle {
        puzzle_data: PuzzleLayout,
        cluster_data: ClusterState,
    },
    Clusters {
        cluster_data: ClusterState,
    },
    /// Keys are stringified piece ids.
    PiecePixmaps {
        pixmaps: BTreeMap<String, Pixmap>,
    },
    Grabbed {
        clusters: Vec<ClusterId>,
        playerid: PlayerId,
    },
    Dropped {
        clusters: Vec<ClusterId>,
    },
    Moved {
        cluster_positions: BTreeMap<ClusterId, Position>,
    },
    Joined {
        cluster: ClusterId,
        joined_clusters: Vec<ClusterId>,
        position: Position,
    },
    Solved,
}

impl Call for ServerMsg {
    fn name(&self) -> &'static str {
        match self {
            ServerMsg::Connected { .. } => "connected",
            ServerMsg::Disconnected { .. } => "disconnected",
            ServerMsg::Puzzle { .. } => "puzzle",
            ServerMsg::Clusters { .. } => "clusters",
            ServerMsg::PiecePixmaps { .. } => "piece_pixmaps",
            ServerMsg::Grabbed { .. } => "grabbed",
            ServerMsg::Dropped { .. } => "dropped",
            ServerMsg::Moved { .. } => "moved",
            ServerMsg::Joined { .. } => "joined",
            ServerMsg::Solved => "solved",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Pixmap(pub Vec<u8>);

impl fmt::Debug for Pixmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pixmap({} bytes)", self.0.len())
    }
}

impl Serialize for Pixmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Pixmap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Pixmap)
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_keys(value: &serde_json::Value) -> Vec<String> {
        match value.get("args") {
            Some(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn assert_matches_table<T: Call>(msg: &T, direction: Direction) {
        let spec = CALLS
            .iter()
            .find(|spec| spec.name == msg.name())
            .unwrap_or_else(|| panic!("{} missing from CALLS", msg.name()));
        assert_eq!(spec.direction, direction, "{}", spec.name);
        let value = serde_json::to_value(msg).unwrap();
        assert_eq!(value["call"], spec.name);
        let mut keys = args_keys(&value);
        keys.sort();
        let mut params: Vec<String> = spec.params.iter().map(|p| p.to_string()).collect();
        params.sort();
        assert_eq!(keys, params, "{}", spec.name);
    }

    #[test]
    fn client_messages_match_declared_calls() {
        let samples = vec![
            ClientMsg::Quit,
            ClientMsg::Connect { name: "ann".into() },
            ClientMsg::Disconnect,
            ClientMsg::LoadPuzzle { path: "/tmp/p".into() },
            ClientMsg::SavePuzzle,
            ClientMsg::RestartPuzzle,
            ClientMsg::GetPuzzle,
            ClientMsg::GetPieces { pieces: Some(vec![1]) },
            ClientMsg::Grab { clusters: vec![1] },
            ClientMsg::Drop { clusters: vec![1] },
            ClientMsg::Move {
                cluster_positions: BTreeMap::from([(1, Position::new(0.0, 0.0, 0))]),
            },
            ClientMsg::Rearrange {
                clusters: vec![1],
                x: Some(1.0),
                y: Some(2.0),
            },
        ];
        for msg in &samples {
            assert_matches_table(msg, Direction::Incoming);
        }
        let incoming = CALLS
            .iter()
            .filter(|spec| spec.direction == Direction::Incoming)
            .count();
        assert_eq!(samples.len(), incoming);
    }

    #[test]
    fn server_messages_match_declared_calls() {
        let samples = vec![
            ServerMsg::Connected {
                playerid: "tcp/1".into(),
                name: "ann".into(),
            },
            ServerMsg::Disconnected {
                playerid: "tcp/1".into(),
            },
            ServerMsg::Puzzle {
                puzzle_data: PuzzleLayout::default(),
                cluster_data: ClusterState::default(),
            },
            ServerMsg::Clusters {
                cluster_data: ClusterState::default(),
            },
            ServerMsg::PiecePixmaps {
                pixmaps: BTreeMap::from([("1".to_string(), Pixmap(vec![1, 2]))]),
            },
            ServerMsg::Grabbed {
                clusters: vec![1],
                playerid: "tcp/1".into(),
            },
            ServerMsg::Dropped { clusters: vec![1] },
            ServerMsg::Moved {
                cluster_positions: BTreeMap::new(),
            },
            ServerMsg::Joined {
                cluster: 1,
                joined_clusters: vec![2],
                position: Position::new(0.0, 0.0, 0),
            },
            ServerMsg::Solved,
        ];
        for msg in &samples {
            assert_matches_table(msg, Direction::Outgoing);
        }
        let outgoing = CALLS
            .iter()
            .filter(|spec| spec.direction == Direction::Outgoing)
            .count();
        assert_eq!(samples.len(), outgoing);
    }

    #[test]
    fn parses_hand_written_calls() {
        let msg: ClientMsg = serde_json::from_str(r#"{"call":"get_puzzle"}"#).unwrap();
        assert_eq!(msg, ClientMsg::GetPuzzle);
        let msg: ClientMsg =
            serde_json::from_str(r#"{"call":"move","args":{"cluster_positions":{"7":{"x":1.5,"y":2,"rotation":3}}}}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMsg::Move {
                cluster_positions: BTreeMap::from([(7, Position::new(1.5, 2.0, 3))]),
            }
        );
        let msg: ClientMsg =
            serde_json::from_str(r#"{"call":"rearrange","args":{"clusters":[1,2]}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMsg::Rearrange {
                clusters: vec![1, 2],
                x: None,
                y: None,
            }
        );
    }

    #[test]
    fn pixmaps_travel_as_base64() {
        let msg = ServerMsg::PiecePixmaps {
            pixmaps: BTreeMap::from([("3".to_string(), Pixmap(b"PNG".to_vec()))]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"UE5H\""));
        let back: ServerMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
