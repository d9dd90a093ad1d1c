use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::geometry::{ClusterId, PieceId, Position};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    pub id: PieceId,
    pub image: String,
    pub x0: i32,
    pub y0: i32,
    pub w: i32,
    pub h: i32,
    #[serde(flatten, default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Piece {
    pub fn new(id: PieceId, image: impl Into<String>, x0: i32, y0: i32, w: i32, h: i32) -> Self {
        Self {
            id,
            image: image.into(),
            x0,
            y0,
            w,
            h,
            meta: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id1: PieceId,
    pub id2: PieceId,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
}

impl Link {
    pub fn new(id1: PieceId, id2: PieceId) -> Self {
        Self { id1, id2, x: 0, y: 0 }
    }

    pub fn touches(&self, piece: PieceId) -> bool {
        self.id1 == piece || self.id2 == piece
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuzzleLayout {
    pub name: String,
    pub rotations: u32,
    pub pieces: Vec<Piece>,
    pub links: Vec<Link>,
}

impl Default for PuzzleLayout {
    fn default() -> Self {
        Self {
            name: String::new(),
            rotations: 1,
            pieces: Vec::new(),
            links: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub rotation: u32,
    pub pieces: Vec<PieceId>,
}

impl ClusterRecord {
    pub fn id(&self) -> Option<ClusterId> {
        self.pieces.iter().min().copied()
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y, self.rotation)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub clusters: Vec<ClusterRecord>,
}
