use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::document::{ClusterRecord, ClusterState, Link, Piece, PuzzleLayout};
use crate::geometry::{
    grid_pitch, normalize_rotation, pieces_per_row, rotate_offset, within_snap, ClusterId,
    PieceId, Position, SNAP_DISTANCE,
};

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("rotations must be at least 1")]
    InvalidRotations,
    #[error("piece ids start at 1")]
    ZeroPieceId,
    #[error("piece {0} is declared more than once")]
    DuplicatePiece(PieceId),
    #[error("unknown piece {0}")]
    UnknownPiece(PieceId),
    #[error("link {0}-{1} references an unknown piece")]
    DanglingLink(PieceId, PieceId),
    #[error("cluster without pieces")]
    EmptyCluster,
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
}

/// A rigid group of pieces. Its id is always the smallest member piece id.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub x: f64,
    pub y: f64,
    pub rotation: u32,
    pieces: Vec<PieceId>,
}

impl Cluster {
    fn new(position: Position, pieces: Vec<PieceId>) -> Self {
        Self {
            x: position.x,
            y: position.y,
            rotation: position.rotation,
            pieces,
        }
    }

    pub fn id(&self) -> ClusterId {
        self.pieces.iter().min().copied().unwrap_or_default()
    }

    pub fn pieces(&self) -> &[PieceId] {
        &self.pieces
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.pieces.len() == 1
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y, self.rotation)
    }

    fn set_position(&mut self, position: Position) {
        self.x = position.x;
        self.y = position.y;
        self.rotation = position.rotation;
    }

    fn record(&self) -> ClusterRecord {
        ClusterRecord {
            x: self.x,
            y: self.y,
            rotation: self.rotation,
            pieces: self.pieces.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub cluster: ClusterId,
    pub joined: Vec<ClusterId>,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct PuzzleBoard {
    name: String,
    rotations: u32,
    snap_distance: f64,
    pieces: BTreeMap<PieceId, Piece>,
    links: Vec<Link>,
    clusters: Vec<Cluster>,
    cluster_of: HashMap<PieceId, usize>,
}

impl Default for PuzzleBoard {
    fn default() -> Self {
        Self {
            name: String::new(),
            rotations: 1,
            snap_distance: SNAP_DISTANCE,
            pieces: BTreeMap::new(),
            links: Vec::new(),
            clusters: Vec::new(),
            cluster_of: HashMap::new(),
        }
    }
}

impl PuzzleBoard {
    pub fn new(
        name: impl Into<String>,
        rotations: u32,
        pieces: Vec<Piece>,
        links: Vec<Link>,
    ) -> Result<Self, BoardError> {
        if rotations == 0 {
            return Err(BoardError::InvalidRotations);
        }
        let mut by_id = BTreeMap::new();
        for piece in pieces {
            let id = piece.id;
            if id == 0 {
                return Err(BoardError::ZeroPieceId);
            }
            if by_id.insert(id, piece).is_some() {
                return Err(BoardError::DuplicatePiece(id));
            }
        }
        for link in &links {
            if !by_id.contains_key(&link.id1) || !by_id.contains_key(&link.id2) {
                return Err(BoardError::DanglingLink(link.id1, link.id2));
            }
        }
        let mut board = Self {
            name: name.into(),
            rotations,
            snap_distance: SNAP_DISTANCE,
            pieces: by_id,
            links,
            clusters: Vec::new(),
            cluster_of: HashMap::new(),
        };
        board.init_clusters();
        Ok(board)
    }

    pub fn from_layout(layout: PuzzleLayout) -> Result<Self, BoardError> {
        Self::new(layout.name, layout.rotations, layout.pieces, layout.links)
    }

    pub fn from_json(json: &str) -> Result<Self, BoardError> {
        let layout: PuzzleLayout = serde_json::from_str(json)?;
        Self::from_layout(layout)
    }

    pub fn with_snap_distance(mut self, snap_distance: f64) -> Self {
        self.snap_distance = snap_distance;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rotations(&self) -> u32 {
        self.rotations
    }

    pub fn snap_distance(&self) -> f64 {
        self.snap_distance
    }

    pub fn pieces(&self) -> impl Iterator<Item = &Piece> {
        self.pieces.values()
    }

    pub fn piece(&self, id: PieceId) -> Option<&Piece> {
        self.pieces.get(&id)
    }

    pub fn piece_ids(&self) -> Vec<PieceId> {
        self.pieces.keys().copied().collect()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        let index = *self.cluster_of.get(&id)?;
        let cluster = self.clusters.get(index)?;
        (cluster.id() == id).then_some(cluster)
    }

    pub fn cluster_of_piece(&self, piece: PieceId) -> Option<&Cluster> {
        let index = *self.cluster_of.get(&piece)?;
        self.clusters.get(index)
    }

    pub fn contains_cluster(&self, id: ClusterId) -> bool {
        self.cluster(id).is_some()
    }

    pub fn layout(&self) -> PuzzleLayout {
        PuzzleLayout {
            name: self.name.clone(),
            rotations: self.rotations,
            pieces: self.pieces.values().cloned().collect(),
            links: self.links.clone(),
        }
    }

    pub fn cluster_state(&self) -> ClusterState {
        ClusterState {
            clusters: self.clusters.iter().map(Cluster::record).collect(),
        }
    }

    pub fn layout_json(&self) -> Result<String, BoardError> {
        Ok(serde_json::to_string_pretty(&self.layout())?)
    }

    pub fn state_json(&self) -> Result<String, BoardError> {
        Ok(serde_json::to_string_pretty(&self.cluster_state())?)
    }

    pub fn init_clusters(&mut self) {
        self.clusters = self
            .pieces
            .keys()
            .map(|&id| Cluster::new(Position::new(0.0, 0.0, 0), vec![id]))
            .collect();
        self.clusters_changed();
    }

    pub fn clusters_from_state(&mut self, state: ClusterState) -> Result<(), BoardError> {
        let mut seen = BTreeSet::new();
        let mut clusters = Vec::with_capacity(state.clusters.len());
        for record in state.clusters {
            if record.pieces.is_empty() {
                return Err(BoardError::EmptyCluster);
            }
            for &piece in &record.pieces {
                if !self.pieces.contains_key(&piece) {
                    return Err(BoardError::UnknownPiece(piece));
                }
                if !seen.insert(piece) {
                    return Err(BoardError::DuplicatePiece(piece));
                }
            }
            let rotation = normalize_rotation(record.rotation, self.rotations);
            clusters.push(Cluster::new(
                Position::new(record.x, record.y, rotation),
                record.pieces,
            ));
        }
        for &id in self.pieces.keys() {
            if !seen.contains(&id) {
                clusters.push(Cluster::new(Position::new(0.0, 0.0, 0), vec![id]));
            }
        }
        self.clusters = clusters;
        self.clusters_changed();
        Ok(())
    }

    pub fn clusters_from_json(&mut self, json: &str) -> Result<(), BoardError> {
        let state: ClusterState = serde_json::from_str(json)?;
        self.clusters_from_state(state)
    }

    fn clusters_changed(&mut self) {
        self.cluster_of.clear();
        for (index, cluster) in self.clusters.iter().enumerate() {
            for &piece in &cluster.pieces {
                self.cluster_of.insert(piece, index);
            }
        }
    }

    pub fn move_cluster(&mut self, id: ClusterId, position: Position) -> Option<Position> {
        let rotations = self.rotations;
        let index = *self.cluster_of.get(&id)?;
        let cluster = self.clusters.get_mut(index)?;
        if cluster.id() != id {
            return None;
        }
        let position = Position::new(
            position.x,
            position.y,
            normalize_rotation(position.rotation, rotations),
        );
        cluster.set_position(position);
        tracing::debug!(cluster = id, x = position.x, y = position.y, rotation = position.rotation, "moved cluster");
        Some(position)
    }

    pub fn joinable_clusters(&self, id: ClusterId) -> Vec<ClusterId> {
        let Some(cluster) = self.cluster(id) else {
            return Vec::new();
        };
        let members: BTreeSet<PieceId> = cluster.pieces.iter().copied().collect();
        let origin = cluster.position();
        let mut result = BTreeSet::new();
        for link in &self.links {
            let other_piece = if members.contains(&link.id1) {
                link.id2
            } else if members.contains(&link.id2) {
                link.id1
            } else {
                continue;
            };
            let Some(other) = self.cluster_of_piece(other_piece) else {
                continue;
            };
            let other_id = other.id();
            if other_id == id {
                continue;
            }
            if within_snap(&origin, &other.position(), self.snap_distance) {
                result.insert(other_id);
            }
        }
        result.into_iter().collect()
    }

    /// Merges `clusters` into `into`. The merged cluster takes the placement
    /// of the participant with the most pieces (lowest id on ties) and its id
    /// becomes the smallest piece id across all participants.
    pub fn join(&mut self, clusters: &[ClusterId], into: ClusterId) -> Option<JoinOutcome> {
        let into_index = *self.cluster_of.get(&into)?;
        if self.clusters.get(into_index)?.id() != into {
            return None;
        }
        let absorbed: BTreeSet<ClusterId> = clusters
            .iter()
            .copied()
            .filter(|&id| id != into && self.contains_cluster(id))
            .collect();
        if absorbed.is_empty() {
            return None;
        }

        let mut participants: Vec<ClusterId> = absorbed.iter().copied().collect();
        participants.push(into);
        let anchor = participants
            .iter()
            .filter_map(|&id| self.cluster(id))
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| b.id().cmp(&a.id())))?
            .position();

        let absorbed_indices: BTreeSet<usize> = absorbed
            .iter()
            .filter_map(|id| self.cluster_of.get(id).copied())
            .collect();
        let mut moved_pieces = Vec::new();
        for &index in &absorbed_indices {
            moved_pieces.extend_from_slice(&self.clusters[index].pieces);
        }
        self.clusters[into_index].pieces.extend(moved_pieces);
        self.clusters[into_index].set_position(anchor);
        let merged = self.clusters[into_index].id();
        let mut index = 0;
        self.clusters.retain(|_| {
            let keep = !absorbed_indices.contains(&index);
            index += 1;
            keep
        });
        self.clusters_changed();

        let mut joined: Vec<ClusterId> = participants
            .into_iter()
            .filter(|&id| id != merged)
            .collect();
        joined.sort_unstable();
        tracing::debug!(cluster = merged, ?joined, "joined clusters");
        Some(JoinOutcome {
            cluster: merged,
            joined,
            position: anchor,
        })
    }

    pub fn reset_puzzle<R: Rng>(&mut self, rng: &mut R) {
        self.init_clusters();
        self.clusters.shuffle(rng);
        let rotations = self.rotations.max(1);
        for cluster in &mut self.clusters {
            cluster.rotation = rng.random_range(0..rotations);
        }
        self.clusters_changed();
        let ids: Vec<ClusterId> = self.clusters.iter().map(Cluster::id).collect();
        self.rearrange(&ids, None);
    }

    /// Packs the singleton clusters among `ids` into a square-ish grid
    /// centred on `pos` (default: their centre of mass), so each piece sits
    /// centred in its cell. Returns the new positions in layout order.
    pub fn rearrange(
        &mut self,
        ids: &[ClusterId],
        pos: Option<(f64, f64)>,
    ) -> Vec<(ClusterId, Position)> {
        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            let Some(&index) = self.cluster_of.get(&id) else {
                continue;
            };
            let cluster = &self.clusters[index];
            if cluster.id() != id || !cluster.is_singleton() {
                continue;
            }
            targets.push(index);
        }
        if targets.is_empty() {
            return Vec::new();
        }

        let pitch = grid_pitch(targets.iter().filter_map(|&index| {
            let piece = self.pieces.get(&self.clusters[index].pieces[0])?;
            Some((piece.w, piece.h))
        }));
        let per_row = pieces_per_row(targets.len());
        let (cx, cy) = pos.unwrap_or_else(|| {
            let n = targets.len() as f64;
            let sx: f64 = targets.iter().map(|&index| self.clusters[index].x).sum();
            let sy: f64 = targets.iter().map(|&index| self.clusters[index].y).sum();
            (sx / n, sy / n)
        });
        let offset = pitch * (per_row as f64 - 0.5) * 0.5;
        let x0 = cx - offset;
        let mut x = x0;
        let mut y = cy - offset;
        let mut in_row = 0;
        let rotations = self.rotations;
        let mut moved = Vec::with_capacity(targets.len());
        for index in targets {
            let piece_id = self.clusters[index].pieces[0];
            let Some(piece) = self.pieces.get(&piece_id) else {
                continue;
            };
            let cluster = &mut self.clusters[index];
            let (xc, yc) = rotate_offset(
                -f64::from(piece.x0) - 0.5 * f64::from(piece.w),
                -f64::from(piece.y0) - 0.5 * f64::from(piece.h),
                cluster.rotation,
                rotations,
            );
            cluster.x = x + xc;
            cluster.y = y + yc;
            moved.push((cluster.id(), cluster.position()));
            x += pitch;
            in_row += 1;
            if in_row >= per_row {
                x = x0;
                y += pitch;
                in_row = 0;
            }
        }
        moved
    }

    pub fn piece_center(&self, piece: PieceId) -> Option<(f64, f64)> {
        let record = self.pieces.get(&piece)?;
        let cluster = self.cluster_of_piece(piece)?;
        let (dx, dy) = rotate_offset(
            f64::from(record.x0) + 0.5 * f64::from(record.w),
            f64::from(record.y0) + 0.5 * f64::from(record.h),
            cluster.rotation,
            self.rotations,
        );
        Some((cluster.x + dx, cluster.y + dy))
    }

    pub fn piece_placements(&self, id: ClusterId) -> Vec<(PieceId, Position)> {
        let Some(cluster) = self.cluster(id) else {
            return Vec::new();
        };
        cluster
            .pieces
            .iter()
            .filter_map(|&piece| {
                let record = self.pieces.get(&piece)?;
                let (dx, dy) = rotate_offset(
                    f64::from(record.x0),
                    f64::from(record.y0),
                    cluster.rotation,
                    self.rotations,
                );
                Some((piece, Position::new(cluster.x + dx, cluster.y + dy, cluster.rotation)))
            })
            .collect()
    }

    pub fn is_solved(&self) -> bool {
        !self.pieces.is_empty()
            && self.clusters.len() == 1
            && self.clusters[0].len() == self.pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn strip(count: u32) -> PuzzleBoard {
        let pieces = (1..=count)
            .map(|id| Piece::new(id, format!("{id}.png"), (id as i32 - 1) * 10, 0, 10, 10))
            .collect();
        let links = (1..count).map(|id| Link::new(id, id + 1)).collect();
        PuzzleBoard::new("strip", 4, pieces, links).unwrap()
    }

    fn assert_ids_are_minimum(board: &PuzzleBoard) {
        for cluster in board.clusters() {
            let min = cluster.pieces().iter().min().copied().unwrap();
            assert_eq!(cluster.id(), min);
            assert_eq!(board.cluster(min).map(Cluster::id), Some(min));
        }
    }

    #[test]
    fn new_board_has_one_singleton_per_piece() {
        let board = strip(3);
        assert_eq!(board.clusters().len(), 3);
        assert!(board.clusters().iter().all(Cluster::is_singleton));
        assert_ids_are_minimum(&board);
    }

    #[test]
    fn rejects_bad_layouts() {
        let dup = vec![Piece::new(1, "a", 0, 0, 1, 1), Piece::new(1, "b", 0, 0, 1, 1)];
        assert!(matches!(
            PuzzleBoard::new("x", 1, dup, Vec::new()),
            Err(BoardError::DuplicatePiece(1))
        ));
        let one = vec![Piece::new(1, "a", 0, 0, 1, 1)];
        assert!(matches!(
            PuzzleBoard::new("x", 0, one.clone(), Vec::new()),
            Err(BoardError::InvalidRotations)
        ));
        assert!(matches!(
            PuzzleBoard::new("x", 1, one, vec![Link::new(1, 9)]),
            Err(BoardError::DanglingLink(1, 9))
        ));
        let zero = vec![Piece::new(0, "a", 0, 0, 1, 1), Piece::new(1, "b", 0, 0, 1, 1)];
        assert!(matches!(
            PuzzleBoard::new("x", 1, zero, Vec::new()),
            Err(BoardError::ZeroPieceId)
        ));
    }

    #[test]
    fn joinable_requires_link_distance_and_rotation() {
        let mut board = strip(3);
        board.move_cluster(1, Position::new(0.0, 0.0, 0));
        board.move_cluster(2, Position::new(39.0, -39.0, 0));
        board.move_cluster(3, Position::new(0.0, 0.0, 0));
        // 3 is not linked to 1
        assert_eq!(board.joinable_clusters(1), vec![2]);
        board.move_cluster(2, Position::new(5.0, 5.0, 1));
        assert!(board.joinable_clusters(1).is_empty());
        assert_eq!(board.joinable_clusters(3), Vec::<ClusterId>::new());
    }

    #[test]
    fn join_adopts_largest_cluster_and_min_id() {
        let mut board = strip(4);
        board.move_cluster(1, Position::new(1.0, 1.0, 0));
        board.move_cluster(2, Position::new(2.0, 2.0, 0));
        let first = board.join(&[1], 2).unwrap();
        assert_eq!(first.cluster, 1);
        assert_eq!(first.joined, vec![2]);
        assert_eq!(first.position, Position::new(1.0, 1.0, 0));

        board.move_cluster(3, Position::new(9.0, 9.0, 0));
        let second = board.join(&[1], 3).unwrap();
        assert_eq!(second.cluster, 1);
        assert_eq!(second.joined, vec![3]);
        // the two-piece cluster wins the anchor
        assert_eq!(second.position, Position::new(1.0, 1.0, 0));
        assert_eq!(board.clusters().len(), 2);
        assert_eq!(board.cluster(1).unwrap().len(), 3);
        assert_ids_are_minimum(&board);
    }

    #[test]
    fn join_ignores_unknown_and_self() {
        let mut board = strip(2);
        assert!(board.join(&[2], 99).is_none());
        assert!(board.join(&[1, 42], 1).is_none());
    }

    #[test]
    fn rearrange_packs_singletons_without_overlap() {
        let pieces = (1..=4).map(|id| Piece::new(id, "p", 0, 0, 10, 10)).collect();
        let mut board = PuzzleBoard::new("grid", 4, pieces, Vec::new()).unwrap();
        for id in 1..=4 {
            board.move_cluster(id, Position::new(0.0, 0.0, id % 4));
        }
        let moved = board.rearrange(&[1, 2, 3, 4], None);
        assert_eq!(moved.len(), 4);
        let pitch = 200f64.sqrt();
        let centers: Vec<(f64, f64)> = (1..=4).map(|id| board.piece_center(id).unwrap()).collect();
        for (i, a) in centers.iter().enumerate() {
            for b in &centers[i + 1..] {
                let dist = ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
                assert!(dist >= pitch - 1e-6, "{a:?} vs {b:?}");
            }
        }
        let expected_start = -pitch * 1.5 * 0.5;
        assert!((centers[0].0 - expected_start).abs() < 1e-6);
        assert!((centers[0].1 - expected_start).abs() < 1e-6);
    }

    #[test]
    fn rearrange_skips_multi_piece_clusters() {
        let mut board = strip(3);
        board.join(&[2], 1);
        let before = board.cluster(1).unwrap().position();
        let moved = board.rearrange(&[1, 3], Some((100.0, 100.0)));
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].0, 3);
        assert_eq!(board.cluster(1).unwrap().position(), before);
    }

    #[test]
    fn reset_restores_singletons_with_valid_rotations() {
        let mut board = strip(5);
        board.join(&[2, 3], 1);
        let mut rng = StdRng::seed_from_u64(7);
        board.reset_puzzle(&mut rng);
        assert_eq!(board.clusters().len(), 5);
        assert!(board.clusters().iter().all(|c| c.is_singleton() && c.rotation < 4));
        assert_ids_are_minimum(&board);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut board = strip(4);
        board.move_cluster(1, Position::new(12.5, -3.25, 3));
        board.join(&[2], 1);
        board.move_cluster(4, Position::new(0.1, 0.2, 1));
        let json = board.state_json().unwrap();
        let mut restored = strip(4);
        restored.clusters_from_json(&json).unwrap();
        assert_eq!(restored.cluster_state(), board.cluster_state());
    }

    #[test]
    fn snapshot_fills_missing_pieces_and_rejects_unknown() {
        let mut board = strip(3);
        let state = ClusterState {
            clusters: vec![ClusterRecord {
                x: 1.0,
                y: 2.0,
                rotation: 7,
                pieces: vec![2, 3],
            }],
        };
        board.clusters_from_state(state).unwrap();
        assert_eq!(board.clusters().len(), 2);
        assert_eq!(board.cluster(2).unwrap().rotation, 3);
        assert!(board.cluster(1).unwrap().is_singleton());

        let bad = ClusterState {
            clusters: vec![ClusterRecord {
                x: 0.0,
                y: 0.0,
                rotation: 0,
                pieces: vec![1, 9],
            }],
        };
        assert!(matches!(
            board.clusters_from_state(bad),
            Err(BoardError::UnknownPiece(9))
        ));
    }

    #[test]
    fn placements_follow_cluster_rotation() {
        let mut board = strip(2);
        board.join(&[2], 1);
        board.move_cluster(1, Position::new(100.0, 50.0, 1));
        let placements = board.piece_placements(1);
        assert_eq!(placements.len(), 2);
        let (_, second) = placements.iter().find(|(id, _)| *id == 2).unwrap();
        // a quarter turn maps the (10, 0) offset to (0, -10)
        assert!((second.x - 100.0).abs() < 1e-9);
        assert!((second.y - 40.0).abs() < 1e-9);
        assert_eq!(second.rotation, 1);
        assert!(board.piece_placements(2).is_empty());
    }

    #[test]
    fn solved_when_single_cluster_holds_everything() {
        let mut board = strip(3);
        assert!(!board.is_solved());
        board.join(&[2, 3], 1);
        assert!(board.is_solved());
        assert!(!PuzzleBoard::default().is_solved());
    }
}
