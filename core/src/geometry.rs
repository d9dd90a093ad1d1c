use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

pub const SNAP_DISTANCE: f64 = 40.0;

pub type PieceId = u32;
pub type ClusterId = u32;

/// Placement of a cluster on the board: the board-space point where the
/// puzzle's unrotated origin lands, plus the rotation step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub rotation: u32,
}

impl Position {
    pub fn new(x: f64, y: f64, rotation: u32) -> Self {
        Self { x, y, rotation }
    }
}

pub fn normalize_rotation(rotation: u32, rotations: u32) -> u32 {
    rotation % rotations.max(1)
}

pub fn rotation_angle(rotation: u32, rotations: u32) -> f64 {
    2.0 * PI * f64::from(rotation) / f64::from(rotations.max(1))
}

pub fn rotate_offset(dx: f64, dy: f64, rotation: u32, rotations: u32) -> (f64, f64) {
    let (sin, cos) = rotation_angle(rotation, rotations).sin_cos();
    (dx * cos + dy * sin, -dx * sin + dy * cos)
}

pub fn within_snap(a: &Position, b: &Position, snap_distance: f64) -> bool {
    (a.x - b.x).abs() < snap_distance
        && (a.y - b.y).abs() < snap_distance
        && a.rotation == b.rotation
}

pub fn grid_pitch<I>(sizes: I) -> f64
where
    I: IntoIterator<Item = (i32, i32)>,
{
    sizes
        .into_iter()
        .map(|(w, h)| {
            let (w, h) = (f64::from(w), f64::from(h));
            w * w + h * h
        })
        .fold(0.0, f64::max)
        .sqrt()
}

pub fn pieces_per_row(count: usize) -> usize {
    ((count as f64).sqrt().floor() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f64, f64), b: (f64, f64)) -> bool {
        (a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9
    }

    #[test]
    fn rotation_zero_is_identity() {
        assert!(close(rotate_offset(3.0, -4.0, 0, 4), (3.0, -4.0)));
    }

    #[test]
    fn quarter_turn_follows_board_convention() {
        assert!(close(rotate_offset(1.0, 0.0, 1, 4), (0.0, -1.0)));
        assert!(close(rotate_offset(0.0, 1.0, 1, 4), (1.0, 0.0)));
        assert!(close(rotate_offset(1.0, 2.0, 2, 4), (-1.0, -2.0)));
    }

    #[test]
    fn full_turn_returns_to_start() {
        let (x, y) = rotate_offset(5.0, 7.0, 6, 6);
        assert!(close((x, y), (5.0, 7.0)));
    }

    #[test]
    fn snap_requires_same_rotation() {
        let a = Position::new(0.0, 0.0, 1);
        let b = Position::new(10.0, -10.0, 1);
        let c = Position::new(10.0, -10.0, 2);
        assert!(within_snap(&a, &b, SNAP_DISTANCE));
        assert!(!within_snap(&a, &c, SNAP_DISTANCE));
        assert!(!within_snap(&a, &Position::new(40.0, 0.0, 1), SNAP_DISTANCE));
    }

    #[test]
    fn pitch_uses_largest_diagonal() {
        let pitch = grid_pitch([(10, 10), (3, 4)]);
        assert!((pitch - 200f64.sqrt()).abs() < 1e-9);
        assert_eq!(grid_pitch(Vec::new()), 0.0);
    }

    #[test]
    fn rows_are_roughly_square() {
        assert_eq!(pieces_per_row(0), 1);
        assert_eq!(pieces_per_row(3), 1);
        assert_eq!(pieces_per_row(4), 2);
        assert_eq!(pieces_per_row(15), 3);
    }
}
