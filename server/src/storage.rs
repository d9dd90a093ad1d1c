use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use jigboard_core::board::{BoardError, PuzzleBoard};
use jigboard_core::document::Piece;
use thiserror::Error;
use tracing::{info, warn};

pub const LAYOUT_FILE: &str = "puzzle.json";
pub const STATE_FILE: &str = "clusters.json";
pub const PIECES_DIR: &str = "pieces";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no puzzle folder is configured")]
    NoBaseFolder,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid document {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: BoardError,
    },
    #[error("image reference `{0}` leaves the pieces folder")]
    ImageOutsideFolder(String),
}

/// A puzzle on disk: `puzzle.json` (static layout), an optional
/// `clusters.json` (play state) and piece images under `pieces/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuzzleFolder {
    root: PathBuf,
}

impl PuzzleFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout_path(&self) -> PathBuf {
        self.root.join(LAYOUT_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn piece_path(&self, image: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(image);
        if !relative
            .components()
            .all(|part| matches!(part, Component::Normal(_)))
        {
            return Err(StorageError::ImageOutsideFolder(image.to_string()));
        }
        Ok(self.root.join(PIECES_DIR).join(relative))
    }

    /// Reads the layout, then the saved play state if there is one. A state
    /// file that does not fit the layout is logged and replaced by fresh
    /// singletons.
    pub fn load(&self) -> Result<PuzzleBoard, StorageError> {
        let layout_path = self.layout_path();
        let text = read_text(&layout_path)?;
        let mut board = PuzzleBoard::from_json(&text).map_err(|source| StorageError::Document {
            path: layout_path.clone(),
            source,
        })?;
        let state_path = self.state_path();
        if state_path.exists() {
            let state = read_text(&state_path)?;
            if let Err(err) = board.clusters_from_json(&state) {
                warn!(
                    "saved state ignored: {err} (path={})",
                    state_path.display()
                );
            }
        }
        info!(
            "loaded puzzle {:?}: {} pieces, {} clusters",
            board.name(),
            board.piece_ids().len(),
            board.clusters().len()
        );
        Ok(board)
    }

    pub fn save_state(&self, board: &PuzzleBoard) -> Result<(), StorageError> {
        let path = self.state_path();
        let json = board.state_json().map_err(|source| StorageError::Document {
            path: path.clone(),
            source,
        })?;
        write_text(&path, &json)?;
        info!("saved {} clusters to {}", board.clusters().len(), path.display());
        Ok(())
    }

    pub fn save_layout(&self, board: &PuzzleBoard) -> Result<(), StorageError> {
        let path = self.layout_path();
        let json = board.layout_json().map_err(|source| StorageError::Document {
            path: path.clone(),
            source,
        })?;
        fs::create_dir_all(&self.root).map_err(|source| StorageError::Write {
            path: self.root.clone(),
            source,
        })?;
        write_text(&path, &json)
    }

    pub fn piece_image(&self, piece: &Piece) -> Result<Vec<u8>, StorageError> {
        let path = self.piece_path(&piece.image)?;
        fs::read(&path).map_err(|source| StorageError::Read { path, source })
    }
}

fn read_text(path: &Path) -> Result<String, StorageError> {
    fs::read_to_string(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write_text(path: &Path, text: &str) -> Result<(), StorageError> {
    fs::write(path, text).map_err(|source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    })
}
