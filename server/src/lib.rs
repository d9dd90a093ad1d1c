pub mod config;
pub mod runtime;
pub mod service;
pub mod storage;

pub use config::{Args, ConfigError, Settings};
pub use runtime::Actor;
pub use service::{NamePolicy, PuzzleService, ServiceError, ServiceOptions};
pub use storage::{PuzzleFolder, StorageError};
