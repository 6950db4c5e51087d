use crate::mask::PixelCoord;
use itertools::Itertools;
use std::fmt;
use std::path::PathBuf;

/// How an object-store failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Transient,
    NotFound,
    Permanent,
}

/// One batch whose output file count differs from the reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountDeviation {
    pub batch: usize,
    pub count: usize,
    pub delta: i64,
}

#[derive(Debug)]
pub enum TileError {
    Io(std::io::Error),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Codec {
        path: PathBuf,
        message: String,
    },
    NoBatchFoldersFound {
        path: PathBuf,
    },
    BatchCountMismatch {
        path: PathBuf,
        reference: usize,
        deviations: Vec<CountDeviation>,
    },
    PixelCountMismatch {
        path: PathBuf,
        batch_pixels: usize,
        enabled_pixels: usize,
    },
    DuplicatePixelMapping {
        pixel: PixelCoord,
        first_batch: usize,
        second_batch: usize,
    },
    WindowOutOfBounds {
        batch: usize,
        pixel: PixelCoord,
        rows: usize,
        cols: usize,
    },
    ShardWrite {
        path: PathBuf,
        message: String,
    },
    Store {
        kind: StoreErrorKind,
        key: String,
        message: String,
    },
    CompletionUnavailable {
        tile: String,
        scenario: String,
        attempts: Vec<String>,
    },
    SyncConflict {
        conflicts: Vec<String>,
    },
    RetryLocked {
        path: PathBuf,
        holder: String,
    },
    NoMergedTiles {
        root: PathBuf,
        scenario: String,
    },
    Scheduler(String),
    Config(String),
    Other(String),
}

impl TileError {
    /// Only transient store failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, TileError::Store { kind: StoreErrorKind::Transient, .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            TileError::Store { kind, .. } => *kind == StoreErrorKind::NotFound,
            TileError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn store(kind: StoreErrorKind, key: &str, message: impl Into<String>) -> Self {
        TileError::Store {
            kind,
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn codec(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        TileError::Codec {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileError::Io(e) => write!(f, "IO error: {}", e),
            TileError::Serialization(e) => write!(f, "Serialization error: {}", e),
            TileError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            TileError::Json(e) => write!(f, "JSON error: {}", e),
            TileError::Codec { path, message } => {
                write!(f, "Cannot decode grid file {}: {}", path.display(), message)
            }
            TileError::NoBatchFoldersFound { path } => {
                write!(f, "No batch folders found in {}. Aborting.", path.display())
            }
            TileError::BatchCountMismatch { path, reference, deviations } => {
                write!(
                    f,
                    "Batch output file counts differ in {} (reference {} files): {}",
                    path.display(),
                    reference,
                    deviations
                        .iter()
                        .map(|d| format!("batch_{} has {} ({:+})", d.batch, d.count, d.delta))
                        .join(", ")
                )
            }
            TileError::PixelCountMismatch { path, batch_pixels, enabled_pixels } => write!(
                f,
                "Batch run-masks cover {} pixels but the tile run-mask enables {} ({})",
                batch_pixels,
                enabled_pixels,
                path.display()
            ),
            TileError::DuplicatePixelMapping { pixel, first_batch, second_batch } => write!(
                f,
                "Pixel {} is claimed by batch_{} and batch_{}",
                pixel, first_batch, second_batch
            ),
            TileError::WindowOutOfBounds { batch, pixel, rows, cols } => write!(
                f,
                "batch_{} pixel {} lies outside the {}x{} tile grid",
                batch, pixel, rows, cols
            ),
            TileError::ShardWrite { path, message } => {
                write!(f, "Failed to write merged output {}: {}", path.display(), message)
            }
            TileError::Store { kind, key, message } => {
                write!(f, "Object store error ({:?}) on {}: {}", kind, key, message)
            }
            TileError::CompletionUnavailable { tile, scenario, attempts } => write!(
                f,
                "Completion unavailable for {} {}: {}",
                tile,
                scenario,
                attempts.join("; ")
            ),
            TileError::SyncConflict { conflicts } => write!(
                f,
                "{} remote file(s) differ from local copies, rerun with force: {}",
                conflicts.len(),
                conflicts.join(", ")
            ),
            TileError::RetryLocked { path, holder } => write!(
                f,
                "Retry construction is locked by {} ({})",
                holder,
                path.display()
            ),
            TileError::Scheduler(e) => write!(f, "Scheduler error: {}", e),
            TileError::NoMergedTiles { root, scenario } => {
                write!(f, "No merged tiles for {} under {}", scenario, root.display())
            }
            TileError::Config(e) => write!(f, "Configuration error: {}", e),
            TileError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for TileError {}

impl From<bincode::error::EncodeError> for TileError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TileError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for TileError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TileError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for TileError {
    fn from(err: std::io::Error) -> Self {
        TileError::Io(err)
    }
}

impl From<serde_json::Error> for TileError {
    fn from(err: serde_json::Error) -> Self {
        TileError::Json(err)
    }
}

impl From<String> for TileError {
    fn from(err: String) -> Self {
        TileError::Other(err)
    }
}

impl From<&str> for TileError {
    fn from(err: &str) -> Self {
        TileError::Other(err.to_string())
    }
}
