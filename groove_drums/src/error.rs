// Error type for the drum pipeline.
//
// Most data-quality problems never reach callers: missing data falls back to
// synthetic samples or a warm-start, and unreadable recordings are degraded to
// empty grids by `DrumDataset::get`. The variants here are what the strict
// entry points (`encode_file`, `try_get`, `load_latest`, `save_checkpoint`,
// `train`) return so the caller can decide.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DrumError>;

#[derive(Error, Debug)]
pub enum DrumError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A recording could not be parsed as a Standard MIDI File.
    #[error("MIDI parse error in {path}: {message}")]
    Midi { path: PathBuf, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A checkpoint parameter does not have the shape the model expects.
    #[error("parameter '{name}' has shape {found:?}, expected {expected:?}")]
    ParameterShape {
        name: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("checkpoint is missing parameter '{0}'")]
    MissingParameter(String),

    #[error("checkpoint checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("unsupported checkpoint format version {0}")]
    UnsupportedFormat(u32),

    /// Training stopped at a cancellation point; no checkpoint was written.
    #[error("training cancelled")]
    Cancelled,

    /// Another thread panicked while holding the registry lock.
    #[error("model registry lock poisoned")]
    RegistryPoisoned,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DrumError {
    pub(crate) fn midi(path: impl Into<PathBuf>, err: impl ToString) -> Self {
        DrumError::Midi {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
