use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by track opening and PCM reading.
///
/// Decode anomalies that happen after data has been streamed are not errors
/// at the task level: they end the run and are reported through
/// `TaskOutcome::Failed`, keeping what was already emitted.
#[derive(Debug, Error)]
pub enum WaveError {
    #[error("failed to open audio source {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },

    #[error("no audio track found in {0}")]
    NoAudioTrack(String),

    #[error("unknown sample rate for {0}")]
    UnknownSampleRate(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<symphonia::core::errors::Error> for WaveError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        match err {
            symphonia::core::errors::Error::IoError(e) => WaveError::Io(e),
            other => WaveError::Decode(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WaveError>;
