//! Error types surfaced by the player lifecycle.

use thiserror::Error;

use crate::codec::CodecError;

/// Errors that can occur while starting, running or stopping a session.
/// Only lifecycle problems surface here; per-packet faults are logged and
/// the offending packet dropped.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("unsupported sample size {0}, only 16-bit streams are supported")]
    UnsupportedSampleSize(u32),

    #[error("frame size {0} is too small to play")]
    FrameSizeTooSmall(usize),

    #[error("buffer_start_fill {0} exceeds the ring capacity {1}")]
    BufferStartFill(usize, usize),

    #[error("decoder error: {0}")]
    Codec(#[from] CodecError),

    #[error("payload decryption failed")]
    Decrypt,

    #[error("failed to spawn egress thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("player is already running")]
    AlreadyPlaying,

    #[error("player is not running")]
    NotPlaying,
}
