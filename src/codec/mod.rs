//! Decoder contract for the compressed frames carried in audio packets.
//!
//! The player owns a decoder for the lifetime of a session and feeds it
//! exactly one packet per call; every packet decodes to one frame of
//! `frame_size` stereo samples. The bundled implementation is
//! [`alac::AlacDecoder`]; any other codec can be plugged in through
//! [`FrameDecoder`].

pub mod alac;

use thiserror::Error;

/// Decoder failure modes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid input data")]
    InvalidInput,

    #[error("output buffer too small")]
    BufferTooSmall,

    #[error("unsupported stream parameters: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Audio frame decoder.
pub trait FrameDecoder: Send {
    /// Decode one packet into interleaved signed 16-bit stereo samples.
    ///
    /// # Returns
    /// Total samples written across both channels, or an error. A
    /// successful decode always yields `2 * frame_size` samples.
    fn decode(&mut self, data: &[u8], output: &mut [i16]) -> Result<usize, CodecError>;

    /// Stereo frames per packet this decoder produces.
    fn frame_size(&self) -> usize;
}
