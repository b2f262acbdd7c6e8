//! Slave-clocked playback core for RAOP network audio receivers.
//!
//! Encrypted ALAC frames arrive over an unreliable network tagged with
//! 16-bit RTP sequence numbers and 32-bit media timestamps; a timing
//! channel publishes anchor points that tie a media timestamp to a local
//! clock instant. This crate reconstructs a continuous 16-bit stereo PCM
//! stream at the output sink, aligned to the source clock, despite packet
//! loss, reordering, late arrival and sender/receiver clock drift.
//!
//! - Input: [`player::Player::put_packet`] from the network receiver
//! - Output: an [`sink::AudioSink`] implementation (the device driver)
//! - Timing: an [`anchor::AnchorSource`] implementation (the timing channel)
//! - Loss recovery: a [`player::ResendRequester`] implementation
//!
//! The network receiver, the timing protocol and the output device are
//! deliberately outside this crate; they plug in through the traits above.

pub mod anchor;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod player;
pub mod ring;
pub mod seq;
pub mod sink;
pub mod stats;
pub mod stuffer;
pub mod time;
pub mod volume;

pub use anchor::{Anchor, AnchorSource};
pub use codec::FrameDecoder;
pub use config::{PlayerConfig, StreamConfig, StuffingMode};
pub use error::PlayerError;
pub use player::{Player, ResendRequester};
pub use sink::{AudioSink, SinkParameters};
pub use stats::PlayerStats;
pub use volume::AudioParameters;

/// Number of PCM slots in the reorder ring. Must be a power of two so
/// that slot selection reduces to a mask of the sequence number.
pub const BUFFER_FRAMES: usize = 512;

/// Nominal source sample rate. One media-timestamp unit is one stereo
/// frame at this rate.
pub const NOMINAL_SAMPLE_RATE: u32 = 44100;

/// Stereo frames per audio packet, used for PPM normalization and for
/// pacing the egress wait.
pub const FRAMES_PER_PACKET: u32 = 352;

/// Largest accepted audio payload in bytes.
pub const MAX_PACKET_BYTES: usize = 2048;
