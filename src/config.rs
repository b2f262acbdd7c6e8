//! Player configuration and per-stream parameters.

use std::str::FromStr;

use crate::BUFFER_FRAMES;

/// How ±1-sample corrections are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StuffingMode {
    /// Splice a single sample in or out at a random point.
    #[default]
    Basic,
    /// Resample the whole frame by linear interpolation.
    Interpolated,
}

impl FromStr for StuffingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(StuffingMode::Basic),
            // `soxr` is the historical name for the resampling mode
            "interpolated" | "soxr" => Ok(StuffingMode::Interpolated),
            other => Err(format!("unknown packet_stuffing mode: {other}")),
        }
    }
}

/// Tunables for a player instance. The defaults match a two-second
/// AirPlay latency target on a well-behaved output device.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Target end-to-end frames between anchor and output.
    pub latency: u32,
    /// Compensation for sink-internal delay, in frames.
    pub audio_backend_latency_offset: i32,
    /// Frames to keep queued in the sink.
    pub audio_backend_buffer_desired_length: u32,
    /// Sync error below which no correction is applied, in frames.
    pub tolerance: i64,
    /// Sync error triggering a resync, in frames. 0 disables.
    pub resync_threshold: i64,
    /// Correction rendering mode.
    pub packet_stuffing: StuffingMode,
    /// Initial-fill guard; must not exceed [`BUFFER_FRAMES`].
    pub buffer_start_fill: usize,
    /// Seconds of packet silence before requesting upstream shutdown.
    /// 0 disables, as does `dont_check_timeout`.
    pub timeout_seconds: u64,
    pub dont_check_timeout: bool,
    /// Emit the periodic stats log line.
    pub statistics_requested: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            latency: 88_200,
            audio_backend_latency_offset: 0,
            audio_backend_buffer_desired_length: 6615,
            tolerance: 88,
            resync_threshold: 2205,
            packet_stuffing: StuffingMode::Basic,
            buffer_start_fill: 220,
            timeout_seconds: 120,
            dont_check_timeout: false,
            statistics_requested: false,
        }
    }
}

impl PlayerConfig {
    /// Validate cross-field constraints. Called by `play`.
    pub fn validate(&self) -> Result<(), crate::error::PlayerError> {
        if self.buffer_start_fill > BUFFER_FRAMES {
            return Err(crate::error::PlayerError::BufferStartFill(
                self.buffer_start_fill,
                BUFFER_FRAMES,
            ));
        }
        Ok(())
    }
}

/// Per-stream parameters announced at session setup.
#[derive(Clone)]
pub struct StreamConfig {
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],
    pub encrypted: bool,
    /// Twelve-integer format vector; `fmtp[1]` is the frame size,
    /// `fmtp[3]` the sample size, `fmtp[11]` the sampling rate. The
    /// remaining entries are forwarded to the decoder untouched.
    pub fmtp: [u32; 12],
}

impl StreamConfig {
    pub fn frame_size(&self) -> usize {
        self.fmtp[1] as usize
    }

    pub fn sample_size(&self) -> u32 {
        self.fmtp[3]
    }

    pub fn sampling_rate(&self) -> u32 {
        self.fmtp[11]
    }
}
