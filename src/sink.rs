//! Output sink contract.
//!
//! The device driver behind this trait is outside the core. Optional
//! capabilities default to no-ops so simple backends only implement the
//! data path.

/// Capability and volume-range description an output backend may expose.
///
/// Attenuations use the same scale as [`crate::volume::vol2attn`]:
/// `linear_gain = 10^(attn / 1000)`, unity at 0.
#[derive(Debug, Clone, Copy)]
pub struct SinkParameters {
    pub minimum_attenuation: i32,
    pub maximum_attenuation: i32,
    /// When set, the player hands volume changes to [`AudioSink::set_volume`]
    /// instead of scaling samples in software.
    pub has_hardware_volume: bool,
}

/// An audio output device.
///
/// `play` is the only call that may block for a meaningful time (waiting
/// for buffer space); everything else must return promptly.
pub trait AudioSink: Send + Sync {
    /// Prepare the device for output at `sample_rate`.
    fn start(&self, sample_rate: u32);

    /// Stop output and release the device.
    fn stop(&self);

    /// Enqueue interleaved stereo samples; blocks until accepted.
    fn play(&self, pcm: &[i16]);

    /// Drop any buffered audio not yet rendered.
    fn flush(&self);

    /// Stereo frames currently queued in the device, or `None` on a
    /// transient query error.
    fn delay(&self) -> Option<u64>;

    /// Apply `volume_db` in hardware. Only consulted when
    /// [`SinkParameters::has_hardware_volume`] is advertised; returning
    /// false hands attenuation back to the software scaler.
    fn set_volume(&self, _volume_db: f64) -> bool {
        false
    }

    /// Advertised capabilities, if the backend can describe itself.
    fn parameters(&self) -> Option<SinkParameters> {
        None
    }
}
