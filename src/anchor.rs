//! Timing-anchor contract.
//!
//! The timing channel periodically maps a media timestamp to a local
//! clock instant; the player slaves its output to the most recent such
//! mapping.

/// One observation from the timing channel: `rtp_timestamp` was at the
/// source's output at `local_time` (32.32 fixed point, same epoch as
/// [`crate::time::now`]). `remote_time` is the sender's clock reading
/// for the same instant, carried through for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub rtp_timestamp: u32,
    pub local_time: u64,
    pub remote_time: u64,
}

/// Provider of the most recent timing anchor.
pub trait AnchorSource: Send + Sync {
    /// The latest anchor, or `None` while the timing channel has not
    /// produced one yet. Implementations must return both fields from
    /// the same observation; the player never pairs a timestamp with a
    /// local time read separately.
    fn current_anchor(&self) -> Option<Anchor>;
}
