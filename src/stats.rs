//! Playback statistics: a sliding trend window over sync error,
//! correction and drift, plus the session counters reported alongside
//! it.

use crate::FRAMES_PER_PACKET;

/// Window length in frames; also the reporting interval.
pub const TREND_INTERVAL: usize = 3758;

/// Sliding window with O(1) running sums. `drift` for a sample is
/// `sync_error - previous_sync_error - previous_correction`: the part of
/// the error change the last correction did not account for.
pub struct TrendWindow {
    samples: Vec<[i64; 3]>,
    pos: usize,
    count: usize,
    sum_sync_error: i64,
    sum_correction: i64,
    sum_abs_correction: i64,
    sum_drift: i64,
    prev: Option<(i64, i64)>,
}

impl TrendWindow {
    pub fn new() -> Self {
        Self::with_capacity(TREND_INTERVAL)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: vec![[0; 3]; capacity],
            pos: 0,
            count: 0,
            sum_sync_error: 0,
            sum_correction: 0,
            sum_abs_correction: 0,
            sum_drift: 0,
            prev: None,
        }
    }

    /// Record one frame's sync error and the correction chosen for it.
    pub fn push(&mut self, sync_error: i64, correction: i64) {
        let drift = match self.prev {
            Some((prev_err, prev_corr)) => sync_error - prev_err - prev_corr,
            None => 0,
        };
        self.prev = Some((sync_error, correction));

        if self.count == self.samples.len() {
            let [old_err, old_corr, old_drift] = self.samples[self.pos];
            self.sum_sync_error -= old_err;
            self.sum_correction -= old_corr;
            self.sum_abs_correction -= old_corr.abs();
            self.sum_drift -= old_drift;
        } else {
            self.count += 1;
        }

        self.samples[self.pos] = [sync_error, correction, drift];
        self.pos = (self.pos + 1) % self.samples.len();
        self.sum_sync_error += sync_error;
        self.sum_correction += correction;
        self.sum_abs_correction += correction.abs();
        self.sum_drift += drift;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Average sync error over the window, in frames.
    pub fn average_sync_error(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum_sync_error as f64 / self.count as f64
    }

    /// Net correction rate normalized to one packet, in PPM.
    pub fn net_correction_ppm(&self) -> f64 {
        self.ppm(self.sum_correction)
    }

    /// Insertions plus deletions normalized to one packet, in PPM.
    pub fn gross_correction_ppm(&self) -> f64 {
        self.ppm(self.sum_abs_correction)
    }

    /// Residual drift rate normalized to one packet, in PPM.
    pub fn drift_ppm(&self) -> f64 {
        self.ppm(self.sum_drift)
    }

    fn ppm(&self, sum: i64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (sum as f64 / self.count as f64) * 1_000_000.0 / f64::from(FRAMES_PER_PACKET)
    }
}

impl Default for TrendWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the session's health, as reported in the periodic stats
/// line and through [`crate::player::Player::stats`].
#[derive(Debug, Clone, Default)]
pub struct PlayerStats {
    pub average_sync_error: f64,
    pub net_correction_ppm: f64,
    pub gross_correction_ppm: f64,
    pub drift_ppm: f64,
    pub packet_count: u64,
    pub missing_packets: u64,
    pub late_packets: u64,
    pub too_late_packets: u64,
    pub resend_requests: u64,
    /// Anchor timestamp the current play segment was released against;
    /// 0 outside a segment.
    pub play_segment_reference_frame: u32,
    /// Smallest DAC queue length observed, in frames.
    pub minimum_dac_queue: u64,
    /// Ring occupancy extremes over the last window, in packets.
    pub minimum_buffer_occupancy: i32,
    pub maximum_buffer_occupancy: i32,
}

impl PlayerStats {
    /// One-line report in the format of the periodic stats log.
    pub fn format_report(&self) -> String {
        format!(
            "sync error {:.1} frames, net correction {:+.1} ppm, corrections {:.1} ppm, \
             drift {:+.1} ppm, missing {}, late {}, too late {}, resends {}, \
             min DAC queue {}, buffer {}..{}",
            self.average_sync_error,
            self.net_correction_ppm,
            self.gross_correction_ppm,
            self.drift_ppm,
            self.missing_packets,
            self.late_packets,
            self.too_late_packets,
            self.resend_requests,
            self.minimum_dac_queue,
            self.minimum_buffer_occupancy,
            self.maximum_buffer_occupancy,
        )
    }
}
