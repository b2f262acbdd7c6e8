//! The playback session: packet ingress, flush control, pre-roll, and
//! the slave-clocked egress loop.
//!
//! Two outside threads talk to a running session: the network receiver
//! calls [`Player::put_packet`], and a control caller drives
//! play/stop/flush/volume. The session owns one egress thread that
//! drains the reorder ring into the sink, padding holes with silence and
//! applying ±1-sample corrections so the stream stays locked to the
//! timing anchors.
//!
//! Lock order: the stream lock (`ab`) and the flush lock are never held
//! together; the flush lock is always consulted first and released
//! before the stream lock is taken. The volume lock and the stats
//! snapshot are leaves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;

use crate::anchor::{Anchor, AnchorSource};
use crate::codec::{alac::AlacDecoder, FrameDecoder};
use crate::config::{PlayerConfig, StreamConfig, StuffingMode};
use crate::crypto::PacketCipher;
use crate::error::PlayerError;
use crate::ring::FrameRing;
use crate::seq::{seq_diff, seq_after, seq_successor, seq_sum, ts_diff, ts_after};
use crate::sink::AudioSink;
use crate::stats::{PlayerStats, TrendWindow, TREND_INTERVAL};
use crate::stuffer;
use crate::time;
use crate::volume::{self, AudioParameters, DitherLcg, UNITY_VOLUME};
use crate::{FRAMES_PER_PACKET, MAX_PACKET_BYTES, NOMINAL_SAMPLE_RATE};

/// Out-of-band retransmission hint channel. Requests are best effort and
/// must not block; no acknowledgement is expected.
pub trait ResendRequester: Send + Sync {
    fn request_resend(&self, first: u16, count: u16);
}

/// The sink must hold at least this many frames before corrections are
/// allowed; stuffing into a nearly dry queue audibly glitches.
const DAC_QUEUE_MINIMUM: u64 = 5000;

/// Pre-roll silence batch, and the most the DAC queue is fed ahead.
const SILENCE_CHUNK_FRAMES: i64 = 4410;

/// Frames skipped forward when the first packet is already late.
const LATE_SKIP_FRAMES: u32 = 4410;

/// Frames the lingering flush filter discards before complaining.
const FLUSH_SCAN_LIMIT: i64 = 8820;

/// No corrections during the first seconds of a session, then only a
/// trickle until the half-minute mark.
const CORRECTION_LOCKOUT: u64 = 5 << 32;
const CORRECTION_EASE: u64 = 30 << 32;
const CORRECTION_EASE_SKIP_PER_MILLE: u32 = 648;

/// Egress wait bound: 4/3 of one packet duration.
const PACKET_WAIT: Duration = Duration::from_micros(
    FRAMES_PER_PACKET as u64 * 4 * 1_000_000 / (3 * NOMINAL_SAMPLE_RATE as u64),
);

/// Everything the stream lock protects: the ring, both cursors, and the
/// per-session flags and counters.
struct StreamState {
    ring: Option<FrameRing>,
    ab_read: u16,
    ab_write: u16,
    synced: bool,
    buffering: bool,
    /// 0 doubles as "unset"; a real timestamp of 0 restarts pre-roll,
    /// which is harmless.
    first_packet_timestamp: u32,
    first_packet_time_to_play: u64,
    play_segment_reference_frame: u32,
    /// Expected timestamp of the next released frame, for scheduling
    /// holes. Valid once `have_timestamp_estimate` is set.
    next_expected_timestamp: u32,
    have_timestamp_estimate: bool,
    time_of_last_audio_packet: u64,
    last_seqno_read: Option<u16>,
    session_begun_at: u64,
    sync_error_run: u32,
    flush_scan_dropped: i64,
    flush_scan_logged: bool,
    packet_count: u64,
    missing_packets: u64,
    late_packets: u64,
    too_late_packets: u64,
    resend_requests: u64,
    min_dac_queue: u64,
    min_occupancy: i32,
    max_occupancy: i32,
}

impl StreamState {
    fn new(ring: Option<FrameRing>) -> Self {
        Self {
            ring,
            ab_read: 0,
            ab_write: 0,
            synced: false,
            buffering: true,
            first_packet_timestamp: 0,
            first_packet_time_to_play: 0,
            play_segment_reference_frame: 0,
            next_expected_timestamp: 0,
            have_timestamp_estimate: false,
            time_of_last_audio_packet: 0,
            last_seqno_read: None,
            session_begun_at: 0,
            sync_error_run: 0,
            flush_scan_dropped: 0,
            flush_scan_logged: false,
            packet_count: 0,
            missing_packets: 0,
            late_packets: 0,
            too_late_packets: 0,
            resend_requests: 0,
            min_dac_queue: u64::MAX,
            min_occupancy: i32::MAX,
            max_occupancy: i32::MIN,
        }
    }

    /// Drop all buffered audio and return to the buffering state.
    fn resync(&mut self) {
        if let Some(ring) = self.ring.as_mut() {
            ring.clear_all();
        }
        self.synced = false;
        self.buffering = true;
        self.first_packet_timestamp = 0;
        self.first_packet_time_to_play = 0;
        self.play_segment_reference_frame = 0;
        self.next_expected_timestamp = 0;
        self.have_timestamp_estimate = false;
        self.last_seqno_read = None;
        self.session_begun_at = 0;
        self.sync_error_run = 0;
        self.flush_scan_dropped = 0;
        self.flush_scan_logged = false;
    }
}

/// `rtp_timestamp == 0` means no boundary; a flush at the literal
/// timestamp 0 cannot be expressed, which matches the wire protocol.
struct FlushState {
    requested: bool,
    rtp_timestamp: u32,
}

struct VolumeState {
    fix_volume: u32,
    parameters: AudioParameters,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self {
            fix_volume: UNITY_VOLUME,
            parameters: AudioParameters::default(),
        }
    }
}

/// Decoder and cipher, owned by the ingress path for the session.
#[derive(Default)]
struct IngressCodec {
    decoder: Option<Box<dyn FrameDecoder>>,
    cipher: Option<PacketCipher>,
    decrypt_buf: Vec<u8>,
    decode_buf: Vec<i16>,
}

struct Shared<S, A, R> {
    config: PlayerConfig,
    sink: S,
    anchor: A,
    resend: R,
    ab: Mutex<StreamState>,
    flowcontrol: Condvar,
    flush: Mutex<FlushState>,
    vol: Mutex<VolumeState>,
    ingress: Mutex<IngressCodec>,
    stats_snapshot: Mutex<PlayerStats>,
    please_stop: AtomicBool,
    connected: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl<S, A, R> Shared<S, A, R>
where
    S: AudioSink,
    A: AnchorSource,
    R: ResendRequester,
{
    /// Classify an arrived packet against the cursors and, when it has a
    /// slot, decode it into the ring. Caller holds the stream lock.
    fn ingest(
        &self,
        st: &mut StreamState,
        seqno: u16,
        timestamp: u32,
        payload: &[u8],
        connected: bool,
        drop_for_flush: bool,
    ) {
        let Some(ring) = st.ring.as_mut() else {
            return;
        };
        st.time_of_last_audio_packet = time::now();
        st.packet_count += 1;
        if !connected {
            return;
        }
        if drop_for_flush {
            debug!("dropping seq {seqno}: ts {timestamp} at or before the flush boundary");
            return;
        }

        if !st.synced {
            st.ab_write = seqno;
            st.ab_read = seqno;
            st.synced = true;
        }

        let target = if seqno == st.ab_write {
            st.ab_write = seq_successor(seqno);
            Some(seqno)
        } else if seq_after(st.ab_write, seqno) {
            // a gap: clear the skipped slots and ask the sender again
            let gap = seq_diff(st.ab_write, seqno);
            let mut s = st.ab_write;
            while s != seqno {
                ring.clear(s);
                s = seq_successor(s);
            }
            debug!("gap of {gap} packets before seq {seqno}, requesting resend");
            self.resend.request_resend(st.ab_write, gap as u16);
            st.resend_requests += 1;
            st.ab_write = seq_successor(seqno);
            Some(seqno)
        } else if seq_after(st.ab_read, seqno) {
            st.late_packets += 1;
            Some(seqno)
        } else {
            st.too_late_packets += 1;
            None
        };

        let Some(target) = target else {
            return;
        };

        // a stale entry here means the sequence space lapped the ring
        {
            let slot = ring.slot(target);
            if slot.ready && slot.sequence != target {
                if seq_after(st.ab_read, slot.sequence) {
                    warn!(
                        "ring aliasing at seq {target}: advancing read cursor to {}",
                        slot.sequence
                    );
                    st.ab_read = slot.sequence;
                } else {
                    warn!(
                        "ring slot for seq {target} held stale seq {}",
                        slot.sequence
                    );
                }
            }
        }

        let mut codec_guard = self.ingress.lock();
        let codec = &mut *codec_guard;
        let Some(decoder) = codec.decoder.as_mut() else {
            return;
        };
        let data: &[u8] = if let Some(cipher) = codec.cipher.as_ref() {
            if cipher.decrypt(payload, &mut codec.decrypt_buf).is_err() {
                warn!("payload decryption failed, dropping seq {seqno}");
                return;
            }
            &codec.decrypt_buf
        } else {
            payload
        };
        match decoder.decode(data, &mut codec.decode_buf) {
            Ok(n) if n == codec.decode_buf.len() => {
                ring.store(target, timestamp, &codec.decode_buf);
            }
            Ok(n) => {
                error!(
                    "decoder produced {n} samples, expected {}; ending session",
                    codec.decode_buf.len()
                );
                self.shutdown_requested.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                error!("decode failed for seq {seqno}: {e}; ending session");
                self.shutdown_requested.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Deadline for the first released frame: anchor instant plus the
/// distance from the anchor timestamp, the latency target and the
/// backend offset.
fn first_packet_deadline(anchor: &Anchor, first_ts: u32, latency: i64, backend_offset: i64) -> u64 {
    let delta = ts_diff(anchor.rtp_timestamp, first_ts);
    local_time_plus_frames(anchor.local_time, delta + latency + backend_offset)
}

/// `base` shifted by a signed frame count, saturating at the ends of the
/// fixed-point range.
fn local_time_plus_frames(base: u64, frames: i64) -> u64 {
    let shift =
        (((frames.unsigned_abs() as u128) << 32) / NOMINAL_SAMPLE_RATE as u128) as u64;
    if frames >= 0 {
        base.saturating_add(shift)
    } else {
        base.saturating_sub(shift)
    }
}

/// Signed frame count covered by the interval from `from` to `to`.
fn frames_between(from: u64, to: u64) -> i64 {
    if to >= from {
        time::interval_to_frames(to - from, NOMINAL_SAMPLE_RATE) as i64
    } else {
        -(time::interval_to_frames(from - to, NOMINAL_SAMPLE_RATE) as i64)
    }
}

/// Predicted offset, in frames, between when the next DAC frame will
/// play and when it should: positive means the queue is running long.
fn compute_sync_error(
    now: u64,
    anchor: &Anchor,
    frame_ts: u32,
    current_delay: u64,
    latency: i64,
) -> i64 {
    let td_frames = frames_between(anchor.local_time, now);
    let delay = td_frames - ts_diff(anchor.rtp_timestamp, frame_ts) + current_delay as i64;
    delay - latency
}

/// Pick the ±1 correction for this frame, subject to the dry-queue guard
/// and the early-session rate limiter.
fn choose_correction<RN: Rng>(
    sync_error: i64,
    current_delay: u64,
    session_age: u64,
    tolerance: i64,
    rng: &mut RN,
) -> i32 {
    let mut stuff = if sync_error > tolerance {
        -1
    } else if sync_error < -tolerance {
        1
    } else {
        0
    };
    if current_delay < DAC_QUEUE_MINIMUM {
        stuff = 0;
    }
    if session_age < CORRECTION_LOCKOUT {
        stuff = 0;
    } else if session_age < CORRECTION_EASE
        && rng.gen_range(0..1000) < CORRECTION_EASE_SKIP_PER_MILLE
    {
        stuff = 0;
    }
    stuff
}

/// Count consecutive out-of-bounds sync errors; fires after three.
fn watchdog_tick(run: &mut u32, out_of_bounds: bool) -> bool {
    if out_of_bounds {
        *run += 1;
        if *run >= 3 {
            *run = 0;
            return true;
        }
    } else {
        *run = 0;
    }
    false
}

/// What one egress iteration decided to do, carried out of the lock.
enum Action {
    Idle,
    /// Emit pre-roll silence.
    Silence { frames: usize },
    /// Emit the frame staged in the scratch buffer.
    Emit { stuff: i32, resync_to: Option<u32> },
    /// Raise a flush request at the given boundary.
    RequestFlush(u32),
    /// Flush the sink and reset the stream state in place.
    Resync,
}

struct Egress<S, A, R> {
    shared: Arc<Shared<S, A, R>>,
    trend: TrendWindow,
    dither: DitherLcg,
    rng: rand::rngs::ThreadRng,
    frame: Vec<i16>,
    stuffed: Vec<i16>,
    silence: Vec<i16>,
    frames_until_report: usize,
    boundary_cleared: bool,
    delay_error_logged: bool,
}

impl<S, A, R> Egress<S, A, R>
where
    S: AudioSink,
    A: AnchorSource,
    R: ResendRequester,
{
    fn new(shared: Arc<Shared<S, A, R>>) -> Self {
        Self {
            shared,
            trend: TrendWindow::new(),
            dither: DitherLcg::new(),
            rng: rand::thread_rng(),
            frame: Vec::new(),
            stuffed: Vec::new(),
            silence: Vec::new(),
            frames_until_report: TREND_INTERVAL,
            boundary_cleared: false,
            delay_error_logged: false,
        }
    }

    fn run(mut self) {
        debug!("egress thread running");
        loop {
            if self.shared.please_stop.load(Ordering::SeqCst) {
                break;
            }
            let boundary = self.service_flush();
            let action = self.step(boundary);
            if self.boundary_cleared {
                let mut f = self.shared.flush.lock();
                if f.rtp_timestamp == boundary {
                    f.rtp_timestamp = 0;
                }
                self.boundary_cleared = false;
            }
            match action {
                Action::Idle => {}
                Action::Silence { frames } => self.emit_silence(frames),
                Action::Emit { stuff, resync_to } => {
                    self.emit_frame(stuff);
                    if let Some(ts) = resync_to {
                        self.request_flush(ts);
                    }
                }
                Action::RequestFlush(ts) => self.request_flush(ts),
                Action::Resync => {
                    self.shared.sink.flush();
                    self.shared.ab.lock().resync();
                }
            }
        }
        debug!("egress thread exiting");
    }

    /// Apply a pending flush request, then report the lingering
    /// timestamp boundary (if any) for this iteration.
    fn service_flush(&mut self) -> u32 {
        let shared = Arc::clone(&self.shared);
        let (requested, boundary) = {
            let f = shared.flush.lock();
            (f.requested, f.rtp_timestamp)
        };
        if !requested {
            return boundary;
        }
        if boundary != 0 {
            debug!("flushing up to timestamp {boundary}");
        } else {
            debug!("flushing");
        }
        shared.sink.flush();
        shared.ab.lock().resync();
        let mut f = shared.flush.lock();
        f.requested = false;
        f.rtp_timestamp
    }

    fn step(&mut self, boundary: u32) -> Action {
        let shared = Arc::clone(&self.shared);
        let mut ab = shared.ab.lock();
        if ab.ring.is_none() {
            shared.flowcontrol.wait_for(&mut ab, PACKET_WAIT);
            return Action::Idle;
        }

        let now = time::now();

        // upstream silence watchdog
        let config = &shared.config;
        if ab.time_of_last_audio_packet != 0
            && config.timeout_seconds != 0
            && !config.dont_check_timeout
            && now.saturating_sub(ab.time_of_last_audio_packet) >= config.timeout_seconds << 32
        {
            if !shared.shutdown_requested.swap(true, Ordering::SeqCst) {
                warn!(
                    "no audio for {} seconds, requesting upstream shutdown",
                    config.timeout_seconds
                );
            }
        }

        // lingering flush filter: discard buffered frames up to the boundary
        if boundary != 0 {
            let st = &mut *ab;
            if let Some(ring) = st.ring.as_mut() {
                while st.synced {
                    let slot = ring.slot(st.ab_read);
                    if !slot.ready {
                        break;
                    }
                    if slot.timestamp != 0 && ts_after(boundary, slot.timestamp) {
                        // first frame past the boundary retires the filter
                        self.boundary_cleared = true;
                        break;
                    }
                    let frames = ring.frame_size() as i64;
                    ring.clear(st.ab_read);
                    st.ab_read = seq_successor(st.ab_read);
                    st.flush_scan_dropped += frames;
                    if st.flush_scan_dropped > FLUSH_SCAN_LIMIT && !st.flush_scan_logged {
                        warn!(
                            "flush filter discarded {} frames and counting",
                            st.flush_scan_dropped
                        );
                        st.flush_scan_logged = true;
                    }
                }
            }
        }

        if ab.buffering {
            return self.preroll_step(&mut ab, now);
        }

        // release decision for the frame at the read cursor
        let (ready, slot_ts) = {
            let st = &*ab;
            match st.ring.as_ref() {
                Some(ring) => {
                    let slot = ring.slot(st.ab_read);
                    (slot.ready, slot.timestamp)
                }
                None => return Action::Idle,
            }
        };
        let due_ts = if ready && slot_ts != 0 {
            Some(slot_ts)
        } else if ab.have_timestamp_estimate {
            Some(ab.next_expected_timestamp)
        } else {
            None
        };
        let anchor = shared.anchor.current_anchor();
        let due_now = match (due_ts, &anchor) {
            (Some(ts), Some(a)) => {
                let offset = i64::from(shared.config.latency)
                    + i64::from(shared.config.audio_backend_latency_offset)
                    - i64::from(shared.config.audio_backend_buffer_desired_length);
                let net = ts_diff(a.rtp_timestamp, ts) + offset;
                now >= local_time_plus_frames(a.local_time, net)
            }
            _ => false,
        };
        if !due_now {
            shared.flowcontrol.wait_for(&mut ab, PACKET_WAIT);
            return Action::Idle;
        }
        // due_now implies the anchor read succeeded
        let Some(anchor) = anchor else {
            return Action::Idle;
        };
        self.consume(&mut ab, now, anchor)
    }

    /// One pre-roll iteration: fix the first-play instant when the first
    /// frame shows up, then pad with silence until the gap closes.
    fn preroll_step(&mut self, ab: &mut MutexGuard<'_, StreamState>, now: u64) -> Action {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;

        let front_ts = {
            let st = &**ab;
            match st.ring.as_ref() {
                Some(ring) if st.synced => {
                    let slot = ring.slot(st.ab_read);
                    slot.ready.then_some(slot.timestamp)
                }
                _ => None,
            }
        };
        let Some(front_ts) = front_ts else {
            shared.flowcontrol.wait_for(ab, PACKET_WAIT);
            return Action::Idle;
        };

        if ab.first_packet_timestamp == 0 {
            let Some(anchor) = shared.anchor.current_anchor() else {
                // no anchor yet: keep buffering
                shared.flowcontrol.wait_for(ab, PACKET_WAIT);
                return Action::Idle;
            };
            ab.first_packet_timestamp = front_ts;
            ab.first_packet_time_to_play = first_packet_deadline(
                &anchor,
                front_ts,
                i64::from(config.latency),
                i64::from(config.audio_backend_latency_offset),
            );
            if now >= ab.first_packet_time_to_play {
                warn!("first packet is already late, skipping 0.1 s ahead");
                return Action::RequestFlush(front_ts.wrapping_add(LATE_SKIP_FRAMES));
            }
        }

        let dac_delay = self.query_dac_delay();
        let gross = frames_between(now, ab.first_packet_time_to_play);
        let exact = gross - dac_delay as i64;
        if exact <= 0 {
            debug!("pre-roll overshot by {} frames, resyncing", -exact);
            return Action::Resync;
        }

        let mut fill = SILENCE_CHUNK_FRAMES.min(SILENCE_CHUNK_FRAMES - dac_delay as i64);
        let frame_size = ab.ring.as_ref().map_or(0, |r| r.frame_size()) as i64;
        if exact <= fill || exact <= 2 * frame_size {
            // to the sample: after this batch the first frame is due
            fill = exact;
            let st = &mut **ab;
            st.buffering = false;
            st.session_begun_at = now;
            st.next_expected_timestamp = st.first_packet_timestamp;
            st.have_timestamp_estimate = true;
            if let Some(a) = shared.anchor.current_anchor() {
                st.play_segment_reference_frame = a.rtp_timestamp;
            }
            info!(
                "pre-roll complete, releasing at timestamp {}",
                st.first_packet_timestamp
            );
        } else if fill <= 0 {
            // the sink already holds enough; let it drain a little
            shared.flowcontrol.wait_for(ab, PACKET_WAIT);
            return Action::Idle;
        }
        Action::Silence {
            frames: fill as usize,
        }
    }

    /// Pull the frame at the read cursor (or synthesize silence for a
    /// hole), pick its correction, and advance the cursor.
    fn consume(
        &mut self,
        ab: &mut MutexGuard<'_, StreamState>,
        now: u64,
        anchor: Anchor,
    ) -> Action {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        let st = &mut **ab;
        let Some(ring) = st.ring.as_mut() else {
            return Action::Idle;
        };
        let frame_size = ring.frame_size();

        let occupancy = seq_diff(st.ab_read, st.ab_write);
        st.min_occupancy = st.min_occupancy.min(occupancy);
        st.max_occupancy = st.max_occupancy.max(occupancy);

        // last-chance resends for later holes, at widening offsets
        let mut i: i32 = 8;
        while i < occupancy / 2 {
            let s = seq_sum(st.ab_read, i as u16);
            if !ring.slot(s).ready {
                shared.resend.request_resend(s, 1);
                st.resend_requests += 1;
            }
            i *= 2;
        }

        let slot = ring.slot_mut(st.ab_read);
        let have_data;
        let frame_ts;
        let frame_seq;
        self.frame.clear();
        if slot.ready {
            self.frame.extend_from_slice(&slot.data);
            frame_ts = slot.timestamp;
            frame_seq = slot.sequence;
            have_data = true;
        } else {
            self.frame.resize(2 * frame_size, 0);
            frame_ts = 0;
            frame_seq = st.ab_read;
            have_data = false;
            st.missing_packets += 1;
        }
        slot.ready = false;
        slot.timestamp = 0;
        slot.sequence = 0;

        // sync error and correction for the next DAC frame
        let mut stuff = 0i32;
        let mut resync_to = None;
        if frame_ts != 0 {
            let current_delay = self.query_dac_delay();
            st.min_dac_queue = st.min_dac_queue.min(current_delay);
            let sync_error = compute_sync_error(
                now,
                &anchor,
                frame_ts,
                current_delay,
                i64::from(config.latency),
            );
            stuff = choose_correction(
                sync_error,
                current_delay,
                now.saturating_sub(st.session_begun_at),
                config.tolerance,
                &mut self.rng,
            );
            let out_of_bounds = config.resync_threshold != 0
                && sync_error.abs() > config.resync_threshold
                && have_data;
            if watchdog_tick(&mut st.sync_error_run, out_of_bounds) {
                warn!("sync error {sync_error} frames for three consecutive frames, resyncing");
                resync_to = Some(frame_ts);
            }
            self.trend.push(sync_error, i64::from(stuff));
        }

        // audit the sequence stream, then advance the cursor
        match st.last_seqno_read {
            None => st.last_seqno_read = Some(frame_seq),
            Some(prev) => {
                let expected = seq_successor(prev);
                if have_data && frame_seq != expected {
                    debug!("sequence anomaly: expected {expected}, read {frame_seq}");
                    st.last_seqno_read = Some(frame_seq);
                } else {
                    st.last_seqno_read = Some(expected);
                }
            }
        }
        st.ab_read = seq_successor(st.ab_read);
        st.next_expected_timestamp = if frame_ts != 0 {
            frame_ts.wrapping_add(frame_size as u32)
        } else {
            st.next_expected_timestamp.wrapping_add(frame_size as u32)
        };

        {
            let mut snap = shared.stats_snapshot.lock();
            snap.average_sync_error = self.trend.average_sync_error();
            snap.net_correction_ppm = self.trend.net_correction_ppm();
            snap.gross_correction_ppm = self.trend.gross_correction_ppm();
            snap.drift_ppm = self.trend.drift_ppm();
        }
        self.frames_until_report -= 1;
        if self.frames_until_report == 0 {
            self.frames_until_report = TREND_INTERVAL;
            if config.statistics_requested {
                let report = PlayerStats {
                    average_sync_error: self.trend.average_sync_error(),
                    net_correction_ppm: self.trend.net_correction_ppm(),
                    gross_correction_ppm: self.trend.gross_correction_ppm(),
                    drift_ppm: self.trend.drift_ppm(),
                    packet_count: st.packet_count,
                    missing_packets: st.missing_packets,
                    late_packets: st.late_packets,
                    too_late_packets: st.too_late_packets,
                    resend_requests: st.resend_requests,
                    play_segment_reference_frame: st.play_segment_reference_frame,
                    minimum_dac_queue: if st.min_dac_queue == u64::MAX {
                        0
                    } else {
                        st.min_dac_queue
                    },
                    minimum_buffer_occupancy: if st.min_occupancy == i32::MAX {
                        0
                    } else {
                        st.min_occupancy
                    },
                    maximum_buffer_occupancy: if st.max_occupancy == i32::MIN {
                        0
                    } else {
                        st.max_occupancy
                    },
                };
                info!("{}", report.format_report());
            }
            st.min_dac_queue = u64::MAX;
            st.min_occupancy = i32::MAX;
            st.max_occupancy = i32::MIN;
        }

        Action::Emit { stuff, resync_to }
    }

    fn query_dac_delay(&mut self) -> u64 {
        match self.shared.sink.delay() {
            Some(d) => {
                self.delay_error_logged = false;
                d
            }
            None => {
                if !self.delay_error_logged {
                    warn!("sink delay query failed, assuming empty queue");
                    self.delay_error_logged = true;
                }
                0
            }
        }
    }

    fn emit_silence(&mut self, frames: usize) {
        if frames == 0 || self.shared.please_stop.load(Ordering::SeqCst) {
            return;
        }
        if self.silence.len() < 2 * frames {
            self.silence.resize(2 * frames, 0);
        }
        self.shared.sink.play(&self.silence[..2 * frames]);
    }

    fn emit_frame(&mut self, stuff: i32) {
        let shared = Arc::clone(&self.shared);
        if shared.please_stop.load(Ordering::SeqCst) {
            return;
        }
        let fix_volume = shared.vol.lock().fix_volume;
        if stuff == 0 && fix_volume == UNITY_VOLUME {
            shared.sink.play(&self.frame);
            return;
        }
        let frames = self.frame.len() / 2;
        self.stuffed.resize(2 * (frames + 1), 0);
        let n = match shared.config.packet_stuffing {
            StuffingMode::Basic => stuffer::stuff_basic(
                &self.frame,
                &mut self.stuffed,
                stuff,
                fix_volume,
                &mut self.dither,
                &mut self.rng,
            ),
            StuffingMode::Interpolated => stuffer::stuff_interpolated(
                &self.frame,
                &mut self.stuffed,
                stuff,
                fix_volume,
                &mut self.dither,
            ),
        };
        shared.sink.play(&self.stuffed[..2 * n]);
    }

    fn request_flush(&self, timestamp: u32) {
        let mut f = self.shared.flush.lock();
        f.requested = true;
        f.rtp_timestamp = timestamp;
    }
}

/// A playback session host. Construct once with the collaborators, then
/// drive any number of play/stop cycles through shared references.
pub struct Player<S, A, R> {
    shared: Arc<Shared<S, A, R>>,
    egress: Mutex<Option<JoinHandle<()>>>,
}

impl<S, A, R> Player<S, A, R>
where
    S: AudioSink + 'static,
    A: AnchorSource + 'static,
    R: ResendRequester + 'static,
{
    pub fn new(config: PlayerConfig, sink: S, anchor: A, resend: R) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                sink,
                anchor,
                resend,
                ab: Mutex::new(StreamState::new(None)),
                flowcontrol: Condvar::new(),
                flush: Mutex::new(FlushState {
                    requested: false,
                    rtp_timestamp: 0,
                }),
                vol: Mutex::new(VolumeState::default()),
                ingress: Mutex::new(IngressCodec::default()),
                stats_snapshot: Mutex::new(PlayerStats::default()),
                please_stop: AtomicBool::new(false),
                connected: AtomicBool::new(true),
                shutdown_requested: AtomicBool::new(false),
            }),
            egress: Mutex::new(None),
        }
    }

    /// Start a session with the bundled ALAC decoder configured from the
    /// stream's format vector.
    pub fn play(&self, stream: StreamConfig) -> Result<(), PlayerError> {
        if stream.sample_size() != 16 {
            return Err(PlayerError::UnsupportedSampleSize(stream.sample_size()));
        }
        let decoder = AlacDecoder::from_fmtp(&stream.fmtp)?;
        self.play_with_decoder(stream, Box::new(decoder))
    }

    /// Start a session with a caller-provided decoder.
    pub fn play_with_decoder(
        &self,
        stream: StreamConfig,
        decoder: Box<dyn FrameDecoder>,
    ) -> Result<(), PlayerError> {
        if stream.sample_size() != 16 {
            return Err(PlayerError::UnsupportedSampleSize(stream.sample_size()));
        }
        self.shared.config.validate()?;
        let frame_size = decoder.frame_size();
        // the splice stuffer needs at least one interior sample to work on
        if frame_size < 3 {
            return Err(PlayerError::FrameSizeTooSmall(frame_size));
        }

        let mut egress = self.egress.lock();
        if egress.is_some() {
            return Err(PlayerError::AlreadyPlaying);
        }

        {
            let mut codec = self.shared.ingress.lock();
            codec.decoder = Some(decoder);
            codec.cipher = stream
                .encrypted
                .then(|| PacketCipher::new(stream.aes_key, stream.aes_iv));
            codec.decrypt_buf = Vec::with_capacity(MAX_PACKET_BYTES);
            codec.decode_buf = vec![0i16; 2 * frame_size];
        }
        *self.shared.ab.lock() = StreamState::new(Some(FrameRing::new(frame_size)));
        {
            let mut f = self.shared.flush.lock();
            f.requested = false;
            f.rtp_timestamp = 0;
        }
        *self.shared.stats_snapshot.lock() = PlayerStats::default();
        self.shared.please_stop.store(false, Ordering::SeqCst);
        self.shared.shutdown_requested.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("raop-egress".into())
            // decode scratch and both stuffer buffers live on this stack
            .stack_size(512 * 1024)
            .spawn(move || Egress::new(shared).run())?;
        *egress = Some(handle);

        self.shared.sink.start(stream.sampling_rate());
        Ok(())
    }

    /// Stop the session: join the egress thread, stop the sink and free
    /// the ring and decoder.
    pub fn stop(&self) -> Result<(), PlayerError> {
        let handle = self.egress.lock().take();
        let Some(handle) = handle else {
            return Err(PlayerError::NotPlaying);
        };
        self.shared.please_stop.store(true, Ordering::SeqCst);
        self.shared.flowcontrol.notify_all();
        if handle.join().is_err() {
            error!("egress thread panicked");
        }
        self.shared.sink.stop();
        self.shared.ab.lock().ring = None;
        let mut codec = self.shared.ingress.lock();
        codec.decoder = None;
        codec.cipher = None;
        Ok(())
    }

    /// Request a flush of all audio at or before `timestamp`. Timestamp
    /// 0 is the "no boundary" sentinel and flushes without one.
    pub fn flush(&self, timestamp: u32) {
        {
            let mut f = self.shared.flush.lock();
            f.requested = true;
            f.rtp_timestamp = timestamp;
        }
        self.shared.ab.lock().play_segment_reference_frame = 0;
        self.shared.flowcontrol.notify_all();
    }

    /// Hand one received audio packet to the session. Oversized packets
    /// and packets at or before a pending flush boundary are dropped.
    pub fn put_packet(&self, seqno: u16, timestamp: u32, payload: &[u8]) {
        if payload.len() > MAX_PACKET_BYTES {
            warn!("dropping oversized packet of {} bytes", payload.len());
            return;
        }
        let shared = &*self.shared;
        let connected = shared.connected.load(Ordering::SeqCst);
        let mut drop_for_flush = false;
        if connected {
            let mut f = shared.flush.lock();
            if f.rtp_timestamp != 0 {
                if ts_after(f.rtp_timestamp, timestamp) {
                    // first arrival past the boundary retires the filter
                    f.rtp_timestamp = 0;
                } else {
                    drop_for_flush = true;
                }
            }
        }
        {
            let mut ab = shared.ab.lock();
            shared.ingest(&mut ab, seqno, timestamp, payload, connected, drop_for_flush);
        }
        shared.flowcontrol.notify_all();
    }

    /// Gate between the network and the ring. Dropping the connection
    /// also flushes whatever is buffered.
    pub fn set_connected(&self, connected: bool) {
        let was = self.shared.connected.swap(connected, Ordering::SeqCst);
        if was && !connected {
            self.shared.flush.lock().requested = true;
            self.shared.flowcontrol.notify_all();
        }
    }

    /// Apply an AirPlay volume in [-30, 0], or -144 for mute. Hardware
    /// volume is preferred when the sink offers it; otherwise the gain
    /// is folded into the software scaler.
    pub fn set_volume(&self, airplay_volume: f64) {
        let shared = &*self.shared;
        let params = shared.sink.parameters();
        let (min_attn, max_attn) = params
            .map(|p| (p.minimum_attenuation, p.maximum_attenuation))
            .unwrap_or((volume::MIN_ATTENUATION, volume::MAX_ATTENUATION));
        let muted = airplay_volume == volume::MUTE_VOLUME;
        // a sink advertising a hardware mixer gets the raw value; if it
        // declines after all, attenuation falls back to the software path
        let hardware = params.map_or(false, |p| p.has_hardware_volume)
            && shared.sink.set_volume(airplay_volume);
        let (linear, attn) = if hardware {
            (1.0, max_attn)
        } else if muted {
            (0.0, min_attn)
        } else {
            let attn = volume::vol2attn(airplay_volume, max_attn, min_attn);
            (volume::attenuation_to_linear(attn), attn)
        };
        let mut vol = shared.vol.lock();
        vol.fix_volume = volume::fix_volume_for(linear);
        vol.parameters = AudioParameters {
            airplay_volume,
            current_attenuation: attn,
            minimum_attenuation: min_attn,
            maximum_attenuation: max_attn,
            muted,
            hardware_volume: hardware,
            software_gain: linear,
        };
    }

    /// Most recent volume publication.
    pub fn audio_parameters(&self) -> AudioParameters {
        self.shared.vol.lock().parameters
    }

    /// True once the core has asked its owner to tear the stream down
    /// (packet timeout or fatal decode error). The core itself keeps
    /// running until [`Player::stop`].
    pub fn shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Session health snapshot.
    pub fn stats(&self) -> PlayerStats {
        let mut s = { self.shared.stats_snapshot.lock().clone() };
        let ab = self.shared.ab.lock();
        s.packet_count = ab.packet_count;
        s.missing_packets = ab.missing_packets;
        s.late_packets = ab.late_packets;
        s.too_late_packets = ab.too_late_packets;
        s.resend_requests = ab.resend_requests;
        s.play_segment_reference_frame = ab.play_segment_reference_frame;
        s.minimum_dac_queue = if ab.min_dac_queue == u64::MAX {
            0
        } else {
            ab.min_dac_queue
        };
        s.minimum_buffer_occupancy = if ab.min_occupancy == i32::MAX {
            0
        } else {
            ab.min_occupancy
        };
        s.maximum_buffer_occupancy = if ab.max_occupancy == i32::MIN {
            0
        } else {
            ab.max_occupancy
        };
        s
    }
}

impl<S, A, R> Drop for Player<S, A, R> {
    fn drop(&mut self) {
        if let Some(handle) = self.egress.get_mut().take() {
            self.shared.please_stop.store(true, Ordering::SeqCst);
            self.shared.flowcontrol.notify_all();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    struct TestSink {
        played: Mutex<Vec<Vec<i16>>>,
        delay: AtomicU64,
        flushes: AtomicU64,
        hw_volume: bool,
    }

    impl TestSink {
        fn new(delay: u64) -> Self {
            Self {
                played: Mutex::new(Vec::new()),
                delay: AtomicU64::new(delay),
                flushes: AtomicU64::new(0),
                hw_volume: false,
            }
        }

        fn with_hardware_volume(delay: u64) -> Self {
            Self {
                hw_volume: true,
                ..Self::new(delay)
            }
        }
    }

    impl AudioSink for TestSink {
        fn start(&self, _sample_rate: u32) {}
        fn stop(&self) {}
        fn play(&self, pcm: &[i16]) {
            self.played.lock().push(pcm.to_vec());
        }
        fn flush(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        fn delay(&self) -> Option<u64> {
            Some(self.delay.load(Ordering::SeqCst))
        }
        fn set_volume(&self, _volume_db: f64) -> bool {
            self.hw_volume
        }
        fn parameters(&self) -> Option<crate::sink::SinkParameters> {
            self.hw_volume.then(|| crate::sink::SinkParameters {
                minimum_attenuation: volume::MIN_ATTENUATION,
                maximum_attenuation: volume::MAX_ATTENUATION,
                has_hardware_volume: true,
            })
        }
    }

    #[derive(Default)]
    struct TestAnchor(Mutex<Option<Anchor>>);

    impl TestAnchor {
        fn set(&self, anchor: Anchor) {
            *self.0.lock() = Some(anchor);
        }
    }

    impl AnchorSource for &'static TestAnchor {
        fn current_anchor(&self) -> Option<Anchor> {
            *self.0.lock()
        }
    }

    #[derive(Default)]
    struct ResendLog(Mutex<Vec<(u16, u16)>>);

    impl ResendRequester for &'static ResendLog {
        fn request_resend(&self, first: u16, count: u16) {
            self.0.lock().push((first, count));
        }
    }

    /// Decoder stub: interprets the payload as little-endian PCM when it
    /// is a full frame, otherwise repeats the first byte.
    struct PcmPassthrough {
        frame_size: usize,
    }

    impl FrameDecoder for PcmPassthrough {
        fn decode(&mut self, data: &[u8], output: &mut [i16]) -> Result<usize, CodecError> {
            let samples = 2 * self.frame_size;
            if data.len() >= 4 * self.frame_size {
                for (i, out) in output.iter_mut().take(samples).enumerate() {
                    *out = i16::from_le_bytes([data[2 * i], data[2 * i + 1]]);
                }
            } else {
                let fill = i16::from(*data.first().unwrap_or(&0));
                output[..samples].fill(fill);
            }
            Ok(samples)
        }

        fn frame_size(&self) -> usize {
            self.frame_size
        }
    }

    type TestPlayer = Player<TestSink, &'static TestAnchor, &'static ResendLog>;

    fn test_config() -> PlayerConfig {
        PlayerConfig {
            latency: 0,
            audio_backend_latency_offset: 0,
            audio_backend_buffer_desired_length: 0,
            tolerance: 10_000,
            resync_threshold: 0,
            timeout_seconds: 0,
            ..Default::default()
        }
    }

    fn start_player(
        config: PlayerConfig,
        sink_delay: u64,
        frame_size: usize,
    ) -> (TestPlayer, &'static TestAnchor, &'static ResendLog) {
        let anchor: &'static TestAnchor = Box::leak(Box::new(TestAnchor::default()));
        let resend: &'static ResendLog = Box::leak(Box::new(ResendLog::default()));
        let player = Player::new(config, TestSink::new(sink_delay), anchor, resend);
        let stream = StreamConfig {
            aes_key: [0; 16],
            aes_iv: [0; 16],
            encrypted: false,
            fmtp: [96, frame_size as u32, 0, 16, 40, 10, 14, 2, 255, 0, 0, 44100],
        };
        player
            .play_with_decoder(stream, Box::new(PcmPassthrough { frame_size }))
            .unwrap();
        (player, anchor, resend)
    }

    /// Payload whose passthrough decode is a recognizable constant fill.
    fn marker_payload(marker: u8) -> Vec<u8> {
        vec![marker]
    }

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn gap_triggers_single_resend() {
        let (player, _anchor, resend) = start_player(test_config(), 0, 4);
        player.put_packet(100, 1000, &marker_payload(1));
        player.put_packet(101, 1004, &marker_payload(2));
        player.put_packet(103, 1012, &marker_payload(3));
        assert_eq!(*resend.0.lock(), vec![(102, 1)]);
        assert_eq!(player.stats().resend_requests, 1);
        player.stop().unwrap();
    }

    #[test]
    fn too_late_packet_is_dropped_without_side_effects() {
        let (player, _anchor, resend) = start_player(test_config(), 0, 4);
        player.put_packet(500, 1000, &marker_payload(1));
        player.put_packet(490, 960, &marker_payload(2));
        let stats = player.stats();
        assert_eq!(stats.too_late_packets, 1);
        assert_eq!(stats.packet_count, 2);
        assert!(resend.0.lock().is_empty());
        {
            let ab = player.shared.ab.lock();
            let ring = ab.ring.as_ref().unwrap();
            assert!(!ring.slot(490).ready);
            assert!(ring.slot(500).ready);
        }
        player.stop().unwrap();
    }

    #[test]
    fn late_but_unplayed_packet_fills_its_slot() {
        let (player, _anchor, _resend) = start_player(test_config(), 0, 4);
        player.put_packet(10, 1000, &marker_payload(1));
        player.put_packet(13, 1012, &marker_payload(2)); // creates holes 11, 12
        player.put_packet(11, 1004, &marker_payload(3)); // late but unplayed
        let stats = player.stats();
        assert_eq!(stats.late_packets, 1);
        {
            let ab = player.shared.ab.lock();
            let ring = ab.ring.as_ref().unwrap();
            assert!(ring.slot(11).ready);
            assert!(!ring.slot(12).ready);
        }
        player.stop().unwrap();
    }

    #[test]
    fn flush_boundary_filters_ingress_until_passed() {
        let (player, _anchor, _resend) = start_player(test_config(), 0, 4);
        player.flush(200_000);
        // the egress side applies the request and flushes the sink
        assert!(wait_until(1000, || {
            player.shared.sink.flushes.load(Ordering::SeqCst) > 0
        }));
        player.put_packet(1, 199_000, &marker_payload(1));
        player.put_packet(2, 200_000, &marker_payload(2));
        let stats = player.stats();
        assert_eq!(stats.packet_count, 2);
        // boundary still armed: nothing accepted yet
        assert_ne!(player.shared.flush.lock().rtp_timestamp, 0);

        player.put_packet(3, 200_004, &marker_payload(3));
        assert_eq!(player.shared.flush.lock().rtp_timestamp, 0);
        player.stop().unwrap();
    }

    #[test]
    fn put_packet_stores_decoded_pcm() {
        let (player, _anchor, _resend) = start_player(test_config(), 0, 4);
        let pcm: Vec<i16> = (0i16..8).map(|x| x * 3 - 5).collect();
        let payload: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        player.put_packet(42, 5000, &payload);
        {
            let ab = player.shared.ab.lock();
            let slot = ab.ring.as_ref().unwrap().slot(42);
            assert!(slot.ready);
            assert_eq!(slot.timestamp, 5000);
            assert_eq!(slot.sequence, 42);
            assert_eq!(&slot.data[..], &pcm[..]);
        }
        player.stop().unwrap();
    }

    #[test]
    fn disconnected_player_drops_everything() {
        let (player, _anchor, _resend) = start_player(test_config(), 0, 4);
        player.set_connected(false);
        player.put_packet(7, 1000, &marker_payload(1));
        let stats = player.stats();
        assert_eq!(stats.packet_count, 1);
        {
            let ab = player.shared.ab.lock();
            assert!(!ab.synced);
            assert!(!ab.ring.as_ref().unwrap().slot(7).ready);
        }
        player.stop().unwrap();
    }

    #[test]
    fn preroll_then_ordered_playback() {
        let frame_size = 352usize;
        let (player, anchor, _resend) = start_player(test_config(), 0, frame_size);

        let base_ts = 10_000u32;
        let first_ts = base_ts + 4410; // 100 ms after the anchor point
        for i in 0..16u16 {
            player.put_packet(
                1 + i,
                first_ts + u32::from(i) * frame_size as u32,
                &marker_payload(10 + i as u8),
            );
        }
        anchor.set(Anchor {
            rtp_timestamp: base_ts,
            local_time: time::now(),
            remote_time: 0,
        });

        let sink = &player.shared.sink;
        assert!(
            wait_until(3000, || sink.played.lock().len() >= 9),
            "sink received {} buffers",
            sink.played.lock().len()
        );
        // the play segment was released against the current anchor
        assert_eq!(player.stats().play_segment_reference_frame, base_ts);
        player.stop().unwrap();

        let played = sink.played.lock();
        // pre-roll silence first, then the frames in sequence order
        assert!(played[0].iter().all(|&s| s == 0));
        assert!(played[0].len() <= 2 * 4410);
        for (i, frame) in played[1..9].iter().enumerate() {
            assert_eq!(frame.len(), 2 * frame_size);
            assert!(
                frame.iter().all(|&s| s == i16::from(10 + i as u8)),
                "frame {i} out of order"
            );
        }
    }

    #[test]
    fn missing_packet_is_played_as_silence() {
        let frame_size = 352usize;
        let (player, anchor, resend) = start_player(test_config(), 0, frame_size);

        // enough packets that no tail hole comes due while we observe
        let base_ts = 10_000u32;
        let first_ts = base_ts + 4410;
        for i in 0..40u16 {
            if i == 4 {
                continue; // the hole
            }
            player.put_packet(
                1 + i,
                first_ts + u32::from(i) * frame_size as u32,
                &marker_payload(10 + i as u8),
            );
        }
        anchor.set(Anchor {
            rtp_timestamp: base_ts,
            local_time: time::now(),
            remote_time: 0,
        });

        let sink = &player.shared.sink;
        assert!(wait_until(5000, || sink.played.lock().len() >= 20));
        let missing = player.stats().missing_packets;
        player.stop().unwrap();

        assert_eq!(missing, 1);
        // the gap was reported to the sender when seq 6 arrived
        assert!(resend.0.lock().contains(&(5, 1)));
        let played = sink.played.lock();
        assert!(played[5].iter().all(|&s| s == 0), "hole should be silent");
        assert!(played[4].iter().all(|&s| s == 13));
        assert!(played[6].iter().all(|&s| s == 15));
    }

    #[test]
    fn first_packet_deadline_matches_reference_case() {
        // anchor at ts 10000, first packet at 12000, latency 88200:
        // deadline is anchor time + (2000 + 88200) / 44100 seconds
        let t0 = 77u64 << 32;
        let anchor = Anchor {
            rtp_timestamp: 10_000,
            local_time: t0,
            remote_time: 0,
        };
        let deadline = first_packet_deadline(&anchor, 12_000, 88_200, 0);
        let expected = t0 + ((90_200u64) << 32) / 44_100;
        assert_eq!(deadline, expected);
    }

    #[test]
    fn sync_error_reference_case() {
        // dac holds 8820 frames, anchor 100 frames ahead of the packet:
        // the queue is running 8920 frames long
        let t0 = 12u64 << 32;
        let anchor = Anchor {
            rtp_timestamp: 50_100,
            local_time: t0,
            remote_time: 0,
        };
        let sync_error = compute_sync_error(t0, &anchor, 50_000, 8820, 0);
        assert_eq!(sync_error, 8920);

        // a mature session drops one sample for it
        let mut rng = StdRng::seed_from_u64(1);
        let stuff = choose_correction(sync_error, 8820, 60 << 32, 88, &mut rng);
        assert_eq!(stuff, -1);

        // and the stuffer shortens the frame to 351
        let input = vec![0i16; 2 * 352];
        let mut output = vec![0i16; 2 * 353];
        let mut dither = DitherLcg::new();
        let n = stuffer::stuff_basic(&input, &mut output, stuff, UNITY_VOLUME, &mut dither, &mut rng);
        assert_eq!(n, 351);
    }

    #[test]
    fn correction_rate_limiter() {
        let mut rng = StdRng::seed_from_u64(7);
        // inside tolerance: nothing
        assert_eq!(choose_correction(50, 9000, 60 << 32, 88, &mut rng), 0);
        // over tolerance: drop; under: insert
        assert_eq!(choose_correction(200, 9000, 60 << 32, 88, &mut rng), -1);
        assert_eq!(choose_correction(-200, 9000, 60 << 32, 88, &mut rng), 1);
        // a dry DAC queue blocks corrections
        assert_eq!(choose_correction(200, 100, 60 << 32, 88, &mut rng), 0);
        // first five seconds: never
        for _ in 0..100 {
            assert_eq!(choose_correction(200, 9000, 4 << 32, 88, &mut rng), 0);
        }
        // between 5 and 30 seconds: roughly 352 in 1000 pass through
        let passed = (0..10_000)
            .filter(|_| choose_correction(200, 9000, 10 << 32, 88, &mut rng) != 0)
            .count();
        assert!((2800..=4300).contains(&passed), "passed {passed}");
    }

    #[test]
    fn watchdog_needs_three_consecutive() {
        let mut run = 0;
        assert!(!watchdog_tick(&mut run, true));
        assert!(!watchdog_tick(&mut run, true));
        assert!(!watchdog_tick(&mut run, false)); // streak broken
        assert!(!watchdog_tick(&mut run, true));
        assert!(!watchdog_tick(&mut run, true));
        assert!(watchdog_tick(&mut run, true)); // third in a row fires
        assert!(!watchdog_tick(&mut run, true)); // counter restarted
    }

    #[test]
    fn volume_mute_and_range() {
        let (player, _anchor, _resend) = start_player(test_config(), 0, 4);
        player.set_volume(0.0);
        assert_eq!(player.shared.vol.lock().fix_volume, UNITY_VOLUME);
        player.set_volume(-144.0);
        let params = player.audio_parameters();
        assert!(params.muted);
        assert_eq!(player.shared.vol.lock().fix_volume, 0);
        player.set_volume(-15.0);
        let fix = player.shared.vol.lock().fix_volume;
        assert!(fix > 0 && fix < UNITY_VOLUME);
        player.stop().unwrap();
    }

    #[test]
    fn hardware_volume_sink_keeps_software_gain_at_unity() {
        let anchor: &'static TestAnchor = Box::leak(Box::new(TestAnchor::default()));
        let resend: &'static ResendLog = Box::leak(Box::new(ResendLog::default()));
        let player = Player::new(
            test_config(),
            TestSink::with_hardware_volume(0),
            anchor,
            resend,
        );
        player.set_volume(-15.0);
        assert_eq!(player.shared.vol.lock().fix_volume, UNITY_VOLUME);
        let params = player.audio_parameters();
        assert!(params.hardware_volume);
        assert_eq!(params.software_gain, 1.0);
    }

    #[test]
    fn play_rejects_tiny_frame_size() {
        let anchor: &'static TestAnchor = Box::leak(Box::new(TestAnchor::default()));
        let resend: &'static ResendLog = Box::leak(Box::new(ResendLog::default()));
        let player = Player::new(test_config(), TestSink::new(0), anchor, resend);
        let stream = StreamConfig {
            aes_key: [0; 16],
            aes_iv: [0; 16],
            encrypted: false,
            fmtp: [96, 2, 0, 16, 40, 10, 14, 2, 255, 0, 0, 44100],
        };
        assert!(matches!(
            player.play_with_decoder(stream, Box::new(PcmPassthrough { frame_size: 2 })),
            Err(PlayerError::FrameSizeTooSmall(2))
        ));
        assert!(player.stop().is_err());
    }

    #[test]
    fn play_rejects_wrong_sample_size() {
        let anchor: &'static TestAnchor = Box::leak(Box::new(TestAnchor::default()));
        let resend: &'static ResendLog = Box::leak(Box::new(ResendLog::default()));
        let player = Player::new(test_config(), TestSink::new(0), anchor, resend);
        let stream = StreamConfig {
            aes_key: [0; 16],
            aes_iv: [0; 16],
            encrypted: false,
            fmtp: [96, 352, 0, 24, 40, 10, 14, 2, 255, 0, 0, 44100],
        };
        assert!(matches!(
            player.play_with_decoder(stream, Box::new(PcmPassthrough { frame_size: 352 })),
            Err(PlayerError::UnsupportedSampleSize(24))
        ));
        assert!(player.stop().is_err());
    }

    #[test]
    fn second_play_is_rejected_until_stop() {
        let (player, _anchor, _resend) = start_player(test_config(), 0, 4);
        let stream = StreamConfig {
            aes_key: [0; 16],
            aes_iv: [0; 16],
            encrypted: false,
            fmtp: [96, 4, 0, 16, 40, 10, 14, 2, 255, 0, 0, 44100],
        };
        assert!(matches!(
            player.play_with_decoder(stream.clone(), Box::new(PcmPassthrough { frame_size: 4 })),
            Err(PlayerError::AlreadyPlaying)
        ));
        player.stop().unwrap();
        player
            .play_with_decoder(stream, Box::new(PcmPassthrough { frame_size: 4 }))
            .unwrap();
        player.stop().unwrap();
    }
}
