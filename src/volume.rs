//! Output gain: 16.16 fixed-point attenuation applied per sample, with
//! triangular-PDF dither injected whenever the gain is below unity.

/// Unity gain in 16.16 fixed point.
pub const UNITY_VOLUME: u32 = 0x10000;

/// AirPlay volume value meaning "mute".
pub const MUTE_VOLUME: f64 = -144.0;

/// Default attenuation range: `linear = 10^(attn / 1000)`, so -4810 is
/// a gain of roughly 1.5e-5.
pub const MAX_ATTENUATION: i32 = 0;
pub const MIN_ATTENUATION: i32 = -4810;

/// Published volume state, refreshed on every volume change.
#[derive(Debug, Clone, Copy)]
pub struct AudioParameters {
    pub airplay_volume: f64,
    pub current_attenuation: i32,
    pub minimum_attenuation: i32,
    pub maximum_attenuation: i32,
    pub muted: bool,
    pub hardware_volume: bool,
    pub software_gain: f64,
}

impl Default for AudioParameters {
    fn default() -> Self {
        Self {
            airplay_volume: 0.0,
            current_attenuation: MAX_ATTENUATION,
            minimum_attenuation: MIN_ATTENUATION,
            maximum_attenuation: MAX_ATTENUATION,
            muted: false,
            hardware_volume: false,
            software_gain: 1.0,
        }
    }
}

/// Triangular-PDF dither source: a 69069-multiplier LCG whose low 16
/// bits provide the new tap each call, with the previous value as the
/// second tap. Both taps start at zero.
pub struct DitherLcg {
    state: u32,
    prev: i32,
}

impl DitherLcg {
    pub fn new() -> Self {
        Self { state: 0, prev: 0 }
    }

    /// Next dither value: new tap minus previous tap.
    fn next(&mut self) -> i32 {
        self.state = self.state.wrapping_mul(69069).wrapping_add(3);
        let cur = (self.state & 0xFFFF) as i32;
        let dither = cur - self.prev;
        self.prev = cur;
        dither
    }
}

impl Default for DitherLcg {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale one sample by `fix_volume` (16.16), adding TPDF dither below
/// unity. At unity this is the identity.
pub fn dithered_vol(sample: i16, fix_volume: u32, dither: &mut DitherLcg) -> i16 {
    let mut out = i64::from(sample) * i64::from(fix_volume);
    if fix_volume < UNITY_VOLUME {
        out += i64::from(dither.next());
    }
    (out >> 16) as i16
}

/// Map an AirPlay volume in [-30, 0] onto the attenuation range
/// [`min_attn`, `max_attn`] by straight-line interpolation.
pub fn vol2attn(volume: f64, max_attn: i32, min_attn: i32) -> i32 {
    let clamped = volume.clamp(-30.0, 0.0);
    let frac = (clamped + 30.0) / 30.0;
    (f64::from(min_attn) + frac * f64::from(max_attn - min_attn)).round() as i32
}

/// Linear gain for an attenuation on the vol2attn scale.
pub fn attenuation_to_linear(attn: i32) -> f64 {
    10f64.powf(f64::from(attn) / 1000.0)
}

/// 16.16 fixed-point gain for a linear factor.
pub fn fix_volume_for(linear: f64) -> u32 {
    (65536.0 * linear).round() as u32
}
