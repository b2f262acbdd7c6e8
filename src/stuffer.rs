//! Frame stuffing: stretch or shrink one frame by a single stereo sample
//! so playback tracks the source clock without changing the output rate.
//!
//! Two renditions: a splice at one random point (cheap, inaudible at the
//! corrected rates the player allows), and a whole-frame linear
//! interpolation that spreads the correction across the frame.

use rand::Rng;

use crate::volume::{dithered_vol, DitherLcg, UNITY_VOLUME};

/// Integer midpoint of two samples. The i32 sum cannot overflow, and the
/// mean of two i16 values always fits back into i16.
fn shortmean(a: i16, b: i16) -> i16 {
    ((i32::from(a) + i32::from(b)) / 2) as i16
}

/// Splice stuffer: copy through the volume scaler, inserting a bridging
/// sample or skipping one input sample at a uniformly chosen splice
/// point. Returns the number of stereo frames written
/// (`frames + stuff`).
pub fn stuff_basic<R: Rng>(
    input: &[i16],
    output: &mut [i16],
    stuff: i32,
    fix_volume: u32,
    dither: &mut DitherLcg,
    rng: &mut R,
) -> usize {
    debug_assert!(input.len() % 2 == 0);
    debug_assert!((-1..=1).contains(&stuff));
    let frames = input.len() / 2;

    let splice = if stuff != 0 {
        rng.gen_range(1..=frames - 2)
    } else {
        frames
    };

    let mut out = 0;
    let mut inp = 0;
    while inp < 2 * splice {
        output[out] = dithered_vol(input[inp], fix_volume, dither);
        output[out + 1] = dithered_vol(input[inp + 1], fix_volume, dither);
        out += 2;
        inp += 2;
    }

    if stuff == 1 {
        // bridge the splice with the midpoint of its neighbours
        output[out] = dithered_vol(shortmean(input[inp - 2], input[inp]), fix_volume, dither);
        output[out + 1] = dithered_vol(shortmean(input[inp - 1], input[inp + 1]), fix_volume, dither);
        out += 2;
    } else if stuff == -1 {
        inp += 2;
    }

    while inp < input.len() {
        output[out] = dithered_vol(input[inp], fix_volume, dither);
        output[out + 1] = dithered_vol(input[inp + 1], fix_volume, dither);
        out += 2;
        inp += 2;
    }

    out / 2
}

/// Interpolating stuffer: resample the whole frame to `frames + stuff`
/// stereo samples by linear interpolation, then pin the first and last
/// five samples to the raw input so the block edges stay continuous with
/// the neighbouring frames. The volume scaler runs only below unity.
pub fn stuff_interpolated(
    input: &[i16],
    output: &mut [i16],
    stuff: i32,
    fix_volume: u32,
    dither: &mut DitherLcg,
) -> usize {
    debug_assert!(input.len() % 2 == 0);
    debug_assert!((-1..=1).contains(&stuff));
    let frames = input.len() / 2;
    let out_frames = (frames as i64 + i64::from(stuff)) as usize;

    if stuff == 0 {
        if fix_volume == UNITY_VOLUME {
            output[..input.len()].copy_from_slice(input);
        } else {
            for (o, i) in output[..input.len()].iter_mut().zip(input) {
                *o = dithered_vol(*i, fix_volume, dither);
            }
        }
        return frames;
    }

    let step = (frames - 1) as f64 / (out_frames - 1) as f64;
    for j in 0..out_frames {
        let pos = j as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let next = (idx + 1).min(frames - 1);
        for ch in 0..2 {
            let a = f64::from(input[2 * idx + ch]);
            let b = f64::from(input[2 * next + ch]);
            output[2 * j + ch] = (a + (b - a) * frac).round() as i16;
        }
    }

    let edge = 5.min(frames).min(out_frames);
    for j in 0..edge {
        output[2 * j] = input[2 * j];
        output[2 * j + 1] = input[2 * j + 1];
    }
    for j in 0..edge {
        let o = out_frames - 1 - j;
        let i = frames - 1 - j;
        output[2 * o] = input[2 * i];
        output[2 * o + 1] = input[2 * i + 1];
    }

    if fix_volume != UNITY_VOLUME {
        for s in &mut output[..2 * out_frames] {
            *s = dithered_vol(*s, fix_volume, dither);
        }
    }

    out_frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(frames: usize) -> Vec<i16> {
        (0..2 * frames)
            .map(|i| (i as i16).wrapping_mul(13))
            .collect()
    }

    #[test]
    fn shortmean_midpoints() {
        assert_eq!(shortmean(0, 10), 5);
        assert_eq!(shortmean(-10, 10), 0);
        assert_eq!(shortmean(i16::MIN, i16::MIN), i16::MIN);
        assert_eq!(shortmean(i16::MAX, i16::MAX), i16::MAX);
    }

    #[test]
    fn basic_identity_at_unity() {
        let input = ramp(352);
        let mut output = vec![0i16; 2 * 353];
        let mut lcg = DitherLcg::new();
        let mut rng = StdRng::seed_from_u64(1);
        let n = stuff_basic(&input, &mut output, 0, UNITY_VOLUME, &mut lcg, &mut rng);
        assert_eq!(n, 352);
        assert_eq!(&output[..input.len()], &input[..]);
    }

    #[test]
    fn basic_insert_adds_one_frame() {
        let input = ramp(352);
        let mut output = vec![0i16; 2 * 353];
        let mut lcg = DitherLcg::new();
        let mut rng = StdRng::seed_from_u64(2);
        let n = stuff_basic(&input, &mut output, 1, UNITY_VOLUME, &mut lcg, &mut rng);
        assert_eq!(n, 353);
        // all input samples survive; find the inserted frame by first mismatch
        let mut k = 0;
        while k < input.len() && output[k] == input[k] {
            k += 1;
        }
        let splice = k / 2;
        assert!(splice >= 1 && splice <= 350);
        // the inserted stereo sample is the midpoint of its neighbours
        assert_eq!(
            output[2 * splice],
            shortmean(input[2 * (splice - 1)], input[2 * splice])
        );
        assert_eq!(
            output[2 * splice + 1],
            shortmean(input[2 * splice - 1], input[2 * splice + 1])
        );
        // the remainder is shifted by one frame
        assert_eq!(&output[2 * (splice + 1)..2 * 353], &input[2 * splice..]);
    }

    #[test]
    fn basic_delete_drops_one_frame() {
        let input = ramp(352);
        let mut output = vec![0i16; 2 * 353];
        let mut lcg = DitherLcg::new();
        let mut rng = StdRng::seed_from_u64(3);
        let n = stuff_basic(&input, &mut output, -1, UNITY_VOLUME, &mut lcg, &mut rng);
        assert_eq!(n, 351);
        let mut k = 0;
        while k < 2 * 351 && output[k] == input[k] {
            k += 1;
        }
        let splice = k / 2;
        assert!(splice >= 1 && splice <= 350);
        assert_eq!(&output[2 * splice..2 * 351], &input[2 * (splice + 1)..]);
    }

    #[test]
    fn interpolated_lengths_and_edges() {
        let input = ramp(352);
        let mut output = vec![0i16; 2 * 353];
        let mut lcg = DitherLcg::new();

        for stuff in [-1i32, 1] {
            let n = stuff_interpolated(&input, &mut output, stuff, UNITY_VOLUME, &mut lcg);
            assert_eq!(n as i64, 352 + i64::from(stuff));
            // first and last five stereo samples are the raw input
            assert_eq!(&output[..10], &input[..10]);
            assert_eq!(&output[2 * n - 10..2 * n], &input[input.len() - 10..]);
        }
    }

    #[test]
    fn interpolated_zero_stuff_is_identity_at_unity() {
        let input = ramp(64);
        let mut output = vec![0i16; 2 * 65];
        let mut lcg = DitherLcg::new();
        let n = stuff_interpolated(&input, &mut output, 0, UNITY_VOLUME, &mut lcg);
        assert_eq!(n, 64);
        assert_eq!(&output[..input.len()], &input[..]);
    }

    #[test]
    fn interpolated_output_is_monotone_for_monotone_input() {
        // a rising ramp must stay rising after interpolation
        let frames = 100;
        let input: Vec<i16> = (0..2 * frames)
            .map(|i| ((i / 2) * 20) as i16)
            .collect();
        let mut output = vec![0i16; 2 * (frames + 1)];
        let mut lcg = DitherLcg::new();
        let n = stuff_interpolated(&input, &mut output, 1, UNITY_VOLUME, &mut lcg);
        for j in 1..n {
            assert!(output[2 * j] >= output[2 * (j - 1)]);
        }
    }
}
