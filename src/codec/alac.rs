//! ALAC frame decoding through Symphonia (pure Rust).
//!
//! RAOP announces the codec setup as a twelve-integer format vector; all
//! but the first entry are the fields of the ALAC magic cookie, so the
//! decoder is configured by rebuilding the cookie and handing it to
//! Symphonia's registry as codec extra data.

use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_ALAC};
use symphonia::core::formats::Packet;

use super::{CodecError, FrameDecoder};

/// Rebuild the 24-byte ALAC magic cookie from the format vector.
///
/// `fmtp[0]` is the payload type and is not part of the cookie;
/// `fmtp[1]` is the frames-per-packet count, `fmtp[3]` the sample size,
/// `fmtp[11]` the sample rate.
pub fn magic_cookie(fmtp: &[u32; 12]) -> [u8; 24] {
    let mut cookie = [0u8; 24];
    cookie[0..4].copy_from_slice(&fmtp[1].to_be_bytes()); // frames per packet
    cookie[4] = fmtp[2] as u8; // compatible version
    cookie[5] = fmtp[3] as u8; // bit depth
    cookie[6] = fmtp[4] as u8; // rice history mult
    cookie[7] = fmtp[5] as u8; // rice initial history
    cookie[8] = fmtp[6] as u8; // rice k modifier
    cookie[9] = fmtp[7] as u8; // channels
    cookie[10..12].copy_from_slice(&(fmtp[8] as u16).to_be_bytes()); // max run
    cookie[12..16].copy_from_slice(&fmtp[9].to_be_bytes()); // max frame bytes
    cookie[16..20].copy_from_slice(&fmtp[10].to_be_bytes()); // average bit rate
    cookie[20..24].copy_from_slice(&fmtp[11].to_be_bytes()); // sample rate
    cookie
}

/// ALAC decoder wrapper satisfying [`FrameDecoder`].
pub struct AlacDecoder {
    inner: Box<dyn Decoder>,
    frame_size: usize,
}

impl AlacDecoder {
    /// Build a decoder from the announced format vector. Only 16-bit
    /// streams are supported.
    pub fn from_fmtp(fmtp: &[u32; 12]) -> Result<Self, CodecError> {
        let sample_size = fmtp[3];
        if sample_size != 16 {
            return Err(CodecError::Unsupported(format!(
                "sample size {sample_size}, only 16-bit streams are supported"
            )));
        }
        let frame_size = fmtp[1] as usize;
        // the stuffers need room for a splice point inside the frame
        if frame_size < 3 {
            return Err(CodecError::InvalidInput);
        }

        let cookie = magic_cookie(fmtp);
        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_ALAC)
            .with_sample_rate(fmtp[11])
            .with_extra_data(cookie.to_vec().into_boxed_slice());

        let inner = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| CodecError::Other(format!("ALAC decoder init failed: {e}")))?;

        Ok(Self { inner, frame_size })
    }
}

impl FrameDecoder for AlacDecoder {
    fn decode(&mut self, data: &[u8], output: &mut [i16]) -> Result<usize, CodecError> {
        let packet = Packet::new_from_slice(0, 0, self.frame_size as u64, data);
        let decoded = self
            .inner
            .decode(&packet)
            .map_err(|e| CodecError::Other(format!("ALAC decode failed: {e}")))?;
        copy_to_i16(&decoded, output)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

/// Interleave a decoded buffer into signed 16-bit output.
fn copy_to_i16(decoded: &AudioBufferRef, output: &mut [i16]) -> Result<usize, CodecError> {
    match decoded {
        AudioBufferRef::S16(buf) => {
            let channels = buf.spec().channels.count();
            let frames = buf.frames();
            if frames * channels > output.len() {
                return Err(CodecError::BufferTooSmall);
            }
            let mut offset = 0;
            for frame in 0..frames {
                for ch in 0..channels {
                    output[offset] = buf.chan(ch)[frame];
                    offset += 1;
                }
            }
            Ok(offset)
        }
        AudioBufferRef::S32(buf) => {
            let channels = buf.spec().channels.count();
            let frames = buf.frames();
            if frames * channels > output.len() {
                return Err(CodecError::BufferTooSmall);
            }
            let mut offset = 0;
            for frame in 0..frames {
                for ch in 0..channels {
                    output[offset] = (buf.chan(ch)[frame] >> 16) as i16;
                    offset += 1;
                }
            }
            Ok(offset)
        }
        _ => Err(CodecError::Unsupported(
            "decoder produced a sample format other than S16/S32".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FMTP: [u32; 12] = [96, 352, 0, 16, 40, 10, 14, 2, 255, 0, 0, 44100];

    #[test]
    fn cookie_layout() {
        let cookie = magic_cookie(&FMTP);
        assert_eq!(&cookie[0..4], &352u32.to_be_bytes());
        assert_eq!(cookie[4], 0); // compatible version
        assert_eq!(cookie[5], 16); // bit depth
        assert_eq!(cookie[6], 40);
        assert_eq!(cookie[7], 10);
        assert_eq!(cookie[8], 14);
        assert_eq!(cookie[9], 2); // channels
        assert_eq!(&cookie[10..12], &255u16.to_be_bytes());
        assert_eq!(&cookie[20..24], &44100u32.to_be_bytes());
    }

    #[test]
    fn rejects_non_16_bit_streams() {
        let mut fmtp = FMTP;
        fmtp[3] = 24;
        assert!(matches!(
            AlacDecoder::from_fmtp(&fmtp),
            Err(CodecError::Unsupported(_))
        ));
    }

    #[test]
    fn rejects_degenerate_frame_sizes() {
        for frame_size in [0u32, 1, 2] {
            let mut fmtp = FMTP;
            fmtp[1] = frame_size;
            assert!(matches!(
                AlacDecoder::from_fmtp(&fmtp),
                Err(CodecError::InvalidInput)
            ));
        }
    }

    #[test]
    fn builds_from_valid_fmtp() {
        let dec = AlacDecoder::from_fmtp(&FMTP).unwrap();
        assert_eq!(dec.frame_size(), 352);
    }
}
