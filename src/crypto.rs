//! Payload decryption for encrypted sessions: AES-128-CBC over whole
//! 16-byte blocks, with the session IV reloaded for every packet and the
//! trailing partial block carried verbatim.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};

use crate::error::PlayerError;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Session cipher state: key and IV as announced at stream setup.
pub struct PacketCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl PacketCipher {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Decrypt `payload` into `out`. The block-aligned prefix
    /// (`len & !0xF` bytes) is CBC-decrypted with a cipher freshly keyed
    /// from the session IV; the tail bytes are copied unchanged.
    pub fn decrypt(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<(), PlayerError> {
        out.clear();
        out.extend_from_slice(payload);
        let aeslen = payload.len() & !0xF;
        if aeslen > 0 {
            let cipher = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
            cipher
                .decrypt_padded_mut::<NoPadding>(&mut out[..aeslen])
                .map_err(|_| PlayerError::Decrypt)?;
        }
        Ok(())
    }
}
