//! AES-256-CTR content cipher addressed by absolute byte offset

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;

use super::{CONTENT_IV_LEN, CONTENT_KEY_LEN};
use crate::error::{Result, VaultError};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Keystream positioned at an absolute offset into the plaintext
///
/// Encrypting bytes `[o, o + n)` with a cipher created at offset `o` yields the
/// same ciphertext as encrypting the whole object in one pass, so parts can be
/// processed in any order. Decryption is the same operation.
pub struct ContentCipher {
    inner: Aes256Ctr,
}

impl ContentCipher {
    pub fn new(key: &[u8], iv: &[u8], offset: u64) -> Result<Self> {
        if key.len() != CONTENT_KEY_LEN || iv.len() != CONTENT_IV_LEN {
            return Err(VaultError::EncryptionClient(format!(
                "content key/IV must be {}/{} bytes, got {}/{}",
                CONTENT_KEY_LEN,
                CONTENT_IV_LEN,
                key.len(),
                iv.len()
            )));
        }
        let mut inner = Aes256Ctr::new_from_slices(key, iv)
            .map_err(|e| VaultError::EncryptionClient(format!("cannot create cipher: {}", e)))?;
        inner
            .try_seek(offset)
            .map_err(|e| VaultError::EncryptionClient(format!("cannot seek keystream to {}: {}", offset, e)))?;
        Ok(Self { inner })
    }

    /// Encrypt or decrypt `buf` in place, advancing the keystream
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

/// Transform `buf` in place as the bytes at `offset` of the object
pub fn transform_at(key: &[u8], iv: &[u8], offset: u64, buf: &mut [u8]) -> Result<()> {
    ContentCipher::new(key, iv, offset)?.apply(buf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];
    const IV: [u8; 16] = [9u8; 16];

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 256) as u8).collect()
    }

    #[test]
    fn test_round_trip() {
        let original = plaintext(1000);
        let mut buf = original.clone();
        transform_at(&KEY, &IV, 0, &mut buf).unwrap();
        assert_ne!(buf, original);
        transform_at(&KEY, &IV, 0, &mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn test_parts_at_unaligned_offsets_match_single_pass() {
        let original = plaintext(10_000);
        let mut whole = original.clone();
        transform_at(&KEY, &IV, 0, &mut whole).unwrap();

        // 777 is not a multiple of the 16-byte block size
        let mut pieces = Vec::new();
        for (index, chunk) in original.chunks(777).enumerate().rev() {
            let mut part = chunk.to_vec();
            transform_at(&KEY, &IV, (index * 777) as u64, &mut part).unwrap();
            pieces.push((index, part));
        }
        pieces.sort_by_key(|(index, _)| *index);
        let joined: Vec<u8> = pieces.into_iter().flat_map(|(_, p)| p).collect();
        assert_eq!(joined, whole);
    }

    #[test]
    fn test_ranged_decrypt() {
        let original = plaintext(4096);
        let mut encrypted = original.clone();
        transform_at(&KEY, &IV, 0, &mut encrypted).unwrap();

        let mut slice = encrypted[1001..2003].to_vec();
        transform_at(&KEY, &IV, 1001, &mut slice).unwrap();
        assert_eq!(slice, &original[1001..2003]);
    }

    #[test]
    fn test_incremental_apply() {
        let original = plaintext(300);
        let mut once = original.clone();
        transform_at(&KEY, &IV, 5, &mut once).unwrap();

        let mut twice = original.clone();
        let mut cipher = ContentCipher::new(&KEY, &IV, 5).unwrap();
        let (a, b) = twice.split_at_mut(101);
        cipher.apply(a);
        cipher.apply(b);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_bad_key_length() {
        let err = ContentCipher::new(&[0u8; 16], &IV, 0).err().unwrap();
        assert_eq!(err.code(), "EncryptionClientError");
    }
}
