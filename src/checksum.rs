/*!
 * Checksums used on the wire and for end-to-end verification
 *
 * CRC-32 is computed per part and combined into an object-level value, so a
 * finished transfer can be checked against the service without re-reading data.
 */

use base64::{engine::general_purpose::STANDARD, Engine as _};
use crc32fast::Hasher;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::Result;

/// CRC-32 (IEEE) of a buffer
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// CRC-32 of `A || B` given `crc(A)`, `crc(B)` and the length of `B`
pub fn combine_crc32(crc_a: u32, crc_b: u32, len_b: u64) -> u32 {
    let mut left = Hasher::new_with_initial(crc_a);
    let right = Hasher::new_with_initial_len(crc_b, len_b);
    left.combine(&right);
    left.finalize()
}

/// Fold ordered `(crc, len)` pairs into the CRC-32 of their concatenation
pub fn combine_all<I>(parts: I) -> u32
where
    I: IntoIterator<Item = (u32, u64)>,
{
    parts
        .into_iter()
        .fold(0u32, |acc, (crc, len)| combine_crc32(acc, crc, len))
}

/// Base64 MD5 digest, as sent in `content-md5`
pub fn content_md5_base64(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

/// Hex MD5 digest, the ETag of a single-part object
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Streaming MD5 of a local file
pub fn file_md5_hex(path: &Path) -> Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
