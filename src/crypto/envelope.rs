//! Envelope metadata codec and the multipart crypto context

use std::collections::BTreeMap;

use super::provider::ContentCryptoMaterial;
use super::{cipher, CEK_ALGORITHM};
use crate::checkpoint::EncryptionRecord;
use crate::error::{Result, VaultError};
use crate::partition::part_count;

/// Wrapped content key, base64
pub const META_KEY: &str = "x-meta-client-side-encryption-key";
/// Wrapped IV, base64
pub const META_START: &str = "x-meta-client-side-encryption-start";
pub const META_CEK_ALG: &str = "x-meta-client-side-encryption-cek-alg";
pub const META_WRAP_ALG: &str = "x-meta-client-side-encryption-wrap-alg";
pub const META_MATDESC: &str = "x-meta-client-side-encryption-matdesc";
pub const META_UNENCRYPTED_MD5: &str = "x-meta-client-side-encryption-unencrypted-content-md5";
pub const META_UNENCRYPTED_LENGTH: &str =
    "x-meta-client-side-encryption-unencrypted-content-length";
pub const META_PART_SIZE: &str = "x-meta-client-side-encryption-part-size";
pub const META_DATA_SIZE: &str = "x-meta-client-side-encryption-data-size";

/// Object metadata headers carrying the wrapped material
pub fn envelope_headers(material: &ContentCryptoMaterial) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(META_KEY.to_string(), material.wrapped_key.clone());
    headers.insert(META_START.to_string(), material.wrapped_iv.clone());
    headers.insert(META_CEK_ALG.to_string(), material.cek_algorithm.clone());
    headers.insert(META_WRAP_ALG.to_string(), material.wrap_algorithm.clone());
    if !material.mat_desc.is_empty() {
        headers.insert(META_MATDESC.to_string(), material.mat_desc.clone());
    }
    headers
}

/// Read the envelope from object headers
///
/// Returns `None` when the object carries no encryption metadata, which means
/// it is stored in plaintext. A partial envelope or an unsupported content
/// algorithm fails with `EncryptionClientError`.
pub fn parse_envelope(headers: &BTreeMap<String, String>) -> Result<Option<EncryptionRecord>> {
    let present = [META_KEY, META_START, META_CEK_ALG, META_WRAP_ALG]
        .iter()
        .filter(|name| headers.contains_key(**name))
        .count();
    if present == 0 {
        return Ok(None);
    }

    let field = |name: &str| {
        headers.get(name).cloned().ok_or_else(|| {
            VaultError::EncryptionClient(format!("incomplete encryption metadata: missing {}", name))
        })
    };
    let record = EncryptionRecord {
        wrapped_key: field(META_KEY)?,
        wrapped_iv: field(META_START)?,
        cek_algorithm: field(META_CEK_ALG)?,
        wrap_algorithm: field(META_WRAP_ALG)?,
        mat_desc: headers.get(META_MATDESC).cloned(),
    };

    if record.cek_algorithm != CEK_ALGORITHM {
        return Err(VaultError::EncryptionClient(format!(
            "unsupported content encryption algorithm: expected {}, got {}",
            CEK_ALGORITHM, record.cek_algorithm
        )));
    }
    Ok(Some(record))
}

/// Plaintext length recorded at upload time
pub fn unencrypted_length(headers: &BTreeMap<String, String>) -> Option<u64> {
    headers
        .get(META_UNENCRYPTED_LENGTH)
        .and_then(|v| v.parse().ok())
}

/// Remove envelope headers, e.g. before handing user metadata back
pub fn strip_envelope(headers: &mut BTreeMap<String, String>) {
    headers.retain(|name, _| !name.starts_with("x-meta-client-side-encryption-"));
}

/// Crypto state of one encrypted multipart session
///
/// Fixes the part layout up front: every part but the last is `part_size`
/// bytes and the parts together cover `data_size` bytes. Each part is
/// encrypted at its absolute offset so parts may be sent in any order.
#[derive(Debug, Clone)]
pub struct MultipartCryptoContext {
    pub material: ContentCryptoMaterial,
    pub part_size: u64,
    pub data_size: u64,
}

impl MultipartCryptoContext {
    /// Build a context; both sizes must be known
    ///
    /// A missing part size fails with `EncryptionClientError`, a missing data
    /// size with `InvalidEncryptionRequest`.
    pub fn new(
        material: ContentCryptoMaterial,
        part_size: Option<u64>,
        data_size: Option<u64>,
    ) -> Result<Self> {
        let part_size = match part_size {
            Some(size) if size > 0 => size,
            _ => {
                return Err(VaultError::EncryptionClient(
                    "part size must be set on the crypto context before initiating an encrypted multipart upload"
                        .to_string(),
                ))
            }
        };
        let data_size = data_size.ok_or_else(|| {
            VaultError::InvalidEncryptionRequest(
                "data size must be set on the crypto context before initiating an encrypted multipart upload"
                    .to_string(),
            )
        })?;
        Ok(Self {
            material,
            part_size,
            data_size,
        })
    }

    /// Number of parts the layout implies; an empty object has one empty part
    pub fn part_count(&self) -> u64 {
        part_count(self.data_size, self.part_size).max(1)
    }

    /// Plaintext offset of a part
    pub fn part_offset(&self, part_number: u32) -> u64 {
        (part_number.saturating_sub(1) as u64) * self.part_size
    }

    /// Length the layout requires for a part
    pub fn expected_part_length(&self, part_number: u32) -> Result<u64> {
        if part_number == 0 || part_number as u64 > self.part_count() {
            return Err(VaultError::InvalidEncryptionRequest(format!(
                "part {} outside the {} parts of the encrypted upload",
                part_number,
                self.part_count()
            )));
        }
        let offset = self.part_offset(part_number);
        Ok(self.part_size.min(self.data_size - offset))
    }

    /// Encrypt one part in place after checking it fits the layout
    pub fn encrypt_part(&self, part_number: u32, data: &mut [u8]) -> Result<()> {
        let expected = self.expected_part_length(part_number)?;
        if data.len() as u64 != expected {
            return Err(VaultError::InvalidEncryptionRequest(format!(
                "part {} is {} bytes, the encrypted layout requires {}",
                part_number,
                data.len(),
                expected
            )));
        }
        cipher::transform_at(
            &self.material.key,
            &self.material.iv,
            self.part_offset(part_number),
            data,
        )
    }

    /// Check a completion list covers exactly parts `1..=part_count` in order
    pub fn check_complete<I>(&self, part_numbers: I) -> Result<()>
    where
        I: IntoIterator<Item = u32>,
    {
        let supplied: Vec<u32> = part_numbers.into_iter().collect();
        let expected = self.part_count();
        let in_order = supplied
            .iter()
            .enumerate()
            .all(|(index, number)| *number as usize == index + 1);
        if supplied.len() as u64 != expected || !in_order {
            return Err(VaultError::InvalidEncryptionRequest(format!(
                "completion lists parts {:?}, the encrypted upload has parts 1..={}",
                supplied, expected
            )));
        }
        Ok(())
    }

    /// Metadata headers for the initiate request
    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = envelope_headers(&self.material);
        headers.insert(META_PART_SIZE.to_string(), self.part_size.to_string());
        headers.insert(META_DATA_SIZE.to_string(), self.data_size.to_string());
        headers.insert(META_UNENCRYPTED_LENGTH.to_string(), self.data_size.to_string());
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, SymmetricKeyProvider};

    fn material() -> ContentCryptoMaterial {
        SymmetricKeyProvider::generate("test")
            .generate_content_material()
            .unwrap()
    }

    #[test]
    fn test_envelope_round_trip() {
        let material = material();
        let headers = envelope_headers(&material);
        assert_eq!(headers.get(META_CEK_ALG).unwrap(), CEK_ALGORITHM);
        let record = parse_envelope(&headers).unwrap().unwrap();
        assert_eq!(record, material.to_record());
    }

    #[test]
    fn test_plain_object_has_no_envelope() {
        let mut headers = BTreeMap::new();
        headers.insert("x-meta-owner".to_string(), "ops".to_string());
        assert!(parse_envelope(&headers).unwrap().is_none());
    }

    #[test]
    fn test_partial_or_foreign_envelope_rejected() {
        let mut headers = envelope_headers(&material());
        headers.remove(META_START);
        assert_eq!(parse_envelope(&headers).unwrap_err().code(), "EncryptionClientError");

        let mut headers = envelope_headers(&material());
        headers.insert(META_CEK_ALG.to_string(), "AES/CBC/PKCS5Padding".to_string());
        let err = parse_envelope(&headers).unwrap_err();
        assert!(err.to_string().contains("expected AES/CTR/NoPadding"));
        assert!(err.to_string().contains("AES/CBC/PKCS5Padding"));
    }

    #[test]
    fn test_context_requires_sizes() {
        let err = MultipartCryptoContext::new(material(), None, Some(10)).unwrap_err();
        assert_eq!(err.code(), "EncryptionClientError");
        let err = MultipartCryptoContext::new(material(), Some(10), None).unwrap_err();
        assert_eq!(err.code(), "InvalidEncryptionRequest");
    }

    #[test]
    fn test_context_layout() {
        let ctx = MultipartCryptoContext::new(material(), Some(100), Some(250)).unwrap();
        assert_eq!(ctx.part_count(), 3);
        assert_eq!(ctx.expected_part_length(1).unwrap(), 100);
        assert_eq!(ctx.expected_part_length(3).unwrap(), 50);
        assert!(ctx.expected_part_length(4).is_err());

        let mut short = vec![0u8; 99];
        assert_eq!(
            ctx.encrypt_part(1, &mut short).unwrap_err().code(),
            "InvalidEncryptionRequest"
        );
    }

    #[test]
    fn test_parts_encrypt_like_whole_object() {
        let ctx = MultipartCryptoContext::new(material(), Some(123), Some(400)).unwrap();
        let plaintext: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();

        let mut whole = plaintext.clone();
        cipher::transform_at(&ctx.material.key, &ctx.material.iv, 0, &mut whole).unwrap();

        let mut joined = Vec::new();
        for (index, chunk) in plaintext.chunks(123).enumerate() {
            let mut part = chunk.to_vec();
            ctx.encrypt_part(index as u32 + 1, &mut part).unwrap();
            joined.extend(part);
        }
        assert_eq!(joined, whole);
    }

    #[test]
    fn test_check_complete() {
        let ctx = MultipartCryptoContext::new(material(), Some(100), Some(250)).unwrap();
        assert!(ctx.check_complete([1, 2, 3]).is_ok());
        assert_eq!(
            ctx.check_complete([1, 2]).unwrap_err().code(),
            "InvalidEncryptionRequest"
        );
        assert!(ctx.check_complete([1, 3, 2]).is_err());

        let empty = MultipartCryptoContext::new(material(), Some(100), Some(0)).unwrap();
        assert_eq!(empty.part_count(), 1);
        assert_eq!(empty.expected_part_length(1).unwrap(), 0);
    }

    #[test]
    fn test_context_headers() {
        let ctx = MultipartCryptoContext::new(material(), Some(100), Some(250)).unwrap();
        let headers = ctx.headers();
        assert_eq!(headers.get(META_PART_SIZE).unwrap(), "100");
        assert_eq!(headers.get(META_DATA_SIZE).unwrap(), "250");
        assert_eq!(unencrypted_length(&headers), Some(250));

        let mut stripped = headers.clone();
        stripped.insert("x-meta-owner".to_string(), "ops".to_string());
        strip_envelope(&mut stripped);
        assert_eq!(stripped.len(), 1);
    }
}
