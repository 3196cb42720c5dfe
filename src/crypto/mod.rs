/*!
 * Client-side envelope encryption
 *
 * Each object version is encrypted with its own random content key and IV
 * under AES-256-CTR. The content material is wrapped by a [`CryptoProvider`]
 * holding a master key and travels with the object as
 * `x-meta-client-side-encryption-*` metadata. The keystream is positioned by
 * absolute plaintext offset, so parts and ranges can be processed in any order.
 */

pub mod cipher;
pub mod envelope;
pub mod provider;

pub use cipher::{transform_at, ContentCipher};
pub use envelope::{
    envelope_headers, parse_envelope, strip_envelope, unencrypted_length, MultipartCryptoContext,
};
pub use provider::{
    ContentCryptoMaterial, CryptoProvider, EncryptionMaterials, SymmetricKeyProvider,
    SYMMETRIC_WRAP_ALGORITHM,
};

/// Content encryption algorithm name stored with every encrypted object
pub const CEK_ALGORITHM: &str = "AES/CTR/NoPadding";

/// Content key length (AES-256)
pub const CONTENT_KEY_LEN: usize = 32;

/// Content IV length (one AES block)
pub const CONTENT_IV_LEN: usize = 16;
