//! Key providers: generate content material and wrap/unwrap it

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::{CEK_ALGORITHM, CONTENT_IV_LEN, CONTENT_KEY_LEN};
use crate::checkpoint::EncryptionRecord;
use crate::error::{Result, VaultError};

/// Wrap algorithm of [`SymmetricKeyProvider`]
pub const SYMMETRIC_WRAP_ALGORITHM: &str = "ChaCha20-Poly1305";

/// Size of the master key in bytes (256 bits)
const MASTER_KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits for ChaCha20-Poly1305)
const NONCE_SIZE: usize = 12;

/// Poly1305 tag length
const TAG_SIZE: usize = 16;

/// Content key and IV of one object version, with their wrapped forms
#[derive(Clone)]
pub struct ContentCryptoMaterial {
    pub key: Zeroizing<Vec<u8>>,
    pub iv: Zeroizing<Vec<u8>>,
    /// Base64 of the wrapped key
    pub wrapped_key: String,
    /// Base64 of the wrapped IV
    pub wrapped_iv: String,
    pub wrap_algorithm: String,
    pub cek_algorithm: String,
    pub mat_desc: String,
}

impl ContentCryptoMaterial {
    /// Checkpoint form of the material
    pub fn to_record(&self) -> EncryptionRecord {
        EncryptionRecord {
            wrapped_key: self.wrapped_key.clone(),
            wrapped_iv: self.wrapped_iv.clone(),
            wrap_algorithm: self.wrap_algorithm.clone(),
            cek_algorithm: self.cek_algorithm.clone(),
            mat_desc: (!self.mat_desc.is_empty()).then(|| self.mat_desc.clone()),
        }
    }
}

impl std::fmt::Debug for ContentCryptoMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCryptoMaterial")
            .field("wrap_algorithm", &self.wrap_algorithm)
            .field("cek_algorithm", &self.cek_algorithm)
            .field("mat_desc", &self.mat_desc)
            .finish_non_exhaustive()
    }
}

/// Holds a master key and wraps content keys with it
pub trait CryptoProvider: Send + Sync {
    /// Name stored in `client-side-encryption-wrap-alg`
    fn wrap_algorithm(&self) -> &str;

    /// Material description stored in `client-side-encryption-matdesc`
    fn description(&self) -> &str;

    /// Fail with `EncryptionClientError` if the master key is unusable
    fn validate(&self) -> Result<()>;

    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn unwrap(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Fresh random content key and IV, wrapped under the master key
    fn generate_content_material(&self) -> Result<ContentCryptoMaterial> {
        self.validate()?;

        let mut key = Zeroizing::new(vec![0u8; CONTENT_KEY_LEN]);
        let mut iv = Zeroizing::new(vec![0u8; CONTENT_IV_LEN]);
        rand::rng().fill_bytes(key.as_mut_slice());
        rand::rng().fill_bytes(iv.as_mut_slice());

        let wrapped_key = BASE64.encode(self.wrap(&key)?);
        let wrapped_iv = BASE64.encode(self.wrap(&iv)?);

        Ok(ContentCryptoMaterial {
            key,
            iv,
            wrapped_key,
            wrapped_iv,
            wrap_algorithm: self.wrap_algorithm().to_string(),
            cek_algorithm: CEK_ALGORITHM.to_string(),
            mat_desc: self.description().to_string(),
        })
    }

    /// Recover the content material from its wrapped form
    fn unwrap_content_material(&self, record: &EncryptionRecord) -> Result<ContentCryptoMaterial> {
        self.validate()?;

        if record.wrap_algorithm != self.wrap_algorithm() {
            return Err(VaultError::EncryptionClient(format!(
                "unsupported key wrap algorithm: expected {}, got {}",
                self.wrap_algorithm(),
                record.wrap_algorithm
            )));
        }
        if record.cek_algorithm != CEK_ALGORITHM {
            return Err(VaultError::EncryptionClient(format!(
                "unsupported content encryption algorithm: expected {}, got {}",
                CEK_ALGORITHM, record.cek_algorithm
            )));
        }

        let decode = |value: &str, what: &str| {
            BASE64
                .decode(value)
                .map_err(|e| VaultError::EncryptionClient(format!("corrupt wrapped {}: {}", what, e)))
        };
        let key = self.unwrap(&decode(&record.wrapped_key, "key")?)?;
        let iv = self.unwrap(&decode(&record.wrapped_iv, "IV")?)?;
        if key.len() != CONTENT_KEY_LEN || iv.len() != CONTENT_IV_LEN {
            return Err(VaultError::EncryptionClient(format!(
                "unwrapped key/IV have wrong size: {}/{}",
                key.len(),
                iv.len()
            )));
        }

        Ok(ContentCryptoMaterial {
            key,
            iv,
            wrapped_key: record.wrapped_key.clone(),
            wrapped_iv: record.wrapped_iv.clone(),
            wrap_algorithm: record.wrap_algorithm.clone(),
            cek_algorithm: record.cek_algorithm.clone(),
            mat_desc: record.mat_desc.clone().unwrap_or_default(),
        })
    }
}

/// Wraps content keys with a 256-bit master key using ChaCha20-Poly1305
///
/// Wrapped output is `nonce || ciphertext || tag`.
pub struct SymmetricKeyProvider {
    master_key: Zeroizing<Vec<u8>>,
    description: String,
}

impl SymmetricKeyProvider {
    /// Provider over raw key bytes; a key of the wrong size fails `validate`
    pub fn new(master_key: &[u8], description: impl Into<String>) -> Self {
        Self {
            master_key: Zeroizing::new(master_key.to_vec()),
            description: description.into(),
        }
    }

    /// Provider with a freshly generated master key
    pub fn generate(description: impl Into<String>) -> Self {
        let mut key = vec![0u8; MASTER_KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        let provider = Self::new(&key, description);
        zeroize::Zeroize::zeroize(&mut key);
        provider
    }

    /// Provider over a base64-encoded master key
    pub fn from_base64(encoded: &str, description: impl Into<String>) -> Result<Self> {
        let key = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|e| VaultError::EncryptionClient(format!("invalid master key encoding: {}", e)))?,
        );
        Ok(Self::new(&key, description))
    }

    /// Master key as base64, for storing it
    pub fn master_key_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.master_key.as_slice()))
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        self.validate()?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&self.master_key)))
    }
}

impl CryptoProvider for SymmetricKeyProvider {
    fn wrap_algorithm(&self) -> &str {
        SYMMETRIC_WRAP_ALGORITHM
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn validate(&self) -> Result<()> {
        if self.master_key.len() != MASTER_KEY_SIZE {
            return Err(VaultError::EncryptionClient(format!(
                "master key must be {} bytes, got {}",
                MASTER_KEY_SIZE,
                self.master_key.len()
            )));
        }
        Ok(())
    }

    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| VaultError::EncryptionClient(format!("key wrap failed: {}", e)))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let cipher = self.cipher()?;
        if wrapped.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::EncryptionClient(format!(
                "wrapped key too short: {} bytes",
                wrapped.len()
            )));
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| {
                VaultError::EncryptionClient(
                    "cannot unwrap content key: wrong master key or corrupted metadata".to_string(),
                )
            })
    }
}

/// Providers available to a client
///
/// The primary provider encrypts new objects. On decryption the provider whose
/// description matches the object's material description is used.
#[derive(Clone)]
pub struct EncryptionMaterials {
    primary: Arc<dyn CryptoProvider>,
    additional: Vec<Arc<dyn CryptoProvider>>,
}

impl EncryptionMaterials {
    pub fn new(primary: Arc<dyn CryptoProvider>) -> Self {
        Self {
            primary,
            additional: Vec::new(),
        }
    }

    /// Add a provider used only for decryption
    pub fn with_provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.additional.push(provider);
        self
    }

    pub fn primary(&self) -> &Arc<dyn CryptoProvider> {
        &self.primary
    }

    /// Fail with `EncryptionClientError` if the primary provider is unusable
    pub fn validate(&self) -> Result<()> {
        self.primary.validate()
    }

    /// Provider whose description is `mat_desc`
    pub fn provider_for(&self, mat_desc: &str) -> Result<&Arc<dyn CryptoProvider>> {
        std::iter::once(&self.primary)
            .chain(self.additional.iter())
            .find(|p| p.description() == mat_desc)
            .ok_or_else(|| {
                VaultError::EncryptionClient(format!(
                    "no encryption materials match description '{}'",
                    mat_desc
                ))
            })
    }

    /// New content material under the primary provider
    pub fn generate_content_material(&self) -> Result<ContentCryptoMaterial> {
        self.primary.generate_content_material()
    }

    /// Unwrap stored material with the matching provider
    pub fn unwrap_content_material(&self, record: &EncryptionRecord) -> Result<ContentCryptoMaterial> {
        let mat_desc = record.mat_desc.as_deref().unwrap_or_default();
        self.provider_for(mat_desc)?.unwrap_content_material(record)
    }
}

impl std::fmt::Debug for EncryptionMaterials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionMaterials")
            .field("primary", &self.primary.description())
            .field("additional", &self.additional.len())
            .finish()
    }
}
