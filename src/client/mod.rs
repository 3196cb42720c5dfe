/*!
 * Transfer client
 *
 * One client type covers plain and encryption-enabled use. What a client may
 * do is described by its [`ClientCapabilities`]; operations check them and
 * fail uniformly with `EncryptionClientError` or `ClientDisabled`.
 *
 * Object operations live in `object`, multipart primitives in `multipart`,
 * and the async task API in `task`. The resumable transfers built on top of
 * them live in [`crate::transfer`].
 */

pub mod gate;
pub mod multipart;
pub mod object;
pub mod task;

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::crypto::EncryptionMaterials;
use crate::error::{Result, VaultError};
use crate::retry::{with_retry, RetryPolicy};
use crate::signer::Signer;
use crate::transport::{HttpRequest, HttpResponse, Transport};

pub use gate::ClientGate;
pub use multipart::{MultipartUpload, MultipartUploadRequest};
pub use object::{AppendOutput, GetObjectOptions, GetObjectOutput, WriteOutput};
pub use task::TaskHandle;
use task::TaskExecutor;

/// What a client is able to do right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCapabilities {
    /// Object content is encrypted client-side
    pub supports_encryption: bool,
    /// Requests may be sent; false once the client is disabled
    pub requests_enabled: bool,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    signer: Option<Arc<dyn Signer>>,
    materials: Option<EncryptionMaterials>,
    gate: ClientGate,
    retry: RetryPolicy,
    executor: TaskExecutor,
}

/// Client for object operations and resumable transfers
///
/// Cheap to clone; clones share the transport, the configuration and the
/// enable/disable gate.
#[derive(Clone)]
pub struct TransferClient {
    inner: Arc<ClientInner>,
}

/// Builder for [`TransferClient`]
pub struct TransferClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    signer: Option<Arc<dyn Signer>>,
    materials: Option<EncryptionMaterials>,
}

impl TransferClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Make this an encryption client
    ///
    /// The materials are not checked here; an unusable master key makes every
    /// encryption-dependent operation fail with `EncryptionClientError`.
    pub fn encryption(mut self, materials: EncryptionMaterials) -> Self {
        self.materials = Some(materials);
        self
    }

    pub fn build(self) -> Result<TransferClient> {
        self.config.validate()?;
        let retry = RetryPolicy::from_config(&self.config);
        let executor = TaskExecutor::new(self.config.async_threads);
        info!(
            "Created {} client (max_retries={}, crc_check={})",
            if self.materials.is_some() { "encryption" } else { "plain" },
            self.config.max_retries,
            self.config.crc_check_enabled
        );
        Ok(TransferClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport: self.transport,
                signer: self.signer,
                materials: self.materials,
                gate: ClientGate::new(),
                retry,
                executor,
            }),
        })
    }
}

impl TransferClient {
    /// Start building a client over `transport`
    pub fn builder(transport: Arc<dyn Transport>) -> TransferClientBuilder {
        TransferClientBuilder {
            transport,
            config: ClientConfig::default(),
            signer: None,
            materials: None,
        }
    }

    /// Plain client with default configuration
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(transport).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            supports_encryption: self.inner.materials.is_some(),
            requests_enabled: self.inner.gate.is_enabled(),
        }
    }

    /// Allow requests again after [`disable`](Self::disable)
    pub fn enable(&self) {
        self.inner.gate.enable();
        info!("Client enabled");
    }

    /// Fail every queued, in-flight and future request with `ClientDisabled`
    ///
    /// Retry waits in progress wake immediately.
    pub fn disable(&self) {
        self.inner.gate.disable();
        info!("Client disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.gate.is_enabled()
    }

    pub(crate) fn gate(&self) -> &ClientGate {
        &self.inner.gate
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub(crate) fn signer(&self) -> Option<&Arc<dyn Signer>> {
        self.inner.signer.as_ref()
    }

    /// Encryption materials, checked for usability
    ///
    /// `Ok(None)` for a plain client. An encryption client whose master key is
    /// unusable fails with `EncryptionClientError`.
    pub(crate) fn materials(&self) -> Result<Option<&EncryptionMaterials>> {
        match &self.inner.materials {
            Some(materials) => {
                materials.validate()?;
                Ok(Some(materials))
            }
            None => Ok(None),
        }
    }

    /// Reject an operation that cannot be combined with envelope encryption
    pub(crate) fn reject_if_encrypted(&self, operation: &str) -> Result<()> {
        if self.inner.materials.is_some() {
            return Err(VaultError::EncryptionClient(format!(
                "{} is not supported by an encryption client",
                operation
            )));
        }
        Ok(())
    }

    /// Sign, send and retry one request
    ///
    /// Error responses become `VaultError::Service`. The gate is checked before
    /// every attempt.
    pub(crate) fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.inner.gate.check()?;
        with_retry(&self.inner.retry, &self.inner.gate, || {
            let mut attempt = request.clone();
            // Presigned URLs carry their own credentials
            if let (Some(signer), None) = (&self.inner.signer, &attempt.url) {
                signer.sign(&mut attempt)?;
            }
            let response = self.inner.transport.execute(&attempt)?;
            let target = attempt.url.clone().unwrap_or_else(|| attempt.path());
            debug!("{} {} -> {}", attempt.method, target, response.status);
            response.into_result()
        })
    }
}

impl std::fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferClient")
            .field("capabilities", &self.capabilities())
            .field("materials", &self.inner.materials)
            .finish_non_exhaustive()
    }
}

/// Fail with `ValidateError` unless bucket and key are both set
pub(crate) fn validate_object_name(bucket: &str, key: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(VaultError::Validate("bucket name must not be empty".to_string()));
    }
    if key.is_empty() {
        return Err(VaultError::Validate("object key must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::SymmetricKeyProvider;
    use crate::transport::{Fault, MemoryTransport, Method, Operation};

    pub(crate) fn fast_config() -> ClientConfig {
        ClientConfig {
            max_retries: 2,
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 5,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_capabilities() {
        let store = Arc::new(MemoryTransport::new());
        let plain = TransferClient::new(store.clone()).unwrap();
        assert_eq!(
            plain.capabilities(),
            ClientCapabilities {
                supports_encryption: false,
                requests_enabled: true
            }
        );

        let materials = EncryptionMaterials::new(Arc::new(SymmetricKeyProvider::generate("d")));
        let encrypted = TransferClient::builder(store)
            .encryption(materials)
            .build()
            .unwrap();
        assert!(encrypted.capabilities().supports_encryption);
        assert!(encrypted.reject_if_encrypted("AppendObject").is_err());
        assert!(plain.reject_if_encrypted("AppendObject").is_ok());
    }

    #[test]
    fn test_send_retries_transient_failures() {
        let store = Arc::new(MemoryTransport::new());
        let client = TransferClient::builder(store.clone())
            .config(fast_config())
            .build()
            .unwrap();
        store.inject(Fault::network(Operation::PutObject).times(2));

        let response = client
            .send(HttpRequest::new(Method::Put, "b", Some("k")).with_body(b"x".to_vec()))
            .unwrap();
        assert!(response.is_success());
        assert_eq!(store.request_count(Operation::PutObject), 3);
    }

    #[test]
    fn test_send_does_not_retry_client_errors() {
        let store = Arc::new(MemoryTransport::new());
        let client = TransferClient::builder(store.clone())
            .config(fast_config())
            .build()
            .unwrap();

        let err = client
            .send(HttpRequest::new(Method::Get, "b", Some("missing")))
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchKey");
        assert_eq!(store.request_count(Operation::GetObject), 1);
    }

    #[test]
    fn test_disabled_client_sends_nothing() {
        let store = Arc::new(MemoryTransport::new());
        let client = TransferClient::new(store.clone()).unwrap();
        client.disable();
        assert!(!client.capabilities().requests_enabled);

        let err = client
            .send(HttpRequest::new(Method::Get, "b", Some("k")))
            .unwrap_err();
        assert_eq!(err.code(), "ClientDisabled");
        assert_eq!(store.total_requests(), 0);

        client.enable();
        assert!(client.is_enabled());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig {
            default_thread_num: 0,
            ..ClientConfig::default()
        };
        let result = TransferClient::builder(Arc::new(MemoryTransport::new()))
            .config(config)
            .build();
        assert_eq!(result.unwrap_err().code(), "ValidateError");
    }
}
