//! Single-request object operations

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{validate_object_name, TransferClient};
use crate::checksum;
use crate::crypto::{self, envelope, EncryptionMaterials};
use crate::error::{Result, VaultError};
use crate::transport::{
    HttpRequest, HttpResponse, Method, HEADER_COPY_SOURCE, HEADER_COPY_SOURCE_IF_MATCH,
    HEADER_CRC32, HEADER_NEXT_APPEND_POSITION, HEADER_TRAFFIC_LIMIT, HEADER_VERSION_ID,
};
use crate::types::{ByteRange, Conditions, CopySource, ObjectInfo, ObjectMetadata};

/// Result of a request that writes an object or a part
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutput {
    pub etag: Option<String>,
    pub crc32: Option<u32>,
    pub version_id: Option<String>,
}

impl WriteOutput {
    pub(crate) fn from_response(response: &HttpResponse) -> Self {
        Self {
            etag: response.header("etag").map(str::to_string),
            crc32: response.header(HEADER_CRC32).and_then(|v| v.parse().ok()),
            version_id: response.header(HEADER_VERSION_ID).map(str::to_string),
        }
    }
}

/// Options of a GetObject request
#[derive(Debug, Clone, Default)]
pub struct GetObjectOptions {
    pub range: Option<ByteRange>,
    pub conditions: Conditions,
    pub version_id: Option<String>,
    /// Traffic limit hint in bytes/sec
    pub traffic_limit: Option<u64>,
}

impl GetObjectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn with_traffic_limit(mut self, bytes_per_sec: u64) -> Self {
        self.traffic_limit = Some(bytes_per_sec);
        self
    }
}

/// Object content and attributes
#[derive(Debug, Clone)]
pub struct GetObjectOutput {
    pub info: ObjectInfo,
    /// Plaintext content (decrypted when the object was encrypted)
    pub data: Vec<u8>,
    /// Whether the content was decrypted client-side
    pub decrypted: bool,
}

/// Result of an AppendObject request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutput {
    pub next_position: u64,
    pub etag: Option<String>,
    pub crc32: Option<u32>,
}

/// Start offset of a `content-range: bytes a-b/total` header
pub(crate) fn content_range_start(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes ")?;
    let (span, _) = spec.split_once('/')?;
    let (start, _) = span.split_once('-')?;
    start.trim().parse().ok()
}

impl TransferClient {
    /// Upload an object in a single request
    ///
    /// An encryption client generates fresh content material, stores it as
    /// envelope metadata, and sends the ciphertext.
    pub fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<WriteOutput> {
        validate_object_name(bucket, key)?;
        let materials = self.materials()?;

        let mut headers = metadata.to_headers();
        let mut body = data;
        if let Some(materials) = materials {
            let material = materials.generate_content_material()?;
            headers.extend(crypto::envelope_headers(&material));
            headers.insert(
                envelope::META_UNENCRYPTED_LENGTH.to_string(),
                body.len().to_string(),
            );
            headers.insert(
                envelope::META_UNENCRYPTED_MD5.to_string(),
                checksum::content_md5_base64(&body),
            );
            crypto::transform_at(&material.key, &material.iv, 0, &mut body)?;
        }
        headers.insert("content-md5".to_string(), checksum::content_md5_base64(&body));

        let size = body.len();
        let response = self.send(
            HttpRequest::new(Method::Put, bucket, Some(key))
                .with_headers(headers)
                .with_body(body),
        )?;
        debug!("Put {}/{} ({} bytes)", bucket, key, size);
        Ok(WriteOutput::from_response(&response))
    }

    /// Upload a local file in a single request
    pub fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        metadata: &ObjectMetadata,
    ) -> Result<WriteOutput> {
        let data = std::fs::read(path)
            .map_err(|e| VaultError::from(e).context(format!("cannot read {}", path.display())))?;
        self.put_object(bucket, key, data, metadata)
    }

    /// Download an object, or a range of it
    ///
    /// Encrypted objects are decrypted with the keystream positioned at the
    /// first returned byte. Objects without envelope metadata are returned as
    /// stored, even by an encryption client.
    pub fn get_object(
        &self,
        bucket: &str,
        key: &str,
        options: &GetObjectOptions,
    ) -> Result<GetObjectOutput> {
        validate_object_name(bucket, key)?;
        if let Some(range) = &options.range {
            range.validate()?;
        }
        let materials = self.materials()?;

        let response = self.send(Self::get_request(bucket, key, options))?;
        Self::open_response(response, materials)
    }

    pub(crate) fn get_request(bucket: &str, key: &str, options: &GetObjectOptions) -> HttpRequest {
        let mut request = HttpRequest::new(Method::Get, bucket, Some(key))
            .with_headers(options.conditions.to_headers());
        if let Some(range) = &options.range {
            request = request.with_header("range", range.to_header());
        }
        if let Some(version_id) = &options.version_id {
            request = request.with_query("versionId", version_id);
        }
        if let Some(limit) = options.traffic_limit {
            request = request.with_header(HEADER_TRAFFIC_LIMIT, limit.to_string());
        }
        request
    }

    /// Decrypt a GET response if it carries an envelope
    pub(crate) fn open_response(
        response: HttpResponse,
        materials: Option<&EncryptionMaterials>,
    ) -> Result<GetObjectOutput> {
        let offset = response
            .header("content-range")
            .and_then(content_range_start)
            .unwrap_or(0);
        let mut headers = response.headers;
        let mut data = response.body;

        let mut decrypted = false;
        if let Some(materials) = materials {
            if let Some(record) = crypto::parse_envelope(&headers)? {
                let material = materials.unwrap_content_material(&record)?;
                crypto::transform_at(&material.key, &material.iv, offset, &mut data)?;
                envelope::strip_envelope(&mut headers);
                decrypted = true;
            }
        }

        Ok(GetObjectOutput {
            info: ObjectInfo::from_headers(&headers),
            data,
            decrypted,
        })
    }

    /// Raw headers of an object
    pub(crate) fn head_headers(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        conditions: &Conditions,
    ) -> Result<BTreeMap<String, String>> {
        validate_object_name(bucket, key)?;
        let mut request =
            HttpRequest::new(Method::Head, bucket, Some(key)).with_headers(conditions.to_headers());
        if let Some(version_id) = version_id {
            request = request.with_query("versionId", version_id);
        }
        Ok(self.send(request)?.headers)
    }

    /// Object attributes
    ///
    /// An encryption client hides the envelope metadata from the result.
    pub fn head_object(&self, bucket: &str, key: &str, version_id: Option<&str>) -> Result<ObjectInfo> {
        let mut headers = self.head_headers(bucket, key, version_id, &Conditions::default())?;
        if self.capabilities().supports_encryption {
            envelope::strip_envelope(&mut headers);
        }
        Ok(ObjectInfo::from_headers(&headers))
    }

    pub fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        validate_object_name(bucket, key)?;
        self.send(HttpRequest::new(Method::Delete, bucket, Some(key)))?;
        debug!("Deleted {}/{}", bucket, key);
        Ok(())
    }

    /// Server-side copy of a whole object
    ///
    /// With `metadata` set the destination gets that metadata instead of the
    /// source's. An encryption client carries the source's envelope over, so
    /// the copy stays decryptable.
    pub fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        metadata: Option<&ObjectMetadata>,
    ) -> Result<WriteOutput> {
        self.copy_object_from(&CopySource::new(src_bucket, src_key), dst_bucket, dst_key, metadata)
    }

    /// Server-side copy of a specific source version, optionally pinned to its etag
    pub fn copy_object_from(
        &self,
        source: &CopySource,
        dst_bucket: &str,
        dst_key: &str,
        metadata: Option<&ObjectMetadata>,
    ) -> Result<WriteOutput> {
        let (src_bucket, src_key) = (source.bucket.as_str(), source.key.as_str());
        validate_object_name(src_bucket, src_key)?;
        validate_object_name(dst_bucket, dst_key)?;
        let materials = self.materials()?;

        let mut request = HttpRequest::new(Method::Put, dst_bucket, Some(dst_key))
            .with_header(HEADER_COPY_SOURCE, source.to_header());
        if let Some(etag) = &source.if_match {
            request = request.with_header(HEADER_COPY_SOURCE_IF_MATCH, etag.clone());
        }
        if let Some(metadata) = metadata {
            let mut headers = metadata.to_headers();
            if materials.is_some() {
                let source = self.head_headers(
                    src_bucket,
                    src_key,
                    source.version_id.as_deref(),
                    &Conditions::default(),
                )?;
                headers.extend(
                    source
                        .into_iter()
                        .filter(|(name, _)| name.starts_with("x-meta-client-side-encryption-")),
                );
            }
            request = request
                .with_header("x-metadata-directive", "REPLACE")
                .with_headers(headers);
        }

        let response = self.send(request)?;
        debug!("Copied {}/{} to {}/{}", src_bucket, src_key, dst_bucket, dst_key);
        Ok(WriteOutput::from_response(&response))
    }

    /// Append to an appendable object at `position`
    ///
    /// Not available on encryption clients.
    pub fn append_object(
        &self,
        bucket: &str,
        key: &str,
        position: u64,
        data: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<AppendOutput> {
        self.reject_if_encrypted("AppendObject")?;
        validate_object_name(bucket, key)?;

        let response = self.send(
            HttpRequest::new(Method::Post, bucket, Some(key))
                .with_flag("append")
                .with_query("position", position)
                .with_headers(metadata.to_headers())
                .with_body(data),
        )?;
        let next_position = response
            .header(HEADER_NEXT_APPEND_POSITION)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                VaultError::service(response.status, "InvalidResponse", "missing next append position")
            })?;
        Ok(AppendOutput {
            next_position,
            etag: response.header("etag").map(str::to_string),
            crc32: response.header(HEADER_CRC32).and_then(|v| v.parse().ok()),
        })
    }

    /// Presigned URL for a GET or PUT of one object
    ///
    /// Not available on encryption clients: a URL holder would bypass the
    /// envelope.
    pub fn generate_presigned_url(
        &self,
        bucket: &str,
        key: &str,
        method: Method,
        expires_in: Duration,
    ) -> Result<String> {
        self.reject_if_encrypted("presigned URL")?;
        validate_object_name(bucket, key)?;
        let signer = self.signer().ok_or_else(|| {
            VaultError::Validate("presigned URLs need a client with a signer".to_string())
        })?;
        signer.presign(&self.config().endpoint, method, bucket, key, expires_in)
    }

    /// GET through a presigned URL
    pub fn get_object_with_url(&self, url: &str) -> Result<GetObjectOutput> {
        self.reject_if_encrypted("GetObject with presigned URL")?;
        let response = self.send(HttpRequest::presigned(Method::Get, url))?;
        Self::open_response(response, None)
    }

    /// PUT through a presigned URL
    pub fn put_object_with_url(&self, url: &str, data: Vec<u8>) -> Result<WriteOutput> {
        self.reject_if_encrypted("PutObject with presigned URL")?;
        let response = self.send(HttpRequest::presigned(Method::Put, url).with_body(data))?;
        Ok(WriteOutput::from_response(&response))
    }
}
