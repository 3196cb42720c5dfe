//! Multipart upload primitives

use tracing::{debug, info};

use super::{validate_object_name, TransferClient, WriteOutput};
use crate::checkpoint::EncryptionRecord;
use crate::checksum;
use crate::crypto::MultipartCryptoContext;
use crate::error::{Result, VaultError};
use crate::partition::validate_part_number;
use crate::transport::{
    CompletedPart, HttpRequest, HttpResponse, Method, HEADER_COPY_SOURCE,
    HEADER_COPY_SOURCE_IF_MATCH, HEADER_COPY_SOURCE_RANGE, HEADER_CRC32, HEADER_UPLOAD_ID,
};
use crate::types::{ByteRange, CopySource, ObjectMetadata, PartETag};

/// Parameters of InitiateMultipartUpload
///
/// `part_size` and `data_size` fix the part layout of an encrypted upload and
/// are required on encryption clients; plain clients ignore them.
#[derive(Debug, Clone, Default)]
pub struct MultipartUploadRequest {
    pub bucket: String,
    pub key: String,
    pub metadata: ObjectMetadata,
    pub part_size: Option<u64>,
    pub data_size: Option<u64>,
}

impl MultipartUploadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_data_size(mut self, data_size: u64) -> Self {
        self.data_size = Some(data_size);
        self
    }
}

/// An open multipart session
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// Present when the session was initiated by an encryption client
    pub crypto: Option<MultipartCryptoContext>,
}

fn part_etag(part_number: u32, size: u64, response: &HttpResponse) -> Result<PartETag> {
    let etag = response
        .header("etag")
        .ok_or_else(|| VaultError::service(response.status, "InvalidResponse", "part response has no etag"))?;
    Ok(PartETag {
        part_number,
        etag: etag.to_string(),
        size,
        crc32: response.header(HEADER_CRC32).and_then(|v| v.parse().ok()),
    })
}

impl TransferClient {
    /// Open a multipart session
    ///
    /// An encryption client generates the content material here and sends its
    /// envelope with the initiate request.
    pub fn initiate_multipart_upload(&self, request: &MultipartUploadRequest) -> Result<MultipartUpload> {
        validate_object_name(&request.bucket, &request.key)?;

        let mut headers = request.metadata.to_headers();
        let crypto = match self.materials()? {
            Some(materials) => {
                let material = materials.generate_content_material()?;
                let context =
                    MultipartCryptoContext::new(material, request.part_size, request.data_size)?;
                headers.extend(context.headers());
                Some(context)
            }
            None => None,
        };

        let response = self.send(
            HttpRequest::new(Method::Post, &request.bucket, Some(&request.key))
                .with_flag("uploads")
                .with_headers(headers),
        )?;
        let upload_id = response
            .header(HEADER_UPLOAD_ID)
            .ok_or_else(|| VaultError::service(response.status, "InvalidResponse", "initiate response has no upload id"))?
            .to_string();

        info!(
            "Initiated multipart upload {} for {}/{}{}",
            upload_id,
            request.bucket,
            request.key,
            if crypto.is_some() { " (encrypted)" } else { "" }
        );
        Ok(MultipartUpload {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            upload_id,
            crypto,
        })
    }

    /// Reattach to a session opened earlier, e.g. from a checkpoint
    ///
    /// An encrypted session needs the material it was initiated with; it is
    /// unwrapped with this client's providers.
    pub fn resume_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        encryption: Option<&EncryptionRecord>,
        part_size: u64,
        data_size: u64,
    ) -> Result<MultipartUpload> {
        validate_object_name(bucket, key)?;
        let crypto = match (self.materials()?, encryption) {
            (Some(materials), Some(record)) => {
                let material = materials.unwrap_content_material(record)?;
                Some(MultipartCryptoContext::new(
                    material,
                    Some(part_size),
                    Some(data_size),
                )?)
            }
            (Some(_), None) => {
                return Err(VaultError::EncryptionClient(format!(
                    "upload {} has no encryption material",
                    upload_id
                )))
            }
            (None, Some(_)) => {
                return Err(VaultError::EncryptionClient(format!(
                    "upload {} is encrypted and needs an encryption client",
                    upload_id
                )))
            }
            (None, None) => None,
        };
        Ok(MultipartUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            crypto,
        })
    }

    /// Upload one part
    ///
    /// On an encrypted session the part must have exactly the length the
    /// layout requires; it is encrypted at its absolute offset.
    pub fn upload_part(&self, upload: &MultipartUpload, part_number: u32, data: Vec<u8>) -> Result<PartETag> {
        validate_part_number(part_number)?;
        let mut body = data;
        if self.materials()?.is_some() {
            let context = upload.crypto.as_ref().ok_or_else(|| {
                VaultError::EncryptionClient(format!(
                    "upload {} was not initiated with a crypto context",
                    upload.upload_id
                ))
            })?;
            context.encrypt_part(part_number, &mut body)?;
        }

        let local_crc = checksum::crc32(&body);
        let size = body.len() as u64;
        let response = self.send(
            HttpRequest::new(Method::Put, &upload.bucket, Some(&upload.key))
                .with_query("partNumber", part_number)
                .with_query("uploadId", &upload.upload_id)
                .with_header("content-md5", checksum::content_md5_base64(&body))
                .with_body(body),
        )?;

        let part = part_etag(part_number, size, &response)?;
        if self.config().crc_check_enabled {
            if let Some(remote) = part.crc32 {
                if remote != local_crc {
                    return Err(VaultError::ChecksumMismatch {
                        expected: local_crc.to_string(),
                        actual: remote.to_string(),
                    }
                    .context(format!("part {}", part_number)));
                }
            }
        }
        debug!("Uploaded part {} of {} ({} bytes)", part_number, upload.upload_id, size);
        Ok(part)
    }

    /// Fill one part from a range of an existing object
    ///
    /// Not available on encryption clients.
    pub fn upload_part_copy(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        source: &CopySource,
        range: Option<ByteRange>,
    ) -> Result<PartETag> {
        self.reject_if_encrypted("UploadPartCopy")?;
        validate_part_number(part_number)?;
        validate_object_name(&source.bucket, &source.key)?;

        let mut request = HttpRequest::new(Method::Put, &upload.bucket, Some(&upload.key))
            .with_query("partNumber", part_number)
            .with_query("uploadId", &upload.upload_id)
            .with_header(HEADER_COPY_SOURCE, source.to_header());
        let mut size = 0;
        if let Some(range) = range {
            range.validate()?;
            if let Some(end) = range.end {
                size = end - range.start + 1;
            }
            request = request.with_header(HEADER_COPY_SOURCE_RANGE, range.to_header());
        }
        if let Some(etag) = &source.if_match {
            request = request.with_header(HEADER_COPY_SOURCE_IF_MATCH, etag.clone());
        }

        let response = self.send(request)?;
        debug!("Copied part {} of {}", part_number, upload.upload_id);
        part_etag(part_number, size, &response)
    }

    /// Finish a session from its ordered part list
    ///
    /// On an encrypted session the list must name exactly the parts of the
    /// layout, in order, or the call fails with `InvalidEncryptionRequest`
    /// without contacting the service.
    pub fn complete_multipart_upload(&self, upload: &MultipartUpload, parts: &[PartETag]) -> Result<WriteOutput> {
        if parts.is_empty() {
            return Err(VaultError::Validate(
                "part list must not be empty".to_string(),
            ));
        }
        if self.materials()?.is_some() {
            let context = upload.crypto.as_ref().ok_or_else(|| {
                VaultError::EncryptionClient(format!(
                    "upload {} was not initiated with a crypto context",
                    upload.upload_id
                ))
            })?;
            context.check_complete(parts.iter().map(|p| p.part_number))?;
        }

        let body: Vec<CompletedPart> = parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();
        let response = self.send(
            HttpRequest::new(Method::Post, &upload.bucket, Some(&upload.key))
                .with_query("uploadId", &upload.upload_id)
                .with_body(serde_json::to_vec(&body)?),
        )?;
        info!(
            "Completed multipart upload {} for {}/{} ({} parts)",
            upload.upload_id,
            upload.bucket,
            upload.key,
            parts.len()
        );
        Ok(WriteOutput::from_response(&response))
    }

    pub fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        validate_object_name(bucket, key)?;
        self.send(
            HttpRequest::new(Method::Delete, bucket, Some(key)).with_query("uploadId", upload_id),
        )?;
        info!("Aborted multipart upload {}", upload_id);
        Ok(())
    }

    /// Parts stored so far in a session
    pub fn list_parts(&self, bucket: &str, key: &str, upload_id: &str) -> Result<Vec<PartETag>> {
        validate_object_name(bucket, key)?;
        let response = self.send(
            HttpRequest::new(Method::Get, bucket, Some(key)).with_query("uploadId", upload_id),
        )?;
        Ok(serde_json::from_slice(&response.body)?)
    }
}
