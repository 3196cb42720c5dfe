//! Type definitions for object operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, VaultError};

/// Header prefix for user metadata
pub const USER_METADATA_PREFIX: &str = "x-meta-";

/// Format a timestamp as an HTTP date
pub fn format_http_date(time: &DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP date header
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Metadata supplied with an upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Content type
    pub content_type: Option<String>,

    /// Canned ACL (e.g. private, public-read)
    pub acl: Option<String>,

    /// Cache control
    pub cache_control: Option<String>,

    /// Content disposition
    pub content_disposition: Option<String>,

    /// User-defined metadata, sent as `x-meta-<name>`
    pub user_metadata: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Create empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the canned ACL
    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    /// Add one user metadata entry
    pub fn with_user_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_metadata.insert(name.into(), value.into());
        self
    }

    /// Render as request headers
    pub fn to_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        if let Some(ct) = &self.content_type {
            headers.insert("content-type".to_string(), ct.clone());
        }
        if let Some(acl) = &self.acl {
            headers.insert("x-object-acl".to_string(), acl.clone());
        }
        if let Some(cc) = &self.cache_control {
            headers.insert("cache-control".to_string(), cc.clone());
        }
        if let Some(cd) = &self.content_disposition {
            headers.insert("content-disposition".to_string(), cd.clone());
        }
        for (name, value) in &self.user_metadata {
            headers.insert(
                format!("{}{}", USER_METADATA_PREFIX, name.to_lowercase()),
                value.clone(),
            );
        }
        headers
    }
}

/// Object attributes returned by HEAD/GET
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Stored size in bytes
    pub size: u64,

    /// ETag
    pub etag: Option<String>,

    /// Last modified, as sent by the service
    pub last_modified: Option<String>,

    /// CRC-32 of the stored bytes
    pub crc32: Option<u32>,

    /// Content type
    pub content_type: Option<String>,

    /// Version ID (if versioning is enabled)
    pub version_id: Option<String>,

    /// User-defined metadata, prefix stripped
    pub user_metadata: BTreeMap<String, String>,
}

impl ObjectInfo {
    /// Extract object attributes from response headers
    pub fn from_headers(headers: &BTreeMap<String, String>) -> Self {
        let user_metadata = headers
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(USER_METADATA_PREFIX)
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect();

        Self {
            size: headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            etag: headers.get("etag").cloned(),
            last_modified: headers.get("last-modified").cloned(),
            crc32: headers.get("x-hash-crc32").and_then(|v| v.parse().ok()),
            content_type: headers.get("content-type").cloned(),
            version_id: headers.get("x-version-id").cloned(),
            user_metadata,
        }
    }
}

/// Inclusive byte range; `end = None` reads to the end of the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Range `start..=end`
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Range from `start` to the end of the object
    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Check the range is well formed
    pub fn validate(&self) -> Result<()> {
        match self.end {
            Some(end) if end < self.start => Err(VaultError::Validate(format!(
                "invalid range: end {} before start {}",
                end, self.start
            ))),
            _ => Ok(()),
        }
    }

    /// Resolve against an object size, returning the half-open span `[start, end)`
    pub fn resolve(&self, object_size: u64) -> Result<(u64, u64)> {
        self.validate()?;
        if self.start >= object_size {
            return Err(VaultError::Validate(format!(
                "range start {} beyond object size {}",
                self.start, object_size
            )));
        }
        let end = match self.end {
            Some(end) => end.min(object_size - 1) + 1,
            None => object_size,
        };
        Ok((self.start, end))
    }

    /// Render as a `range` header value
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Parse a `bytes=a-b` header value
    pub fn parse_header(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse().ok()?),
        };
        Some(Self { start, end })
    }
}

/// Conditional request constraints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl Conditions {
    /// True when no constraint is set
    pub fn is_empty(&self) -> bool {
        self.if_match.is_none()
            && self.if_none_match.is_none()
            && self.if_modified_since.is_none()
            && self.if_unmodified_since.is_none()
    }

    /// Render as request headers
    pub fn to_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        if let Some(etag) = &self.if_match {
            headers.insert("if-match".to_string(), etag.clone());
        }
        if let Some(etag) = &self.if_none_match {
            headers.insert("if-none-match".to_string(), etag.clone());
        }
        if let Some(t) = &self.if_modified_since {
            headers.insert("if-modified-since".to_string(), format_http_date(t));
        }
        if let Some(t) = &self.if_unmodified_since {
            headers.insert("if-unmodified-since".to_string(), format_http_date(t));
        }
        headers
    }
}

/// Object read by a server-side copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub bucket: String,
    pub key: String,
    /// Version to read instead of the latest
    pub version_id: Option<String>,
    /// ETag the source must still have
    pub if_match: Option<String>,
}

impl CopySource {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            if_match: None,
        }
    }

    pub fn with_version_id(mut self, version_id: Option<String>) -> Self {
        self.version_id = version_id;
        self
    }

    pub fn with_if_match(mut self, etag: Option<String>) -> Self {
        self.if_match = etag;
        self
    }

    /// Value of the copy-source header: `/bucket/key[?versionId=..]`
    pub fn to_header(&self) -> String {
        match &self.version_id {
            Some(version_id) => format!("/{}/{}?versionId={}", self.bucket, self.key, version_id),
            None => format!("/{}/{}", self.bucket, self.key),
        }
    }

    /// Parse a copy-source header into bucket, key and version
    pub fn parse_header(value: &str) -> Option<Self> {
        let (path, version_id) = match value.rsplit_once("?versionId=") {
            Some((path, version)) if !version.is_empty() => (path, Some(version.to_string())),
            _ => (value, None),
        };
        let (bucket, key) = path.trim_start_matches('/').split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(bucket, key).with_version_id(version_id))
    }
}

/// A completed part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartETag {
    /// Part number (1-indexed)
    pub part_number: u32,

    /// ETag of the uploaded part
    pub etag: String,

    /// Size of the part in bytes
    pub size: u64,

    /// CRC-32 reported by the service
    pub crc32: Option<u32>,
}

impl PartETag {
    /// Create a new part record
    pub fn new(part_number: u32, etag: impl Into<String>, size: u64) -> Self {
        Self {
            part_number,
            etag: etag.into(),
            size,
            crc32: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_metadata_headers() {
        let meta = ObjectMetadata::new()
            .with_content_type("text/plain")
            .with_acl("private")
            .with_user_metadata("Owner", "ops");
        let headers = meta.to_headers();
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(headers.get("x-object-acl").unwrap(), "private");
        assert_eq!(headers.get("x-meta-owner").unwrap(), "ops");
    }

    #[test]
    fn test_object_info_from_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("content-length".to_string(), "1234".to_string());
        headers.insert("etag".to_string(), "abc".to_string());
        headers.insert("x-hash-crc32".to_string(), "42".to_string());
        headers.insert("x-meta-color".to_string(), "blue".to_string());

        let info = ObjectInfo::from_headers(&headers);
        assert_eq!(info.size, 1234);
        assert_eq!(info.etag.as_deref(), Some("abc"));
        assert_eq!(info.crc32, Some(42));
        assert_eq!(info.user_metadata.get("color").unwrap(), "blue");
    }

    #[test]
    fn test_range_resolve() {
        assert_eq!(ByteRange::new(10, 19).resolve(100).unwrap(), (10, 20));
        assert_eq!(ByteRange::new(90, 500).resolve(100).unwrap(), (90, 100));
        assert_eq!(ByteRange::starting_at(5).resolve(100).unwrap(), (5, 100));
        assert!(ByteRange::starting_at(100).resolve(100).is_err());
        assert!(ByteRange::new(9, 3).validate().is_err());
    }

    #[test]
    fn test_range_header() {
        let range = ByteRange::new(0, 99);
        assert_eq!(range.to_header(), "bytes=0-99");
        assert_eq!(ByteRange::parse_header("bytes=0-99"), Some(range));
        assert_eq!(ByteRange::parse_header("bytes=7-"), Some(ByteRange::starting_at(7)));
        assert_eq!(ByteRange::parse_header("items=1-2"), None);
    }

    #[test]
    fn test_http_date_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 17, 4, 5).unwrap();
        let formatted = format_http_date(&t);
        assert_eq!(formatted, "Sat, 09 Mar 2024 17:04:05 GMT");
        assert_eq!(parse_http_date(&formatted), Some(t));
    }

    #[test]
    fn test_conditions_headers() {
        let conditions = Conditions {
            if_match: Some("etag-1".to_string()),
            ..Default::default()
        };
        assert!(!conditions.is_empty());
        assert_eq!(conditions.to_headers().get("if-match").unwrap(), "etag-1");
        assert!(Conditions::default().is_empty());
    }

    #[test]
    fn test_copy_source_header() {
        let latest = CopySource::new("b", "dir/k");
        assert_eq!(latest.to_header(), "/b/dir/k");
        assert_eq!(CopySource::parse_header("/b/dir/k"), Some(latest));

        let pinned = CopySource::new("b", "k").with_version_id(Some("v7".to_string()));
        assert_eq!(pinned.to_header(), "/b/k?versionId=v7");
        assert_eq!(CopySource::parse_header(&pinned.to_header()), Some(pinned));

        assert_eq!(CopySource::parse_header("/b"), None);
        assert_eq!(CopySource::parse_header("//k"), None);
    }
}
