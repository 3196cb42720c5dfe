/*!
 * Transport abstraction
 *
 * Every remote call goes through [`Transport::execute`]. Requests address an
 * object by bucket and key (or by a presigned URL); the wire contract is plain
 * headers plus a JSON body where a structured payload is needed.
 */

pub mod memory;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, VaultError};

pub use memory::{Fault, FaultKind, MemoryTransport, Operation};

/// Error code header on failed responses
pub const HEADER_ERROR_CODE: &str = "x-error-code";
/// Request id header on every response
pub const HEADER_REQUEST_ID: &str = "x-request-id";
/// Multipart session id returned by initiate
pub const HEADER_UPLOAD_ID: &str = "x-upload-id";
/// CRC-32 of the stored bytes
pub const HEADER_CRC32: &str = "x-hash-crc32";
/// Copy source, `/bucket/key`
pub const HEADER_COPY_SOURCE: &str = "x-copy-source";
/// Byte range of the copy source
pub const HEADER_COPY_SOURCE_RANGE: &str = "x-copy-source-range";
/// ETag the copy source must have
pub const HEADER_COPY_SOURCE_IF_MATCH: &str = "x-copy-source-if-match";
/// Next offset after an append
pub const HEADER_NEXT_APPEND_POSITION: &str = "x-next-append-position";
/// Traffic limit hint in bytes/sec
pub const HEADER_TRAFFIC_LIMIT: &str = "x-traffic-limit";
/// Object version id
pub const HEADER_VERSION_ID: &str = "x-version-id";

/// Entry of a CompleteMultipartUpload body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Head,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        };
        f.write_str(name)
    }
}

/// One request to the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub bucket: String,
    pub key: Option<String>,
    /// Query parameters; `None` values are bare flags such as `?uploads`
    pub query: BTreeMap<String, Option<String>>,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Full presigned URL; when set it addresses the request instead of bucket/key
    pub url: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, bucket: impl Into<String>, key: Option<&str>) -> Self {
        Self {
            method,
            bucket: bucket.into(),
            key: key.map(str::to_string),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            url: None,
        }
    }

    /// Request addressed by a presigned URL
    pub fn presigned(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::new(method, "", None)
        }
    }

    pub fn with_query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.insert(name.to_string(), Some(value.to_string()));
        self
    }

    pub fn with_flag(mut self, name: &str) -> Self {
        self.query.insert(name.to_string(), None);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.to_lowercase(), value);
        }
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query.get(name).and_then(|v| v.as_deref())
    }

    pub fn has_query(&self, name: &str) -> bool {
        self.query.contains_key(name)
    }

    /// `/bucket/key` path of the request
    pub fn path(&self) -> String {
        match &self.key {
            Some(key) => format!("/{}/{}", self.bucket, key),
            None => format!("/{}", self.bucket),
        }
    }
}

/// Response from the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Failed response carrying a service error code
    pub fn error(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self::new(status)
            .with_header(HEADER_ERROR_CODE, code)
            .with_body(message.into().into_bytes())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Service error described by a failed response
    pub fn to_error(&self) -> VaultError {
        let code = self
            .header(HEADER_ERROR_CODE)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Http{}", self.status));
        VaultError::Service {
            status: self.status,
            code,
            message: String::from_utf8_lossy(&self.body).into_owned(),
            request_id: self.header(HEADER_REQUEST_ID).map(str::to_string),
        }
    }

    /// Pass successful responses through, convert the rest into errors
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

/// Executes requests against the remote store
///
/// Implementations report connection-level failures as `VaultError::Network`
/// and return every HTTP answer, including error statuses, as a response.
pub trait Transport: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let req = HttpRequest::new(Method::Put, "bucket", Some("dir/key"))
            .with_query("partNumber", 3)
            .with_query("uploadId", "u-1")
            .with_flag("uploads")
            .with_header("Content-Type", "text/plain");
        assert_eq!(req.path(), "/bucket/dir/key");
        assert_eq!(req.query_value("partNumber"), Some("3"));
        assert!(req.has_query("uploads"));
        assert_eq!(req.query_value("uploads"), None);
        assert_eq!(req.header("content-type"), Some("text/plain"));
    }

    #[test]
    fn test_error_response_conversion() {
        let resp = HttpResponse::error(404, "NoSuchUpload", "upload gone")
            .with_header(HEADER_REQUEST_ID, "req-9");
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code(), "NoSuchUpload");
        assert_eq!(err.status(), Some(404));
        match err {
            VaultError::Service {
                message,
                request_id,
                ..
            } => {
                assert_eq!(message, "upload gone");
                assert_eq!(request_id.as_deref(), Some("req-9"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_error_without_code_header() {
        let err = HttpResponse::new(503).to_error();
        assert_eq!(err.code(), "Http503");
        assert!(err.is_retryable());
    }
}
