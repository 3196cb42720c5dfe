//! In-process object store speaking the transport wire contract
//!
//! Stores objects and multipart sessions in memory, computes ETags and CRC-32
//! headers like the real service, and can be told to fail specific requests.
//! Used as the remote end in tests and local tooling.

use chrono::{DateTime, Timelike, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use super::{
    CompletedPart, HttpRequest, HttpResponse, Method, Transport, HEADER_COPY_SOURCE,
    HEADER_COPY_SOURCE_IF_MATCH, HEADER_COPY_SOURCE_RANGE, HEADER_CRC32, HEADER_NEXT_APPEND_POSITION,
    HEADER_REQUEST_ID, HEADER_UPLOAD_ID, HEADER_VERSION_ID,
};
use crate::checksum;
use crate::error::{codes, Result, VaultError};
use crate::partition::{MAX_PART_COUNT, MIN_PART_SIZE};
use crate::signer::{parse_presigned_url, HmacSigner};
use crate::types::{
    format_http_date, parse_http_date, ByteRange, CopySource, PartETag, USER_METADATA_PREFIX,
};

/// Kind of remote operation a request performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PutObject,
    GetObject,
    HeadObject,
    DeleteObject,
    CopyObject,
    AppendObject,
    InitiateMultipartUpload,
    UploadPart,
    UploadPartCopy,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    ListParts,
}

impl Operation {
    /// Classify a request by method, query and headers
    pub fn classify(request: &HttpRequest) -> Self {
        let copy = request.header(HEADER_COPY_SOURCE).is_some();
        match request.method {
            Method::Post if request.has_query("uploads") => Operation::InitiateMultipartUpload,
            Method::Post if request.has_query("append") => Operation::AppendObject,
            Method::Post => Operation::CompleteMultipartUpload,
            Method::Put if request.has_query("partNumber") && copy => Operation::UploadPartCopy,
            Method::Put if request.has_query("partNumber") => Operation::UploadPart,
            Method::Put if copy => Operation::CopyObject,
            Method::Put => Operation::PutObject,
            Method::Get if request.has_query("uploadId") => Operation::ListParts,
            Method::Get => Operation::GetObject,
            Method::Head => Operation::HeadObject,
            Method::Delete if request.has_query("uploadId") => Operation::AbortMultipartUpload,
            Method::Delete => Operation::DeleteObject,
        }
    }
}

/// How an injected fault fails the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection-level failure
    Network(String),
    /// Error response from the service
    Status {
        status: u16,
        code: String,
        message: String,
    },
}

/// A failure to inject into matching requests
#[derive(Debug, Clone)]
pub struct Fault {
    pub operation: Operation,
    /// Only requests for this part number
    pub part_number: Option<u32>,
    /// Only ranged requests starting at this offset
    pub range_start: Option<u64>,
    pub kind: FaultKind,
    /// Remaining injections; `None` fails forever
    pub remaining: Option<u32>,
}

impl Fault {
    /// Persistent network failure on `operation`
    pub fn network(operation: Operation) -> Self {
        Self {
            operation,
            part_number: None,
            range_start: None,
            kind: FaultKind::Network("injected connection reset".to_string()),
            remaining: None,
        }
    }

    /// Persistent error response on `operation`
    pub fn status(operation: Operation, status: u16, code: &str) -> Self {
        Self {
            operation,
            part_number: None,
            range_start: None,
            kind: FaultKind::Status {
                status,
                code: code.to_string(),
                message: format!("injected {}", code),
            },
            remaining: None,
        }
    }

    pub fn on_part(mut self, part_number: u32) -> Self {
        self.part_number = Some(part_number);
        self
    }

    pub fn on_range_start(mut self, start: u64) -> Self {
        self.range_start = Some(start);
        self
    }

    /// Fail only the next `n` matching requests
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, operation: Operation, request: &HttpRequest) -> bool {
        if self.operation != operation || self.remaining == Some(0) {
            return false;
        }
        if let Some(part) = self.part_number {
            let requested = request
                .query_value("partNumber")
                .and_then(|v| v.parse::<u32>().ok());
            if requested != Some(part) {
                return false;
            }
        }
        if let Some(start) = self.range_start {
            let requested = request
                .header("range")
                .and_then(ByteRange::parse_header)
                .map(|r| r.start);
            if requested != Some(start) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    crc32: u32,
    last_modified: DateTime<Utc>,
    version_id: String,
    metadata: BTreeMap<String, String>,
    appendable: bool,
}

#[derive(Debug, Clone)]
struct StoredPart {
    data: Vec<u8>,
    etag: String,
    crc32: u32,
}

#[derive(Debug, Clone)]
struct MultipartSession {
    bucket: String,
    key: String,
    metadata: BTreeMap<String, String>,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<(String, String), StoredObject>,
    /// Versions replaced by a later write, oldest first
    noncurrent: HashMap<(String, String), Vec<StoredObject>>,
    uploads: HashMap<String, MultipartSession>,
    faults: Vec<Fault>,
    counts: HashMap<Operation, usize>,
    latency: Duration,
    next_id: u64,
}

impl StoreState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Make `object` the current version, keeping the one it replaces
    fn install(&mut self, object_key: (String, String), object: StoredObject) {
        if let Some(previous) = self.objects.insert(object_key.clone(), object) {
            self.noncurrent.entry(object_key).or_default().push(previous);
        }
    }

    /// The current version, or the one named by `version_id`
    fn lookup(
        &self,
        object_key: &(String, String),
        version_id: Option<&str>,
    ) -> std::result::Result<&StoredObject, HttpResponse> {
        let current = self.objects.get(object_key);
        let Some(version_id) = version_id else {
            return current.ok_or_else(|| MemoryTransport::no_such_key(&object_key.1));
        };
        current
            .filter(|o| o.version_id == version_id)
            .or_else(|| {
                self.noncurrent
                    .get(object_key)?
                    .iter()
                    .find(|o| o.version_id == version_id)
            })
            .ok_or_else(|| {
                if current.is_none() && !self.noncurrent.contains_key(object_key) {
                    MemoryTransport::no_such_key(&object_key.1)
                } else {
                    HttpResponse::error(404, "NoSuchVersion", "The specified version does not exist")
                }
            })
    }
}

/// In-memory object store
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<StoreState>>,
    verifier: Option<HmacSigner>,
}

/// Header names persisted with an object
fn is_stored_header(name: &str) -> bool {
    matches!(
        name,
        "content-type" | "cache-control" | "content-disposition" | "x-object-acl"
    ) || name.starts_with(USER_METADATA_PREFIX)
}

fn stored_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| is_stored_header(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(0).unwrap_or(now)
}

fn multipart_etag(parts: &[&StoredPart]) -> String {
    let mut digests = Vec::with_capacity(parts.len() * 16);
    for part in parts {
        if let Ok(raw) = hex::decode(&part.etag) {
            digests.extend_from_slice(&raw);
        }
    }
    format!("{}-{}", checksum::md5_hex(&digests), parts.len())
}

impl MemoryTransport {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify presigned URLs against this signer's credentials
    pub fn with_presign_verifier(mut self, signer: HmacSigner) -> Self {
        self.verifier = Some(signer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a fault
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Remove every fault
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Delay applied to every request
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Number of requests seen for an operation, including failed ones
    pub fn request_count(&self, operation: Operation) -> usize {
        self.lock().counts.get(&operation).copied().unwrap_or(0)
    }

    /// Number of requests seen overall
    pub fn total_requests(&self) -> usize {
        self.lock().counts.values().sum()
    }

    pub fn reset_counts(&self) {
        self.lock().counts.clear();
    }

    /// Stored bytes of an object
    pub fn object_data(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Stored metadata headers of an object
    pub fn object_metadata(&self, bucket: &str, key: &str) -> Option<BTreeMap<String, String>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.metadata.clone())
    }

    /// Store an object directly, bypassing the request path
    pub fn put_raw(&self, bucket: &str, key: &str, data: Vec<u8>, metadata: BTreeMap<String, String>) {
        let mut state = self.lock();
        let version_id = format!("v{}", state.next_id());
        let object = StoredObject {
            etag: checksum::md5_hex(&data),
            crc32: checksum::crc32(&data),
            data,
            last_modified: now_seconds(),
            version_id,
            metadata,
            appendable: false,
        };
        state.install((bucket.to_string(), key.to_string()), object);
    }

    /// Delete an object directly
    pub fn remove_object(&self, bucket: &str, key: &str) -> bool {
        self.lock()
            .objects
            .remove(&(bucket.to_string(), key.to_string()))
            .is_some()
    }

    /// Ids of open multipart sessions
    pub fn upload_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().uploads.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a multipart session, as if it expired
    pub fn expire_upload(&self, upload_id: &str) -> bool {
        self.lock().uploads.remove(upload_id).is_some()
    }

    /// Part numbers stored in an open session
    pub fn uploaded_parts(&self, upload_id: &str) -> Vec<u32> {
        self.lock()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    fn take_fault(state: &mut StoreState, operation: Operation, request: &HttpRequest) -> Option<FaultKind> {
        let fault = state
            .faults
            .iter_mut()
            .find(|f| f.matches(operation, request))?;
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(fault.kind.clone())
    }

    fn object_headers(object: &StoredObject) -> HttpResponse {
        let mut response = HttpResponse::new(200)
            .with_header("etag", object.etag.clone())
            .with_header("last-modified", format_http_date(&object.last_modified))
            .with_header(HEADER_CRC32, object.crc32.to_string())
            .with_header(HEADER_VERSION_ID, object.version_id.clone())
            .with_header("content-length", object.data.len().to_string());
        for (name, value) in &object.metadata {
            response = response.with_header(name, value.clone());
        }
        response
    }

    fn check_conditions(object: &StoredObject, request: &HttpRequest) -> Option<HttpResponse> {
        if let Some(expected) = request.header("if-match") {
            if expected != "*" && expected != object.etag {
                return Some(HttpResponse::error(
                    412,
                    codes::PRECONDITION_FAILED,
                    "At least one of the pre-conditions you specified did not hold",
                ));
            }
        }
        if let Some(t) = request.header("if-unmodified-since").and_then(parse_http_date) {
            if object.last_modified > t {
                return Some(HttpResponse::error(
                    412,
                    codes::PRECONDITION_FAILED,
                    "Object modified since the given time",
                ));
            }
        }
        if let Some(expected) = request.header("if-none-match") {
            if expected == "*" || expected == object.etag {
                return Some(HttpResponse::error(304, codes::NOT_MODIFIED, "Not Modified"));
            }
        }
        if let Some(t) = request.header("if-modified-since").and_then(parse_http_date) {
            if object.last_modified <= t {
                return Some(HttpResponse::error(304, codes::NOT_MODIFIED, "Not Modified"));
            }
        }
        None
    }

    fn no_such_key(key: &str) -> HttpResponse {
        HttpResponse::error(
            404,
            codes::NO_SUCH_KEY,
            format!("The specified key does not exist: {}", key),
        )
    }

    fn no_such_upload(upload_id: &str) -> HttpResponse {
        HttpResponse::error(
            404,
            codes::NO_SUCH_UPLOAD,
            format!("The specified upload does not exist: {}", upload_id),
        )
    }

    fn handle(
        state: &mut StoreState,
        operation: Operation,
        request: &HttpRequest,
        bucket: &str,
        key: &str,
    ) -> HttpResponse {
        let object_key = (bucket.to_string(), key.to_string());

        match operation {
            Operation::PutObject => {
                if let Some(md5) = request.header("content-md5") {
                    if md5 != checksum::content_md5_base64(&request.body) {
                        return HttpResponse::error(400, "BadDigest", "Content-MD5 mismatch");
                    }
                }
                let version_id = format!("v{}", state.next_id());
                let object = StoredObject {
                    etag: checksum::md5_hex(&request.body),
                    crc32: checksum::crc32(&request.body),
                    data: request.body.clone(),
                    last_modified: now_seconds(),
                    version_id,
                    metadata: stored_headers(&request.headers),
                    appendable: false,
                };
                let response = HttpResponse::new(200)
                    .with_header("etag", object.etag.clone())
                    .with_header(HEADER_CRC32, object.crc32.to_string())
                    .with_header(HEADER_VERSION_ID, object.version_id.clone());
                state.install(object_key, object);
                response
            }

            Operation::GetObject | Operation::HeadObject => {
                let object = match state.lookup(&object_key, request.query_value("versionId")) {
                    Ok(object) => object,
                    Err(missing) => return missing,
                };
                if let Some(failed) = Self::check_conditions(object, request) {
                    return failed;
                }

                let mut response = Self::object_headers(object);
                if operation == Operation::HeadObject {
                    return response;
                }

                let size = object.data.len() as u64;
                match request.header("range").and_then(ByteRange::parse_header) {
                    Some(range) => {
                        let Ok((start, end)) = range.resolve(size) else {
                            return HttpResponse::error(
                                416,
                                codes::INVALID_RANGE,
                                "The requested range is not satisfiable",
                            );
                        };
                        response.status = 206;
                        response
                            .with_header("content-length", (end - start).to_string())
                            .with_header(
                                "content-range",
                                format!("bytes {}-{}/{}", start, end - 1, size),
                            )
                            .with_body(object.data[start as usize..end as usize].to_vec())
                    }
                    None => response.with_body(object.data.clone()),
                }
            }

            Operation::DeleteObject => {
                state.objects.remove(&object_key);
                HttpResponse::new(204)
            }

            Operation::CopyObject => {
                let Some(copy_source) = request.header(HEADER_COPY_SOURCE).and_then(CopySource::parse_header)
                else {
                    return HttpResponse::error(400, "InvalidArgument", "Invalid copy source");
                };
                let source = match state.lookup(
                    &(copy_source.bucket, copy_source.key),
                    copy_source.version_id.as_deref(),
                ) {
                    Ok(source) => source.clone(),
                    Err(missing) => return missing,
                };
                if let Some(expected) = request.header(HEADER_COPY_SOURCE_IF_MATCH) {
                    if expected != source.etag {
                        return HttpResponse::error(412, codes::PRECONDITION_FAILED, "Copy source changed");
                    }
                }
                let metadata = if request.header("x-metadata-directive") == Some("REPLACE") {
                    stored_headers(&request.headers)
                } else {
                    source.metadata.clone()
                };
                let version_id = format!("v{}", state.next_id());
                let object = StoredObject {
                    last_modified: now_seconds(),
                    version_id,
                    metadata,
                    appendable: false,
                    ..source
                };
                let response = HttpResponse::new(200)
                    .with_header("etag", object.etag.clone())
                    .with_header(HEADER_CRC32, object.crc32.to_string())
                    .with_header(HEADER_VERSION_ID, object.version_id.clone());
                state.install(object_key, object);
                response
            }

            Operation::AppendObject => {
                let Some(position) = request
                    .query_value("position")
                    .and_then(|p| p.parse::<u64>().ok())
                else {
                    return HttpResponse::error(400, "InvalidArgument", "Missing append position");
                };
                match state.objects.get(&object_key) {
                    Some(existing) if !existing.appendable => {
                        return HttpResponse::error(409, "ObjectNotAppendable", "Object is not appendable");
                    }
                    Some(existing) if position != existing.data.len() as u64 => {
                        return HttpResponse::error(
                            409,
                            codes::POSITION_NOT_EQUAL_TO_LENGTH,
                            format!("Position {} is not equal to length {}", position, existing.data.len()),
                        );
                    }
                    None if position != 0 => {
                        return HttpResponse::error(
                            409,
                            codes::POSITION_NOT_EQUAL_TO_LENGTH,
                            "Position must be 0 for a new object",
                        );
                    }
                    _ => {}
                }
                let version_id = format!("v{}", state.next_id());
                let metadata = stored_headers(&request.headers);
                let object = state.objects.entry(object_key).or_insert_with(|| StoredObject {
                    data: Vec::new(),
                    etag: String::new(),
                    crc32: 0,
                    last_modified: now_seconds(),
                    version_id: String::new(),
                    metadata,
                    appendable: true,
                });
                object.data.extend_from_slice(&request.body);
                object.etag = checksum::md5_hex(&object.data);
                object.crc32 = checksum::crc32(&object.data);
                object.last_modified = now_seconds();
                object.version_id = version_id;
                HttpResponse::new(200)
                    .with_header("etag", object.etag.clone())
                    .with_header(HEADER_CRC32, object.crc32.to_string())
                    .with_header(HEADER_NEXT_APPEND_POSITION, object.data.len().to_string())
            }

            Operation::InitiateMultipartUpload => {
                let upload_id = format!("upload-{:06}", state.next_id());
                state.uploads.insert(
                    upload_id.clone(),
                    MultipartSession {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        metadata: stored_headers(&request.headers),
                        parts: BTreeMap::new(),
                    },
                );
                debug!("Initiated multipart upload {} for {}/{}", upload_id, bucket, key);
                HttpResponse::new(200).with_header(HEADER_UPLOAD_ID, upload_id)
            }

            Operation::UploadPart | Operation::UploadPartCopy => {
                let upload_id = request.query_value("uploadId").unwrap_or_default().to_string();
                let part_number = match request
                    .query_value("partNumber")
                    .and_then(|p| p.parse::<u32>().ok())
                {
                    Some(n) if (1..=MAX_PART_COUNT).contains(&n) => n,
                    _ => return HttpResponse::error(400, "InvalidArgument", "Invalid part number"),
                };

                let data = if operation == Operation::UploadPartCopy {
                    let Some(copy_source) =
                        request.header(HEADER_COPY_SOURCE).and_then(CopySource::parse_header)
                    else {
                        return HttpResponse::error(400, "InvalidArgument", "Invalid copy source");
                    };
                    let source = match state.lookup(
                        &(copy_source.bucket, copy_source.key),
                        copy_source.version_id.as_deref(),
                    ) {
                        Ok(source) => source,
                        Err(missing) => return missing,
                    };
                    if let Some(expected) = request.header(HEADER_COPY_SOURCE_IF_MATCH) {
                        if expected != source.etag {
                            return HttpResponse::error(412, codes::PRECONDITION_FAILED, "Copy source changed");
                        }
                    }
                    match request.header(HEADER_COPY_SOURCE_RANGE).and_then(ByteRange::parse_header) {
                        Some(range) => match range.resolve(source.data.len() as u64) {
                            Ok((start, end)) => source.data[start as usize..end as usize].to_vec(),
                            Err(_) => {
                                return HttpResponse::error(416, codes::INVALID_RANGE, "Copy range not satisfiable")
                            }
                        },
                        None => source.data.clone(),
                    }
                } else {
                    request.body.clone()
                };

                let Some(session) = state.uploads.get_mut(&upload_id) else {
                    return Self::no_such_upload(&upload_id);
                };
                if session.bucket != bucket || session.key != key {
                    return Self::no_such_upload(&upload_id);
                }
                let part = StoredPart {
                    etag: checksum::md5_hex(&data),
                    crc32: checksum::crc32(&data),
                    data,
                };
                let response = HttpResponse::new(200)
                    .with_header("etag", part.etag.clone())
                    .with_header(HEADER_CRC32, part.crc32.to_string());
                trace!("Stored part {} of {}", part_number, upload_id);
                session.parts.insert(part_number, part);
                response
            }

            Operation::CompleteMultipartUpload => {
                let upload_id = request.query_value("uploadId").unwrap_or_default().to_string();
                let Some(session) = state.uploads.get(&upload_id) else {
                    return Self::no_such_upload(&upload_id);
                };
                if session.bucket != bucket || session.key != key {
                    return Self::no_such_upload(&upload_id);
                }

                let requested: Vec<CompletedPart> = match serde_json::from_slice(&request.body) {
                    Ok(parts) => parts,
                    Err(e) => return HttpResponse::error(400, "MalformedRequest", e.to_string()),
                };
                if requested.is_empty() {
                    return HttpResponse::error(400, "MalformedRequest", "No parts given");
                }
                if requested
                    .windows(2)
                    .any(|w| w[0].part_number >= w[1].part_number)
                {
                    return HttpResponse::error(400, codes::INVALID_PART_ORDER, "Parts must be ascending");
                }

                let mut parts = Vec::with_capacity(requested.len());
                for (index, wanted) in requested.iter().enumerate() {
                    let Some(part) = session.parts.get(&wanted.part_number) else {
                        return HttpResponse::error(
                            400,
                            codes::INVALID_PART,
                            format!("Part {} was not uploaded", wanted.part_number),
                        );
                    };
                    if part.etag != wanted.etag {
                        return HttpResponse::error(
                            400,
                            codes::INVALID_PART,
                            format!("Part {} etag mismatch", wanted.part_number),
                        );
                    }
                    let is_last = index + 1 == requested.len();
                    if !is_last && (part.data.len() as u64) < MIN_PART_SIZE {
                        return HttpResponse::error(
                            400,
                            codes::ENTITY_TOO_SMALL,
                            format!("Part {} is smaller than the minimum", wanted.part_number),
                        );
                    }
                    parts.push(part);
                }

                let mut data = Vec::with_capacity(parts.iter().map(|p| p.data.len()).sum());
                for part in &parts {
                    data.extend_from_slice(&part.data);
                }
                let etag = multipart_etag(&parts);
                let metadata = session.metadata.clone();
                let version_id = format!("v{}", state.next_id());

                let object = StoredObject {
                    crc32: checksum::crc32(&data),
                    data,
                    etag,
                    last_modified: now_seconds(),
                    version_id,
                    metadata,
                    appendable: false,
                };
                let response = HttpResponse::new(200)
                    .with_header("etag", object.etag.clone())
                    .with_header(HEADER_CRC32, object.crc32.to_string())
                    .with_header(HEADER_VERSION_ID, object.version_id.clone());
                state.uploads.remove(&upload_id);
                state.install(object_key, object);
                debug!("Completed multipart upload {}", upload_id);
                response
            }

            Operation::AbortMultipartUpload => {
                let upload_id = request.query_value("uploadId").unwrap_or_default();
                match state.uploads.remove(upload_id) {
                    Some(_) => HttpResponse::new(204),
                    None => Self::no_such_upload(upload_id),
                }
            }

            Operation::ListParts => {
                let upload_id = request.query_value("uploadId").unwrap_or_default();
                let Some(session) = state.uploads.get(upload_id) else {
                    return Self::no_such_upload(upload_id);
                };
                let parts: Vec<PartETag> = session
                    .parts
                    .iter()
                    .map(|(number, part)| PartETag {
                        part_number: *number,
                        etag: part.etag.clone(),
                        size: part.data.len() as u64,
                        crc32: Some(part.crc32),
                    })
                    .collect();
                match serde_json::to_vec(&parts) {
                    Ok(body) => HttpResponse::new(200).with_body(body),
                    Err(e) => HttpResponse::error(500, codes::INTERNAL_ERROR, e.to_string()),
                }
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let (operation, fault, latency, request_id) = {
            let mut state = self.lock();
            let operation = Operation::classify(request);
            *state.counts.entry(operation).or_insert(0) += 1;
            let fault = Self::take_fault(&mut state, operation, request);
            let request_id = format!("req-{:08}", state.next_id());
            (operation, fault, state.latency, request_id)
        };

        if !latency.is_zero() {
            thread::sleep(latency);
        }

        match fault {
            Some(FaultKind::Network(message)) => {
                debug!("Injected network failure on {:?}", operation);
                return Err(VaultError::Network(message));
            }
            Some(FaultKind::Status {
                status,
                code,
                message,
            }) => {
                debug!("Injected {} on {:?}", code, operation);
                return Ok(HttpResponse::error(status, &code, message)
                    .with_header(HEADER_REQUEST_ID, request_id));
            }
            None => {}
        }

        let (bucket, key) = match &request.url {
            Some(url) => {
                let target = match &self.verifier {
                    Some(verifier) => verifier.verify_presigned(request.method, url),
                    None => parse_presigned_url(url),
                };
                match target {
                    Ok(target) => (target.bucket, target.key),
                    Err(e) => {
                        let (status, code) = (e.status().unwrap_or(400), e.code().to_string());
                        return Ok(HttpResponse::error(status, &code, e.to_string())
                            .with_header(HEADER_REQUEST_ID, request_id));
                    }
                }
            }
            None => match &request.key {
                Some(key) => (request.bucket.clone(), key.clone()),
                None => {
                    return Ok(HttpResponse::error(400, "InvalidArgument", "Missing object key")
                        .with_header(HEADER_REQUEST_ID, request_id))
                }
            },
        };

        let mut state = self.lock();
        let response = Self::handle(&mut state, operation, request, &bucket, &key);
        Ok(response.with_header(HEADER_REQUEST_ID, request_id))
    }
}
