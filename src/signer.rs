/*!
 * Request signing and presigned URLs
 */

use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::error::{Result, VaultError};
use crate::transport::{HttpRequest, Method};

type HmacSha256 = Hmac<Sha256>;

/// Produces request credentials
pub trait Signer: Send + Sync {
    /// Add authentication headers to a request
    fn sign(&self, request: &mut HttpRequest) -> Result<()>;

    /// Build a presigned URL for one object operation
    fn presign(
        &self,
        endpoint: &str,
        method: Method,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String>;
}

/// Bucket, key and query of a parsed presigned URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedTarget {
    pub bucket: String,
    pub key: String,
    pub query: BTreeMap<String, String>,
}

/// Split a presigned URL into bucket, key and query parameters
pub fn parse_presigned_url(url: &str) -> Result<PresignedTarget> {
    let parsed =
        Url::parse(url).map_err(|e| VaultError::Validate(format!("invalid URL {}: {}", url, e)))?;

    let mut segments = parsed
        .path_segments()
        .ok_or_else(|| VaultError::Validate(format!("URL has no path: {}", url)))?;
    let decode = |segment: &str| {
        percent_decode_str(segment)
            .decode_utf8()
            .map(|s| s.into_owned())
            .map_err(|e| VaultError::Validate(format!("invalid URL path {}: {}", url, e)))
    };
    let bucket = decode(segments.next().unwrap_or_default())?;
    let key = segments.map(decode).collect::<Result<Vec<_>>>()?.join("/");
    if bucket.is_empty() || key.is_empty() {
        return Err(VaultError::Validate(format!(
            "URL does not name an object: {}",
            url
        )));
    }

    let query = parsed.query_pairs().into_owned().collect();
    Ok(PresignedTarget { bucket, key, query })
}

/// HMAC-SHA256 signer keyed by an access key pair
#[derive(Clone)]
pub struct HmacSigner {
    access_key: String,
    secret_key: String,
}

impl HmacSigner {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| VaultError::Validate(format!("invalid secret key: {}", e)))
    }

    fn signature(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(string_to_sign.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn presign_string(method: Method, bucket: &str, key: &str, expires: i64, access_key: &str) -> String {
        format!("{}\n/{}/{}\n{}\n{}", method, bucket, key, expires, access_key)
    }

    /// Check a presigned URL's signature and expiry for `method`
    pub fn verify_presigned(&self, method: Method, url: &str) -> Result<PresignedTarget> {
        let target = parse_presigned_url(url)?;
        let denied = |message: &str| VaultError::service(403, "AccessDenied", message);

        let expires: i64 = target
            .query
            .get("expires")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| denied("missing expires"))?;
        let access_key = target
            .query
            .get("access-key")
            .ok_or_else(|| denied("missing access key"))?;
        let signature = target
            .query
            .get("signature")
            .and_then(|s| hex::decode(s).ok())
            .ok_or_else(|| denied("missing signature"))?;

        if access_key != &self.access_key {
            return Err(denied("unknown access key"));
        }
        if Utc::now().timestamp() > expires {
            return Err(denied("request has expired"));
        }

        let mut mac = self.mac()?;
        mac.update(
            Self::presign_string(method, &target.bucket, &target.key, expires, access_key).as_bytes(),
        );
        mac.verify_slice(&signature)
            .map_err(|_| denied("signature does not match"))?;

        Ok(target)
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl Signer for HmacSigner {
    fn sign(&self, request: &mut HttpRequest) -> Result<()> {
        let date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        request.headers.insert("x-date".to_string(), date.clone());

        let query = request
            .query
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{}={}", k, v),
                None => k.clone(),
            })
            .collect::<Vec<_>>()
            .join("&");
        let payload_hash = hex::encode(Sha256::digest(&request.body));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}\n{}",
            request.method,
            request.path(),
            query,
            date,
            payload_hash
        );
        let signature = self.signature(&string_to_sign)?;

        request.headers.insert(
            "authorization".to_string(),
            format!("OBJV-HMAC-SHA256 {}:{}", self.access_key, signature),
        );
        Ok(())
    }

    fn presign(
        &self,
        endpoint: &str,
        method: Method,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String> {
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        let signature =
            self.signature(&Self::presign_string(method, bucket, key, expires, &self.access_key))?;

        let mut url = Url::parse(endpoint)
            .map_err(|e| VaultError::Validate(format!("invalid endpoint {}: {}", endpoint, e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| VaultError::Validate(format!("endpoint cannot be a base: {}", endpoint)))?;
            segments.pop_if_empty().push(bucket);
            for part in key.split('/') {
                segments.push(part);
            }
        }
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("access-key", &self.access_key)
            .append_pair("signature", &signature);

        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> HmacSigner {
        HmacSigner::new("AK", "secret")
    }

    #[test]
    fn test_sign_adds_headers() {
        let mut req = HttpRequest::new(Method::Put, "b", Some("k")).with_body(b"data".to_vec());
        signer().sign(&mut req).unwrap();
        assert!(req.header("x-date").is_some());
        assert!(req
            .header("authorization")
            .unwrap()
            .starts_with("OBJV-HMAC-SHA256 AK:"));
    }

    #[test]
    fn test_presign_round_trip() {
        let url = signer()
            .presign(
                "memory://objvault",
                Method::Get,
                "bucket",
                "dir/a b.txt",
                Duration::from_secs(60),
            )
            .unwrap();
        assert!(url.starts_with("memory://objvault/bucket/dir/a%20b.txt?expires="));

        let target = signer().verify_presigned(Method::Get, &url).unwrap();
        assert_eq!(target.bucket, "bucket");
        assert_eq!(target.key, "dir/a b.txt");
    }

    #[test]
    fn test_presign_rejects_wrong_method_or_key() {
        let url = signer()
            .presign("memory://objvault", Method::Get, "b", "k", Duration::from_secs(60))
            .unwrap();
        let err = signer().verify_presigned(Method::Put, &url).unwrap_err();
        assert_eq!(err.code(), "AccessDenied");

        let other = HmacSigner::new("AK", "other-secret");
        assert!(other.verify_presigned(Method::Get, &url).is_err());
    }

    #[test]
    fn test_parse_rejects_bucket_only() {
        assert!(parse_presigned_url("memory://objvault/bucket").is_err());
        assert!(parse_presigned_url("not a url").is_err());
    }
}
