//! AWS Signature Version 4 for S3-compatible requests.
//!
//! Only the header-based variant is implemented: every request carries
//! `host`, `x-amz-content-sha256` and `x-amz-date`, and the payload is hashed
//! in full (objects written here are small documents).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
}

/// Signs requests for one access key / region pair.
#[derive(Clone)]
pub struct Signer {
    access_key: String,
    secret_key: String,
    region: String,
}

impl Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
        }
    }

    /// Produce the signature headers for a request.
    ///
    /// `host` must include the port when it is not the scheme default, and
    /// `canonical_path` must already be URI-encoded.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        canonical_path: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> SignedHeaders {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let content_sha256 = hex::encode(Sha256::digest(payload));

        let canonical_request = format!(
            "{method}\n{path}\n\nhost:{host}\nx-amz-content-sha256:{hash}\nx-amz-date:{amz_date}\n\n{signed}\n{hash}",
            method = method,
            path = canonical_path,
            host = host,
            hash = content_sha256,
            amz_date = amz_date,
            signed = SIGNED_HEADERS,
        );

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(&self.secret_key, &date, &self.region, SERVICE);
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

        SignedHeaders {
            authorization: format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, self.access_key, scope, SIGNED_HEADERS, signature
            ),
            amz_date,
            content_sha256,
        }
    }
}

/// Derive the per-day signing key.
pub(crate) fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// URI-encode a path, leaving `/` separators intact.
pub fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn signing_key_matches_published_vector() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn empty_payload_hash() {
        let signer = Signer::new("AKID", "secret", "us-east-1");
        let now = Utc.with_ymd_and_hms(2025, 11, 14, 5, 0, 0).unwrap();
        let headers = signer.sign("HEAD", "minio:9000", "/okx", b"", now);
        assert_eq!(
            headers.content_sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(headers.amz_date, "20251114T050000Z");
    }

    #[test]
    fn authorization_names_scope_and_headers() {
        let signer = Signer::new("AKID", "secret", "us-east-1");
        let now = Utc.with_ymd_and_hms(2025, 11, 14, 5, 0, 0).unwrap();
        let headers = signer.sign("PUT", "minio:9000", "/okx/data/x.json", b"{}", now);

        assert!(headers.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKID/20251114/us-east-1/s3/aws4_request, "
        ));
        assert!(headers
            .authorization
            .contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));

        let signature = headers.authorization.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn signature_depends_on_payload() {
        let signer = Signer::new("AKID", "secret", "us-east-1");
        let now = Utc.with_ymd_and_hms(2025, 11, 14, 5, 0, 0).unwrap();
        let a = signer.sign("PUT", "minio:9000", "/okx/k", b"a", now);
        let b = signer.sign("PUT", "minio:9000", "/okx/k", b"b", now);
        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn encode_path_keeps_separators() {
        assert_eq!(
            encode_path("/okx/data/data_20251114T050000.250Z.json"),
            "/okx/data/data_20251114T050000.250Z.json"
        );
        assert_eq!(encode_path("/okx/a b:c"), "/okx/a%20b%3Ac");
    }
}
