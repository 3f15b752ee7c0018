//! The narrow object-store protocol the sink is written against.

use async_trait::async_trait;
use bytes::Bytes;

use crate::StoreError;

/// Bucket/object operations consumed from an S3-compatible store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check whether a bucket exists.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;

    /// Create a bucket. Creating a bucket that already exists is not an error.
    async fn make_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Write an object, replacing any existing object under the same key.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError>;
}

/// Validate a bucket name against the S3 naming rules.
pub fn validate_bucket_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| -> Result<(), StoreError> {
        Err(StoreError::InvalidConfig(format!(
            "invalid bucket name '{}': {}",
            name, reason
        )))
    };

    if name.len() < 3 || name.len() > 63 {
        return invalid("must be 3-63 characters");
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
    {
        return invalid("only lowercase letters, digits, '.' and '-' are allowed");
    }
    let first = name.as_bytes()[0];
    let last = name.as_bytes()[name.len() - 1];
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return invalid("must start and end with a letter or digit");
    }
    if name.contains("..") {
        return invalid("must not contain consecutive dots");
    }
    Ok(())
}

/// Validate an object key.
pub fn validate_object_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.len() > 1024 {
        return Err(StoreError::InvalidConfig(format!(
            "object key must be 1-1024 bytes, got {}",
            key.len()
        )));
    }
    if key.starts_with('/') {
        return Err(StoreError::InvalidConfig(format!(
            "object key '{}' must not start with '/'",
            key
        )));
    }
    Ok(())
}
