//! In-process object store used by tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::StoreError;
use crate::store::{ObjectStore, validate_bucket_name, validate_object_key};

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
}

/// Thread-safe in-memory bucket/object map.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: DashMap<String, HashMap<String, StoredObject>>,
    /// Number of upcoming `put_object` calls that fail with a 503.
    failing_puts: AtomicU32,
    bucket_creations: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a retryable error.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Fetch an object.
    pub fn get_object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.buckets
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    /// All keys in a bucket, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// How many buckets were actually created (not counting idempotent repeats).
    pub fn bucket_creations(&self) -> usize {
        self.bucket_creations.load(Ordering::SeqCst)
    }

    /// How many `put_object` calls were attempted, including failed ones.
    pub fn put_attempts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        validate_bucket_name(bucket)?;
        Ok(self.buckets.contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        validate_bucket_name(bucket)?;
        if let Entry::Vacant(entry) = self.buckets.entry(bucket.to_string()) {
            entry.insert(HashMap::new());
            self.bucket_creations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;
        self.puts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Status {
                status: 503,
                code: Some("ServiceUnavailable".to_string()),
                message: "injected failure".to_string(),
            });
        }

        let mut objects = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_requires_bucket() {
        let store = MemoryObjectStore::new();
        let err = store
            .put_object("okx", "data/a.json", Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSuchBucket(b) if b == "okx"));
    }

    #[tokio::test]
    async fn make_bucket_is_idempotent() {
        let store = MemoryObjectStore::new();
        store.make_bucket("okx").await.unwrap();
        store.make_bucket("okx").await.unwrap();
        assert!(store.bucket_exists("okx").await.unwrap());
        assert_eq!(store.bucket_creations(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryObjectStore::new();
        store.make_bucket("okx").await.unwrap();
        store.fail_next_puts(2);

        for _ in 0..2 {
            let err = store
                .put_object("okx", "k", Bytes::from_static(b"x"), "text/plain")
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }

        store
            .put_object("okx", "k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
        assert_eq!(store.put_attempts(), 3);
        assert_eq!(store.keys("okx"), vec!["k".to_string()]);
    }
}
