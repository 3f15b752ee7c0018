//! Idempotent artifact writer on top of an [`ObjectStore`].

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::ObjectStore;
use crate::{KeyPrecision, ObjectKey, StoreError};

/// Where and how slot artifacts are named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLayout {
    pub prefix: String,
    pub suffix: String,
    pub precision: KeyPrecision,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>, precision: KeyPrecision) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            precision,
        }
    }

    pub fn key_for(&self, slot: DateTime<Utc>) -> ObjectKey {
        ObjectKey::for_slot(&self.prefix, slot, self.precision, &self.suffix)
    }
}

/// A written object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub container: String,
    pub key: ObjectKey,
    pub content_type: String,
    pub size: usize,
}

/// Ensures containers exist and writes artifacts into them.
pub struct ObjectSink {
    store: Arc<dyn ObjectStore>,
    /// Containers confirmed to exist by this process.
    known: DashSet<String>,
}

impl ObjectSink {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            known: DashSet::new(),
        }
    }

    /// Create the container if it does not exist yet.
    ///
    /// Safe to race: the underlying `make_bucket` treats an existing bucket
    /// as success.
    pub async fn ensure_container(&self, name: &str) -> Result<(), StoreError> {
        if self.known.contains(name) {
            return Ok(());
        }

        if !self.store.bucket_exists(name).await? {
            self.store.make_bucket(name).await?;
            info!(container = name, "created container");
        }

        self.known.insert(name.to_string());
        Ok(())
    }

    /// Write one object. Re-writing the same key replaces the object.
    pub async fn put_object(
        &self,
        container: &str,
        key: &ObjectKey,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<Artifact, StoreError> {
        let size = bytes.len();
        match self
            .store
            .put_object(container, key.as_str(), bytes, content_type)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NoSuchBucket(bucket)) => {
                // Deleted behind our back; re-check on the next attempt.
                self.known.remove(container);
                return Err(StoreError::NoSuchBucket(bucket));
            }
            Err(e) => return Err(e),
        }

        debug!(container, key = %key, size, "object written");
        Ok(Artifact {
            container: container.to_string(),
            key: key.clone(),
            content_type: content_type.to_string(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryObjectStore;
    use chrono::TimeZone;

    fn sink() -> (Arc<MemoryObjectStore>, ObjectSink) {
        let store = Arc::new(MemoryObjectStore::new());
        (store.clone(), ObjectSink::new(store))
    }

    #[tokio::test]
    async fn ensure_container_creates_once() {
        let (store, sink) = sink();
        sink.ensure_container("okx").await.unwrap();
        sink.ensure_container("okx").await.unwrap();
        assert_eq!(store.bucket_creations(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_writers_do_not_error() {
        let store = Arc::new(MemoryObjectStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sink = ObjectSink::new(store.clone());
            handles.push(tokio::spawn(async move { sink.ensure_container("okx").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.bucket_creations(), 1);
    }

    #[tokio::test]
    async fn put_overwrites_same_key() {
        let (store, sink) = sink();
        sink.ensure_container("okx").await.unwrap();

        let key = ObjectKey::new("data/data_20251114T050000Z.json");
        sink.put_object("okx", &key, Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();
        let artifact = sink
            .put_object("okx", &key, Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();

        assert_eq!(artifact.size, 2);
        assert_eq!(store.keys("okx").len(), 1);
    }

    #[tokio::test]
    async fn missing_bucket_is_rechecked() {
        let (store, sink) = sink();
        sink.known.insert("okx".to_string());

        let key = ObjectKey::new("data/x.json");
        let err = sink
            .put_object("okx", &key, Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSuchBucket(_)));

        sink.ensure_container("okx").await.unwrap();
        assert_eq!(store.bucket_creations(), 1);
    }

    #[test]
    fn layout_derives_slot_key() {
        let layout = KeyLayout::new("data/data_", ".json", KeyPrecision::Seconds);
        let slot = Utc.with_ymd_and_hms(2025, 11, 14, 5, 0, 0).unwrap();
        assert_eq!(
            layout.key_for(slot).as_str(),
            "data/data_20251114T050000Z.json"
        );
    }
}
