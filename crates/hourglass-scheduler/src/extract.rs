//! The extraction collaborator: whatever produces the bytes of an artifact.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::TaskError;

/// Content type of JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Bytes to store plus their content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Bytes,
    pub content_type: String,
}

impl Payload {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn json(bytes: impl Into<Bytes>) -> Self {
        Self::new(bytes, JSON_CONTENT_TYPE)
    }
}

/// Produces the payload of one run. The scheduler never looks inside it.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self) -> Result<Payload, TaskError>;
}

/// Reads a local JSON document and re-encodes it pretty-printed.
#[derive(Debug, Clone)]
pub struct JsonFileExtractor {
    path: PathBuf,
}

impl JsonFileExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Extractor for JsonFileExtractor {
    async fn extract(&self) -> Result<Payload, TaskError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => TaskError::Configuration(
                format!("cannot read {}: {}", self.path.display(), e),
            ),
            _ => TaskError::Transient(format!("reading {}: {}", self.path.display(), e)),
        })?;

        let document: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| {
            TaskError::Configuration(format!("{} is not valid JSON: {}", self.path.display(), e))
        })?;

        let pretty = serde_json::to_vec_pretty(&document)
            .map_err(|e| TaskError::Transient(format!("encoding payload: {}", e)))?;

        Ok(Payload::json(pretty))
    }
}

/// Adapts a closure into an [`Extractor`].
pub struct FnExtractor<F>(F);

impl<F> FnExtractor<F>
where
    F: Fn() -> Result<Payload, TaskError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Extractor for FnExtractor<F>
where
    F: Fn() -> Result<Payload, TaskError> + Send + Sync,
{
    async fn extract(&self) -> Result<Payload, TaskError> {
        (self.0)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_file_is_pretty_printed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"{"symbol":["BTC-USDT",97000.1]}"#).unwrap();

        let payload = JsonFileExtractor::new(&path).extract().await.unwrap();
        assert_eq!(payload.content_type, "application/json");
        assert_eq!(
            std::str::from_utf8(&payload.bytes).unwrap(),
            "{\n  \"symbol\": [\n    \"BTC-USDT\",\n    97000.1\n  ]\n}"
        );
    }

    #[tokio::test]
    async fn object_keys_keep_document_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"{"ts":"1","instId":"BTC","askPx":"2"}"#).unwrap();

        let payload = JsonFileExtractor::new(&path).extract().await.unwrap();
        assert_eq!(
            std::str::from_utf8(&payload.bytes).unwrap(),
            "{\n  \"ts\": \"1\",\n  \"instId\": \"BTC\",\n  \"askPx\": \"2\"\n}"
        );
    }

    #[tokio::test]
    async fn non_ascii_is_kept_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"["данные"]"#).unwrap();

        let payload = JsonFileExtractor::new(&path).extract().await.unwrap();
        assert!(std::str::from_utf8(&payload.bytes).unwrap().contains("данные"));
    }

    #[tokio::test]
    async fn missing_file_is_configuration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonFileExtractor::new(dir.path().join("absent.json"))
            .extract()
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_file_is_configuration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonFileExtractor::new(&path).extract().await.unwrap_err();
        assert!(matches!(err, TaskError::Configuration(msg) if msg.contains("not valid JSON")));
    }

    #[tokio::test]
    async fn closures_are_extractors() {
        let extractor = FnExtractor::new(|| Ok(Payload::json(Bytes::from_static(b"[]"))));
        let payload = extractor.extract().await.unwrap();
        assert_eq!(payload.bytes, Bytes::from_static(b"[]"));
    }
}
