//! Connection settings for an S3-compatible endpoint.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Region MinIO reports when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Endpoint and credentials, resolved once at process start.
#[derive(Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// `host:port` or a full `http(s)://` URL.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Use HTTPS when `endpoint` carries no scheme.
    #[serde(default)]
    pub secure: bool,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl ObjectStoreConfig {
    /// Create a config for a plain-HTTP endpoint in the default region.
    pub fn new(
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: default_region(),
            secure: false,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Resolve the base URL requests are issued against.
    pub fn base_url(&self) -> Result<Url, StoreError> {
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(StoreError::InvalidConfig("endpoint is empty".to_string()));
        }

        let raw = if endpoint.contains("://") {
            endpoint.to_string()
        } else if self.secure {
            format!("https://{}", endpoint)
        } else {
            format!("http://{}", endpoint)
        };

        let url = Url::parse(&raw)
            .map_err(|e| StoreError::InvalidConfig(format!("endpoint '{}': {}", raw, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(StoreError::InvalidConfig(format!(
                "endpoint scheme must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(StoreError::InvalidConfig(format!(
                "endpoint '{}' has no host",
                raw
            )));
        }
        if url.path() != "/" && !url.path().is_empty() {
            return Err(StoreError::InvalidConfig(format!(
                "endpoint '{}' must not contain a path",
                raw
            )));
        }

        Ok(url)
    }

    /// Check every field before any request is made.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.access_key.trim().is_empty() {
            return Err(StoreError::InvalidConfig("access key is empty".to_string()));
        }
        if self.secret_key.trim().is_empty() {
            return Err(StoreError::InvalidConfig("secret key is empty".to_string()));
        }
        if self.region.trim().is_empty() {
            return Err(StoreError::InvalidConfig("region is empty".to_string()));
        }
        self.base_url()?;
        Ok(())
    }
}

impl fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("secure", &self.secure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_defaults_to_http() {
        let config = ObjectStoreConfig::new("minio:9000", "ak", "sk");
        let url = config.base_url().unwrap();
        assert_eq!(url.as_str(), "http://minio:9000/");
    }

    #[test]
    fn secure_flag_selects_https() {
        let config = ObjectStoreConfig::new("minio:9000", "ak", "sk").with_secure(true);
        assert_eq!(config.base_url().unwrap().scheme(), "https");
    }

    #[test]
    fn explicit_scheme_wins() {
        let config = ObjectStoreConfig::new("https://s3.local/", "ak", "sk");
        assert_eq!(config.base_url().unwrap().as_str(), "https://s3.local/");
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let config = ObjectStoreConfig::new("minio:9000", "", "sk");
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(msg)) if msg.contains("access key")
        ));

        let config = ObjectStoreConfig::new("minio:9000", "ak", "  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn endpoint_with_path_is_rejected() {
        let config = ObjectStoreConfig::new("http://minio:9000/bucket", "ak", "sk");
        assert!(config.validate().is_err());
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let config = ObjectStoreConfig::new("ftp://minio:9000", "ak", "sk");
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let config = ObjectStoreConfig::new("minio:9000", "ak", "super-secret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
