//! S3-compatible HTTP client (path-style addressing, as MinIO serves it).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Method, Response, StatusCode, Url};
use tracing::{debug, warn};

use crate::sigv4::{Signer, encode_path};
use crate::store::{ObjectStore, validate_bucket_name, validate_object_key};
use crate::{DEFAULT_REGION, ObjectStoreConfig, StoreError};

/// Client for a single S3-compatible endpoint.
pub struct S3Client {
    http: Client,
    base_url: Url,
    host: String,
    region: String,
    signer: Signer,
}

impl S3Client {
    /// Create a client from validated configuration.
    pub fn new(config: &ObjectStoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let base_url = config.base_url()?;

        let host = match (base_url.host_str(), base_url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(StoreError::InvalidConfig(format!(
                    "endpoint '{}' has no host",
                    config.endpoint
                )));
            }
        };

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            base_url,
            host,
            region: config.region.clone(),
            signer: Signer::new(&config.access_key, &config.secret_key, &config.region),
        })
    }

    /// Issue a signed request against `path` (unencoded, starting with `/`).
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<Response, StoreError> {
        let canonical_path = encode_path(path);
        let url = format!(
            "{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            canonical_path
        );

        let signed = self
            .signer
            .sign(method.as_str(), &self.host, &canonical_path, &body, Utc::now());

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("authorization", signed.authorization)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256);

        if let Some(content_type) = content_type {
            request = request.header("content-type", content_type);
        }
        if method == Method::PUT {
            request = request.body(body);
        }

        debug!(method = %method, url = %url, "object store request");
        Ok(request.send().await?)
    }

    fn location_constraint(&self) -> Bytes {
        if self.region == DEFAULT_REGION {
            Bytes::new()
        } else {
            Bytes::from(format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            ))
        }
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    #[tracing::instrument(skip(self))]
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        validate_bucket_name(bucket)?;
        let response = self
            .send(Method::HEAD, &format!("/{}", bucket), Bytes::new(), None)
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_from_response(response, bucket).await),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn make_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        validate_bucket_name(bucket)?;
        let response = self
            .send(
                Method::PUT,
                &format!("/{}", bucket),
                self.location_constraint(),
                None,
            )
            .await?;

        if response.status().is_success() {
            debug!(bucket, "bucket created");
            return Ok(());
        }

        match error_from_response(response, bucket).await {
            StoreError::Status {
                status: 409,
                code: Some(code),
                ..
            } if code == "BucketAlreadyOwnedByYou" || code == "BucketAlreadyExists" => {
                debug!(bucket, code = %code, "bucket already exists");
                Ok(())
            }
            err => Err(err),
        }
    }

    #[tracing::instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        let response = self
            .send(
                Method::PUT,
                &format!("/{}/{}", bucket, key),
                data,
                Some(content_type),
            )
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let resource = format!("{}/{}", bucket, key);
        match error_from_response(response, &resource).await {
            StoreError::Status {
                status: 404,
                code: Some(code),
                ..
            } if code == "NoSuchBucket" => Err(StoreError::NoSuchBucket(bucket.to_string())),
            err => Err(err),
        }
    }
}

/// Turn a non-success response into a [`StoreError`].
async fn error_from_response(response: Response, resource: &str) -> StoreError {
    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to read object store error body");
            String::new()
        }
    };

    let code = xml_tag(&body, "Code");
    let message = xml_tag(&body, "Message").unwrap_or_else(|| {
        if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("no response body")
                .to_string()
        } else {
            body.trim().to_string()
        }
    });

    if status == StatusCode::FORBIDDEN {
        return StoreError::PermissionDenied {
            resource: resource.to_string(),
            message: match code {
                Some(code) => format!("{}: {}", code, message),
                None => message,
            },
        };
    }

    StoreError::Status {
        status: status.as_u16(),
        code,
        message,
    }
}

/// Extract the text of the first `<tag>...</tag>` in an S3 XML error body.
fn xml_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}
