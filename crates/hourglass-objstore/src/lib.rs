//! Object sink for hourglass artifacts.
//!
//! This crate provides the narrow object-store protocol the scheduler writes
//! through:
//! - **Protocol**: `bucket_exists` / `make_bucket` / `put_object`
//! - **S3 client**: path-style, SigV4-signed HTTP client for MinIO and S3
//! - **Memory store**: in-process implementation for tests
//! - **Keys**: deterministic, collision-free object keys per logical slot

mod client;
mod config;
mod error;
mod key;
mod memory;
mod sigv4;
mod sink;
mod store;

pub use client::S3Client;
pub use config::{DEFAULT_REGION, ObjectStoreConfig};
pub use error::StoreError;
pub use key::{KeyPrecision, ObjectKey};
pub use memory::{MemoryObjectStore, StoredObject};
pub use sigv4::{SignedHeaders, Signer};
pub use sink::{Artifact, KeyLayout, ObjectSink};
pub use store::{ObjectStore, validate_bucket_name, validate_object_key};
