//! S3 client abstraction
//!
//! The uploader never talks to the network itself. Everything it needs from
//! S3 goes through [`S3UploadClient`], which covers exactly the five
//! operations a streaming upload uses. Authentication, signing, endpoint
//! resolution and retries are the implementation's concern.
//!
//! [`sdk`] provides the implementation for `aws_sdk_s3::Client`.
//!
//! # Request shape
//!
//! Every request carries the shared [`ObjectTarget`]. Implementations forward
//! whichever target fields the underlying API accepts for that operation:
//!
//! | Operation | Target fields forwarded |
//! |-----------|-------------------------|
//! | PutObject | all |
//! | CreateMultipartUpload | all except `if_none_match` |
//! | UploadPart | bucket, key, SSE-C key, expected owner, request payer |
//! | CompleteMultipartUpload | bucket, key, SSE-C key, expected owner, request payer, `if_none_match` |
//! | AbortMultipartUpload | bucket, key, expected owner, request payer |

pub mod sdk;

use crate::upload::checksum::{ChecksumAlgorithm, ChecksumType, ChecksumValue};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// S3 client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S3ClientError {
    #[error("Request error: {0}")]
    RequestError(String),

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("Service error {code}: {message}")]
    ServiceError { code: String, message: String },
}

impl S3ClientError {
    /// Build a service error from an S3 error code and message.
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServiceError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// S3 error code, when the service returned one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::ServiceError { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Customer-provided server-side encryption key (SSE-C).
///
/// Forwarded verbatim; the uploader never computes or checks key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SseCustomerKey {
    pub algorithm: String,
    pub key: String,
    pub key_md5: Option<String>,
}

impl std::fmt::Debug for SseCustomerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseCustomerKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .field("key_md5", &self.key_md5)
            .finish()
    }
}

/// Destination object and the metadata forwarded with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectTarget {
    pub bucket: String,
    pub key: String,
    pub acl: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub storage_class: Option<String>,
    /// URL-encoded `key=value` pairs.
    pub tagging: Option<String>,
    pub server_side_encryption: Option<String>,
    pub sse_kms_key_id: Option<String>,
    pub sse_customer: Option<SseCustomerKey>,
    pub expected_bucket_owner: Option<String>,
    pub request_payer: Option<String>,
    /// Conditional write; `"*"` fails the upload if the key already exists.
    pub if_none_match: Option<String>,
    /// Name of the checksum algorithm, e.g. `"CRC32C"`. Defaults to CRC32.
    pub checksum_algorithm: Option<String>,
}

impl ObjectTarget {
    /// Create a target for `bucket`/`key` with no extra metadata.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_checksum_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.checksum_algorithm = Some(algorithm.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tagging(mut self, tagging: impl Into<String>) -> Self {
        self.tagging = Some(tagging.into());
        self
    }
}

/// Part acknowledged by UploadPart, as listed in CompleteMultipartUpload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: Option<String>,
    /// Checksums echoed by the service, stored verbatim.
    pub checksums: BTreeMap<ChecksumAlgorithm, String>,
}

/// PutObject request
#[derive(Debug, Clone)]
pub struct PutObjectRequest {
    pub target: Arc<ObjectTarget>,
    pub body: Bytes,
    pub checksum: Option<ChecksumValue>,
}

/// PutObject response
#[derive(Debug, Clone, Default)]
pub struct PutObjectResponse {
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

/// CreateMultipartUpload request
#[derive(Debug, Clone)]
pub struct CreateMultipartUploadRequest {
    pub target: Arc<ObjectTarget>,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub checksum_type: ChecksumType,
}

/// CreateMultipartUpload response
#[derive(Debug, Clone)]
pub struct CreateMultipartUploadResponse {
    pub upload_id: String,
}

/// UploadPart request
#[derive(Debug, Clone)]
pub struct UploadPartRequest {
    pub target: Arc<ObjectTarget>,
    pub upload_id: String,
    pub part_number: i32,
    pub body: Bytes,
    pub checksum: Option<ChecksumValue>,
}

/// UploadPart response
#[derive(Debug, Clone, Default)]
pub struct UploadPartResponse {
    pub etag: Option<String>,
    pub checksums: BTreeMap<ChecksumAlgorithm, String>,
}

/// CompleteMultipartUpload request
#[derive(Debug, Clone)]
pub struct CompleteMultipartUploadRequest {
    pub target: Arc<ObjectTarget>,
    pub upload_id: String,
    /// Sorted by part number.
    pub parts: Vec<CompletedPart>,
    pub checksum: Option<ChecksumValue>,
    pub checksum_type: ChecksumType,
    /// Sum of all part sizes; S3 rejects the request if it disagrees.
    pub mpu_object_size: i64,
}

/// CompleteMultipartUpload response
#[derive(Debug, Clone, Default)]
pub struct CompleteMultipartUploadResponse {
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

/// AbortMultipartUpload request
#[derive(Debug, Clone)]
pub struct AbortMultipartUploadRequest {
    pub target: Arc<ObjectTarget>,
    pub upload_id: String,
}

/// The S3 operations needed to stream an object.
///
/// Cancellation is expressed by dropping the returned future.
#[async_trait]
pub trait S3UploadClient: Send + Sync {
    async fn put_object(
        &self,
        request: PutObjectRequest,
    ) -> Result<PutObjectResponse, S3ClientError>;

    async fn create_multipart_upload(
        &self,
        request: CreateMultipartUploadRequest,
    ) -> Result<CreateMultipartUploadResponse, S3ClientError>;

    async fn upload_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResponse, S3ClientError>;

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> Result<CompleteMultipartUploadResponse, S3ClientError>;

    async fn abort_multipart_upload(
        &self,
        request: AbortMultipartUploadRequest,
    ) -> Result<(), S3ClientError>;
}

#[async_trait]
impl<T: S3UploadClient + ?Sized> S3UploadClient for Arc<T> {
    async fn put_object(
        &self,
        request: PutObjectRequest,
    ) -> Result<PutObjectResponse, S3ClientError> {
        (**self).put_object(request).await
    }

    async fn create_multipart_upload(
        &self,
        request: CreateMultipartUploadRequest,
    ) -> Result<CreateMultipartUploadResponse, S3ClientError> {
        (**self).create_multipart_upload(request).await
    }

    async fn upload_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResponse, S3ClientError> {
        (**self).upload_part(request).await
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> Result<CompleteMultipartUploadResponse, S3ClientError> {
        (**self).complete_multipart_upload(request).await
    }

    async fn abort_multipart_upload(
        &self,
        request: AbortMultipartUploadRequest,
    ) -> Result<(), S3ClientError> {
        (**self).abort_multipart_upload(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_target_builder() {
        let target = ObjectTarget::new("test-bucket", "dir/key.bin")
            .with_content_type("application/octet-stream")
            .with_checksum_algorithm("SHA256")
            .with_metadata("origin", "unit-test")
            .with_tagging("env=test");

        assert_eq!(target.bucket, "test-bucket");
        assert_eq!(target.key, "dir/key.bin");
        assert_eq!(
            target.content_type.as_deref(),
            Some("application/octet-stream")
        );
        assert_eq!(target.checksum_algorithm.as_deref(), Some("SHA256"));
        assert_eq!(target.metadata.get("origin").map(String::as_str), Some("unit-test"));
        assert_eq!(target.tagging.as_deref(), Some("env=test"));
        assert!(target.acl.is_none());
    }

    #[test]
    fn test_sse_customer_key_is_redacted() {
        let key = SseCustomerKey {
            algorithm: "AES256".into(),
            key: "c2VjcmV0LWtleQ==".into(),
            key_md5: None,
        };

        let debug = format!("{key:?}");
        assert!(debug.contains("AES256"));
        assert!(!debug.contains("c2VjcmV0LWtleQ=="));
    }

    #[test]
    fn test_client_error_code() {
        let err = S3ClientError::service("NoSuchUpload", "upload does not exist");
        assert_eq!(err.code(), Some("NoSuchUpload"));
        assert_eq!(
            err.to_string(),
            "Service error NoSuchUpload: upload does not exist"
        );
        assert_eq!(S3ClientError::RequestError("timeout".into()).code(), None);
    }
}
