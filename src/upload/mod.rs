//! Upload module
//!
//! Streams bytes to S3 through [`S3Writer`], which buffers input into parts
//! and decides between a single PutObject and a concurrent multipart upload.

use crate::s3::S3ClientError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod checksum;
pub mod executor;
pub mod limiter;
pub mod multipart;
pub mod writer;

pub use checksum::{ChecksumAlgorithm, ChecksumEngine, ChecksumType, ChecksumValue};
pub use executor::{CallerRunsExecutor, ExecutorError};
pub use limiter::RateLimiter;
pub use multipart::MultipartUpload;
pub use writer::{S3Writer, S3WriterBuilder, UploadState};

/// Maximum size of an S3 object (5 TiB).
pub const MAX_OBJECT_SIZE: u64 = 5_497_558_138_880;

/// Maximum number of parts per multipart upload.
///
/// Not enforced; choose a part size large enough for the expected stream.
pub const MAX_PART_COUNT: u32 = 10_000;

/// Minimum size of every part but the last (5 MiB).
pub const MIN_PART_SIZE: u64 = 5_242_880;

/// Maximum size of a part (5 GiB).
pub const MAX_PART_SIZE: u64 = 5_368_709_120;

/// Default number of concurrent part uploads.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Upload errors
///
/// Cloneable so that a latched failure can be returned from every subsequent
/// call on the same writer.
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    UnsupportedChecksum(#[from] checksum::UnsupportedChecksumAlgorithm),

    #[error("writer already closed")]
    Closed,

    #[error("Source read error after {bytes_read} bytes: {source}")]
    Read {
        /// Bytes taken from the source before it failed.
        bytes_read: u64,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("PutObject error: {0}")]
    PutObject(#[source] S3ClientError),

    #[error("CreateMultipartUpload error: {0}")]
    CreateMultipartUpload(#[source] S3ClientError),

    #[error("UploadPart {part_number} error: {source}")]
    UploadPart {
        part_number: i32,
        #[source]
        source: S3ClientError,
    },

    #[error("CompleteMultipartUpload error: {0}")]
    CompleteMultipartUpload(#[source] S3ClientError),

    #[error("AbortMultipartUpload error: {0}")]
    AbortMultipartUpload(#[source] S3ClientError),

    #[error("parts {missing:?} were dispatched but never acknowledged")]
    PartsMissing { missing: Vec<i32> },

    #[error("Submit upload task error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("upload cancelled")]
    Cancelled,

    #[error(transparent)]
    Multipart(#[from] MultipartUploadError),
}

impl UploadError {
    pub(crate) fn read(err: std::io::Error, bytes_read: u64) -> Self {
        Self::Read {
            bytes_read,
            source: Arc::new(err),
        }
    }

    /// Bytes consumed from the source when it failed, for read errors.
    pub fn bytes_read(&self) -> Option<u64> {
        match self {
            Self::Read { bytes_read, .. } => Some(*bytes_read),
            Self::Multipart(e) => e.cause.bytes_read(),
            _ => None,
        }
    }

    /// Label used for the error metric.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::UnsupportedChecksum(_) => "unsupported_checksum",
            Self::Closed => "closed",
            Self::Read { .. } => "read",
            Self::PutObject(_) => "put_object",
            Self::CreateMultipartUpload(_) => "create_multipart_upload",
            Self::UploadPart { .. } => "upload_part",
            Self::CompleteMultipartUpload(_) => "complete_multipart_upload",
            Self::AbortMultipartUpload(_) => "abort_multipart_upload",
            Self::PartsMissing { .. } => "parts_missing",
            Self::Executor(_) => "executor",
            Self::Cancelled => "cancelled",
            Self::Multipart(e) => e.cause.kind(),
        }
    }

    /// The structured multipart error, if this is one.
    pub fn as_multipart(&self) -> Option<&MultipartUploadError> {
        match self {
            Self::Multipart(e) => Some(e),
            _ => None,
        }
    }
}

/// Result of the automatic AbortMultipartUpload after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    /// Abort was disabled by configuration.
    NotAttempted,
    Success,
    Failure(S3ClientError),
}

impl fmt::Display for AbortOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAttempted => f.write_str("abort not attempted"),
            Self::Success => f.write_str("abort succeeded"),
            Self::Failure(e) => write!(f, "abort failed: {e}"),
        }
    }
}

/// Failure of a multipart upload after CreateMultipartUpload succeeded.
#[derive(Error, Debug, Clone)]
#[error("multipart upload {upload_id} failed ({abort}): {cause}")]
pub struct MultipartUploadError {
    #[source]
    pub cause: Box<UploadError>,
    pub upload_id: String,
    pub abort: AbortOutcome,
}

/// Write-only byte counter fed as parts are acknowledged.
pub trait ProgressSink: Send + Sync {
    fn record(&self, bytes: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits() {
        assert_eq!(MIN_PART_SIZE, 5 * 1024 * 1024);
        assert_eq!(MAX_PART_SIZE, 5 * 1024 * 1024 * 1024);
        assert_eq!(MAX_OBJECT_SIZE, 5 * 1024 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_multipart_error_display() {
        let err = UploadError::from(MultipartUploadError {
            cause: Box::new(UploadError::UploadPart {
                part_number: 2,
                source: S3ClientError::RequestError("connection reset".into()),
            }),
            upload_id: "upload-123".into(),
            abort: AbortOutcome::Success,
        });

        assert_eq!(
            err.to_string(),
            "multipart upload upload-123 failed (abort succeeded): \
             UploadPart 2 error: Request error: connection reset"
        );
        assert_eq!(err.kind(), "upload_part");
        assert_eq!(err.as_multipart().unwrap().upload_id, "upload-123");
    }

    #[test]
    fn test_read_error_carries_count() {
        let err = UploadError::from(MultipartUploadError {
            cause: Box::new(UploadError::read(
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"),
                42,
            )),
            upload_id: "upload-123".into(),
            abort: AbortOutcome::NotAttempted,
        });

        assert_eq!(err.bytes_read(), Some(42));
        assert_eq!(err.kind(), "read");
        assert!(err.to_string().ends_with("Source read error after 42 bytes: eof"));
        assert_eq!(UploadError::Cancelled.bytes_read(), None);
    }

    #[test]
    fn test_abort_failure_display() {
        let outcome = AbortOutcome::Failure(S3ClientError::service("AccessDenied", "denied"));
        assert_eq!(
            outcome.to_string(),
            "abort failed: Service error AccessDenied: denied"
        );
    }
}
