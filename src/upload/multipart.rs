//! Multipart upload session
//!
//! Holds everything that exists only once CreateMultipartUpload succeeded:
//! the upload id, the part counter and the concurrently filled map of
//! acknowledged parts.

use super::checksum::{ChecksumAlgorithm, ChecksumValue};
use super::limiter::RateLimiter;
use super::{ProgressSink, UploadError};
use crate::metrics;
use crate::s3::{CompletedPart, ObjectTarget, S3UploadClient, UploadPartRequest};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// State of a created multipart upload.
#[derive(Debug)]
pub struct MultipartUpload {
    upload_id: String,
    last_part_number: i32,
    object_size: u64,
    parts: Arc<DashMap<i32, CompletedPart>>,
}

impl MultipartUpload {
    pub(crate) fn new(upload_id: String) -> Self {
        Self {
            upload_id,
            last_part_number: 0,
            object_size: 0,
            parts: Arc::new(DashMap::new()),
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Number of parts handed out so far.
    pub fn parts_dispatched(&self) -> i32 {
        self.last_part_number
    }

    /// Number of parts S3 acknowledged so far.
    pub fn parts_acknowledged(&self) -> usize {
        self.parts.len()
    }

    /// Sum of the sizes of all dispatched parts.
    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Assign the next part number to a part of `len` bytes.
    pub(crate) fn next_part(&mut self, len: usize) -> i32 {
        self.last_part_number += 1;
        self.object_size += len as u64;
        self.last_part_number
    }

    /// Dispatched part numbers with no acknowledgement recorded.
    pub fn missing_parts(&self) -> Vec<i32> {
        (1..=self.last_part_number)
            .filter(|number| !self.parts.contains_key(number))
            .collect()
    }

    /// Fail unless every dispatched part was acknowledged.
    pub(crate) fn ensure_acknowledged(&self) -> Result<(), UploadError> {
        let missing = self.missing_parts();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(UploadError::PartsMissing { missing })
        }
    }

    pub(crate) fn parts(&self) -> Arc<DashMap<i32, CompletedPart>> {
        Arc::clone(&self.parts)
    }

    /// Acknowledged parts sorted by part number, ready for completion.
    pub(crate) fn sorted_parts(&self) -> Vec<CompletedPart> {
        let mut parts: Vec<CompletedPart> =
            self.parts.iter().map(|entry| entry.value().clone()).collect();
        parts.sort_by_key(|part| part.part_number);
        parts
    }
}

/// One part on its way to S3.
pub(crate) struct PartUpload {
    pub client: Arc<dyn S3UploadClient>,
    pub target: Arc<ObjectTarget>,
    pub upload_id: String,
    pub part_number: i32,
    pub body: Bytes,
    pub algorithm: ChecksumAlgorithm,
    pub limiter: Arc<RateLimiter>,
    pub parts: Arc<DashMap<i32, CompletedPart>>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl PartUpload {
    /// Wait for the rate limiter, upload the part and record the ack.
    #[tracing::instrument(
        name = "upload.multipart.upload_part",
        skip(self),
        fields(
            s3.bucket = %self.target.bucket,
            s3.upload_id = %self.upload_id,
            part_number = self.part_number,
            upload.bytes = self.body.len()
        ),
        err
    )]
    pub(crate) async fn run(self) -> Result<(), UploadError> {
        let size = self.body.len();
        self.limiter.acquire(size).await;

        let checksum = ChecksumValue::compute(self.algorithm, &self.body);
        let response = self
            .client
            .upload_part(UploadPartRequest {
                target: Arc::clone(&self.target),
                upload_id: self.upload_id.clone(),
                part_number: self.part_number,
                body: self.body,
                checksum: Some(checksum.clone()),
            })
            .await
            .map_err(|source| UploadError::UploadPart {
                part_number: self.part_number,
                source,
            })?;

        // the service echoes checksums; fall back to ours so completion
        // always lists the part checksum
        let mut checksums = response.checksums;
        checksums
            .entry(checksum.algorithm)
            .or_insert(checksum.value);

        self.parts.insert(
            self.part_number,
            CompletedPart {
                part_number: self.part_number,
                etag: response.etag,
                checksums,
            },
        );

        metrics::record_bytes_uploaded(size as u64);
        if let Some(progress) = &self.progress {
            progress.record(size as u64);
        }

        tracing::debug!(
            part_number = self.part_number,
            size = size,
            "Uploaded part"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn part(part_number: i32) -> CompletedPart {
        CompletedPart {
            part_number,
            etag: Some(format!("\"etag-{part_number}\"")),
            checksums: BTreeMap::new(),
        }
    }

    #[test]
    fn test_part_numbers_start_at_one() {
        let mut upload = MultipartUpload::new("upload-123".into());
        assert_eq!(upload.upload_id(), "upload-123");
        assert_eq!(upload.next_part(10), 1);
        assert_eq!(upload.next_part(20), 2);
        assert_eq!(upload.next_part(5), 3);
        assert_eq!(upload.parts_dispatched(), 3);
        assert_eq!(upload.object_size(), 35);
    }

    #[test]
    fn test_sorted_parts() {
        let upload = MultipartUpload::new("upload-123".into());
        let parts = upload.parts();
        for number in [3, 1, 4, 2] {
            parts.insert(number, part(number));
        }

        let sorted: Vec<i32> = upload
            .sorted_parts()
            .iter()
            .map(|part| part.part_number)
            .collect();
        assert_eq!(sorted, vec![1, 2, 3, 4]);
        assert_eq!(upload.parts_acknowledged(), 4);
    }

    #[test]
    fn test_missing_parts_fail_acknowledgement() {
        let mut upload = MultipartUpload::new("upload-123".into());
        for _ in 0..3 {
            upload.next_part(10);
        }
        let parts = upload.parts();
        parts.insert(2, part(2));

        assert_eq!(upload.missing_parts(), vec![1, 3]);
        assert!(matches!(
            upload.ensure_acknowledged(),
            Err(UploadError::PartsMissing { missing }) if missing == vec![1, 3]
        ));

        parts.insert(1, part(1));
        parts.insert(3, part(3));
        assert!(upload.ensure_acknowledged().is_ok());
    }
}
