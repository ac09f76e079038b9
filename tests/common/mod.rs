//! Shared test infrastructure
//!
//! - `MockS3Client`: in-memory S3 that records every call, assembles
//!   completed multipart uploads and can be told to fail or stall
//! - Test data and tracing helpers

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use s3writer::s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompleteMultipartUploadResponse,
    CreateMultipartUploadRequest, CreateMultipartUploadResponse, PutObjectRequest,
    PutObjectResponse, S3ClientError, S3UploadClient, UploadPartRequest, UploadPartResponse,
};
use s3writer::upload::{ChecksumAlgorithm, ChecksumType, ChecksumValue, ProgressSink};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

/// One recorded client call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    PutObject {
        key: String,
        size: usize,
        checksum: Option<ChecksumValue>,
    },
    CreateMultipartUpload {
        key: String,
        upload_id: String,
        checksum_algorithm: ChecksumAlgorithm,
        checksum_type: ChecksumType,
    },
    UploadPart {
        upload_id: String,
        part_number: i32,
        size: usize,
    },
    CompleteMultipartUpload {
        upload_id: String,
        part_numbers: Vec<i32>,
        mpu_object_size: i64,
        checksum: Option<ChecksumValue>,
        checksum_type: ChecksumType,
    },
    AbortMultipartUpload {
        upload_id: String,
    },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::PutObject { .. } => "put",
            Call::CreateMultipartUpload { .. } => "create",
            Call::UploadPart { .. } => "part",
            Call::CompleteMultipartUpload { .. } => "complete",
            Call::AbortMultipartUpload { .. } => "abort",
        }
    }
}

/// In-memory S3 with failure injection
#[derive(Default)]
pub struct MockS3Client {
    calls: Mutex<Vec<Call>>,
    objects: Mutex<HashMap<String, Bytes>>,
    parts: Mutex<HashMap<String, BTreeMap<i32, Bytes>>>,
    fail_put: Mutex<bool>,
    fail_create: Mutex<bool>,
    fail_part: Mutex<Option<i32>>,
    panic_part: Mutex<Option<i32>>,
    fail_complete: Mutex<bool>,
    fail_abort: Mutex<bool>,
    part_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockS3Client {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_put(&self) {
        *self.fail_put.lock() = true;
    }

    pub fn fail_create(&self) {
        *self.fail_create.lock() = true;
    }

    /// Fail UploadPart for `part_number` with a 500.
    pub fn fail_part(&self, part_number: i32) {
        *self.fail_part.lock() = Some(part_number);
    }

    /// Panic inside UploadPart for `part_number`, killing the task running it.
    pub fn panic_part(&self, part_number: i32) {
        *self.panic_part.lock() = Some(part_number);
    }

    pub fn fail_complete(&self) {
        *self.fail_complete.lock() = true;
    }

    pub fn fail_abort(&self) {
        *self.fail_abort.lock() = true;
    }

    /// Make every UploadPart take `delay`.
    pub fn part_delay(&self, delay: Duration) {
        *self.part_delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Names of the recorded calls in order.
    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(Call::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.name() == name).count()
    }

    /// Committed object content, if any.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }

    /// Highest number of concurrently running UploadPart calls.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

fn internal_error() -> S3ClientError {
    S3ClientError::service("InternalError", "injected failure")
}

#[async_trait]
impl S3UploadClient for MockS3Client {
    async fn put_object(
        &self,
        request: PutObjectRequest,
    ) -> Result<PutObjectResponse, S3ClientError> {
        self.record(Call::PutObject {
            key: request.target.key.clone(),
            size: request.body.len(),
            checksum: request.checksum.clone(),
        });

        if *self.fail_put.lock() {
            return Err(internal_error());
        }

        self.objects
            .lock()
            .insert(request.target.key.clone(), request.body);
        Ok(PutObjectResponse {
            etag: Some("\"put-etag\"".into()),
            version_id: None,
        })
    }

    async fn create_multipart_upload(
        &self,
        request: CreateMultipartUploadRequest,
    ) -> Result<CreateMultipartUploadResponse, S3ClientError> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.record(Call::CreateMultipartUpload {
            key: request.target.key.clone(),
            upload_id: upload_id.clone(),
            checksum_algorithm: request.checksum_algorithm,
            checksum_type: request.checksum_type,
        });

        if *self.fail_create.lock() {
            return Err(internal_error());
        }

        self.parts.lock().insert(upload_id.clone(), BTreeMap::new());
        Ok(CreateMultipartUploadResponse { upload_id })
    }

    async fn upload_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResponse, S3ClientError> {
        self.record(Call::UploadPart {
            upload_id: request.upload_id.clone(),
            part_number: request.part_number,
            size: request.body.len(),
        });

        if *self.panic_part.lock() == Some(request.part_number) {
            panic!("injected panic in part {}", request.part_number);
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.part_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if *self.fail_part.lock() == Some(request.part_number) {
            return Err(internal_error());
        }

        let mut checksums = BTreeMap::new();
        if let Some(checksum) = &request.checksum {
            checksums.insert(checksum.algorithm, checksum.value.clone());
        }

        self.parts
            .lock()
            .entry(request.upload_id.clone())
            .or_default()
            .insert(request.part_number, request.body);

        Ok(UploadPartResponse {
            etag: Some(format!("\"etag-{}\"", request.part_number)),
            checksums,
        })
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> Result<CompleteMultipartUploadResponse, S3ClientError> {
        self.record(Call::CompleteMultipartUpload {
            upload_id: request.upload_id.clone(),
            part_numbers: request.parts.iter().map(|p| p.part_number).collect(),
            mpu_object_size: request.mpu_object_size,
            checksum: request.checksum.clone(),
            checksum_type: request.checksum_type,
        });

        if *self.fail_complete.lock() {
            return Err(internal_error());
        }

        let uploaded = self
            .parts
            .lock()
            .remove(&request.upload_id)
            .ok_or_else(|| S3ClientError::service("NoSuchUpload", "upload does not exist"))?;

        let mut object = Vec::new();
        for part in &request.parts {
            let body = uploaded.get(&part.part_number).ok_or_else(|| {
                S3ClientError::service("InvalidPart", format!("part {}", part.part_number))
            })?;
            object.extend_from_slice(body);
        }

        if object.len() as i64 != request.mpu_object_size {
            return Err(S3ClientError::service(
                "InvalidRequest",
                "object size does not match MpuObjectSize",
            ));
        }

        self.objects
            .lock()
            .insert(request.target.key.clone(), Bytes::from(object));
        Ok(CompleteMultipartUploadResponse {
            etag: Some("\"complete-etag-2\"".into()),
            version_id: None,
        })
    }

    async fn abort_multipart_upload(
        &self,
        request: AbortMultipartUploadRequest,
    ) -> Result<(), S3ClientError> {
        self.record(Call::AbortMultipartUpload {
            upload_id: request.upload_id.clone(),
        });

        if *self.fail_abort.lock() {
            return Err(S3ClientError::service("AccessDenied", "abort denied"));
        }

        self.parts.lock().remove(&request.upload_id);
        Ok(())
    }
}

/// Progress sink counting acknowledged bytes.
#[derive(Default)]
pub struct CountingProgress {
    pub bytes: AtomicU64,
}

impl ProgressSink for CountingProgress {
    fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }
}

/// Deterministic, non-repeating-per-part test payload.
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Install a test subscriber once per binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "s3writer=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
