//! Streaming S3 writer
//!
//! [`S3Writer`] accepts bytes through [`write`](S3Writer::write) and
//! [`read_from`](S3Writer::read_from) without knowing the final object size.
//! Input is staged in a buffer of `part_size` bytes:
//!
//! - If the stream ends before the buffer ever fills, [`close`](S3Writer::close)
//!   uploads it with a single PutObject.
//! - The first time the buffer fills, a multipart upload is created and every
//!   full buffer becomes a part. Parts run on a caller-runs executor, so a
//!   write blocks on an inline upload whenever every worker is busy.
//!   `close` uploads the remainder as the last part and completes the upload.
//!
//! Every call waits for the parts it dispatched before returning. The first
//! failure cancels the remaining parts of that call, aborts the multipart
//! upload (unless disabled) and is latched: every later call returns it again.
//!
//! # Example
//!
//! ```no_run
//! use s3writer::config::UploaderConfig;
//! use s3writer::s3::ObjectTarget;
//! use s3writer::upload::S3Writer;
//!
//! # async fn example(client: aws_sdk_s3::Client) -> Result<(), Box<dyn std::error::Error>> {
//! let target = ObjectTarget::new("my-bucket", "backups/dump.sql")
//!     .with_content_type("application/sql");
//! let mut writer = S3Writer::new(client, target, UploaderConfig::default())?;
//!
//! let mut file = tokio::fs::File::open("dump.sql").await?;
//! writer.read_from(&mut file).await?;
//! writer.write(b"-- end of dump\n").await?;
//! writer.close().await?;
//! # Ok(())
//! # }
//! ```

use super::checksum::ChecksumEngine;
use super::executor::{CallerRunsExecutor, Task};
use super::limiter::RateLimiter;
use super::multipart::{MultipartUpload, PartUpload};
use super::{AbortOutcome, MultipartUploadError, ProgressSink, UploadError};
use crate::config::UploaderConfig;
use crate::metrics;
use crate::s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CreateMultipartUploadRequest,
    ObjectTarget, PutObjectRequest, S3UploadClient,
};
use bytes::BytesMut;
use futures::FutureExt;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Lifecycle of an upload.
#[derive(Debug)]
pub enum UploadState {
    /// Nothing dispatched yet; all data so far is buffered.
    Idle,
    /// Close is uploading the buffer with PutObject.
    SinglePut,
    /// A multipart upload was created.
    Multipart(MultipartUpload),
    Completed,
    /// Explicitly aborted by the caller.
    Aborted,
    /// Latched failure, returned by every subsequent call.
    Failed(UploadError),
}

impl UploadState {
    fn method(&self) -> &'static str {
        match self {
            Self::Multipart(_) => "multipart",
            _ => "put_object",
        }
    }
}

/// Builder for [`S3Writer`].
pub struct S3WriterBuilder {
    client: Arc<dyn S3UploadClient>,
    target: ObjectTarget,
    config: UploaderConfig,
    cancel: Option<CancellationToken>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl S3WriterBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: UploaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn part_size(mut self, part_size: u64) -> Self {
        self.config.part_size = part_size;
        self
    }

    pub fn max_bytes_per_second(mut self, max_bytes_per_second: u64) -> Self {
        self.config.max_bytes_per_second = max_bytes_per_second;
        self
    }

    pub fn disable_abort_on_error(mut self, disable: bool) -> Self {
        self.config.disable_abort_on_error = disable;
        self
    }

    /// Use `token` as the writer's cancellation token.
    ///
    /// Cancelling it stops in-flight parts; the pending call returns
    /// [`UploadError::Cancelled`] and the upload is aborted.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Feed acknowledged byte counts into `sink`.
    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Validate the configuration and create the writer.
    pub fn build(self) -> Result<S3Writer, UploadError> {
        self.config.validate()?;
        let checksum = ChecksumEngine::from_name(self.target.checksum_algorithm.as_deref())?;

        let part_size = usize::try_from(self.config.part_size).map_err(|_| {
            UploadError::InvalidConfig(format!(
                "part_size ({}) does not fit in memory on this platform",
                self.config.part_size
            ))
        })?;

        let limiter = RateLimiter::new(self.config.max_bytes_per_second, self.config.part_size);

        tracing::debug!(
            s3.bucket = %self.target.bucket,
            s3.key = %self.target.key,
            concurrency = self.config.concurrency,
            part_size = part_size,
            max_bytes_per_second = self.config.max_bytes_per_second,
            checksum_algorithm = %checksum.algorithm(),
            "Created S3 writer"
        );

        Ok(S3Writer {
            client: self.client,
            target: Arc::new(self.target),
            part_size,
            disable_abort_on_error: self.config.disable_abort_on_error,
            cancel: self.cancel.unwrap_or_default(),
            executor: CallerRunsExecutor::new(self.config.concurrency - 1),
            limiter: Arc::new(limiter),
            buf: BytesMut::with_capacity(part_size),
            checksum,
            progress: self.progress,
            state: UploadState::Idle,
        })
    }
}

/// Streaming uploader over PutObject / multipart upload.
pub struct S3Writer {
    client: Arc<dyn S3UploadClient>,
    target: Arc<ObjectTarget>,
    part_size: usize,
    disable_abort_on_error: bool,
    cancel: CancellationToken,
    executor: CallerRunsExecutor,
    limiter: Arc<RateLimiter>,
    buf: BytesMut,
    checksum: ChecksumEngine,
    progress: Option<Arc<dyn ProgressSink>>,
    state: UploadState,
}

impl std::fmt::Debug for S3Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Writer")
            .field("bucket", &self.target.bucket)
            .field("key", &self.target.key)
            .field("part_size", &self.part_size)
            .field("buffered", &self.buf.len())
            .field("executor", &self.executor)
            .field("state", &self.state)
            .finish()
    }
}

/// Parts dispatched by one call, and the first failure among them.
struct PartBatch {
    token: CancellationToken,
    tracker: TaskTracker,
    failure: Arc<OnceLock<UploadError>>,
}

impl PartBatch {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
            failure: Arc::new(OnceLock::new()),
        }
    }

    /// Wrap `part` so that its failure cancels the rest of the batch.
    fn track(&self, part: PartUpload) -> Task {
        let token = self.token.clone();
        let failure = Arc::clone(&self.failure);

        self.tracker
            .track_future(async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = part.run() => result,
                };

                if let Err(e) = result {
                    // only the first failure is kept
                    let _ = failure.set(e);
                    token.cancel();
                }
            })
            .boxed()
    }

    /// Wait for every tracked part to finish.
    async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn failure(&self) -> Option<UploadError> {
        self.failure.get().cloned()
    }
}

impl S3Writer {
    /// Create a writer for `target`.
    ///
    /// Only fails on invalid configuration or an unsupported checksum
    /// algorithm; nothing is sent to S3 until data is written.
    pub fn new(
        client: impl S3UploadClient + 'static,
        target: ObjectTarget,
        config: UploaderConfig,
    ) -> Result<Self, UploadError> {
        Self::builder(client, target).config(config).build()
    }

    /// Start building a writer with the default configuration.
    pub fn builder(client: impl S3UploadClient + 'static, target: ObjectTarget) -> S3WriterBuilder {
        S3WriterBuilder {
            client: Arc::new(client),
            target,
            config: UploaderConfig::default(),
            cancel: None,
            progress: None,
        }
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    /// Upload id of the multipart upload, once created.
    pub fn upload_id(&self) -> Option<&str> {
        match &self.state {
            UploadState::Multipart(upload) => Some(upload.upload_id()),
            _ => None,
        }
    }

    /// Token that cancels this writer's in-flight work when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bytes staged in the buffer and not yet dispatched.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Write all of `data`.
    ///
    /// Returns `data.len()` on success even though some bytes may still be
    /// buffered. Bytes accepted before a failure are not reported; the writer
    /// is unusable after an error anyway.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, UploadError> {
        self.ensure_open()?;

        let mut src = data;
        match self.pump(&mut src, false).await {
            Ok(_) => Ok(data.len()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Read `src` until end of stream, uploading full parts along the way.
    ///
    /// Returns the number of bytes read from `src`. If `src` fails, the
    /// count read up to that point is carried by the error, see
    /// [`UploadError::bytes_read`].
    pub async fn read_from<R>(&mut self, src: &mut R) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.ensure_open()?;

        match self.pump(src, false).await {
            Ok(read) => Ok(read),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Upload whatever is buffered and finish the upload.
    ///
    /// After a successful close every call returns [`UploadError::Closed`].
    pub async fn close(&mut self) -> Result<(), UploadError> {
        self.ensure_open()?;

        match self.pump(&mut tokio::io::empty(), true).await {
            Ok(_) => {
                self.executor.stop().await;
                self.state = UploadState::Completed;
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Discard buffered data and abort the multipart upload, if one exists.
    ///
    /// The abort request is sent even if the cancellation token has fired.
    pub async fn abort(&mut self) -> Result<(), UploadError> {
        self.ensure_open()?;

        self.executor.stop().await;
        self.buf.clear();

        let result = match &self.state {
            UploadState::Multipart(upload) => self
                .abort_multipart_upload(upload.upload_id())
                .await
                .map_err(UploadError::AbortMultipartUpload),
            _ => Ok(()),
        };

        self.state = match &result {
            Ok(()) => UploadState::Aborted,
            Err(e) => UploadState::Failed(e.clone()),
        };
        result
    }

    fn ensure_open(&self) -> Result<(), UploadError> {
        match &self.state {
            UploadState::Completed | UploadState::Aborted => Err(UploadError::Closed),
            UploadState::Failed(e) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    /// Move bytes from `src` into parts; with `flush`, also finish the upload.
    async fn pump<R>(&mut self, src: &mut R, flush: bool) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let batch = PartBatch::new(self.cancel.child_token());
        let mut read = 0;

        let dispatched = self.fill_and_dispatch(src, &batch, &mut read).await;
        batch.settle().await;

        // a failed part outranks the cancellation it caused
        if let Some(e) = batch.failure() {
            return Err(e);
        }
        dispatched?;

        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        // a part task that died without reporting leaves a gap
        if let UploadState::Multipart(upload) = &self.state {
            upload.ensure_acknowledged()?;
        }

        if flush {
            self.finish().await?;
        }

        Ok(read)
    }

    async fn fill_and_dispatch<R>(
        &mut self,
        src: &mut R,
        batch: &PartBatch,
        read: &mut u64,
    ) -> Result<(), UploadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            while self.buf.len() < self.part_size {
                let limit = (self.part_size - self.buf.len()) as u64;
                let mut limited = (&mut *src).take(limit);
                let n = tokio::select! {
                    biased;
                    _ = batch.token.cancelled() => return Err(UploadError::Cancelled),
                    n = limited.read_buf(&mut self.buf) => {
                        n.map_err(|e| UploadError::read(e, *read))?
                    }
                };

                if n == 0 {
                    break;
                }
                *read += n as u64;
            }

            // short of a full part; close will take care of the rest
            if self.buf.len() < self.part_size {
                return Ok(());
            }

            self.dispatch_part(batch).await?;
        }
    }

    /// Cut the full buffer into a part and hand it to the executor.
    async fn dispatch_part(&mut self, batch: &PartBatch) -> Result<(), UploadError> {
        if matches!(self.state, UploadState::Idle) {
            let upload = self.create_multipart_upload(&batch.token).await?;
            self.state = UploadState::Multipart(upload);
        }

        let UploadState::Multipart(upload) = &mut self.state else {
            return Err(UploadError::Closed);
        };

        let body = self.buf.split().freeze();
        self.buf.reserve(self.part_size);

        let part_number = upload.next_part(body.len());
        self.checksum.observe(&body);

        let part = PartUpload {
            client: Arc::clone(&self.client),
            target: Arc::clone(&self.target),
            upload_id: upload.upload_id().to_owned(),
            part_number,
            body,
            algorithm: self.checksum.algorithm(),
            limiter: Arc::clone(&self.limiter),
            parts: upload.parts(),
            progress: self.progress.clone(),
        };

        self.executor.execute(batch.track(part)).await?;
        Ok(())
    }

    /// Upload the tail and commit: PutObject if no part was ever dispatched,
    /// otherwise a last part followed by CompleteMultipartUpload.
    async fn finish(&mut self) -> Result<(), UploadError> {
        if matches!(self.state, UploadState::Idle) {
            self.state = UploadState::SinglePut;
            return self.put_object().await;
        }

        let UploadState::Multipart(upload) = &mut self.state else {
            return Err(UploadError::Closed);
        };

        if !self.buf.is_empty() {
            let body = self.buf.split().freeze();
            let part_number = upload.next_part(body.len());
            self.checksum.observe(&body);

            let part = PartUpload {
                client: Arc::clone(&self.client),
                target: Arc::clone(&self.target),
                upload_id: upload.upload_id().to_owned(),
                part_number,
                body,
                algorithm: self.checksum.algorithm(),
                limiter: Arc::clone(&self.limiter),
                parts: upload.parts(),
                progress: self.progress.clone(),
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                result = part.run() => result?,
            }
        }

        let UploadState::Multipart(upload) = &self.state else {
            return Err(UploadError::Closed);
        };
        self.complete_multipart_upload(upload).await?;

        metrics::record_multipart_upload_success(&self.target.bucket, upload.parts_acknowledged());
        Ok(())
    }

    #[tracing::instrument(
        name = "upload.put_object",
        skip(self),
        fields(
            s3.bucket = %self.target.bucket,
            s3.key = %self.target.key,
            upload.bytes = self.buf.len(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn put_object(&mut self) -> Result<(), UploadError> {
        let body = self.buf.split().freeze();
        let size = body.len() as u64;
        self.checksum.observe(&body);

        let request = PutObjectRequest {
            target: Arc::clone(&self.target),
            checksum: Some(self.checksum.hash_part(&body)),
            body,
        };

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            response = self.client.put_object(request) => {
                response.map_err(UploadError::PutObject)?
            }
        };

        if let Some(etag) = &response.etag {
            tracing::Span::current().record("s3.etag", etag.as_str());
        }

        metrics::record_bytes_uploaded(size);
        metrics::record_put_object_success(&self.target.bucket);
        if let Some(progress) = &self.progress {
            progress.record(size);
        }

        tracing::info!(
            etag = ?response.etag,
            bytes_written = size,
            "PutObject upload completed"
        );

        Ok(())
    }

    #[tracing::instrument(
        name = "upload.multipart.create",
        skip(self, token),
        fields(
            s3.bucket = %self.target.bucket,
            s3.key = %self.target.key,
            s3.upload_id = tracing::field::Empty
        ),
        err
    )]
    async fn create_multipart_upload(
        &self,
        token: &CancellationToken,
    ) -> Result<MultipartUpload, UploadError> {
        let algorithm = self.checksum.algorithm();
        let request = CreateMultipartUploadRequest {
            target: Arc::clone(&self.target),
            checksum_algorithm: algorithm,
            checksum_type: algorithm.checksum_type(),
        };

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(UploadError::Cancelled),
            response = self.client.create_multipart_upload(request) => {
                response.map_err(UploadError::CreateMultipartUpload)?
            }
        };

        tracing::Span::current().record("s3.upload_id", response.upload_id.as_str());
        tracing::info!(
            upload_id = %response.upload_id,
            checksum_algorithm = %algorithm,
            "Created multipart upload"
        );

        Ok(MultipartUpload::new(response.upload_id))
    }

    #[tracing::instrument(
        name = "upload.multipart.complete",
        skip(self, upload),
        fields(
            s3.bucket = %self.target.bucket,
            s3.upload_id = %upload.upload_id(),
            parts_count = upload.parts_dispatched(),
            upload.bytes = upload.object_size(),
            s3.etag = tracing::field::Empty
        ),
        err
    )]
    async fn complete_multipart_upload(&self, upload: &MultipartUpload) -> Result<(), UploadError> {
        upload.ensure_acknowledged()?;
        let parts = upload.sorted_parts();

        let checksum = self.checksum.finalise();
        let request = CompleteMultipartUploadRequest {
            target: Arc::clone(&self.target),
            upload_id: upload.upload_id().to_owned(),
            parts,
            checksum: checksum.value,
            checksum_type: checksum.checksum_type,
            mpu_object_size: upload.object_size() as i64,
        };

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            response = self.client.complete_multipart_upload(request) => {
                response.map_err(UploadError::CompleteMultipartUpload)?
            }
        };

        if let Some(etag) = &response.etag {
            tracing::Span::current().record("s3.etag", etag.as_str());
        }
        tracing::info!(
            upload_id = %upload.upload_id(),
            parts = upload.parts_dispatched(),
            etag = ?response.etag,
            "Completed multipart upload"
        );

        Ok(())
    }

    /// Abort without racing the cancellation token so cleanup still happens
    /// after the caller gave up.
    #[tracing::instrument(
        name = "upload.multipart.abort",
        skip(self),
        fields(s3.bucket = %self.target.bucket, s3.upload_id = %upload_id),
        err
    )]
    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<(), crate::s3::S3ClientError> {
        self.client
            .abort_multipart_upload(AbortMultipartUploadRequest {
                target: Arc::clone(&self.target),
                upload_id: upload_id.to_owned(),
            })
            .await?;

        tracing::info!(upload_id = %upload_id, "Aborted multipart upload");
        Ok(())
    }

    /// Turn `err` into the error latched for the rest of this writer's life,
    /// aborting the multipart upload on the way if one exists.
    async fn fail(&mut self, err: UploadError) -> UploadError {
        let method = self.state.method();

        let err = match &self.state {
            UploadState::Multipart(upload) => {
                let upload_id = upload.upload_id().to_owned();
                let abort = if self.disable_abort_on_error {
                    AbortOutcome::NotAttempted
                } else {
                    match self.abort_multipart_upload(&upload_id).await {
                        Ok(()) => AbortOutcome::Success,
                        Err(e) => AbortOutcome::Failure(e),
                    }
                };

                metrics::record_abort(match abort {
                    AbortOutcome::NotAttempted => "not_attempted",
                    AbortOutcome::Success => "success",
                    AbortOutcome::Failure(_) => "failure",
                });

                UploadError::Multipart(MultipartUploadError {
                    cause: Box::new(err),
                    upload_id,
                    abort,
                })
            }
            _ => err,
        };

        tracing::error!(
            s3.bucket = %self.target.bucket,
            s3.key = %self.target.key,
            error = %err,
            "Upload failed"
        );
        metrics::record_upload_failure(&self.target.bucket, method);
        metrics::record_error(err.kind());

        self.executor.stop().await;
        self.state = UploadState::Failed(err.clone());
        err
    }
}

impl Drop for S3Writer {
    fn drop(&mut self) {
        if let UploadState::Multipart(upload) = &self.state {
            tracing::warn!(
                s3.bucket = %self.target.bucket,
                s3.key = %self.target.key,
                upload_id = %upload.upload_id(),
                "S3 writer dropped without close; multipart upload left incomplete"
            );
        }
    }
}
