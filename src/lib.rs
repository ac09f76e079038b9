//! s3writer Library
//!
//! Streaming uploads to S3 for sources of unknown length.
//!
//! # Features
//!
//! - **Streaming**: `write`/`read_from` without knowing the object size up front
//! - **Single or Multipart**: small objects go out as one PutObject, larger
//!   ones as a multipart upload created on the first full part
//! - **Backpressure**: bounded part concurrency with caller-runs overflow
//! - **Rate Limiting**: token bucket over uploaded bytes
//! - **Integrity**: CRC32, CRC32C, SHA1 or SHA256 checksums per part and
//!   for the whole object
//! - **Cleanup**: failed multipart uploads are aborted automatically
//!
//! # Example
//!
//! ```no_run
//! use s3writer::{ObjectTarget, S3Writer, UploaderConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sdk_config = aws_config::load_from_env().await;
//!     let client = aws_sdk_s3::Client::new(&sdk_config);
//!
//!     let config = UploaderConfig::load("uploader.yaml")?;
//!     let target = ObjectTarget::new("my-bucket", "logs/app.log");
//!
//!     let mut writer = S3Writer::new(client, target, config)?;
//!     let mut stdin = tokio::io::stdin();
//!     writer.read_from(&mut stdin).await?;
//!     writer.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod s3;
pub mod upload;

// Re-export commonly used types
pub use config::{ConfigError, UploaderConfig};
pub use s3::{ObjectTarget, S3ClientError, S3UploadClient};
pub use upload::{
    AbortOutcome, MultipartUploadError, ProgressSink, S3Writer, S3WriterBuilder, UploadError,
    UploadState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
