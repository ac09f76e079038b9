//! Checksum engine
//!
//! Computes the `x-amz-checksum-*` values attached to every request the
//! uploader makes. Per-part digests are computed by whichever task uploads the
//! part; the whole-object digest is fed from the submitting task in part-number
//! order so that it sees every transmitted byte exactly once.
//!
//! CRC32 and CRC32C support S3's `FULL_OBJECT` checksum type, so the running
//! CRC over the whole stream is sent on completion. SHA1 and SHA256 only
//! support `COMPOSITE`, in which case S3 derives the object checksum from the
//! part checksums and no whole-object value is sent.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use sha1::Digest;

/// Checksum algorithm used when the target does not name one.
pub const DEFAULT_CHECKSUM_ALGORITHM: ChecksumAlgorithm = ChecksumAlgorithm::Crc32;

/// Checksum algorithms supported by the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChecksumAlgorithm {
    /// CRC-32 (IEEE 802.3).
    Crc32,
    /// CRC-32C (Castagnoli).
    Crc32c,
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
}

impl ChecksumAlgorithm {
    /// Canonical name used in S3 headers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crc32 => "CRC32",
            Self::Crc32c => "CRC32C",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }

    /// The checksum type S3 uses for multipart uploads with this algorithm.
    #[must_use]
    pub fn checksum_type(&self) -> ChecksumType {
        match self {
            Self::Crc32 | Self::Crc32c => ChecksumType::FullObject,
            Self::Sha1 | Self::Sha256 => ChecksumType::Composite,
        }
    }

    /// Compute the base64-encoded digest of `data`.
    #[must_use]
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            Self::Crc32 => BASE64_STANDARD.encode(crc32fast::hash(data).to_be_bytes()),
            Self::Crc32c => BASE64_STANDARD.encode(crc32c::crc32c(data).to_be_bytes()),
            Self::Sha1 => BASE64_STANDARD.encode(sha1::Sha1::digest(data)),
            Self::Sha256 => BASE64_STANDARD.encode(sha2::Sha256::digest(data)),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a checksum algorithm name is not supported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported checksum algorithm: {0}")]
pub struct UnsupportedChecksumAlgorithm(pub String);

impl FromStr for ChecksumAlgorithm {
    type Err = UnsupportedChecksumAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRC32" => Ok(Self::Crc32),
            "CRC32C" => Ok(Self::Crc32c),
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            _ => Err(UnsupportedChecksumAlgorithm(s.to_owned())),
        }
    }
}

/// How S3 computes the checksum of a multipart object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    /// Checksum over the full object content.
    FullObject,
    /// Checksum of the concatenated part checksums.
    Composite,
}

impl ChecksumType {
    /// Canonical name used in S3 headers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullObject => "FULL_OBJECT",
            Self::Composite => "COMPOSITE",
        }
    }
}

/// A base64-encoded checksum value paired with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    /// The algorithm used to compute this checksum.
    pub algorithm: ChecksumAlgorithm,
    /// The base64-encoded checksum.
    pub value: String,
}

impl ChecksumValue {
    /// Compute the checksum of `data` with `algorithm`.
    #[must_use]
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            value: algorithm.digest(data),
        }
    }
}

/// Checksum fields sent with CompleteMultipartUpload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalChecksum {
    pub checksum_type: ChecksumType,
    /// Whole-object value; only present for [`ChecksumType::FullObject`].
    pub value: Option<ChecksumValue>,
}

#[derive(Debug, Clone)]
enum Running {
    Crc32(crc32fast::Hasher),
    Crc32c(u32),
    // Composite algorithms have no whole-object state.
    None,
}

/// Incremental checksum engine bound to one algorithm for the lifetime of an
/// upload.
#[derive(Debug, Clone)]
pub struct ChecksumEngine {
    algorithm: ChecksumAlgorithm,
    running: Running,
    observed: u64,
}

impl ChecksumEngine {
    /// Create an engine for `algorithm`.
    #[must_use]
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let running = match algorithm {
            ChecksumAlgorithm::Crc32 => Running::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Crc32c => Running::Crc32c(0),
            ChecksumAlgorithm::Sha1 | ChecksumAlgorithm::Sha256 => Running::None,
        };

        Self {
            algorithm,
            running,
            observed: 0,
        }
    }

    /// Resolve the algorithm named by an upload target, falling back to
    /// [`DEFAULT_CHECKSUM_ALGORITHM`].
    pub fn from_name(name: Option<&str>) -> Result<Self, UnsupportedChecksumAlgorithm> {
        let algorithm = match name {
            Some(name) => name.parse()?,
            None => DEFAULT_CHECKSUM_ALGORITHM,
        };
        Ok(Self::new(algorithm))
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Number of bytes fed through [`observe`](Self::observe).
    pub fn observed_bytes(&self) -> u64 {
        self.observed
    }

    /// Digest of a single part, attached to its UploadPart request.
    #[must_use]
    pub fn hash_part(&self, data: &[u8]) -> ChecksumValue {
        ChecksumValue::compute(self.algorithm, data)
    }

    /// Feed transmitted bytes into the whole-object digest.
    pub fn observe(&mut self, data: &[u8]) {
        self.observed += data.len() as u64;
        match &mut self.running {
            Running::Crc32(hasher) => hasher.update(data),
            Running::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, data),
            Running::None => {}
        }
    }

    /// Checksum fields for CompleteMultipartUpload.
    #[must_use]
    pub fn finalise(&self) -> FinalChecksum {
        let value = match &self.running {
            Running::Crc32(hasher) => Some(hasher.clone().finalize().to_be_bytes()),
            Running::Crc32c(crc) => Some(crc.to_be_bytes()),
            Running::None => None,
        };

        FinalChecksum {
            checksum_type: self.algorithm.checksum_type(),
            value: value.map(|bytes| ChecksumValue {
                algorithm: self.algorithm,
                value: BASE64_STANDARD.encode(bytes),
            }),
        }
    }
}
