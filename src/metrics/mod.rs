//! Metrics module
//!
//! Prometheus metrics for streaming uploads, registered in the default
//! registry so the embedding application can expose them however it likes.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "s3writer_uploads_total",
        "Total number of finished uploads",
        &["bucket", "method", "status"]  // method: "put_object" or "multipart"
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "s3writer_upload_bytes_total",
        "Total bytes acknowledged by S3"
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "s3writer_multipart_parts",
        "Number of parts per completed multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]
    ).unwrap();

    pub static ref MULTIPART_ABORTS: CounterVec = register_counter_vec!(
        "s3writer_multipart_aborts_total",
        "Automatic multipart aborts by outcome",
        &["outcome"]  // "success", "failure" or "not_attempted"
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "s3writer_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record bytes acknowledged by a successful PutObject or UploadPart
pub fn record_bytes_uploaded(bytes: u64) {
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a successful single PutObject upload
pub fn record_put_object_success(bucket: &str) {
    UPLOADS_TOTAL
        .with_label_values(&[bucket, "put_object", "success"])
        .inc();
}

/// Record a successful multipart upload
pub fn record_multipart_upload_success(bucket: &str, parts_count: usize) {
    UPLOADS_TOTAL
        .with_label_values(&[bucket, "multipart", "success"])
        .inc();
    MULTIPART_PARTS.observe(parts_count as f64);
}

/// Record a failed upload
pub fn record_upload_failure(bucket: &str, method: &str) {
    UPLOADS_TOTAL
        .with_label_values(&[bucket, method, "failure"])
        .inc();
}

/// Record the outcome of an automatic abort
pub fn record_abort(outcome: &str) {
    MULTIPART_ABORTS.with_label_values(&[outcome]).inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
