//! [`S3UploadClient`] for the AWS SDK client
//!
//! Maps the request records onto the SDK's fluent builders. Signing, retries
//! and endpoint resolution stay with however the `aws_sdk_s3::Client` was
//! configured.

use super::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompleteMultipartUploadResponse,
    CreateMultipartUploadRequest, CreateMultipartUploadResponse, ObjectTarget, PutObjectRequest,
    PutObjectResponse, S3ClientError, S3UploadClient, UploadPartRequest, UploadPartResponse,
};
use crate::upload::checksum::ChecksumAlgorithm;
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    self as sdk, CompletedMultipartUpload, ObjectCannedAcl, RequestPayer, ServerSideEncryption,
    StorageClass,
};
use std::collections::BTreeMap;

/// Set the checksum field matching `$algorithm` on any builder that has the
/// four `checksum_*` setters.
macro_rules! with_checksum_value {
    ($builder:expr, $algorithm:expr, $value:expr) => {
        match $algorithm {
            ChecksumAlgorithm::Crc32 => $builder.checksum_crc32($value),
            ChecksumAlgorithm::Crc32c => $builder.checksum_crc32_c($value),
            ChecksumAlgorithm::Sha1 => $builder.checksum_sha1($value),
            ChecksumAlgorithm::Sha256 => $builder.checksum_sha256($value),
        }
    };
}

/// Forward SSE-C key material.
macro_rules! with_sse_customer {
    ($builder:expr, $target:expr) => {
        match &$target.sse_customer {
            Some(sse) => $builder
                .sse_customer_algorithm(&sse.algorithm)
                .sse_customer_key(&sse.key)
                .set_sse_customer_key_md5(sse.key_md5.clone()),
            None => $builder,
        }
    };
}

fn sdk_checksum_algorithm(algorithm: ChecksumAlgorithm) -> sdk::ChecksumAlgorithm {
    sdk::ChecksumAlgorithm::from(algorithm.as_str())
}

fn request_payer(target: &ObjectTarget) -> Option<RequestPayer> {
    target.request_payer.as_deref().map(RequestPayer::from)
}

fn metadata(target: &ObjectTarget) -> Option<std::collections::HashMap<String, String>> {
    (!target.metadata.is_empty()).then(|| target.metadata.clone())
}

/// Map an SDK error, keeping the S3 error code when the service sent one.
fn map_sdk_error<E>(err: SdkError<E>) -> S3ClientError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(context) => {
            let service = context.err();
            S3ClientError::service(
                service.code().unwrap_or("Unknown"),
                service.message().unwrap_or_default(),
            )
        }
        SdkError::ResponseError(_) => {
            S3ClientError::ResponseError(DisplayErrorContext(&err).to_string())
        }
        _ => S3ClientError::RequestError(DisplayErrorContext(&err).to_string()),
    }
}

#[async_trait]
impl S3UploadClient for aws_sdk_s3::Client {
    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, request),
        fields(
            s3.bucket = %request.target.bucket,
            s3.key = %request.target.key,
            upload.bytes = request.body.len()
        ),
        err
    )]
    async fn put_object(
        &self,
        request: PutObjectRequest,
    ) -> Result<PutObjectResponse, S3ClientError> {
        let target = &request.target;
        let mut builder = self
            .put_object()
            .bucket(&target.bucket)
            .key(&target.key)
            .body(ByteStream::from(request.body))
            .set_acl(target.acl.as_deref().map(ObjectCannedAcl::from))
            .set_cache_control(target.cache_control.clone())
            .set_content_disposition(target.content_disposition.clone())
            .set_content_encoding(target.content_encoding.clone())
            .set_content_language(target.content_language.clone())
            .set_content_type(target.content_type.clone())
            .set_metadata(metadata(target))
            .set_storage_class(target.storage_class.as_deref().map(StorageClass::from))
            .set_tagging(target.tagging.clone())
            .set_server_side_encryption(
                target
                    .server_side_encryption
                    .as_deref()
                    .map(ServerSideEncryption::from),
            )
            .set_ssekms_key_id(target.sse_kms_key_id.clone())
            .set_expected_bucket_owner(target.expected_bucket_owner.clone())
            .set_request_payer(request_payer(target))
            .set_if_none_match(target.if_none_match.clone());
        builder = with_sse_customer!(builder, target);

        if let Some(checksum) = request.checksum {
            builder = builder.checksum_algorithm(sdk_checksum_algorithm(checksum.algorithm));
            builder = with_checksum_value!(builder, checksum.algorithm, checksum.value);
        }

        let output = builder.send().await.map_err(map_sdk_error)?;

        Ok(PutObjectResponse {
            etag: output.e_tag().map(str::to_owned),
            version_id: output.version_id().map(str::to_owned),
        })
    }

    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self, request),
        fields(s3.bucket = %request.target.bucket, s3.key = %request.target.key),
        err
    )]
    async fn create_multipart_upload(
        &self,
        request: CreateMultipartUploadRequest,
    ) -> Result<CreateMultipartUploadResponse, S3ClientError> {
        let target = &request.target;
        let mut builder = self
            .create_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .checksum_algorithm(sdk_checksum_algorithm(request.checksum_algorithm))
            .checksum_type(sdk::ChecksumType::from(request.checksum_type.as_str()))
            .set_acl(target.acl.as_deref().map(ObjectCannedAcl::from))
            .set_cache_control(target.cache_control.clone())
            .set_content_disposition(target.content_disposition.clone())
            .set_content_encoding(target.content_encoding.clone())
            .set_content_language(target.content_language.clone())
            .set_content_type(target.content_type.clone())
            .set_metadata(metadata(target))
            .set_storage_class(target.storage_class.as_deref().map(StorageClass::from))
            .set_tagging(target.tagging.clone())
            .set_server_side_encryption(
                target
                    .server_side_encryption
                    .as_deref()
                    .map(ServerSideEncryption::from),
            )
            .set_ssekms_key_id(target.sse_kms_key_id.clone())
            .set_expected_bucket_owner(target.expected_bucket_owner.clone())
            .set_request_payer(request_payer(target));
        builder = with_sse_customer!(builder, target);

        let output = builder.send().await.map_err(map_sdk_error)?;
        let upload_id = output.upload_id().ok_or_else(|| {
            S3ClientError::ResponseError("CreateMultipartUpload returned no UploadId".into())
        })?;

        Ok(CreateMultipartUploadResponse {
            upload_id: upload_id.to_owned(),
        })
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, request),
        fields(
            s3.bucket = %request.target.bucket,
            s3.upload_id = %request.upload_id,
            part_number = request.part_number,
            upload.bytes = request.body.len()
        ),
        err
    )]
    async fn upload_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResponse, S3ClientError> {
        let target = &request.target;
        let mut builder = self
            .upload_part()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&request.upload_id)
            .part_number(request.part_number)
            .body(ByteStream::from(request.body))
            .set_expected_bucket_owner(target.expected_bucket_owner.clone())
            .set_request_payer(request_payer(target));
        builder = with_sse_customer!(builder, target);

        if let Some(checksum) = request.checksum {
            builder = builder.checksum_algorithm(sdk_checksum_algorithm(checksum.algorithm));
            builder = with_checksum_value!(builder, checksum.algorithm, checksum.value);
        }

        let output = builder.send().await.map_err(map_sdk_error)?;

        let echoed = [
            (ChecksumAlgorithm::Crc32, output.checksum_crc32()),
            (ChecksumAlgorithm::Crc32c, output.checksum_crc32_c()),
            (ChecksumAlgorithm::Sha1, output.checksum_sha1()),
            (ChecksumAlgorithm::Sha256, output.checksum_sha256()),
        ];
        let checksums: BTreeMap<ChecksumAlgorithm, String> = echoed
            .into_iter()
            .filter_map(|(algorithm, value)| value.map(|v| (algorithm, v.to_owned())))
            .collect();

        Ok(UploadPartResponse {
            etag: output.e_tag().map(str::to_owned),
            checksums,
        })
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, request),
        fields(
            s3.bucket = %request.target.bucket,
            s3.upload_id = %request.upload_id,
            parts_count = request.parts.len()
        ),
        err
    )]
    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadRequest,
    ) -> Result<CompleteMultipartUploadResponse, S3ClientError> {
        let target = &request.target;

        let parts = request
            .parts
            .into_iter()
            .map(|part| {
                let mut builder = sdk::CompletedPart::builder()
                    .part_number(part.part_number)
                    .set_e_tag(part.etag);
                for (algorithm, value) in part.checksums {
                    builder = with_checksum_value!(builder, algorithm, value);
                }
                builder.build()
            })
            .collect();

        let mut builder = self
            .complete_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&request.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .checksum_type(sdk::ChecksumType::from(request.checksum_type.as_str()))
            .mpu_object_size(request.mpu_object_size)
            .set_if_none_match(target.if_none_match.clone())
            .set_expected_bucket_owner(target.expected_bucket_owner.clone())
            .set_request_payer(request_payer(target));
        builder = with_sse_customer!(builder, target);

        if let Some(checksum) = request.checksum {
            builder = with_checksum_value!(builder, checksum.algorithm, checksum.value);
        }

        let output = builder.send().await.map_err(map_sdk_error)?;

        Ok(CompleteMultipartUploadResponse {
            etag: output.e_tag().map(str::to_owned),
            version_id: output.version_id().map(str::to_owned),
        })
    }

    #[tracing::instrument(
        name = "s3.abort_multipart_upload",
        skip(self, request),
        fields(s3.bucket = %request.target.bucket, s3.upload_id = %request.upload_id),
        err
    )]
    async fn abort_multipart_upload(
        &self,
        request: AbortMultipartUploadRequest,
    ) -> Result<(), S3ClientError> {
        let target = &request.target;
        self.abort_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(&request.upload_id)
            .set_expected_bucket_owner(target.expected_bucket_owner.clone())
            .set_request_payer(request_payer(target))
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(())
    }
}
