// S3 Object Store Implementation
// Works against AWS S3 or any S3-compatible service (MinIO, LocalStack)

use super::{
    copy_part_ranges, validate_key, ByteReader, ObjectInfo, ObjectMetadata, ObjectStore, Precondition, PutReceipt, StorageClass,
    StoreError, StoreResult,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective, ServerSideEncryption};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Parts are buffered one at a time; S3 requires at least 5 MiB for all but the last.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Largest source CopyObject accepts
const COPY_OBJECT_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

/// Range per UploadPartCopy above the CopyObject limit
const COPY_PART_SIZE: u64 = 512 * 1024 * 1024;

/// S3 store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StoreConfig {
    /// Bucket holding artifacts, catalog and leases
    pub bucket_name: String,
    /// AWS region
    pub region: String,
    /// S3-compatible endpoint (MinIO, LocalStack)
    pub endpoint_url: Option<String>,
    /// Path-style addressing, needed by most S3-compatible services
    pub force_path_style: bool,
    /// Use SSE-KMS with this key instead of SSE-S3 (AES256)
    pub kms_key_id: Option<String>,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            bucket_name: "db-backups".to_string(),
            region: "us-east-2".to_string(),
            endpoint_url: None,
            force_path_style: false,
            kms_key_id: None,
        }
    }
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: Client,
    config: S3StoreConfig,
}

fn classify<E>(context: &str, err: SdkError<E>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    match (&err, status) {
        (SdkError::TimeoutError(_), _) | (SdkError::DispatchFailure(_), _) => StoreError::Transient(message),
        (_, Some(404)) => StoreError::NotFound(message),
        (_, Some(409)) | (_, Some(412)) => StoreError::PreconditionFailed(message),
        (_, Some(code)) if code == 429 || code >= 500 => StoreError::Transient(message),
        (SdkError::ResponseError(_), _) => StoreError::Transient(message),
        _ => StoreError::Permanent(message),
    }
}

impl S3ObjectStore {
    /// Create a new S3 store with the given configuration
    pub async fn new(config: S3StoreConfig) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_types::region::Region::new(config.region.clone()));

        // Support for LocalStack/MinIO with custom endpoint
        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
            config,
        }
    }

    fn sse(&self) -> ServerSideEncryption {
        if self.config.kms_key_id.is_some() {
            ServerSideEncryption::AwsKms
        } else {
            ServerSideEncryption::Aes256
        }
    }

    fn s3_class(class: StorageClass) -> aws_sdk_s3::types::StorageClass {
        aws_sdk_s3::types::StorageClass::from(class.as_str())
    }

    fn from_s3_metadata(
        content_type: Option<&str>,
        storage_class: Option<&aws_sdk_s3::types::StorageClass>,
        sse: Option<&ServerSideEncryption>,
        user: Option<&HashMap<String, String>>,
    ) -> ObjectMetadata {
        ObjectMetadata {
            content_type: content_type.map(str::to_string),
            storage_class: storage_class
                .and_then(|c| c.as_str().parse().ok())
                .unwrap_or_default(),
            server_side_encryption: sse.is_some(),
            user: user
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }
    }

    async fn put_single(&self, key: &str, body: Vec<u8>, metadata: &ObjectMetadata) -> StoreResult<PutReceipt> {
        let size_bytes = body.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .body(ByteStream::from(body))
            .storage_class(Self::s3_class(metadata.storage_class))
            .set_content_type(metadata.content_type.clone());
        if metadata.server_side_encryption {
            request = request
                .server_side_encryption(self.sse())
                .set_ssekms_key_id(self.config.kms_key_id.clone());
        }
        for (k, v) in &metadata.user {
            request = request.metadata(k, v);
        }

        let response = request.send().await.map_err(|e| classify("Failed to put object", e))?;
        Ok(PutReceipt {
            size_bytes,
            version: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn put_multipart(
        &self,
        key: &str,
        first_part: Vec<u8>,
        body: &mut ByteReader,
        metadata: &ObjectMetadata,
    ) -> StoreResult<PutReceipt> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(key)
            .storage_class(Self::s3_class(metadata.storage_class))
            .set_content_type(metadata.content_type.clone());
        if metadata.server_side_encryption {
            create = create
                .server_side_encryption(self.sse())
                .set_ssekms_key_id(self.config.kms_key_id.clone());
        }
        for (k, v) in &metadata.user {
            create = create.metadata(k, v);
        }

        let upload = create
            .send()
            .await
            .map_err(|e| classify("Failed to create multipart upload", e))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| StoreError::Permanent("No upload ID returned".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, first_part, body).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                self.abort_upload(key, &upload_id).await;
                Err(e)
            }
        }
    }

    /// Abort so S3 does not keep billing for the orphaned parts
    async fn abort_upload(&self, key: &str, upload_id: &str) {
        if let Err(abort_err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key = %key, error = %DisplayErrorContext(&abort_err), "Failed to abort multipart upload");
        }
    }

    /// Server-side copy. `class` of `None` lands the copy in STANDARD.
    async fn copy_within(&self, source: &str, destination: &str, class: Option<StorageClass>) -> StoreResult<()> {
        let info = self
            .head(source)
            .await?
            .ok_or_else(|| StoreError::NotFound(source.to_string()))?;
        if info.metadata.storage_class.is_archived() {
            return Err(StoreError::Permanent(format!(
                "InvalidObjectState: {} is archived in {} and must be restored before copying",
                source, info.metadata.storage_class
            )));
        }

        let copy_source = format!("{}/{}", self.config.bucket_name, source);
        if info.size_bytes > COPY_OBJECT_LIMIT {
            return self.copy_multipart(&copy_source, destination, &info, class).await;
        }

        self.client
            .copy_object()
            .bucket(&self.config.bucket_name)
            .copy_source(copy_source)
            .key(destination)
            .set_storage_class(class.map(Self::s3_class))
            .metadata_directive(MetadataDirective::Copy)
            .server_side_encryption(self.sse())
            .set_ssekms_key_id(self.config.kms_key_id.clone())
            .send()
            .await
            .map_err(|e| classify("Failed to copy object", e))?;
        Ok(())
    }

    async fn copy_multipart(
        &self,
        copy_source: &str,
        destination: &str,
        source: &ObjectInfo,
        class: Option<StorageClass>,
    ) -> StoreResult<()> {
        // Multipart uploads do not inherit anything from the source
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(destination)
            .set_storage_class(class.map(Self::s3_class))
            .set_content_type(source.metadata.content_type.clone())
            .server_side_encryption(self.sse())
            .set_ssekms_key_id(self.config.kms_key_id.clone());
        for (k, v) in &source.metadata.user {
            create = create.metadata(k, v);
        }

        let upload = create
            .send()
            .await
            .map_err(|e| classify("Failed to create multipart copy", e))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| StoreError::Permanent("No upload ID returned".to_string()))?
            .to_string();

        match self.copy_parts(copy_source, destination, &upload_id, source.size_bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_upload(destination, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn copy_parts(&self, copy_source: &str, destination: &str, upload_id: &str, size: u64) -> StoreResult<()> {
        let mut parts = Vec::new();
        for (index, (start, end)) in copy_part_ranges(size, COPY_PART_SIZE).into_iter().enumerate() {
            let part_number = index as i32 + 1;
            let response = self
                .client
                .upload_part_copy()
                .bucket(&self.config.bucket_name)
                .key(destination)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(copy_source)
                .copy_source_range(format!("bytes={}-{}", start, end))
                .send()
                .await
                .map_err(|e| classify("Failed to copy part", e))?;

            let e_tag = response
                .copy_part_result()
                .and_then(|result| result.e_tag())
                .unwrap_or_default();
            parts.push(CompletedPart::builder().part_number(part_number).e_tag(e_tag).build());
            debug!(key = %destination, part_number, "copied part");
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(destination)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| classify("Failed to complete multipart copy", e))?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        body: &mut ByteReader,
    ) -> StoreResult<PutReceipt> {
        let mut parts = Vec::new();
        let mut size_bytes = 0u64;
        let mut chunk = first_part;
        let mut part_number = 1;

        loop {
            size_bytes += chunk.len() as u64;
            let part_response = self
                .client
                .upload_part()
                .bucket(&self.config.bucket_name)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| classify("Failed to upload part", e))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            debug!(key = %key, part_number, "uploaded part");

            chunk = read_part(body).await?;
            if chunk.is_empty() {
                break;
            }
            part_number += 1;
        }

        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify("Failed to complete multipart upload", e))?;

        Ok(PutReceipt {
            size_bytes,
            version: response.e_tag().unwrap_or_default().to_string(),
        })
    }
}

async fn read_part(body: &mut ByteReader) -> StoreResult<Vec<u8>> {
    let mut part = Vec::with_capacity(PART_SIZE);
    let mut limited = body.take(PART_SIZE as u64);
    limited
        .read_to_end(&mut part)
        .await
        .map_err(|e| StoreError::Transient(format!("Failed to read upload body: {}", e)))?;
    Ok(part)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, mut body: ByteReader, metadata: ObjectMetadata) -> StoreResult<PutReceipt> {
        validate_key(key)?;
        let first = read_part(&mut body).await?;
        if first.len() < PART_SIZE {
            self.put_single(key, first, &metadata).await
        } else {
            self.put_multipart(key, first, &mut body, &metadata).await
        }
    }

    async fn put_conditional(
        &self,
        key: &str,
        body: Bytes,
        metadata: ObjectMetadata,
        precondition: Precondition,
    ) -> StoreResult<PutReceipt> {
        validate_key(key)?;
        let size_bytes = body.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .body(ByteStream::from(body))
            .set_content_type(metadata.content_type.clone());
        if metadata.server_side_encryption {
            request = request
                .server_side_encryption(self.sse())
                .set_ssekms_key_id(self.config.kms_key_id.clone());
        }
        request = match precondition {
            Precondition::IfAbsent => request.if_none_match("*"),
            Precondition::IfMatch(etag) => request.if_match(etag),
        };

        let response = request.send().await.map_err(|e| classify("Conditional put failed", e))?;
        Ok(PutReceipt {
            size_bytes,
            version: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<(ByteReader, ObjectMetadata)> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("Failed to get object", e))?;

        let metadata = Self::from_s3_metadata(
            response.content_type(),
            response.storage_class(),
            response.server_side_encryption(),
            response.metadata(),
        );
        Ok((Box::pin(response.body.into_async_read()), metadata))
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>> {
        let response = match self
            .client
            .head_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return match classify("Failed to head object", e) {
                    StoreError::NotFound(_) => Ok(None),
                    other => Err(other),
                }
            }
        };

        let last_modified = response
            .last_modified()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
            .unwrap_or_else(Utc::now);

        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size_bytes: response.content_length().unwrap_or(0).max(0) as u64,
            version: response.e_tag().unwrap_or_default().to_string(),
            last_modified,
            metadata: Self::from_s3_metadata(
                response.content_type(),
                response.storage_class(),
                response.server_side_encryption(),
                response.metadata(),
            ),
        }))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket_name)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify("Failed to list objects", e))?;

            keys.extend(response.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        // S3 already returns UTF-8 binary order; sort anyway for S3-compatible stores
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("Failed to delete object", e))?;
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str) -> StoreResult<()> {
        validate_key(destination)?;
        self.copy_within(source, destination, None).await
    }

    async fn transition(&self, key: &str, class: StorageClass) -> StoreResult<()> {
        // In-place copy with a new storage class; S3 applies it asynchronously for archives
        self.copy_within(key, key, Some(class)).await
    }
}
