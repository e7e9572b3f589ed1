use crate::config::S3Config;
use crate::state_store::Owner;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Storage-side identifier, used for deletion
    pub object_id: String,
    /// Link handed to the user
    pub public_url: String,
}

/// Outcome of a delete call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The object was already gone
    NotFound,
}

/// Errors that can occur while talking to the remote store
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Deletion failed: {0}")]
    DeletionFailed(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Remote object storage used to stage oversized files
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file and return its id and shareable URL
    async fn upload(&self, local_path: &Path, owner: Owner) -> Result<RemoteObject, ObjectStoreError>;

    /// Delete an object by id
    async fn delete(&self, object_id: &str) -> Result<DeleteOutcome, ObjectStoreError>;
}

/// S3-compatible object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
    /// Lifetime of presigned links
    url_ttl: Duration,
}

impl S3ObjectStore {
    /// Create a new S3 store; presigned links live for `url_ttl`
    pub async fn new(config: &S3Config, url_ttl: Duration) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/R2/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        Ok(Self::from_client(client, config, url_ttl))
    }

    /// Wrap an already configured client
    pub fn from_client(client: S3Client, config: &S3Config, url_ttl: Duration) -> Self {
        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_urls = config.public_base_url.is_some(),
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
            url_ttl,
        }
    }

    /// Upload the file, picking multipart for large files
    async fn put_file(&self, local_path: &Path, key: &str, owner: Owner) -> Result<u64> {
        let size = tokio::fs::metadata(local_path)
            .await
            .with_context(|| format!("Failed to stat {}", local_path.display()))?
            .len();
        let content_type = content_type_for(local_path);

        debug!(key = %key, size_bytes = size, "Uploading file to S3");

        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(local_path, key, content_type, owner).await?;
        } else {
            self.simple_upload(local_path, key, content_type, owner).await?;
        }

        Ok(size)
    }

    /// Single-part upload for small files
    async fn simple_upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        owner: Owner,
    ) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .context("Failed to open file for upload")?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .metadata("owner-user-id", owner.user_id.to_string())
            .metadata("owner-chat-id", owner.chat_id.to_string())
            .send()
            .await
            .context("Failed to upload file to S3")?;

        Ok(())
    }

    /// Multipart upload, streaming the file from disk part by part
    async fn multipart_upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        owner: Owner,
    ) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .metadata("owner-user-id", owner.user_id.to_string())
            .metadata("owner-chat-id", owner.chat_id.to_string())
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(local_path, key, &upload_id).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .context("Failed to complete multipart upload")?;

                Ok(())
            }
            Err(e) => {
                // Abandoned parts are billed until aborted
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(error = %abort_err, key = %key, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(local_path)
            .await
            .context("Failed to open file for upload")?;

        let mut completed_parts = Vec::new();
        let mut part_number = 1;

        loop {
            let chunk = read_chunk(&mut file, self.config.part_size_bytes)
                .await
                .context("Failed to read file chunk")?;
            if chunk.is_empty() {
                break;
            }

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        Ok(completed_parts)
    }

    /// Shareable link for an uploaded key
    async fn public_url(&self, key: &str) -> Result<String> {
        if let Some(ref base) = self.config.public_base_url {
            return Ok(format!("{}/{}", base.trim_end_matches('/'), key));
        }

        let presigning_config = PresigningConfig::expires_in(self.url_ttl)
            .context("Failed to create presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        Ok(presigned.uri().to_string())
    }

    /// Check if an object exists; `None` when access is denied
    ///
    /// Without `s3:ListBucket` S3 answers 403 for missing keys, so a denied
    /// HEAD says nothing about existence.
    async fn object_exists(&self, key: &str) -> Result<Option<bool>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(Some(true)),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(Some(false))
                } else if e.raw_response().map(|r| r.status().as_u16()) == Some(403) {
                    Ok(None)
                } else {
                    Err(e).context("Failed to check object existence")
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> Result<DeleteOutcome> {
        // S3 deletes are idempotent, so check first to report missing objects
        match self.object_exists(key).await? {
            Some(false) => return Ok(DeleteOutcome::NotFound),
            Some(true) => {}
            None => warn!(key = %key, "HEAD denied, deleting without existence check"),
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete object from S3")?;

        Ok(DeleteOutcome::Deleted)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, local_path), fields(file = %local_path.display(), user_id = owner.user_id))]
    async fn upload(&self, local_path: &Path, owner: Owner) -> Result<RemoteObject, ObjectStoreError> {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let key = generate_object_key(&self.config.key_prefix, &file_name, owner, Utc::now());
        let timeout = self.config.upload_timeout();

        let upload = async {
            let size = self.put_file(local_path, &key, owner).await?;
            let public_url = self.public_url(&key).await?;
            Ok::<_, anyhow::Error>((size, public_url))
        };

        let (size, public_url) = tokio::time::timeout(timeout, upload)
            .await
            .map_err(|_| ObjectStoreError::Timeout {
                operation: "upload",
                after: timeout,
            })?
            .map_err(|e| ObjectStoreError::UploadFailed(format!("{:#}", e)))?;

        info!(key = %key, size_bytes = size, "File staged in S3");

        Ok(RemoteObject {
            object_id: key,
            public_url,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, object_id: &str) -> Result<DeleteOutcome, ObjectStoreError> {
        let timeout = self.config.delete_timeout();

        let outcome = tokio::time::timeout(timeout, self.delete_object(object_id))
            .await
            .map_err(|_| ObjectStoreError::Timeout {
                operation: "delete",
                after: timeout,
            })?
            .map_err(|e| ObjectStoreError::DeletionFailed(format!("{:#}", e)))?;

        debug!(key = %object_id, outcome = ?outcome, "Delete finished");
        Ok(outcome)
    }
}

/// Object key for a staged file
/// Format: {prefix}/{date}/{user_id}/{time}_{unique}_{file_name}
///
/// Date first keeps bucket lifecycle rules simple as a safety net behind the sweep.
pub fn generate_object_key(
    prefix: &str,
    file_name: &str,
    owner: Owner,
    now: DateTime<Utc>,
) -> String {
    format!(
        "{prefix}/{date}/{user}/{time}_{unique}_{name}",
        prefix = prefix.trim_matches('/'),
        date = now.format("%Y-%m-%d"),
        user = owner.user_id,
        time = now.format("%H%M%S%3f"),
        unique = &Uuid::new_v4().simple().to_string()[..8],
        name = sanitize_file_name(file_name),
    )
}

/// Restrict a file name to URL- and key-safe characters
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        return "file".to_string();
    }

    // Keep the extension when shortening
    if cleaned.len() > 96 {
        let ext = Path::new(cleaned)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.len() <= 8)
            .unwrap_or("");
        let stem_len = 96 - ext.len() - 1;
        return format!("{}.{}", &cleaned[..stem_len], ext);
    }

    cleaned.to_string()
}

/// Get content type for a media file
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn read_chunk(file: &mut tokio::fs::File, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size);
    file.take(size as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}
