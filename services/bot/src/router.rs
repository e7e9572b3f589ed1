use crate::config::MAX_WINDOW_SECS;
use crate::media_fetcher::FetchedFile;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::scheduler::ExpiryScheduler;
use crate::state_store::{Owner, StagedFileRecord, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// How a produced file reaches the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Small enough to send through the chat transport
    Direct,
    /// Uploaded to remote storage; the user gets a link until `expires_at`
    Staged {
        record_id: String,
        public_url: String,
        expires_at: DateTime<Utc>,
    },
}

/// Errors that prevent a file from being delivered
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("File of {size_bytes} bytes exceeds the inline limit and no remote storage is configured")]
    Unroutable { size_bytes: u64 },

    #[error("Upload of {size_bytes} bytes failed: {source}")]
    UploadFailed {
        size_bytes: u64,
        #[source]
        source: ObjectStoreError,
    },

    #[error("Failed to record staged file: {0}")]
    Persistence(#[from] StoreError),

    #[error("Retention of {0:?} is out of range")]
    RetentionOutOfRange(std::time::Duration),
}

/// Remote storage plus the scheduler that will expire what is uploaded
pub struct Staging {
    pub store: Arc<dyn ObjectStore>,
    pub scheduler: Arc<ExpiryScheduler>,
}

/// Decides per file whether to deliver inline or stage it remotely
pub struct SizeRouter {
    inline_max_bytes: u64,
    retention: chrono::Duration,
    staging: Option<Staging>,
}

impl SizeRouter {
    pub fn new(
        inline_max_bytes: u64,
        retention: std::time::Duration,
        staging: Option<Staging>,
    ) -> Result<Self, RouteError> {
        if retention.as_secs() > MAX_WINDOW_SECS {
            return Err(RouteError::RetentionOutOfRange(retention));
        }
        let retention = chrono::Duration::from_std(retention)
            .map_err(|_| RouteError::RetentionOutOfRange(retention))?;

        Ok(Self {
            inline_max_bytes,
            retention,
            staging,
        })
    }

    /// Whether files above the inline limit can be handled at all
    pub fn can_stage(&self) -> bool {
        self.staging.is_some()
    }

    pub fn inline_max_bytes(&self) -> u64 {
        self.inline_max_bytes
    }

    /// Route one file. Exactly one upload attempt is made for oversized files.
    #[instrument(skip(self, file), fields(file = %file.file_name(), size_bytes = file.byte_len))]
    pub async fn route(&self, file: &FetchedFile, owner: Owner) -> Result<Route, RouteError> {
        let size_bytes = file.byte_len;

        if size_bytes <= self.inline_max_bytes {
            debug!("File fits inline");
            return Ok(Route::Direct);
        }

        let staging = self
            .staging
            .as_ref()
            .ok_or(RouteError::Unroutable { size_bytes })?;

        let remote = staging
            .store
            .upload(&file.path, owner)
            .await
            .map_err(|source| RouteError::UploadFailed { size_bytes, source })?;

        let record = StagedFileRecord::new(
            &file.file_name(),
            remote.object_id.clone(),
            remote.public_url.clone(),
            owner,
            size_bytes,
            Utc::now(),
            self.retention,
        );
        let record_id = record.record_id.clone();
        let expires_at = record.expires_at;

        if let Err(e) = staging.scheduler.register(record).await {
            // Without a record nothing would ever expire the object
            error!(error = %e, object_id = %remote.object_id, "Failed to register staged file");
            if let Err(delete_err) = staging.store.delete(&remote.object_id).await {
                warn!(error = %delete_err, object_id = %remote.object_id, "Failed to remove unregistered object");
            }
            return Err(e.into());
        }

        metrics::counter!("bot.files.staged").increment(1);
        metrics::histogram!("bot.files.staged_bytes").record(size_bytes as f64);
        info!(record_id = %record_id, expires_at = %expires_at, "File staged for link delivery");

        Ok(Route::Staged {
            record_id,
            public_url: remote.public_url,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExpiryConfig;
    use crate::media_fetcher::MediaKind;
    use crate::object_store::{MockObjectStore, RemoteObject};
    use crate::state_store::{RecordState, StateStore};
    use std::path::PathBuf;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;
    const TWELVE_HOURS: Duration = Duration::from_secs(12 * 3600);

    fn owner() -> Owner {
        Owner {
            user_id: 7,
            chat_id: 70,
        }
    }

    fn file(size: u64) -> FetchedFile {
        FetchedFile {
            path: PathBuf::from("/tmp/harti-test/clip.mp4"),
            byte_len: size,
            kind: MediaKind::Video,
        }
    }

    async fn router_with(
        mock: MockObjectStore,
        dir: &tempfile::TempDir,
    ) -> (SizeRouter, Arc<StateStore>) {
        let state = Arc::new(StateStore::open(dir.path().join("state.json")).await);
        let store: Arc<dyn ObjectStore> = Arc::new(mock);
        let scheduler = Arc::new(ExpiryScheduler::new(
            state.clone(),
            store.clone(),
            &ExpiryConfig::default(),
        ));
        let router = SizeRouter::new(50 * MIB, TWELVE_HOURS, Some(Staging { store, scheduler })).unwrap();
        (router, state)
    }

    #[tokio::test]
    async fn test_small_file_never_touches_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_upload().times(0);
        mock.expect_delete().times(0);
        let (router, state) = router_with(mock, &dir).await;

        assert_eq!(router.route(&file(10 * MIB), owner()).await.unwrap(), Route::Direct);
        assert_eq!(router.route(&file(50 * MIB), owner()).await.unwrap(), Route::Direct);
        assert!(state.staged_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_large_file_is_staged_with_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_upload().times(1).returning(|_, _| {
            Ok(RemoteObject {
                object_id: "staged/2024-01-15/7/clip.mp4".to_string(),
                public_url: "https://files.example.com/clip.mp4".to_string(),
            })
        });
        let (router, state) = router_with(mock, &dir).await;

        let route = router.route(&file(80 * MIB), owner()).await.unwrap();
        let Route::Staged {
            record_id,
            public_url,
            expires_at,
        } = route
        else {
            panic!("expected a staged route");
        };
        assert_eq!(public_url, "https://files.example.com/clip.mp4");

        let record = state.staged_record(&record_id).await.unwrap();
        assert_eq!(record.state, RecordState::Active);
        assert_eq!(record.expires_at, expires_at);
        assert_eq!(record.expires_at - record.created_at, chrono::Duration::hours(12));
        assert_eq!(record.remote_object_id, "staged/2024-01-15/7/clip.mp4");
        assert_eq!(record.size_bytes, 80 * MIB);
        assert_eq!(state.user_stats(7).await.cloud_upload_count, 1);
    }

    #[tokio::test]
    async fn test_upload_failure_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_upload()
            .times(1)
            .returning(|_, _| Err(ObjectStoreError::UploadFailed("connection reset".to_string())));
        let (router, state) = router_with(mock, &dir).await;

        let err = router.route(&file(80 * MIB), owner()).await.unwrap_err();
        assert!(matches!(err, RouteError::UploadFailed { size_bytes, .. } if size_bytes == 80 * MIB));
        assert!(state.staged_records().await.is_empty());
        assert_eq!(state.user_stats(7).await.cloud_upload_count, 0);
    }

    #[tokio::test]
    async fn test_upload_timeout_is_upload_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockObjectStore::new();
        mock.expect_upload().times(1).returning(|_, _| {
            Err(ObjectStoreError::Timeout {
                operation: "upload",
                after: Duration::from_secs(600),
            })
        });
        let (router, _state) = router_with(mock, &dir).await;

        let err = router.route(&file(51 * MIB), owner()).await.unwrap_err();
        assert!(matches!(err, RouteError::UploadFailed { .. }));
    }

    #[tokio::test]
    async fn test_large_file_without_store_is_unroutable() {
        let router = SizeRouter::new(50 * MIB, TWELVE_HOURS, None).unwrap();
        assert!(!router.can_stage());

        let err = router.route(&file(50 * MIB + 1), owner()).await.unwrap_err();
        assert!(matches!(err, RouteError::Unroutable { size_bytes } if size_bytes == 50 * MIB + 1));

        assert_eq!(router.route(&file(MIB), owner()).await.unwrap(), Route::Direct);
    }

    #[test]
    fn test_out_of_range_retention_is_an_error() {
        let huge = Duration::from_secs(u64::MAX / 2);
        assert!(matches!(
            SizeRouter::new(1, huge, None),
            Err(RouteError::RetentionOutOfRange(d)) if d == huge
        ));

        let just_over = Duration::from_secs(MAX_WINDOW_SECS + 1);
        assert!(SizeRouter::new(1, just_over, None).is_err());

        assert!(SizeRouter::new(1, Duration::from_secs(MAX_WINDOW_SECS), None).is_ok());
    }
}
