use crate::delivery::{format_size, staged_file_message, Delivery};
use crate::media_fetcher::{FetchError, FetchedFile, MediaFetcher};
use crate::router::{Route, RouteError, SizeRouter};
use crate::state_store::{Owner, StateStore};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Per-request outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Sent through the chat transport
    pub delivered: usize,
    /// Uploaded to remote storage and sent as a link
    pub staged: usize,
    /// Could not reach the user
    pub failed: usize,
}

impl DownloadSummary {
    pub fn succeeded(&self) -> usize {
        self.delivered + self.staged
    }
}

/// Fetch, route and deliver the media behind one link
pub struct DownloadService {
    fetcher: Arc<dyn MediaFetcher>,
    router: Arc<SizeRouter>,
    delivery: Arc<dyn Delivery>,
    state: Arc<StateStore>,
}

impl DownloadService {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        router: Arc<SizeRouter>,
        delivery: Arc<dyn Delivery>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            fetcher,
            router,
            delivery,
            state,
        }
    }

    /// Handle one link. A failure on one file never stops the remaining files.
    #[instrument(skip(self), fields(user_id = owner.user_id))]
    pub async fn handle(&self, url: &str, owner: Owner) -> Result<DownloadSummary, FetchError> {
        let mode = self.state.preference(owner.user_id).await;

        let output = match self.fetcher.fetch(url, mode).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, mode = %mode, "Fetch failed");
                self.notify(owner.chat_id, &fetch_failure_message(&e)).await;
                return Err(e);
            }
        };

        let mut summary = DownloadSummary::default();
        for file in &output.files {
            match self.deliver_one(file, owner).await {
                Ok(Route::Direct) => summary.delivered += 1,
                Ok(Route::Staged { .. }) => summary.staged += 1,
                Err(()) => summary.failed += 1,
            }
        }

        output.cleanup().await;

        if summary.succeeded() > 0 {
            metrics::counter!("bot.downloads.completed").increment(1);
            if let Err(e) = self.state.record_download(owner.user_id).await {
                error!(error = %e, "Failed to count download");
            }
        } else {
            metrics::counter!("bot.downloads.failed").increment(1);
        }

        info!(
            delivered = summary.delivered,
            staged = summary.staged,
            failed = summary.failed,
            "Download request finished"
        );

        Ok(summary)
    }

    /// Route and deliver one file; the user is told about any failure
    async fn deliver_one(&self, file: &FetchedFile, owner: Owner) -> Result<Route, ()> {
        let name = file.file_name();

        let route = match self.router.route(file, owner).await {
            Ok(route) => route,
            Err(e) => {
                warn!(error = %e, file = %name, "File could not be routed");
                self.notify(owner.chat_id, &self.route_failure_message(&name, &e))
                    .await;
                return Err(());
            }
        };

        let sent = match &route {
            Route::Direct => {
                self.delivery
                    .send_file(owner.chat_id, &file.path, file.kind)
                    .await
            }
            Route::Staged {
                public_url,
                expires_at,
                ..
            } => {
                let text = staged_file_message(&name, file.byte_len, public_url, *expires_at);
                self.delivery.send_text(owner.chat_id, &text).await
            }
        };

        match sent {
            Ok(()) => Ok(route),
            Err(e) => {
                warn!(error = %e, file = %name, "Failed to deliver file");
                self.notify(owner.chat_id, &format!("Failed to send {}: {}", name, e))
                    .await;
                Err(())
            }
        }
    }

    fn route_failure_message(&self, name: &str, error: &RouteError) -> String {
        match error {
            RouteError::Unroutable { size_bytes } => format!(
                "{} is {}, above the {} limit for sending here, and cloud storage is not configured.",
                name,
                format_size(*size_bytes),
                format_size(self.router.inline_max_bytes()),
            ),
            RouteError::UploadFailed { size_bytes, .. } => format!(
                "{} ({}) is too large to send here and the cloud upload failed.",
                name,
                format_size(*size_bytes),
            ),
            RouteError::Persistence(_) => {
                format!("{} was uploaded but could not be registered, please try again.", name)
            }
            RouteError::RetentionOutOfRange(_) => {
                format!("{} could not be staged, please try again later.", name)
            }
        }
    }

    /// Best-effort status message
    async fn notify(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.delivery.send_text(chat_id, text).await {
            warn!(error = %e, chat_id, "Failed to send status message");
        }
    }
}

fn fetch_failure_message(error: &FetchError) -> String {
    match error {
        FetchError::NoFiles => "Nothing could be downloaded from that link.".to_string(),
        FetchError::Timeout(after) => format!(
            "The download took longer than {} minutes and was stopped.",
            after.as_secs() / 60
        ),
        _ => "Download failed. Check the link and try again.".to_string(),
    }
}
