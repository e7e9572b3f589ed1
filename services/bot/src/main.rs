use anyhow::{Context, Result};
use harti_bot::config::Config;
use harti_bot::media_fetcher::YtDlpFetcher;
use harti_bot::object_store::{ObjectStore, S3ObjectStore};
use harti_bot::router::{SizeRouter, Staging};
use harti_bot::scheduler::ExpiryScheduler;
use harti_bot::state_store::StateStore;
use harti_bot::telegram::{run_polling, TelegramClient, Update};
use harti_bot::webhook::{start_webhook_server, WebhookState};
use harti_bot::{Bot, DownloadService};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Updates buffered between the transport and the dispatcher
const UPDATE_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        inline_max_bytes = config.routing.inline_max_bytes,
        retention = ?config.retention(),
        sweep_interval = ?config.sweep_interval(),
        fetch_timeout = ?config.fetch_timeout(),
        "Starting Harti bot"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let state = Arc::new(StateStore::open(&config.store.path).await);
    info!(path = %state.path().display(), "State store ready");

    tokio::fs::create_dir_all(&config.fetcher.work_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.fetcher.work_dir.display()))?;

    let shutdown = CancellationToken::new();

    let (staging, scheduler_handle) = match config.s3 {
        Some(ref s3_config) => {
            let store: Arc<dyn ObjectStore> = Arc::new(
                S3ObjectStore::new(s3_config, config.retention())
                    .await
                    .context("Failed to initialize S3 object store")?,
            );
            let scheduler = Arc::new(ExpiryScheduler::new(state.clone(), store.clone(), &config.expiry));
            let handle = scheduler.clone().spawn(shutdown.clone());
            (Some(Staging { store, scheduler }), Some(handle))
        }
        None => {
            warn!("No S3 storage configured, files above the inline limit cannot be delivered");
            (None, None)
        }
    };

    let router = Arc::new(
        SizeRouter::new(config.routing.inline_max_bytes, config.retention(), staging)
            .context("Invalid retention window")?,
    );
    let client = Arc::new(TelegramClient::new(&config.telegram).context("Failed to initialize Telegram client")?);
    let fetcher = Arc::new(YtDlpFetcher::new(&config.fetcher));
    let downloads = Arc::new(DownloadService::new(fetcher, router, client.clone(), state.clone()));
    let bot = Arc::new(Bot::new(client.clone(), state.clone(), downloads));

    let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE);
    let dispatcher_handle = tokio::spawn(dispatch(
        bot,
        updates_rx,
        config.telegram.max_concurrent_requests,
    ));

    // Spawn transport task
    let transport_handle = match config.telegram.webhook_url {
        Some(ref webhook_url) => {
            let secret = config.telegram.webhook_secret.clone();
            client
                .set_webhook(webhook_url, secret.as_deref())
                .await
                .context("Failed to register webhook")?;
            info!(url = %webhook_url, "Webhook registered");

            let webhook_state = WebhookState {
                updates: updates_tx,
                secret,
            };
            let telegram_config = config.telegram.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = start_webhook_server(webhook_state, &telegram_config, token).await {
                    error!(error = %e, "Webhook server error");
                }
            })
        }
        None => tokio::spawn(run_polling(client.clone(), updates_tx, shutdown.clone())),
    };

    info!(webhook = config.webhook_enabled(), "Harti bot started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down Harti bot");
    shutdown.cancel();

    // The transport owns the update sender; once it stops the dispatcher drains
    if let Err(e) = transport_handle.await {
        error!(error = %e, "Transport task failed");
    }
    if let Err(e) = dispatcher_handle.await {
        error!(error = %e, "Dispatcher task failed");
    }
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Expiry scheduler task failed");
        }
    }

    info!("Harti bot stopped");

    Ok(())
}

/// Run one task per update, at most `max_concurrent` at a time
async fn dispatch(bot: Arc<Bot>, mut updates: mpsc::Receiver<Update>, max_concurrent: usize) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    while let Some(update) = updates.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let bot = bot.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = bot.handle_update(update).await {
                warn!(error = %e, "Failed to handle update");
            }
        });
    }

    // Wait for in-flight requests
    let _ = semaphore.acquire_many(max_concurrent as u32).await;
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Initialize Prometheus metrics exporter; port 0 disables it
fn init_metrics(port: u16) -> Result<()> {
    if port == 0 {
        info!("Prometheus metrics exporter disabled");
        return Ok(());
    }

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
