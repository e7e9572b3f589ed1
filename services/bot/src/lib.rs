//! Harti Bot
//!
//! Telegram bot that downloads media behind a link and sends it back to the
//! chat. Files above the chat upload limit are staged in S3-compatible storage
//! and shared as a temporary link; a background scheduler deletes them once
//! their retention window has passed.
//!
//! ## Features
//!
//! - **Size Routing**: Small files go straight to the chat, oversized files are
//!   uploaded to object storage and registered for expiry
//! - **Scheduled Expiry**: Periodic sweep deletes expired objects, survives
//!   restarts and retries failed deletions
//! - **Durable State**: Per-user preferences and counters plus staged-file
//!   records in a write-through JSON snapshot
//! - **QR Codes**: Any text can be turned into a PNG QR code
//!
//! ## Architecture
//!
//! ```text
//! Telegram (polling / webhook)
//!        │
//!        ▼
//! ┌──────────────┐     ┌──────────────┐
//! │ Bot          │────▶│ Media        │  yt-dlp
//! │ Dispatcher   │     │ Fetcher      │
//! └──────────────┘     └──────────────┘
//!        │                    │ files
//!        ▼                    ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Delivery     │◀────│ Size         │────▶│ Object Store │  S3
//! │ (Bot API)    │     │ Router       │     │              │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                             │                    ▲
//!                             ▼                    │ delete
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │ State Store  │◀────│ Expiry       │
//!                      │ (JSON)       │     │ Scheduler    │
//!                      └──────────────┘     └──────────────┘
//! ```

pub mod bot;
pub mod config;
pub mod delivery;
pub mod download;
pub mod media_fetcher;
pub mod object_store;
pub mod qr;
pub mod router;
pub mod scheduler;
pub mod state_store;
pub mod telegram;
pub mod webhook;

pub use bot::Bot;
pub use config::Config;
pub use delivery::{Delivery, DeliveryError};
pub use download::{DownloadService, DownloadSummary};
pub use media_fetcher::{FetchError, MediaFetcher, MediaKind, MediaMode, YtDlpFetcher};
pub use object_store::{DeleteOutcome, ObjectStore, ObjectStoreError, RemoteObject, S3ObjectStore};
pub use router::{Route, RouteError, SizeRouter, Staging};
pub use scheduler::{ExpiryScheduler, SweepReport};
pub use state_store::{Owner, RecordState, StagedFileRecord, StateStore, StoreError, UserRecord};
pub use telegram::{ChatApi, TelegramClient, Update};
