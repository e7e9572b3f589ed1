//! Chat front end: turns updates into downloads, QR codes and menu actions.

use crate::delivery::DeliveryError;
use crate::download::DownloadService;
use crate::media_fetcher::{looks_like_link, MediaMode};
use crate::qr::render_png_blocking;
use crate::state_store::{Owner, StateStore, UserRecord};
use crate::telegram::{CallbackQuery, ChatApi, InlineKeyboardButton, InlineKeyboardMarkup, Message, Update};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Slash commands the bot understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Stats,
    /// `/qr <text>`; `None` when no text was given
    Qr(Option<String>),
    Unknown(String),
}

/// What an incoming text message asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command(Command),
    Link(String),
    Text(String),
}

/// Parse `/name[@bot] args`; `None` when `text` is not a command
pub fn parse_command(text: &str) -> Option<Command> {
    let rest = text.trim().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

    let command = match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "stats" => Command::Stats,
        "qr" => Command::Qr((!args.is_empty()).then(|| args.to_string())),
        _ => Command::Unknown(name),
    };
    Some(command)
}

pub fn classify(text: &str) -> Inbound {
    let text = text.trim();
    if let Some(command) = parse_command(text) {
        return Inbound::Command(command);
    }
    if looks_like_link(text) {
        return Inbound::Link(text.to_string());
    }
    Inbound::Text(text.to_string())
}

/// Inline keyboard actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    SetMode(MediaMode),
    MenuQr,
    MenuStats,
    MenuHelp,
    BackToMenu,
    Cancel,
    /// Make a QR code from the message the prompt replied to
    QrFromText,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        if let Some(mode) = data.strip_prefix("set_") {
            return MediaMode::parse(mode).map(CallbackAction::SetMode);
        }

        match data {
            "menu_qr" => Some(CallbackAction::MenuQr),
            "menu_stats" => Some(CallbackAction::MenuStats),
            "menu_help" => Some(CallbackAction::MenuHelp),
            "back_to_menu" => Some(CallbackAction::BackToMenu),
            "cancel" => Some(CallbackAction::Cancel),
            "qr_text" => Some(CallbackAction::QrFromText),
            _ => None,
        }
    }

    pub fn data(&self) -> String {
        match self {
            CallbackAction::SetMode(mode) => format!("set_{}", mode.as_str()),
            CallbackAction::MenuQr => "menu_qr".to_string(),
            CallbackAction::MenuStats => "menu_stats".to_string(),
            CallbackAction::MenuHelp => "menu_help".to_string(),
            CallbackAction::BackToMenu => "back_to_menu".to_string(),
            CallbackAction::Cancel => "cancel".to_string(),
            CallbackAction::QrFromText => "qr_text".to_string(),
        }
    }
}

fn button(text: &str, action: CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::new(text, action.data())
}

fn mode_label(mode: MediaMode) -> &'static str {
    match mode {
        MediaMode::Video => "Video",
        MediaMode::Audio => "Audio",
        MediaMode::Both => "All",
    }
}

/// Main menu; the current mode is ticked
pub fn main_menu(current: MediaMode) -> InlineKeyboardMarkup {
    let modes = MediaMode::ALL
        .iter()
        .map(|&mode| {
            let label = if mode == current {
                format!("✅ {}", mode_label(mode))
            } else {
                mode_label(mode).to_string()
            };
            button(&label, CallbackAction::SetMode(mode))
        })
        .collect();

    InlineKeyboardMarkup {
        inline_keyboard: vec![
            modes,
            vec![
                button("QR code", CallbackAction::MenuQr),
                button("Stats", CallbackAction::MenuStats),
            ],
            vec![button("Help", CallbackAction::MenuHelp)],
        ],
    }
}

pub fn back_button() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: vec![vec![button("Back to menu", CallbackAction::BackToMenu)]],
    }
}

fn qr_prompt_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: vec![vec![
            button("Create QR code", CallbackAction::QrFromText),
            button("Cancel", CallbackAction::Cancel),
        ]],
    }
}

pub fn welcome_text(name: &str, mode: MediaMode) -> String {
    format!(
        "Hi, {}!\n\n\
         Send me a link and I will download the media.\n\
         Current format: {}\n\n\
         /qr <text> creates a QR code\n\
         /stats shows your numbers\n\
         /help explains everything",
        if name.is_empty() { "there" } else { name },
        mode_label(mode),
    )
}

pub fn help_text() -> &'static str {
    "Downloads:\n\
     Send a link from YouTube, TikTok, Instagram and many other sites.\n\
     Pick Video, Audio or All in the menu.\n\
     Files too large for the chat are uploaded to cloud storage and sent as a temporary link.\n\n\
     QR codes:\n\
     /qr <text> creates a QR code.\n\
     Any other text can also be turned into one.\n\n\
     Commands: /start /help /qr /stats"
}

fn qr_usage_text() -> &'static str {
    "Send: /qr <text or link>\nFor example: /qr https://telegram.org"
}

pub fn stats_text(stats: &UserRecord) -> String {
    format!(
        "Your stats:\n\n\
         Downloads: {}\n\
         QR codes: {}\n\
         Cloud uploads: {}\n\
         Format: {}",
        stats.download_count,
        stats.qr_count,
        stats.cloud_upload_count,
        mode_label(stats.preferred_mode),
    )
}

/// Update handler shared by every dispatch task
pub struct Bot {
    client: Arc<dyn ChatApi>,
    state: Arc<StateStore>,
    downloads: Arc<DownloadService>,
}

impl Bot {
    pub fn new(client: Arc<dyn ChatApi>, state: Arc<StateStore>, downloads: Arc<DownloadService>) -> Self {
        Self {
            client,
            state,
            downloads,
        }
    }

    #[instrument(skip(self, update), fields(update_id = update.update_id))]
    pub async fn handle_update(&self, update: Update) -> Result<(), DeliveryError> {
        if let Some(query) = update.callback_query {
            return self.handle_callback(query).await;
        }

        match update.message {
            Some(message) => self.handle_message(message).await,
            None => {
                debug!("Ignoring update without message");
                Ok(())
            }
        }
    }

    async fn handle_message(&self, message: Message) -> Result<(), DeliveryError> {
        let (Some(text), Some(from)) = (message.text.as_deref(), message.from.as_ref()) else {
            return Ok(());
        };
        let owner = Owner {
            user_id: from.id,
            chat_id: message.chat.id,
        };

        match classify(text) {
            Inbound::Command(Command::Start) => {
                let mode = self.state.preference(owner.user_id).await;
                self.client
                    .send_message(owner.chat_id, &welcome_text(&from.first_name, mode), None, Some(main_menu(mode)))
                    .await?;
            }
            Inbound::Command(Command::Help) => {
                self.client
                    .send_message(owner.chat_id, help_text(), None, Some(back_button()))
                    .await?;
            }
            Inbound::Command(Command::Stats) => {
                let stats = self.state.user_stats(owner.user_id).await;
                self.client
                    .send_message(owner.chat_id, &stats_text(&stats), None, Some(back_button()))
                    .await?;
            }
            Inbound::Command(Command::Qr(Some(payload))) => {
                let status = self
                    .client
                    .send_message(owner.chat_id, "Creating QR code...", None, None)
                    .await?;
                self.send_qr(owner, &payload, status.message_id).await?;
            }
            Inbound::Command(Command::Qr(None)) => {
                self.client
                    .send_message(owner.chat_id, qr_usage_text(), None, None)
                    .await?;
            }
            Inbound::Command(Command::Unknown(name)) => {
                debug!(command = %name, "Unknown command");
                self.client
                    .send_message(owner.chat_id, "Unknown command. See /help.", None, None)
                    .await?;
            }
            Inbound::Link(url) => {
                let mode = self.state.preference(owner.user_id).await;
                let status = self
                    .client
                    .send_message(owner.chat_id, &format!("Downloading ({})...", mode_label(mode)), None, None)
                    .await?;

                if let Err(e) = self.downloads.handle(&url, owner).await {
                    info!(error = %e, "Download request failed");
                }

                if let Err(e) = self.client.delete_message(owner.chat_id, status.message_id).await {
                    debug!(error = %e, "Failed to remove status message");
                }
            }
            Inbound::Text(_) => {
                // The prompt replies to the text so the callback can find it again
                self.client
                    .send_message(
                        owner.chat_id,
                        "That does not look like a link. Create a QR code from this text?",
                        Some(message.message_id),
                        Some(qr_prompt_keyboard()),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    async fn handle_callback(&self, query: CallbackQuery) -> Result<(), DeliveryError> {
        if let Err(e) = self.client.answer_callback_query(&query.id).await {
            debug!(error = %e, "Failed to answer callback query");
        }

        let Some(message) = query.message else {
            return Ok(());
        };
        let Some(action) = query.data.as_deref().and_then(CallbackAction::parse) else {
            warn!(data = ?query.data, "Unknown callback data");
            return Ok(());
        };

        let owner = Owner {
            user_id: query.from.id,
            chat_id: message.chat.id,
        };
        let (chat_id, message_id) = (message.chat.id, message.message_id);

        match action {
            CallbackAction::SetMode(mode) => {
                if let Err(e) = self.state.set_preference(owner.user_id, mode).await {
                    error!(error = %e, "Failed to save preference");
                }
                let text = format!(
                    "Format set to {}.\n\nLinks will now be downloaded this way. Send a link!",
                    mode_label(mode)
                );
                self.client
                    .edit_message_text(chat_id, message_id, &text, Some(main_menu(mode)))
                    .await?;
            }
            CallbackAction::BackToMenu => {
                let mode = self.state.preference(owner.user_id).await;
                self.client
                    .edit_message_text(chat_id, message_id, "Main menu", Some(main_menu(mode)))
                    .await?;
            }
            CallbackAction::MenuQr => {
                self.client
                    .edit_message_text(chat_id, message_id, qr_usage_text(), Some(back_button()))
                    .await?;
            }
            CallbackAction::MenuStats => {
                let stats = self.state.user_stats(owner.user_id).await;
                self.client
                    .edit_message_text(chat_id, message_id, &stats_text(&stats), Some(back_button()))
                    .await?;
            }
            CallbackAction::MenuHelp => {
                self.client
                    .edit_message_text(chat_id, message_id, help_text(), Some(back_button()))
                    .await?;
            }
            CallbackAction::Cancel => {
                self.client
                    .edit_message_text(chat_id, message_id, "Cancelled.", Some(back_button()))
                    .await?;
            }
            CallbackAction::QrFromText => {
                let payload = message
                    .reply_to_message
                    .as_ref()
                    .and_then(|original| original.text.clone());
                match payload {
                    Some(payload) => {
                        self.client
                            .edit_message_text(chat_id, message_id, "Creating QR code...", None)
                            .await?;
                        self.send_qr(owner, &payload, message_id).await?;
                    }
                    None => {
                        self.client
                            .edit_message_text(chat_id, message_id, "The original text is no longer available.", Some(back_button()))
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Render and send a QR code, replacing the status message
    async fn send_qr(&self, owner: Owner, payload: &str, status_message_id: i64) -> Result<(), DeliveryError> {
        let png = match render_png_blocking(payload.to_string()).await {
            Ok(png) => png,
            Err(e) => {
                warn!(error = %e, "QR rendering failed");
                self.client
                    .edit_message_text(
                        owner.chat_id,
                        status_message_id,
                        &format!("Could not create QR code: {}", e),
                        Some(back_button()),
                    )
                    .await?;
                return Ok(());
            }
        };

        self.client
            .send_photo(owner.chat_id, "qr.png", png, "QR code ready")
            .await?;

        match self.state.record_qr(owner.user_id).await {
            Ok(total) => debug!(total, "QR code sent"),
            Err(e) => error!(error = %e, "Failed to count QR code"),
        }
        metrics::counter!("bot.qr.generated").increment(1);

        if let Err(e) = self.client.delete_message(owner.chat_id, status_message_id).await {
            debug!(error = %e, "Failed to remove status message");
        }
        Ok(())
    }
}
