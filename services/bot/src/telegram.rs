//! Minimal Telegram Bot API client over HTTPS.
//!
//! Only the methods the bot uses are covered. Telegram answers with a JSON
//! envelope even on 4xx, so responses are decoded regardless of status.

use crate::config::TelegramConfig;
use crate::delivery::{Delivery, DeliveryError};
use crate::media_fetcher::MediaKind;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Delay before retrying a failed getUpdates call
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// HTTP timeout for the final offset confirmation on shutdown
const ACKNOWLEDGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineKeyboardButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Response envelope shared by every Bot API method
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, DeliveryError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(DeliveryError::Api {
                code: self.error_code,
                description: self
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }
}

#[derive(Serialize)]
struct GetUpdates<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<&'a InlineKeyboardMarkup>,
}

#[derive(Serialize)]
struct EditMessageText<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<&'a InlineKeyboardMarkup>,
}

#[derive(Serialize)]
struct MessageRef {
    chat_id: i64,
    message_id: i64,
}

#[derive(Serialize)]
struct AnswerCallbackQuery<'a> {
    callback_query_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Serialize)]
struct SetWebhook<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_token: Option<&'a str>,
    allowed_updates: &'a [&'a str],
}

const ALLOWED_UPDATES: &[&str] = &["message", "callback_query"];

/// Bot API client
pub struct TelegramClient {
    http: reqwest::Client,
    /// `{api_base_url}/bot{token}`; never logged
    endpoint: String,
    poll_timeout_secs: u64,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/bot{}",
                config.api_base_url.trim_end_matches('/'),
                config.bot_token
            ),
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.endpoint, method)
    }

    async fn call<P, T>(&self, method: &str, params: &P, timeout: Option<Duration>) -> Result<T, DeliveryError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(self.method_url(method)).json(params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(without_url)?;
        decode(response).await
    }

    async fn call_multipart<T: DeserializeOwned>(&self, method: &str, form: Form) -> Result<T, DeliveryError> {
        let response = self
            .http
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(without_url)?;
        decode(response).await
    }

    /// Confirm every update before `offset` without waiting for new ones
    pub async fn acknowledge(&self, offset: i64) -> Result<(), DeliveryError> {
        let params = GetUpdates {
            offset: Some(offset),
            timeout: 0,
            allowed_updates: ALLOWED_UPDATES,
        };
        let _: Vec<Update> = self
            .call("getUpdates", &params, Some(ACKNOWLEDGE_TIMEOUT))
            .await?;
        Ok(())
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, DeliveryError> {
        let params = GetUpdates {
            offset,
            timeout: self.poll_timeout_secs,
            allowed_updates: ALLOWED_UPDATES,
        };
        // The HTTP timeout must outlast the server-side long poll
        let timeout = Duration::from_secs(self.poll_timeout_secs + 10);
        self.call("getUpdates", &params, Some(timeout)).await
    }

    pub async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<(), DeliveryError> {
        let params = SetWebhook {
            url,
            secret_token,
            allowed_updates: ALLOWED_UPDATES,
        };
        let _: bool = self.call("setWebhook", &params, None).await?;
        Ok(())
    }

    pub async fn delete_webhook(&self) -> Result<(), DeliveryError> {
        let _: bool = self.call("deleteWebhook", &serde_json::json!({}), None).await?;
        Ok(())
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<Message, DeliveryError> {
        let params = SendMessage {
            chat_id,
            text,
            reply_to_message_id,
            reply_markup: keyboard,
        };
        self.call("sendMessage", &params, None).await
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), DeliveryError> {
        let params = EditMessageText {
            chat_id,
            message_id,
            text,
            reply_markup: keyboard,
        };
        // Result is the edited Message or `true`
        let _: serde_json::Value = self.call("editMessageText", &params, None).await?;
        Ok(())
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), DeliveryError> {
        let _: bool = self
            .call("deleteMessage", &MessageRef { chat_id, message_id }, None)
            .await?;
        Ok(())
    }

    pub async fn answer_callback_query(&self, callback_query_id: &str, text: Option<&str>) -> Result<(), DeliveryError> {
        let params = AnswerCallbackQuery {
            callback_query_id,
            text,
        };
        let _: bool = self.call("answerCallbackQuery", &params, None).await?;
        Ok(())
    }

    /// Upload in-memory bytes as an attachment
    pub async fn send_upload(
        &self,
        chat_id: i64,
        kind: MediaKind,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<Message, DeliveryError> {
        let (method, field) = upload_method(kind);

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, Part::bytes(bytes).file_name(file_name.to_string()));
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        self.call_multipart(method, form).await
    }
}

#[async_trait]
impl Delivery for TelegramClient {
    #[instrument(skip(self, path), fields(file = %path.display()))]
    async fn send_file(&self, chat_id: i64, path: &Path, kind: MediaKind) -> Result<(), DeliveryError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| DeliveryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        debug!(size_bytes = bytes.len(), "Uploading file to chat");
        self.send_upload(chat_id, kind, &file_name, bytes, None).await?;
        Ok(())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.send_message(chat_id, text, None, None).await?;
        Ok(())
    }
}

/// Chat operations used by the update handlers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<Message, DeliveryError>;

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), DeliveryError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), DeliveryError>;

    async fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), DeliveryError>;

    /// Send an in-memory PNG as a photo
    async fn send_photo(&self, chat_id: i64, file_name: &str, png: Vec<u8>, caption: &str) -> Result<(), DeliveryError>;
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<Message, DeliveryError> {
        TelegramClient::send_message(self, chat_id, text, reply_to_message_id, keyboard.as_ref()).await
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<(), DeliveryError> {
        TelegramClient::edit_message_text(self, chat_id, message_id, text, keyboard.as_ref()).await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), DeliveryError> {
        TelegramClient::delete_message(self, chat_id, message_id).await
    }

    async fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), DeliveryError> {
        TelegramClient::answer_callback_query(self, callback_query_id, None).await
    }

    async fn send_photo(&self, chat_id: i64, file_name: &str, png: Vec<u8>, caption: &str) -> Result<(), DeliveryError> {
        self.send_upload(chat_id, MediaKind::Image, file_name, png, Some(caption))
            .await?;
        Ok(())
    }
}

/// Bot API method and form field for an attachment kind
fn upload_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Image => ("sendPhoto", "photo"),
        MediaKind::Document => ("sendDocument", "document"),
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, DeliveryError> {
    let envelope: ApiResponse<T> = response.json().await.map_err(without_url)?;
    envelope.into_result()
}

/// reqwest errors carry the request URL, which contains the bot token
fn without_url(e: reqwest::Error) -> DeliveryError {
    DeliveryError::Http(e.without_url())
}

/// Feed updates from getUpdates into `updates` until shutdown
pub async fn run_polling(
    client: Arc<TelegramClient>,
    updates: mpsc::Sender<Update>,
    shutdown: CancellationToken,
) {
    // getUpdates is rejected while a webhook is registered
    if let Err(e) = client.delete_webhook().await {
        warn!(error = %e, "Failed to clear webhook before polling");
    }

    info!("Polling for updates");
    let mut offset: Option<i64> = None;

    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = client.get_updates(offset) => batch,
        };

        match batch {
            Ok(batch) => {
                for update in batch {
                    offset = Some(update.update_id + 1);
                    if updates.send(update).await.is_err() {
                        info!("Update channel closed, stopping polling");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "getUpdates failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(POLL_RETRY_DELAY) => {}
                }
            }
        }
    }

    // Without this the last batch is delivered again after a restart
    if let Some(offset) = offset {
        match client.acknowledge(offset).await {
            Ok(()) => debug!(offset, "Acknowledged final update offset"),
            Err(e) => warn!(error = %e, offset, "Failed to acknowledge final update offset"),
        }
    }

    info!("Polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message_update() {
        let raw = r#"{
            "update_id": 1001,
            "message": {
                "message_id": 5,
                "date": 1700000000,
                "chat": {"id": -42, "type": "private"},
                "from": {"id": 7, "is_bot": false, "first_name": "Ada"},
                "text": "https://youtu.be/abc",
                "reply_to_message": {
                    "message_id": 4,
                    "chat": {"id": -42, "type": "private"},
                    "text": "hello"
                }
            }
        }"#;

        let update: Update = serde_json::from_str(raw).unwrap();
        let message = update.message.unwrap();
        assert_eq!(update.update_id, 1001);
        assert_eq!(message.chat.id, -42);
        assert_eq!(message.from.unwrap().id, 7);
        assert_eq!(message.text.as_deref(), Some("https://youtu.be/abc"));
        assert_eq!(message.reply_to_message.unwrap().text.as_deref(), Some("hello"));
        assert!(update.callback_query.is_none());
    }

    #[test]
    fn test_decode_callback_update() {
        let raw = r#"{
            "update_id": 1002,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": 7, "is_bot": false, "first_name": "Ada", "username": "ada"},
                "message": {"message_id": 9, "chat": {"id": 7}},
                "chat_instance": "x",
                "data": "mode:audio"
            }
        }"#;

        let update: Update = serde_json::from_str(raw).unwrap();
        let query = update.callback_query.unwrap();
        assert_eq!(query.id, "cb-1");
        assert_eq!(query.data.as_deref(), Some("mode:audio"));
        assert_eq!(query.message.unwrap().message_id, 9);
    }

    #[test]
    fn test_error_envelope_becomes_api_error() {
        let raw = r#"{"ok": false, "error_code": 413, "description": "Request Entity Too Large"}"#;
        let envelope: ApiResponse<Message> = serde_json::from_str(raw).unwrap();

        match envelope.into_result() {
            Err(DeliveryError::Api { code, description }) => {
                assert_eq!(code, Some(413));
                assert_eq!(description, "Request Entity Too Large");
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.message_id)),
        }
    }

    #[test]
    fn test_ok_envelope_yields_result() {
        let envelope: ApiResponse<bool> = serde_json::from_str(r#"{"ok": true, "result": true}"#).unwrap();
        assert!(envelope.into_result().unwrap());
    }

    #[test]
    fn test_send_message_omits_empty_fields() {
        let params = SendMessage {
            chat_id: 1,
            text: "hi",
            reply_to_message_id: None,
            reply_markup: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json, serde_json::json!({"chat_id": 1, "text": "hi"}));
    }

    #[test]
    fn test_keyboard_serialization() {
        let keyboard = InlineKeyboardMarkup {
            inline_keyboard: vec![vec![InlineKeyboardButton::new("Audio", "mode:audio")]],
        };
        let json = serde_json::to_value(&keyboard).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"inline_keyboard": [[{"text": "Audio", "callback_data": "mode:audio"}]]})
        );
    }

    #[test]
    fn test_upload_method_per_kind() {
        assert_eq!(upload_method(MediaKind::Video), ("sendVideo", "video"));
        assert_eq!(upload_method(MediaKind::Audio), ("sendAudio", "audio"));
        assert_eq!(upload_method(MediaKind::Image), ("sendPhoto", "photo"));
        assert_eq!(upload_method(MediaKind::Document), ("sendDocument", "document"));
    }

    #[test]
    fn test_endpoint_contains_token() {
        let config = TelegramConfig {
            bot_token: "123:abc".to_string(),
            api_base_url: "https://api.telegram.org/".to_string(),
            ..TelegramConfig::default()
        };
        let client = TelegramClient::new(&config).unwrap();
        assert_eq!(client.method_url("getMe"), "https://api.telegram.org/bot123:abc/getMe");
    }

    /// Bot API stand-in recording every call as (method, JSON body)
    async fn fake_bot_api(calls: Arc<std::sync::Mutex<Vec<(String, serde_json::Value)>>>) -> String {
        use axum::extract::{Path as UrlPath, State};
        use axum::routing::post;
        use axum::{Json, Router};

        async fn handle(
            State(calls): State<Arc<std::sync::Mutex<Vec<(String, serde_json::Value)>>>>,
            UrlPath(method): UrlPath<String>,
            Json(body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            calls.lock().unwrap().push((method.clone(), body.clone()));
            match method.as_str() {
                "getUpdates" if body["timeout"] == 0 => Json(serde_json::json!({"ok": true, "result": []})),
                "getUpdates" if body.get("offset").is_none() => Json(serde_json::json!({
                    "ok": true,
                    "result": [{"update_id": 10, "message": {"message_id": 1, "chat": {"id": 3}, "text": "hi"}}]
                })),
                "getUpdates" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Json(serde_json::json!({"ok": true, "result": []}))
                }
                _ => Json(serde_json::json!({"ok": true, "result": true})),
            }
        }

        let app = Router::new()
            .route("/bottest-token/:method", post(handle))
            .with_state(calls);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_polling_acknowledges_last_offset_on_shutdown() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let base = fake_bot_api(calls.clone()).await;
        let config = TelegramConfig {
            bot_token: "test-token".to_string(),
            api_base_url: base,
            ..TelegramConfig::default()
        };
        let client = Arc::new(TelegramClient::new(&config).unwrap());

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_polling(client, tx, shutdown.clone()));

        let update = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.update_id, 10);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, "deleteWebhook");
        assert!(calls.iter().any(|(method, body)| {
            method == "getUpdates" && body["offset"] == 11 && body["timeout"] == 0
        }));
    }
}
