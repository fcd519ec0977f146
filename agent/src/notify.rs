//! Outbound notifications: alarm texts and recording clips.
//!
//! The agent hands every notification to [`dispatch`], which logs sink
//! failures and moves on.  Delivery guarantees belong to the sink.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::multipart::Form;
use tracing::{error, info};

use nvr_common::error::NotifyError;

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Text(String),
    Video { path: PathBuf, caption: String },
}

pub trait NotificationSink: Send + Sync {
    fn send_text(&self, message: &str) -> Result<(), NotifyError>;
    fn send_video(&self, path: &Path, caption: &str) -> Result<(), NotifyError>;
}

/// Hand `notification` to `sink`; errors are logged, not returned.
pub fn dispatch(sink: &dyn NotificationSink, notification: &Notification) -> bool {
    let result = match notification {
        Notification::Text(message) => sink.send_text(message),
        Notification::Video { path, caption } => sink.send_video(path, caption),
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("Notification failed: {e}");
            false
        }
    }
}

/// Telegram Bot API sink.
pub struct TelegramSink {
    client: reqwest::blocking::Client,
    bot_path: String,
    chat_id: String,
}

impl TelegramSink {
    /// `bot_key` may be given with or without the `bot` prefix.
    pub fn new(bot_key: &str, chat_id: &str) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            bot_path: bot_path(bot_key),
            chat_id: chat_id.to_string(),
        })
    }

    fn url(&self, api_method: &str) -> String {
        format!("{TELEGRAM_API}/{}/{api_method}", self.bot_path)
    }
}

fn bot_path(bot_key: &str) -> String {
    if bot_key.starts_with("bot") {
        bot_key.to_string()
    } else {
        format!("bot{bot_key}")
    }
}

impl NotificationSink for TelegramSink {
    fn send_text(&self, message: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.url("sendMessage"))
            .form(&[("chat_id", self.chat_id.as_str()), ("text", message)])
            .send()?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        info!("Telegram text sent");
        Ok(())
    }

    fn send_video(&self, path: &Path, caption: &str) -> Result<(), NotifyError> {
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_string())
            .file("video", path)?;
        let resp = self.client.post(self.url("sendVideo")).multipart(form).send()?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        info!("Telegram video sent: {caption}");
        Ok(())
    }
}
