//! Resilient reply delivery with automatic retry for Telegram API operations.
//!
//! Replies are sent with exponential backoff and jitter so a transient
//! network error does not swallow the public link of a finished transfer.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ParseMode, ReplyParameters};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

use crate::config::{
    TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
};
use crate::dispatcher::Replier;

/// Retry a Telegram API operation with exponential backoff.
///
/// - Initial delay: 500ms
/// - Max delay: 4s
/// - Max attempts: 3 (constants in `config.rs`)
///
/// # Errors
///
/// Returns the last error if every attempt fails.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "Telegram API operation failed after {} attempts: {}",
            TELEGRAM_API_MAX_RETRIES, e
        );
        e
    })
}

/// Send an HTML reply to a message with automatic retry on network failures.
///
/// # Errors
///
/// Returns an error after all retries are exhausted.
pub async fn send_reply_resilient(
    bot: &Bot,
    chat_id: ChatId,
    reply_to: MessageId,
    text: impl Into<String>,
) -> Result<Message> {
    let text = text.into();
    retry_telegram_operation(|| async {
        bot.send_message(chat_id, text.clone())
            .parse_mode(ParseMode::Html)
            .reply_parameters(ReplyParameters::new(reply_to))
            .await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// [`Replier`] that answers the message carrying the command.
#[derive(Clone)]
pub struct TelegramReplier {
    bot: Bot,
    chat_id: ChatId,
    reply_to: MessageId,
}

impl TelegramReplier {
    /// Creates a replier for `msg`.
    #[must_use]
    pub fn new(bot: Bot, msg: &Message) -> Self {
        Self {
            bot,
            chat_id: msg.chat.id,
            reply_to: msg.id,
        }
    }
}

#[async_trait]
impl Replier for TelegramReplier {
    async fn reply(&self, text: &str) -> Result<()> {
        send_reply_resilient(&self.bot, self.chat_id, self.reply_to, text).await?;
        Ok(())
    }
}
