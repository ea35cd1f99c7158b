//! Command handling: access checks, the relay pipeline and the replies.
//!
//! A `/dl` command walks through
//! `Received → Validated → Unlocking → Downloading → Uploading → Replied`.
//! Every terminal state sends exactly one final reply through the [`Replier`]
//! and is reported back as a [`DispatchOutcome`]. A request holds a rate
//! limit [`Reservation`] from validation to the final reply; only a delivered
//! link turns it into a count.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::{BlockList, Settings};
use crate::rate_limit::{RateLimiter, Reservation};
use crate::transfer::{build_http_client, Downloader, FileHostClient, LogProgress};
use crate::unlock::{UnlockClient, UnlockOutcome};

/// Reply sent to blocked users.
pub const BLOCKED_MESSAGE: &str = "You're Blocked!";
/// Reply when the command argument is not an http(s) URL.
pub const NOT_A_LINK_MESSAGE: &str = "This is not a link.";
/// Reply when the provider cannot unlock the link.
pub const UNAVAILABLE_MESSAGE: &str = "Something went wrong, either the link is dead or the website is not supported. Please try again later.";
/// Reply when the download or the upload failed.
pub const TRANSFER_FAILED_MESSAGE: &str =
    "Something went wrong while transferring your file. Please try again later.";
/// Interim reply once the link is unlocked and the transfer starts.
pub const PREPARING_MESSAGE: &str =
    "Your request is under preparation. I'll send it here once it's ready.";

/// Sends text back to wherever the command came from.
///
/// Replies are Telegram HTML.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Replier: Send + Sync {
    /// Sends one reply.
    async fn reply(&self, text: &str) -> Result<()>;
}

/// Where a command was sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    /// One-to-one chat with the bot.
    Private,
    /// Group or supergroup with its chat id.
    Group(i64),
}

/// Transport-neutral view of an inbound command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Origin chat.
    pub chat: ChatKind,
    /// Sender id.
    pub user_id: i64,
    /// Sender username without `@`, if set.
    pub username: Option<String>,
    /// Sender display name.
    pub display_name: String,
    /// Full message text including the command token.
    pub text: String,
}

/// Terminal state of a handled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent from a private chat or an unknown group.
    Redirected,
    /// Sender is on the block list.
    Blocked,
    /// Sender used up the allowance.
    RateLimited {
        /// Time until the next global reset.
        retry_in: Duration,
    },
    /// Argument is not an http(s) URL.
    NotALink,
    /// The provider did not unlock the link.
    Unavailable,
    /// Declared size above the cap.
    SizeExceeded {
        /// Declared size in bytes.
        filesize: u64,
    },
    /// Download or upload failed.
    TransferFailed,
    /// Usage text was sent.
    HelpSent,
    /// The public link was delivered.
    Delivered {
        /// Name of the relayed file.
        filename: String,
        /// Public download page.
        link: String,
    },
}

/// Static reply settings.
#[derive(Debug, Clone)]
struct ReplyTexts {
    invite_link: String,
    signature: String,
    reset_period: Duration,
}

/// Validates commands and runs the relay pipeline.
pub struct CommandDispatcher {
    authorized_groups: HashSet<i64>,
    blocked: BlockList,
    limiter: Arc<RateLimiter>,
    unlocker: UnlockClient,
    downloader: Downloader,
    uploader: FileHostClient,
    max_file_size: u64,
    texts: ReplyTexts,
}

impl CommandDispatcher {
    /// Wires the pipeline from settings around a shared limiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_settings(settings: &Settings, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = build_http_client(settings.http_timeout())?;
        Ok(Self {
            authorized_groups: settings.authorized_groups(),
            blocked: settings.blocked_users(),
            limiter,
            unlocker: UnlockClient::new(
                client.clone(),
                &settings.unlock_api_url,
                &settings.api_key,
                &settings.unlock_agent,
            ),
            downloader: Downloader::new(client.clone(), &settings.download_dir),
            uploader: FileHostClient::new(
                client,
                &settings.filehost_api_url,
                &settings.filehost_upload_url,
            ),
            max_file_size: settings.max_file_size_bytes,
            texts: ReplyTexts {
                invite_link: settings.group_invite_link.clone(),
                signature: settings.signature.clone(),
                reset_period: settings.reset_period(),
            },
        })
    }

    /// Shared rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Handles `/dl <url>`.
    pub async fn handle_download(
        &self,
        ctx: &CommandContext,
        replier: &dyn Replier,
    ) -> DispatchOutcome {
        let (outcome, reservation) = match self.admit(ctx) {
            Ok((link, reservation)) => (self.relay(ctx, link, replier).await, Some(reservation)),
            Err(rejection) => (rejection, None),
        };

        self.send(replier, &self.reply_text(ctx, &outcome)).await;

        // Uncommitted reservations give their slot back on drop
        if let (DispatchOutcome::Delivered { .. }, Some(reservation)) = (&outcome, reservation) {
            let count = reservation.commit();
            info!(user_id = ctx.user_id, count, "Request recorded");
        }
        outcome
    }

    /// Handles `/help` and `/start`.
    pub async fn handle_help(&self, ctx: &CommandContext, replier: &dyn Replier) -> DispatchOutcome {
        let outcome = self
            .check_access(ctx)
            .unwrap_or(DispatchOutcome::HelpSent);
        self.send(replier, &self.reply_text(ctx, &outcome)).await;
        outcome
    }

    fn check_access(&self, ctx: &CommandContext) -> Option<DispatchOutcome> {
        let in_group = match ctx.chat {
            ChatKind::Private => false,
            ChatKind::Group(id) => self.authorized_groups.contains(&id),
        };
        if !in_group {
            return Some(DispatchOutcome::Redirected);
        }
        if self.blocked.contains(ctx.user_id, ctx.username.as_deref()) {
            return Some(DispatchOutcome::Blocked);
        }
        None
    }

    /// Runs the validation guards, returning the submitted link and the
    /// rate limit slot held for it.
    fn admit<'a>(
        &self,
        ctx: &'a CommandContext,
    ) -> Result<(&'a str, Reservation), DispatchOutcome> {
        if let Some(rejection) = self.check_access(ctx) {
            return Err(rejection);
        }
        let Some(reservation) = RateLimiter::try_reserve(&self.limiter, ctx.user_id) else {
            return Err(DispatchOutcome::RateLimited {
                retry_in: self.limiter.time_until_reset(self.texts.reset_period),
            });
        };
        let link = command_argument(&ctx.text);
        if !is_http_link(link) {
            return Err(DispatchOutcome::NotALink);
        }
        Ok((link, reservation))
    }

    async fn relay(
        &self,
        ctx: &CommandContext,
        link: &str,
        replier: &dyn Replier,
    ) -> DispatchOutcome {
        let unlocked = match self.unlocker.unlock(link).await {
            UnlockOutcome::Resolved(unlocked) => unlocked,
            UnlockOutcome::Rejected { reason } => {
                info!(user_id = ctx.user_id, reason = %reason, "Link not available");
                return DispatchOutcome::Unavailable;
            }
            UnlockOutcome::Transport(e) => {
                warn!(user_id = ctx.user_id, error = %e, "Unlock provider unreachable");
                return DispatchOutcome::Unavailable;
            }
        };

        if unlocked.filesize > self.max_file_size {
            info!(
                user_id = ctx.user_id,
                filesize = unlocked.filesize,
                "Declared size above the cap"
            );
            return DispatchOutcome::SizeExceeded {
                filesize: unlocked.filesize,
            };
        }

        info!(
            user_id = ctx.user_id,
            username = ctx.username.as_deref().unwrap_or(""),
            link = %link,
            direct = %unlocked.link,
            "Relaying link"
        );
        self.send(replier, PREPARING_MESSAGE).await;

        let downloaded = match self
            .downloader
            .download(
                &unlocked.link,
                unlocked.filename.as_deref(),
                &LogProgress::new("Downloading"),
            )
            .await
        {
            Ok(downloaded) => downloaded,
            Err(e) => {
                error!(user_id = ctx.user_id, error = %e, "Download failed");
                return DispatchOutcome::TransferFailed;
            }
        };

        // `downloaded.file` removes the staged copy when this scope ends,
        // whether or not the upload worked.
        match self
            .uploader
            .upload(downloaded.file.path(), Arc::new(LogProgress::new("Uploading")))
            .await
        {
            Ok(public_link) => DispatchOutcome::Delivered {
                filename: downloaded.filename.clone(),
                link: public_link,
            },
            Err(_) => DispatchOutcome::TransferFailed,
        }
    }

    fn reply_text(&self, ctx: &CommandContext, outcome: &DispatchOutcome) -> String {
        let signature = html_escape::encode_text(&self.texts.signature);
        match outcome {
            DispatchOutcome::Redirected => format!(
                "❌ This bot only works in a specific group. Please join the following group and use it there.\n{}",
                html_escape::encode_text(&self.texts.invite_link)
            ),
            DispatchOutcome::Blocked => BLOCKED_MESSAGE.to_string(),
            DispatchOutcome::RateLimited { retry_in } => format!(
                "You've hit the usage limit of {} requests.\nLimits reset for everyone every {}. The next reset is in {}.",
                self.limiter.max_requests(),
                describe_duration(self.texts.reset_period),
                describe_duration(*retry_in)
            ),
            DispatchOutcome::NotALink => NOT_A_LINK_MESSAGE.to_string(),
            DispatchOutcome::Unavailable => UNAVAILABLE_MESSAGE.to_string(),
            DispatchOutcome::SizeExceeded { .. } => format!(
                "Filesize exceeded the {} limit.",
                describe_size(self.max_file_size)
            ),
            DispatchOutcome::TransferFailed => TRANSFER_FAILED_MESSAGE.to_string(),
            DispatchOutcome::HelpSent => format!(
                "Supported Hosts:\n- RapidGator\n- Google Drive\n- Mega (Not folder)\n- TurboBit\n\nUsage:\n/dl http://rapidgator.net/...\n\n\n{signature}"
            ),
            DispatchOutcome::Delivered { filename, link } => format!(
                "Requester: {}\n<code>{}</code>\n{}\n\n\n{signature}",
                mention(ctx),
                html_escape::encode_text(filename),
                html_escape::encode_text(link)
            ),
        }
    }

    async fn send(&self, replier: &dyn Replier, text: &str) {
        if let Err(e) = replier.reply(text).await {
            error!(error = %e, "Failed to send reply");
        }
    }
}

/// Text after the command token (`/dl`, `/dl@bot`), trimmed.
fn command_argument(text: &str) -> &str {
    let text = text.trim();
    if text.starts_with('/') {
        text.split_once(char::is_whitespace)
            .map_or("", |(_, rest)| rest.trim())
    } else {
        text
    }
}

fn is_http_link(text: &str) -> bool {
    let lower = text.get(..8).unwrap_or(text).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// `@username`, or an inline mention by id for users without one. Chats
/// posting as themselves have negative ids and are named plainly.
fn mention(ctx: &CommandContext) -> String {
    ctx.username.as_deref().map_or_else(
        || {
            if ctx.user_id < 0 {
                return html_escape::encode_text(&ctx.display_name).into_owned();
            }
            format!(
                "<a href=\"tg://user?id={}\">{}</a>",
                ctx.user_id,
                html_escape::encode_text(&ctx.display_name)
            )
        },
        |username| format!("@{}", html_escape::encode_text(username)),
    )
}

fn describe_duration(duration: Duration) -> String {
    let total_minutes = duration.as_secs().div_ceil(60);
    let (hours, minutes) = (total_minutes / 60, total_minutes % 60);
    match (hours, minutes) {
        (0, 0) => "less than a minute".to_string(),
        (0, m) => format!("{m}m"),
        (1, 0) => "1 hour".to_string(),
        (h, 0) => format!("{h} hours"),
        (h, m) => format!("{h}h {m}m"),
    }
}

fn describe_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}GB", bytes / GIB)
    } else {
        format!("{bytes} bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_settings;

    const GROUP: i64 = -100_200;

    fn dispatcher_with(configure: impl FnOnce(&mut Settings)) -> CommandDispatcher {
        let mut settings = test_settings();
        settings.authorized_group_ids_str = Some(GROUP.to_string());
        settings.blocked_users_str = Some("666 @troll".to_string());
        // Nothing listens here; guards must stop before any request.
        settings.unlock_api_url = "http://127.0.0.1:9".to_string();
        configure(&mut settings);
        CommandDispatcher::from_settings(&settings, Arc::new(RateLimiter::new(2)))
            .expect("dispatcher builds")
    }

    fn ctx(chat: ChatKind, user_id: i64, username: Option<&str>, text: &str) -> CommandContext {
        CommandContext {
            chat,
            user_id,
            username: username.map(str::to_string),
            display_name: "Alice".to_string(),
            text: text.to_string(),
        }
    }

    fn expect_single_reply(predicate: fn(&str) -> bool) -> MockReplier {
        let mut replier = MockReplier::new();
        replier
            .expect_reply()
            .withf(move |text: &str| predicate(text))
            .times(1)
            .returning(|_| Ok(()));
        replier
    }

    #[tokio::test]
    async fn test_private_chat_is_redirected() {
        let dispatcher = dispatcher_with(|_| {});
        let replier = expect_single_reply(|t| t.contains("https://t.me/+4m_yZcXqi901Mzc5"));
        let outcome = dispatcher
            .handle_download(&ctx(ChatKind::Private, 1, Some("alice"), "/dl http://a/b"), &replier)
            .await;
        assert_eq!(outcome, DispatchOutcome::Redirected);
    }

    #[tokio::test]
    async fn test_unknown_group_is_redirected() {
        let dispatcher = dispatcher_with(|_| {});
        let replier = expect_single_reply(|t| t.starts_with("❌"));
        let outcome = dispatcher
            .handle_download(&ctx(ChatKind::Group(-1), 1, None, "/dl http://a/b"), &replier)
            .await;
        assert_eq!(outcome, DispatchOutcome::Redirected);
    }

    #[tokio::test]
    async fn test_blocked_by_id_and_username() {
        let dispatcher = dispatcher_with(|_| {});

        let replier = expect_single_reply(|t| t == BLOCKED_MESSAGE);
        let outcome = dispatcher
            .handle_download(&ctx(ChatKind::Group(GROUP), 666, None, "/dl http://a/b"), &replier)
            .await;
        assert_eq!(outcome, DispatchOutcome::Blocked);

        let replier = expect_single_reply(|t| t == BLOCKED_MESSAGE);
        let outcome = dispatcher
            .handle_download(
                &ctx(ChatKind::Group(GROUP), 5, Some("Troll"), "/dl http://a/b"),
                &replier,
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_rate_limited_user() {
        let dispatcher = dispatcher_with(|_| {});
        dispatcher.limiter().record_success(1);
        dispatcher.limiter().record_success(1);

        let replier = expect_single_reply(|t| t.contains("usage limit of 2 requests") && t.contains("every 24 hours"));
        let outcome = dispatcher
            .handle_download(&ctx(ChatKind::Group(GROUP), 1, None, "/dl http://a/b"), &replier)
            .await;
        assert!(matches!(outcome, DispatchOutcome::RateLimited { .. }));
        assert_eq!(dispatcher.limiter().count(1), 2);
    }

    #[tokio::test]
    async fn test_not_a_link() {
        let dispatcher = dispatcher_with(|_| {});
        for text in ["/dl", "/dl ftp://host/file", "/dl hello", "/dl@relay_bot   www.x.com"] {
            let replier = expect_single_reply(|t| t == NOT_A_LINK_MESSAGE);
            let outcome = dispatcher
                .handle_download(&ctx(ChatKind::Group(GROUP), 1, None, text), &replier)
                .await;
            assert_eq!(outcome, DispatchOutcome::NotALink, "input: {text}");
        }
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_unavailable() {
        let dispatcher = dispatcher_with(|_| {});
        let replier = expect_single_reply(|t| t == UNAVAILABLE_MESSAGE);
        let outcome = dispatcher
            .handle_download(
                &ctx(ChatKind::Group(GROUP), 1, None, "/dl https://host.example/file"),
                &replier,
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Unavailable);
        assert_eq!(dispatcher.limiter().count(1), 0);
    }

    #[tokio::test]
    async fn test_help_for_group_member() {
        let dispatcher = dispatcher_with(|s| s.signature = "Sig <b>".to_string());
        let replier = expect_single_reply(|t| t.contains("/dl http://rapidgator.net/") && t.contains("Sig &lt;b&gt;"));
        let outcome = dispatcher
            .handle_help(&ctx(ChatKind::Group(GROUP), 1, None, "/help"), &replier)
            .await;
        assert_eq!(outcome, DispatchOutcome::HelpSent);
    }

    #[tokio::test]
    async fn test_help_blocked_and_private() {
        let dispatcher = dispatcher_with(|_| {});

        let replier = expect_single_reply(|t| t == BLOCKED_MESSAGE);
        let outcome = dispatcher
            .handle_help(&ctx(ChatKind::Group(GROUP), 666, None, "/start"), &replier)
            .await;
        assert_eq!(outcome, DispatchOutcome::Blocked);

        let replier = expect_single_reply(|t| t.starts_with("❌"));
        let outcome = dispatcher
            .handle_help(&ctx(ChatKind::Private, 1, None, "/start"), &replier)
            .await;
        assert_eq!(outcome, DispatchOutcome::Redirected);
    }

    #[tokio::test]
    async fn test_failed_reply_does_not_change_outcome() {
        let dispatcher = dispatcher_with(|_| {});
        let mut replier = MockReplier::new();
        replier
            .expect_reply()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("telegram down")));
        let outcome = dispatcher
            .handle_download(&ctx(ChatKind::Group(GROUP), 1, None, "/dl nope"), &replier)
            .await;
        assert_eq!(outcome, DispatchOutcome::NotALink);
    }

    #[tokio::test]
    async fn test_rejected_request_gives_slot_back() {
        let dispatcher = dispatcher_with(|_| {});
        dispatcher.limiter().record_success(1);

        let replier = expect_single_reply(|t| t == NOT_A_LINK_MESSAGE);
        dispatcher
            .handle_download(&ctx(ChatKind::Group(GROUP), 1, None, "/dl nope"), &replier)
            .await;
        let replier = expect_single_reply(|t| t == UNAVAILABLE_MESSAGE);
        dispatcher
            .handle_download(&ctx(ChatKind::Group(GROUP), 1, None, "/dl http://a/b"), &replier)
            .await;

        assert_eq!(dispatcher.limiter().in_flight(1), 0);
        assert_eq!(dispatcher.limiter().count(1), 1);
        assert!(dispatcher.limiter().check_allowed(1));
    }

    #[test]
    fn test_command_argument() {
        assert_eq!(command_argument("/dl http://a/b"), "http://a/b");
        assert_eq!(command_argument("/dl@relay_bot  http://a/b  "), "http://a/b");
        assert_eq!(command_argument("/dl"), "");
        assert_eq!(command_argument("http://a/b"), "http://a/b");
    }

    #[test]
    fn test_is_http_link() {
        assert!(is_http_link("http://a"));
        assert!(is_http_link("HTTPS://a"));
        assert!(!is_http_link("httpx://a"));
        assert!(!is_http_link("ftp://a"));
        assert!(!is_http_link(""));
        assert!(!is_http_link("ключ"));
    }

    #[test]
    fn test_mention() {
        let with_name = ctx(ChatKind::Private, 9, Some("alice"), "");
        assert_eq!(mention(&with_name), "@alice");

        let mut without = ctx(ChatKind::Private, 9, None, "");
        without.display_name = "A<B".to_string();
        assert_eq!(mention(&without), "<a href=\"tg://user?id=9\">A&lt;B</a>");

        let mut as_chat = ctx(ChatKind::Group(GROUP), GROUP, None, "");
        as_chat.display_name = "Relay".to_string();
        assert_eq!(mention(&as_chat), "Relay");
    }

    #[test]
    fn test_describe_duration_and_size() {
        assert_eq!(describe_duration(Duration::from_secs(86_400)), "24 hours");
        assert_eq!(describe_duration(Duration::from_secs(3_600)), "1 hour");
        assert_eq!(describe_duration(Duration::from_secs(7_200)), "2 hours");
        assert_eq!(describe_duration(Duration::from_secs(3_660)), "1h 1m");
        assert_eq!(describe_duration(Duration::from_secs(30)), "1m");
        assert_eq!(describe_duration(Duration::ZERO), "less than a minute");
        assert_eq!(describe_size(8_589_934_592), "8GB");
        assert_eq!(describe_size(1_000), "1000 bytes");
    }
}
