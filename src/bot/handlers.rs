use crate::bot::TelegramReplier;
use crate::dispatcher::{ChatKind, CommandContext, CommandDispatcher};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Relay a hosted-file link
    #[command(description = "Relay a hosted-file link: /dl <url>")]
    Dl(String),
    /// Show usage
    #[command(description = "Show supported hosts and usage.")]
    Help,
    /// Show usage
    #[command(description = "Show supported hosts and usage.")]
    Start,
}

/// Builds the transport-neutral view of a command message.
///
/// Messages sent on behalf of a chat (anonymous admins, linked channels) have
/// no user; they are keyed on the sending chat instead. Returns `None` when
/// the message carries neither.
#[must_use]
pub fn command_context(msg: &Message) -> Option<CommandContext> {
    let chat = if msg.chat.is_private() {
        ChatKind::Private
    } else {
        ChatKind::Group(msg.chat.id.0)
    };
    let text = msg.text().unwrap_or_default().to_string();

    if let Some(user) = msg.from.as_ref() {
        return Some(CommandContext {
            chat,
            user_id: user.id.0.cast_signed(),
            username: user.username.clone(),
            display_name: user.first_name.clone(),
            text,
        });
    }

    msg.sender_chat.as_ref().map(|sender| CommandContext {
        chat,
        user_id: sender.id.0,
        username: sender.username().map(str::to_string),
        display_name: sender.title().unwrap_or("Unknown").to_string(),
        text,
    })
}

/// Handler tree: every recognised command goes to [`handle_command`].
#[must_use]
pub fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .filter_command::<Command>()
        .endpoint(handle_command)
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    dispatcher: Arc<CommandDispatcher>,
) -> Result<(), teloxide::RequestError> {
    let Some(ctx) = command_context(&msg) else {
        warn!(chat_id = msg.chat.id.0, "Command without a sender ignored");
        return respond(());
    };
    let replier = TelegramReplier::new(bot, &msg);

    // Transfers can take hours; updates from the same group must not queue
    // behind them.
    tokio::spawn(async move {
        let outcome = match cmd {
            Command::Dl(_) => dispatcher.handle_download(&ctx, &replier).await,
            Command::Help | Command::Start => dispatcher.handle_help(&ctx, &replier).await,
        };
        info!(user_id = ctx.user_id, outcome = ?outcome, "Command handled");
    });

    respond(())
}
