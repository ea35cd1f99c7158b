/// Telegram command parsing and the update handler tree
pub mod handlers;
/// Reply delivery with automatic retry for Telegram API operations
pub mod resilient;

pub use resilient::TelegramReplier;
