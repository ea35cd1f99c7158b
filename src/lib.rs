#![warn(missing_docs)]
//! Debrid relay bot
//!
//! A Telegram group bot that turns hosted-file links into direct downloads
//! through an unlocking provider, re-hosts the file on a public file host and
//! replies with the new link.

/// Telegram bot implementation
pub mod bot;
/// Configuration management
pub mod config;
/// Command pipeline shared by all transports
pub mod dispatcher;
/// Error types
pub mod error;
/// Local filename derivation
pub mod filename;
/// Per-user request limits
pub mod rate_limit;
/// Streaming download and upload
pub mod transfer;
/// Link unlocking provider client
pub mod unlock;
