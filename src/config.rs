//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines the
//! fixed limits of the relay.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Size of the read/write chunks used by both transfers (150 KiB).
pub const TRANSFER_CHUNK_SIZE: usize = 153_600;

/// Hard cap on the declared size of an unlocked file (8 GiB).
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 8_589_934_592;

/// Successful requests allowed per user between two global resets.
pub const DEFAULT_MAX_REQUESTS_PER_WINDOW: u32 = 2;

/// Period of the global rate-limit reset (24 hours).
pub const DEFAULT_RATE_LIMIT_RESET_SECS: u64 = 86_400;

/// Total timeout applied to every HTTP request (24 hours, large transfers).
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 86_400;

/// Telegram API retry: initial backoff
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Telegram API retry: max backoff
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;
/// Telegram API retry: attempts
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Unlocking provider API key
    pub api_key: String,

    /// Chat ids of the groups the bot answers in
    #[serde(rename = "authorized_group_ids")]
    pub authorized_group_ids_str: Option<String>,

    /// User ids or usernames that may not use the bot
    #[serde(rename = "blocked_users")]
    pub blocked_users_str: Option<String>,

    /// Base URL of the unlocking provider
    #[serde(default = "default_unlock_api_url")]
    pub unlock_api_url: String,
    /// Agent name reported to the unlocking provider
    #[serde(default = "default_unlock_agent")]
    pub unlock_agent: String,

    /// Base URL of the file host API (server selection)
    #[serde(default = "default_filehost_api_url")]
    pub filehost_api_url: String,
    /// Upload endpoint template, `{server}` is replaced with the selected server
    #[serde(default = "default_filehost_upload_url")]
    pub filehost_upload_url: String,

    /// Directory downloaded files are staged in
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Successful requests per user between resets
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: u32,
    /// Seconds between global rate-limit resets
    #[serde(default = "default_reset_secs")]
    pub rate_limit_reset_secs: u64,
    /// Largest accepted declared file size
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Total timeout of each HTTP request
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Invite link shown to users writing from outside the group
    #[serde(default = "default_group_invite_link")]
    pub group_invite_link: String,
    /// Signature block appended to the result and help messages
    #[serde(default = "default_signature")]
    pub signature: String,
}

fn default_unlock_api_url() -> String {
    "https://api.alldebrid.com".to_string()
}

fn default_unlock_agent() -> String {
    "TelegramBot".to_string()
}

fn default_filehost_api_url() -> String {
    "https://api.gofile.io".to_string()
}

fn default_filehost_upload_url() -> String {
    "https://{server}.gofile.io/uploadFile".to_string()
}

fn default_download_dir() -> String {
    "files".to_string()
}

const fn default_max_requests() -> u32 {
    DEFAULT_MAX_REQUESTS_PER_WINDOW
}

const fn default_reset_secs() -> u64 {
    DEFAULT_RATE_LIMIT_RESET_SECS
}

const fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE_BYTES
}

const fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_group_invite_link() -> String {
    "https://t.me/+4m_yZcXqi901Mzc5".to_string()
}

fn default_signature() -> String {
    "Relayed by debrid-relay".to_string()
}

/// Builds the layered configuration source.
///
/// # Errors
///
/// Returns a `ConfigError` if a present config file cannot be parsed.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Local overrides, not checked in
        .add_source(File::with_name("config/local").required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Plain UPPER_SNAKE_CASE variables, empty ones treated as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

fn parse_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.into_iter().flat_map(|s| {
        s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
    })
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a required key is missing.
    pub fn new() -> Result<Self, ConfigError> {
        build_config()?.try_deserialize()
    }

    /// Returns the set of group chat ids the bot accepts commands in
    #[must_use]
    pub fn authorized_groups(&self) -> HashSet<i64> {
        parse_list(self.authorized_group_ids_str.as_deref())
            .filter_map(|id| id.parse::<i64>().ok())
            .collect()
    }

    /// Returns the block list
    #[must_use]
    pub fn blocked_users(&self) -> BlockList {
        BlockList::parse(self.blocked_users_str.as_deref().unwrap_or_default())
    }

    /// Period of the global rate-limit reset
    #[must_use]
    pub const fn reset_period(&self) -> Duration {
        Duration::from_secs(self.rate_limit_reset_secs)
    }

    /// Total timeout for HTTP requests
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Users barred from the bot, by numeric id or by username.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
    ids: HashSet<i64>,
    usernames: HashSet<String>,
}

impl BlockList {
    /// Parses a comma, semicolon or whitespace separated list. Numeric entries
    /// are user ids, everything else is a username (leading `@` optional).
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut list = Self::default();
        for token in parse_list(Some(raw)) {
            if let Ok(id) = token.parse::<i64>() {
                list.ids.insert(id);
            } else {
                list.usernames
                    .insert(token.trim_start_matches('@').to_lowercase());
            }
        }
        list
    }

    /// True if the user matches by id or (case-insensitively) by username.
    #[must_use]
    pub fn contains(&self, user_id: i64, username: Option<&str>) -> bool {
        self.ids.contains(&user_id)
            || username.is_some_and(|name| {
                self.usernames
                    .contains(&name.trim_start_matches('@').to_lowercase())
            })
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len() + self.usernames.len()
    }

    /// True when nobody is blocked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
