use chrono::{TimeDelta, Utc};
use debrid_relay::bot::handlers::setup_handler;
use debrid_relay::config::Settings;
use debrid_relay::dispatcher::CommandDispatcher;
use debrid_relay::rate_limit::{spawn_reset_task, RateLimiter};
use dotenvy::dotenv;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    token1: Regex,
    token2: Regex,
    token3: Regex,
    api_key: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token1: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token2: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token3: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            api_key: Regex::new(r"(apikey=)[^\s&]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let output = self.token1.replace_all(input, "$1[TELEGRAM_TOKEN]$3");
        let output = self.token2.replace_all(&output, "[TELEGRAM_TOKEN]");
        let output = self.token3.replace_all(&output, "$1[TELEGRAM_TOKEN]");
        self.api_key
            .replace_all(&output, "${1}[MASKED]")
            .into_owned()
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // The caller's buffer was consumed in full even if the redacted
        // text has a different length.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Redaction must be in place before the first log line
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting debrid relay bot...");

    let settings = init_settings();
    let groups = settings.authorized_groups();
    if groups.is_empty() {
        warn!("No authorized groups configured, every command will be redirected");
    }
    info!(
        groups = groups.len(),
        blocked = settings.blocked_users().len(),
        download_dir = %settings.download_dir,
        "Access lists loaded"
    );

    let limiter = Arc::new(RateLimiter::new(settings.max_requests_per_window));
    let shutdown = CancellationToken::new();
    let reset_task = spawn_reset_task(limiter.clone(), settings.reset_period(), shutdown.clone());
    log_reset_schedule(&settings);

    let dispatcher = match CommandDispatcher::from_settings(&settings, limiter) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!("Failed to initialize command pipeline: {e:#}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(settings.telegram_token.clone());

    info!("Bot is running...");

    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![dispatcher])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    shutdown.cancel();
    if let Err(e) = reset_task.await {
        warn!("Rate limit reset task ended abnormally: {e}");
    }
    info!("Bot stopped.");

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Settings {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn log_reset_schedule(settings: &Settings) {
    let next_reset = TimeDelta::from_std(settings.reset_period())
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta));
    match next_reset {
        Some(at) => info!(
            max_requests = settings.max_requests_per_window,
            "Rate limit table resets every {}s, next at {}",
            settings.rate_limit_reset_secs,
            at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => info!(
            max_requests = settings.max_requests_per_window,
            "Rate limit table resets every {}s", settings.rate_limit_reset_secs
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_bot_token_in_url() {
        let patterns = RedactionPatterns::new().expect("patterns compile");
        let line = "GET https://api.telegram.org/bot123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw1/getMe";
        let redacted = patterns.redact(line);
        assert!(!redacted.contains("AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw1"));
        assert!(redacted.contains("[TELEGRAM_TOKEN]"));
    }

    #[test]
    fn test_redacts_api_key_query() {
        let patterns = RedactionPatterns::new().expect("patterns compile");
        let line = "GET /v4/link/unlock?apikey=s3cr3t&agent=TelegramBot&link=x";
        assert_eq!(
            patterns.redact(line),
            "GET /v4/link/unlock?apikey=[MASKED]&agent=TelegramBot&link=x"
        );
    }

    #[test]
    fn test_plain_text_untouched() {
        let patterns = RedactionPatterns::new().expect("patterns compile");
        assert_eq!(patterns.redact("Upload completed"), "Upload completed");
    }

    #[test]
    fn test_writer_reports_full_length() {
        let patterns = Arc::new(RedactionPatterns::new().expect("patterns compile"));
        let mut writer = RedactingWriter::new(Vec::new(), patterns);
        let input = b"apikey=abcdef done";
        assert_eq!(writer.write(input).expect("write"), input.len());
        assert_eq!(
            String::from_utf8(writer.inner).expect("utf8"),
            "apikey=[MASKED] done"
        );
    }
}
