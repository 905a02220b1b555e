//! Application configuration.
//!
//! Loaded from a TOML file (`./config/config.toml` unless overridden) and
//! validated into typed settings up front; any problem is a [`ConfigError`]
//! and the binary refuses to start. Passwords may come from the environment:
//! `MAIL_REPLY_SMITH_IMAP_PASSWORD` and `MAIL_REPLY_SMITH_SMTP_PASSWORD` win
//! over the file.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lettre::Address;
use secrecy::SecretString;
use serde::Deserialize;

use crate::channels::imap::{ImapConfig, ProviderQuirk};
use crate::channels::smtp::{SmtpConfig, SmtpSecurity};
use crate::error::ConfigError;
use crate::pipeline::dispatch::RetryPolicy;
use crate::pipeline::processor::ProcessorConfig;
use crate::pipeline::rules::{Action, Filter, RuleField};

pub const DEFAULT_CONFIG_PATH: &str = "./config/config.toml";
pub const IMAP_PASSWORD_ENV: &str = "MAIL_REPLY_SMITH_IMAP_PASSWORD";
pub const SMTP_PASSWORD_ENV: &str = "MAIL_REPLY_SMITH_SMTP_PASSWORD";

/// Fully validated settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub interval: Duration,
    pub keep_unseen_count: NonZeroUsize,
    /// Zero disables escalation.
    pub max_consecutive_fetch_failures: u32,
    pub processor: ProcessorConfig,
    pub retry: RetryPolicy,
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    /// Envelope sender for forwards and replies.
    pub from_address: String,
    pub filters: Vec<Filter>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    pub level: String,
    /// When set, logs also go to a daily rolling file in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

// ── File layout ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    pull_email: RawPullEmail,
    #[serde(default)]
    transport_config: RawTransportConfig,
    #[serde(default)]
    retry: RawRetry,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawPullEmail {
    transport: String,
    select_folder: String,
    fetch_interval_seconds: u64,
    keep_unseen_count: usize,
    fetch_timeout_seconds: u64,
    max_consecutive_fetch_failures: u32,
    force_ack_unmatched: bool,
    unmatched_backlog_limit: Option<usize>,
    max_fetch_per_cycle: Option<usize>,
    max_body_bytes: usize,
}

impl Default for RawPullEmail {
    fn default() -> Self {
        Self {
            transport: "imap".to_string(),
            select_folder: "INBOX".to_string(),
            fetch_interval_seconds: 60,
            keep_unseen_count: 100,
            fetch_timeout_seconds: 30,
            max_consecutive_fetch_failures: 10,
            force_ack_unmatched: true,
            unmatched_backlog_limit: None,
            max_fetch_per_cycle: None,
            max_body_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawTransportConfig {
    imap: Option<RawImap>,
    smtp: Option<RawSmtp>,
}

#[derive(Debug, Deserialize)]
struct RawImap {
    host: String,
    #[serde(default = "default_imap_port")]
    port: u16,
    user: String,
    password: Option<String>,
    quirk: Option<ProviderQuirk>,
    #[serde(default)]
    is_fix_163provider_issue: bool,
}

#[derive(Debug, Deserialize)]
struct RawSmtp {
    host: String,
    /// Defaults to the usual port for `security`.
    port: Option<u16>,
    user: String,
    password: Option<String>,
    #[serde(default)]
    security: SmtpSecurity,
    from_address: Option<String>,
    #[serde(default = "default_send_timeout")]
    send_timeout_seconds: u64,
}

fn default_imap_port() -> u16 {
    993
}

fn default_send_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawRetry {
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    dispatch_ceiling_seconds: u64,
}

impl Default for RawRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            dispatch_ceiling_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawAction {
    Forward,
    Reply,
    MarkRead,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilter {
    name: String,
    #[serde(default, alias = "sender_email_contains")]
    sender_contains: Vec<String>,
    #[serde(default)]
    subject_contains: Vec<String>,
    #[serde(default)]
    body_contains: Vec<String>,
    action: RawAction,
    forward_to: Option<String>,
    reply_template: Option<String>,
}

// ── Loading ─────────────────────────────────────────────────────────

impl AppConfig {
    /// Read and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse TOML text, applying password overrides from the process environment.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::from_toml_str_with(contents, |key| std::env::var(key).ok())
    }

    /// Parse TOML text with a custom environment lookup.
    pub fn from_toml_str_with(
        contents: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        validate(raw, &env)
    }

    /// Settings that load fine but are probably not what the user wants.
    ///
    /// Loading happens before logging is set up, so the caller reports these.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.filters.is_empty() {
            warnings.push("No filters configured; every message will be left unmatched".to_string());
        }
        if self.processor.unmatched_backlog_limit.is_none() && self.imap.fetch_limit != usize::MAX {
            warnings.push(format!(
                "max_fetch_per_cycle = {} with force_ack_unmatched off: once that many unmatched \
                 messages pile up, newer mail is never fetched",
                self.imap.fetch_limit
            ));
        }
        warnings
    }
}

fn validate(raw: RawConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<AppConfig, ConfigError> {
    let pull = raw.pull_email;

    if pull.transport != "imap" {
        return Err(ConfigError::invalid(
            "pull_email.transport",
            format!("unsupported transport {:?}, only \"imap\" is available", pull.transport),
        ));
    }
    if pull.select_folder.trim().is_empty() {
        return Err(ConfigError::invalid("pull_email.select_folder", "must not be empty"));
    }
    if pull.fetch_interval_seconds == 0 {
        return Err(ConfigError::invalid(
            "pull_email.fetch_interval_seconds",
            "must be at least 1",
        ));
    }
    let keep_unseen_count = NonZeroUsize::new(pull.keep_unseen_count).ok_or_else(|| {
        ConfigError::invalid("pull_email.keep_unseen_count", "must be greater than 0")
    })?;
    if pull.fetch_timeout_seconds == 0 {
        return Err(ConfigError::invalid(
            "pull_email.fetch_timeout_seconds",
            "must be at least 1",
        ));
    }
    if pull.max_body_bytes == 0 {
        return Err(ConfigError::invalid("pull_email.max_body_bytes", "must be greater than 0"));
    }
    let fetch_timeout = Duration::from_secs(pull.fetch_timeout_seconds);

    let unmatched_backlog_limit = pull
        .force_ack_unmatched
        .then(|| pull.unmatched_backlog_limit.unwrap_or(keep_unseen_count.get()));
    let fetch_limit = match (pull.max_fetch_per_cycle, unmatched_backlog_limit) {
        (Some(0), _) => {
            return Err(ConfigError::invalid(
                "pull_email.max_fetch_per_cycle",
                "must be at least 1",
            ));
        }
        // A full batch of unmatched mail must leave some to acknowledge,
        // or the listing never moves past it.
        (Some(max), Some(limit)) if max <= limit => {
            return Err(ConfigError::invalid(
                "pull_email.max_fetch_per_cycle",
                format!("must be greater than the unmatched backlog limit ({limit})"),
            ));
        }
        (Some(max), _) => max,
        (None, Some(limit)) => limit.saturating_mul(2).max(1),
        (None, None) => usize::MAX,
    };

    let retry = validate_retry(&raw.retry)?;

    let raw_imap = raw.transport_config.imap.ok_or_else(|| {
        ConfigError::missing("transport_config.imap", "Add a [transport_config.imap] section")
    })?;
    let imap = ImapConfig {
        host: non_empty("transport_config.imap.host", raw_imap.host)?,
        port: raw_imap.port,
        username: non_empty("transport_config.imap.user", raw_imap.user)?,
        password: password(
            "transport_config.imap.password",
            IMAP_PASSWORD_ENV,
            raw_imap.password,
            env,
        )?,
        quirk: match raw_imap.quirk {
            Some(quirk) => quirk,
            None if raw_imap.is_fix_163provider_issue => ProviderQuirk::NeteaseId,
            None => ProviderQuirk::None,
        },
        timeout: fetch_timeout,
        max_body_bytes: pull.max_body_bytes,
        fetch_limit,
    };

    let raw_smtp = raw.transport_config.smtp.ok_or_else(|| {
        ConfigError::missing("transport_config.smtp", "Add a [transport_config.smtp] section")
    })?;
    if raw_smtp.send_timeout_seconds == 0 {
        return Err(ConfigError::invalid(
            "transport_config.smtp.send_timeout_seconds",
            "must be at least 1",
        ));
    }
    let username = non_empty("transport_config.smtp.user", raw_smtp.user)?;
    let from_address = raw_smtp
        .from_address
        .map(|a| a.trim().to_string())
        .unwrap_or_else(|| username.clone());
    check_address("transport_config.smtp.from_address", &from_address)?;
    let smtp = SmtpConfig {
        host: non_empty("transport_config.smtp.host", raw_smtp.host)?,
        port: raw_smtp.port.unwrap_or(raw_smtp.security.default_port()),
        username,
        password: password(
            "transport_config.smtp.password",
            SMTP_PASSWORD_ENV,
            raw_smtp.password,
            env,
        )?,
        security: raw_smtp.security,
        timeout: Duration::from_secs(raw_smtp.send_timeout_seconds),
    };

    let filters = raw
        .filters
        .into_iter()
        .enumerate()
        .map(|(i, f)| validate_filter(i, f))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AppConfig {
        interval: Duration::from_secs(pull.fetch_interval_seconds),
        keep_unseen_count,
        max_consecutive_fetch_failures: pull.max_consecutive_fetch_failures,
        processor: ProcessorConfig {
            folder: pull.select_folder.trim().to_string(),
            fetch_timeout,
            unmatched_backlog_limit,
        },
        retry,
        imap,
        smtp,
        from_address,
        filters,
        logging: raw.logging,
    })
}

fn validate_retry(raw: &RawRetry) -> Result<RetryPolicy, ConfigError> {
    if raw.max_attempts == 0 {
        return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
    }
    if raw.max_backoff_ms < raw.initial_backoff_ms {
        return Err(ConfigError::invalid(
            "retry.max_backoff_ms",
            "must not be smaller than retry.initial_backoff_ms",
        ));
    }
    if raw.dispatch_ceiling_seconds == 0 {
        return Err(ConfigError::invalid(
            "retry.dispatch_ceiling_seconds",
            "must be at least 1",
        ));
    }
    Ok(RetryPolicy {
        max_attempts: raw.max_attempts,
        initial_backoff: Duration::from_millis(raw.initial_backoff_ms),
        max_backoff: Duration::from_millis(raw.max_backoff_ms),
        dispatch_ceiling: Duration::from_secs(raw.dispatch_ceiling_seconds),
    })
}

fn validate_filter(index: usize, raw: RawFilter) -> Result<Filter, ConfigError> {
    let key = |field: &str| format!("filters[{index}].{field}");

    let name = non_empty(&key("name"), raw.name)?;

    let action = match raw.action {
        RawAction::Forward => {
            if raw.reply_template.is_some() {
                return Err(ConfigError::invalid(
                    key("reply_template"),
                    "not allowed on a forward filter",
                ));
            }
            let forward_to = raw
                .forward_to
                .map(|a| a.trim().to_string())
                .ok_or_else(|| ConfigError::missing(key("forward_to"), "Forward filters need a recipient"))?;
            check_address(&key("forward_to"), &forward_to)?;
            Action::Forward { forward_to }
        }
        RawAction::Reply => {
            if raw.forward_to.is_some() {
                return Err(ConfigError::invalid(key("forward_to"), "not allowed on a reply filter"));
            }
            let reply_template = raw
                .reply_template
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| ConfigError::missing(key("reply_template"), "Reply filters need a body template"))?;
            Action::Reply { reply_template }
        }
        RawAction::MarkRead => {
            if raw.forward_to.is_some() {
                return Err(ConfigError::invalid(key("forward_to"), "not allowed on a mark_read filter"));
            }
            if raw.reply_template.is_some() {
                return Err(ConfigError::invalid(
                    key("reply_template"),
                    "not allowed on a mark_read filter",
                ));
            }
            Action::MarkRead
        }
    };

    let mut filter = Filter::new(name, action);
    for (field, label, patterns) in [
        (RuleField::Sender, "sender_contains", raw.sender_contains),
        (RuleField::Subject, "subject_contains", raw.subject_contains),
        (RuleField::Body, "body_contains", raw.body_contains),
    ] {
        if patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::invalid(key(label), "patterns must not be empty"));
        }
        filter = filter.with_patterns(field, patterns);
    }

    if !filter.has_predicates() {
        return Err(ConfigError::invalid(
            key("name"),
            format!(
                "filter {:?} has no sender_contains, subject_contains or body_contains patterns",
                filter.name()
            ),
        ));
    }

    Ok(filter)
}

fn non_empty(key: &str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::invalid(key, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn check_address(key: &str, value: &str) -> Result<(), ConfigError> {
    value
        .parse::<Address>()
        .map(|_| ())
        .map_err(|e| ConfigError::invalid(key, format!("{value:?} is not an email address: {e}")))
}

fn password(
    key: &str,
    env_var: &str,
    from_file: Option<String>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<SecretString, ConfigError> {
    env(env_var)
        .filter(|p| !p.is_empty())
        .or(from_file)
        .map(SecretString::from)
        .ok_or_else(|| ConfigError::missing(key, format!("Set it in the file or via {env_var}")))
}
