//! Configuration, loaded from `OUTREACH_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::Channel;
use crate::clients::NewClient;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::pipeline::dispatcher;

/// Default Ollama model for the classifier.
pub const DEFAULT_LLM_MODEL: &str = "qwen2:72b-instruct-q4_0";

/// Upper bounds for the duration settings. Larger values overflow date
/// arithmetic or make a loop sleep forever.
const MAX_POLL_INTERVAL_SECS: u64 = 86_400;
const MAX_CLASSIFY_TIMEOUT_SECS: u64 = 3_600;
const MAX_CLAIM_LEASE_SECS: u64 = 7 * 86_400;
const MAX_DEFAULT_TIMEOUT_DAYS: u64 = dispatcher::MAX_DEFAULT_TIMEOUT_DAYS as u64;
const MAX_REMINDER_INTERVAL_HOURS: u64 = 87_600;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OutreachConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// Bound on a single classification call.
    pub classify_timeout: Duration,
    /// Age after which an open inbound claim is put back on the queue.
    pub claim_lease: Duration,
    /// Channels this process drains.
    pub channels: Vec<Channel>,
    /// Run the first-contact loop in this process.
    pub initiation: bool,
    /// Run the timeout sweep in this process.
    pub timeout_sweep: bool,
    pub attachments_dir: PathBuf,
    /// Reference of the standard presentation inside `attachments_dir`.
    pub presentation: String,
    pub sender_name: String,
    pub demo_link: Option<String>,
    /// Deadline used when a requested date cannot be parsed.
    pub default_timeout: chrono::Duration,
    /// Minimum spacing between two reminders to one client.
    pub reminder_interval: chrono::Duration,
    /// Products for chat clients created by `/start`. `None` disables it.
    pub self_registration: Option<Vec<String>>,
    pub llm: LlmConfig,
    /// Directory for daily rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl OutreachConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let channels = match get("OUTREACH_CHANNELS") {
            Some(raw) => parse_channels(&raw)?,
            None => Channel::ALL.to_vec(),
        };

        let self_registration = if parse_or(&get, "OUTREACH_CHAT_SELF_REGISTER", false)? {
            let products = NewClient::parse_products(
                &get("OUTREACH_DEFAULT_PRODUCTS").unwrap_or_else(|| "general".to_string()),
            );
            if products.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "OUTREACH_DEFAULT_PRODUCTS".into(),
                    message: "at least one product is required".into(),
                });
            }
            Some(products)
        } else {
            None
        };

        let backend: LlmBackend = parse_or(&get, "OUTREACH_LLM_BACKEND", LlmBackend::Ollama)?;
        let api_key = get("OUTREACH_LLM_API_KEY").map(SecretString::from);
        if backend == LlmBackend::OpenAi && api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "OUTREACH_LLM_API_KEY".into(),
                hint: "The openai backend needs an API key.".into(),
            });
        }
        let llm = LlmConfig {
            backend,
            model: get("OUTREACH_LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            base_url: get("OUTREACH_LLM_BASE_URL"),
            api_key,
        };

        let classify_timeout = Duration::from_secs(bounded(
            &get,
            "OUTREACH_CLASSIFY_TIMEOUT_SECS",
            60,
            MAX_CLASSIFY_TIMEOUT_SECS,
        )?);
        let claim_lease = Duration::from_secs(bounded(
            &get,
            "OUTREACH_CLAIM_LEASE_SECS",
            300,
            MAX_CLAIM_LEASE_SECS,
        )?);
        if claim_lease <= classify_timeout {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_CLAIM_LEASE_SECS".into(),
                message: "must be longer than OUTREACH_CLASSIFY_TIMEOUT_SECS".into(),
            });
        }

        Ok(Self {
            db_path: get("OUTREACH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/outreach.db")),
            poll_interval: Duration::from_secs(bounded(
                &get,
                "OUTREACH_POLL_INTERVAL_SECS",
                5,
                MAX_POLL_INTERVAL_SECS,
            )?),
            classify_timeout,
            claim_lease,
            channels,
            initiation: parse_or(&get, "OUTREACH_INITIATION", true)?,
            timeout_sweep: parse_or(&get, "OUTREACH_TIMEOUT_SWEEP", true)?,
            attachments_dir: get("OUTREACH_ATTACHMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./attachments")),
            presentation: get("OUTREACH_PRESENTATION")
                .unwrap_or_else(|| "presentation.pdf".to_string()),
            sender_name: get("OUTREACH_SENDER_NAME").unwrap_or_else(|| "Sales Team".to_string()),
            demo_link: get("OUTREACH_DEMO_LINK"),
            default_timeout: chrono::Duration::days(bounded(
                &get,
                "OUTREACH_DEFAULT_TIMEOUT_DAYS",
                90,
                MAX_DEFAULT_TIMEOUT_DAYS,
            )? as i64),
            reminder_interval: chrono::Duration::hours(bounded(
                &get,
                "OUTREACH_REMINDER_INTERVAL_HOURS",
                24,
                MAX_REMINDER_INTERVAL_HOURS,
            )? as i64),
            self_registration,
            llm,
            log_dir: get("OUTREACH_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

/// Parse a count in `1..=max`.
fn bounded<G>(get: &G, key: &str, default: u64, max: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(get, key, default)?;
    if value == 0 || value > max {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be between 1 and {max}, got {value}"),
        });
    }
    Ok(value)
}

fn parse_channels(raw: &str) -> Result<Vec<Channel>, ConfigError> {
    let mut channels = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let channel: Channel = parse_value("OUTREACH_CHANNELS", part)?;
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    if channels.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "OUTREACH_CHANNELS".into(),
            message: "no channel given".into(),
        });
    }
    Ok(channels)
}
