//! Configuration for the webhook bridge.
//!
//! Everything is read from environment-style keys. Startup is fail-fast: a
//! missing required key or a malformed value aborts with a [`ConfigError`]
//! instead of running half-configured.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::rate_limit::RateLimitConfig;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;
/// Default webhook route.
pub const DEFAULT_WEBHOOK_PATH: &str = "/webhook/linear";
/// Default bound on the outbound agent call.
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 120;
/// Default request body cap (1 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

const REQUIRED_KEYS: [&str; 3] = [
    "LANGSMITH_API_KEY",
    "LANGSMITH_API_URL",
    "LANGSMITH_AGENT_ID",
];

/// Configuration errors surfaced at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more required keys are unset or empty
    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    /// A key is set but its value cannot be used
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// How the agent run is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Stream run events and concatenate the model's content chunks.
    #[default]
    Stream,
    /// Create the run and block until the final state is returned.
    Wait,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "streaming" => Ok(Self::Stream),
            "wait" | "sync" => Ok(Self::Wait),
            other => Err(format!("expected 'stream' or 'wait', got '{other}'")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{other}'")),
        }
    }
}

/// Connection settings for the remote agent service.
#[derive(Clone)]
pub struct AgentConfig {
    /// API key, sent as `x-api-key`.
    pub api_key: String,
    /// Base URL of the agent server (no trailing slash).
    pub api_url: String,
    /// Assistant to run.
    pub agent_id: String,
    /// Bound on every outbound call.
    pub timeout: Duration,
    /// Wait or stream.
    pub run_mode: RunMode,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("agent_id", &self.agent_id)
            .field("timeout", &self.timeout)
            .field("run_mode", &self.run_mode)
            .finish()
    }
}

/// Bridge configuration.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,
    /// Route the webhook receiver is mounted on.
    pub webhook_path: String,
    /// Deployment environment name (reported by the health check).
    pub environment: String,
    /// Log verbosity (`tracing` filter directive).
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Remote agent settings.
    pub agent: AgentConfig,
    /// Linear webhook signing secret. Signature checks are skipped when unset.
    pub signing_secret: Option<String>,
    /// Shared `?token=` value. Token checks are skipped when unset.
    pub webhook_token: Option<String>,
    /// Event types to act upon. `None` accepts every type.
    pub event_filter: Option<Vec<String>>,
    /// Rate limiter thresholds.
    pub rate_limit: RateLimitConfig,
    /// Key the limiter on the first `X-Forwarded-For` hop instead of the peer address.
    pub trust_forwarded_for: bool,
    /// Maximum accepted request body size.
    pub max_body_bytes: usize,
    /// Maximum accepted `webhookTimestamp` age. `None` disables the check.
    pub max_timestamp_age_ms: Option<i64>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let missing: Vec<&'static str> = REQUIRED_KEYS
            .into_iter()
            .filter(|key| get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let api_url = get("LANGSMITH_API_URL").unwrap_or_default();
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: "LANGSMITH_API_URL",
                reason: "must start with http:// or https://".to_string(),
            });
        }

        let timeout_secs: u64 = parse_or(&get, "AGENT_TIMEOUT_SECS", DEFAULT_AGENT_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "AGENT_TIMEOUT_SECS",
                reason: "timeout must be greater than zero".to_string(),
            });
        }

        let agent = AgentConfig {
            api_key: get("LANGSMITH_API_KEY").unwrap_or_default(),
            api_url: api_url.trim_end_matches('/').to_string(),
            agent_id: get("LANGSMITH_AGENT_ID").unwrap_or_default(),
            timeout: Duration::from_secs(timeout_secs),
            run_mode: parse_or(&get, "AGENT_RUN_MODE", RunMode::default())?,
        };

        let rate_limit = RateLimitConfig {
            requests_per_minute: parse_or(&get, "RATE_LIMIT_PER_MINUTE", 50)?,
            requests_per_hour: parse_or(&get, "RATE_LIMIT_PER_HOUR", 100)?,
            ..RateLimitConfig::default()
        };
        rate_limit.validate().map_err(|e| ConfigError::Invalid {
            key: if rate_limit.requests_per_minute == 0 {
                "RATE_LIMIT_PER_MINUTE"
            } else {
                "RATE_LIMIT_PER_HOUR"
            },
            reason: e.to_string(),
        })?;

        let webhook_path = get("WEBHOOK_PATH").unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_string());
        if !webhook_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "WEBHOOK_PATH",
                reason: "must start with '/'".to_string(),
            });
        }

        let max_timestamp_age_ms = get("LINEAR_MAX_TIMESTAMP_AGE_MS")
            .map(|raw| {
                raw.parse::<i64>()
                    .ok()
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| ConfigError::Invalid {
                        key: "LINEAR_MAX_TIMESTAMP_AGE_MS",
                        reason: format!("expected a positive number of milliseconds, got '{raw}'"),
                    })
            })
            .transpose()?;

        Ok(Self {
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            webhook_path,
            environment: get("ENVIRONMENT").unwrap_or_else(|| "production".to_string()),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: parse_or(&get, "LOG_FORMAT", LogFormat::default())?,
            agent,
            signing_secret: get("LINEAR_SIGNING_SECRET"),
            webhook_token: get("WEBHOOK_SECRET_TOKEN"),
            event_filter: get("LINEAR_EVENT_FILTER").map(|raw| parse_list(&raw)),
            rate_limit,
            trust_forwarded_for: parse_bool(&get, "TRUST_FORWARDED_FOR")?,
            max_body_bytes: parse_or(&get, "MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
            max_timestamp_age_ms,
        })
    }

    /// Insecure settings worth a warning at startup.
    #[must_use]
    pub fn startup_warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        match (&self.signing_secret, self.max_timestamp_age_ms) {
            (None, _) => warnings
                .push("LINEAR_SIGNING_SECRET not set - webhook signatures will not be verified"),
            (Some(_), None) => warnings.push(
                "LINEAR_MAX_TIMESTAMP_AGE_MS not set - replayed deliveries will not be rejected",
            ),
            (Some(_), Some(_)) => {}
        }
        warnings
    }

    /// Check an event type against the allow-list.
    #[must_use]
    pub fn is_event_allowed(&self, event_type: &str) -> bool {
        self.event_filter
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|t| t == event_type))
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("'{raw}': {e}"),
        }),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<bool, ConfigError> {
    match get(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("false" | "0" | "no") => Ok(false),
        Some("true" | "1" | "yes") => Ok(true),
        Some(other) => Err(ConfigError::Invalid {
            key,
            reason: format!("expected true or false, got '{other}'"),
        }),
    }
}
