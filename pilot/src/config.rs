use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

/// Max WebSocket frame/message size accepted on the device channel.
pub const MAX_FRAME_SIZE: usize = 1 << 23;
/// Idle bound on the device channel; no event within this window closes it.
pub const PING_TIMEOUT: Duration = Duration::from_secs(3600);
/// Upper bound for `PILOT_ACK_TIMEOUT_SECS` and `PILOT_ACTION_TIMEOUT_SECS`.
pub const MAX_ACTION_TIMEOUT: Duration = Duration::from_secs(24 * 3600);
/// Upper bound for `OPERATOR_TIMEOUT_MINUTES` (one week).
pub const MAX_OPERATOR_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;
/// Default bound for a single HTTP request to the allocation API or operator queue.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// `start + timeout`, saturating far in the future instead of overflowing.
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse env var {key}={value}: {reason}")]
    Parse {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Agent manager base, e.g. `wss://host/action`
    pub agent_manager_url: String,
    /// Device allocation API base
    pub clerk_api_url: String,
    pub clerk_api_key: Option<String>,
    /// Operator issue queue base
    pub operator_queue_url: String,
    pub operator_queue_token: Option<String>,
    /// Escalate exhausted steps to a human operator.
    pub use_operator: bool,
    pub operator_timeout_minutes: u64,
    pub ack_timeout: Duration,
    pub action_timeout: Duration,
    pub oracle: OracleSettings,
    pub recovery_max_turns: usize,
    /// Messages resent to the recovery model per turn after the seed; 0 keeps all.
    pub recovery_history_window: usize,
    pub loading_recheck: Duration,
    /// Treat classifier ids missing from the registry as `Expected`.
    pub unmatched_state_as_expected: bool,
}

#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub base_url: String,
    pub model: String,
    pub recovery_model: String,
    /// Name of the env var holding the API key; read per call.
    pub api_key_env: String,
    pub max_tokens: u32,
    pub use_ocr: bool,
}

impl Config {
    /// Load `.env` (cwd or any ancestor) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_env_file();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let model = env.str("PILOT_ORACLE_MODEL", "gpt-4o");

        let config = Self {
            agent_manager_url: env.str("AGENT_MANAGER_URL", "wss://agent-manager.local/action"),
            clerk_api_url: env.str("CLERK_API_URL", "http://localhost:8000"),
            clerk_api_key: env.opt("CLERK_API_KEY"),
            operator_queue_url: env.str("OPERATOR_QUEUE_URL", "http://localhost:1488"),
            operator_queue_token: env.opt("OPERATOR_QUEUE_API_TOKEN"),
            use_operator: env.flag("USE_OPERATOR", false)?,
            operator_timeout_minutes: env.parse("OPERATOR_TIMEOUT_MINUTES", 60)?,
            ack_timeout: Duration::from_secs(env.parse("PILOT_ACK_TIMEOUT_SECS", 10)?),
            action_timeout: Duration::from_secs(env.parse("PILOT_ACTION_TIMEOUT_SECS", 90)?),
            oracle: OracleSettings {
                base_url: env.str("PILOT_ORACLE_BASE_URL", "https://api.openai.com/v1"),
                recovery_model: env.str("PILOT_RECOVERY_MODEL", &model),
                model,
                api_key_env: env.str("PILOT_ORACLE_API_KEY_ENV", "OPENAI_API_KEY"),
                max_tokens: env.parse("PILOT_ORACLE_MAX_TOKENS", 2000)?,
                use_ocr: env.flag("PILOT_ORACLE_USE_OCR", false)?,
            },
            recovery_max_turns: env.parse("PILOT_RECOVERY_MAX_TURNS", 5)?,
            recovery_history_window: env.parse("PILOT_RECOVERY_HISTORY_WINDOW", 12)?,
            loading_recheck: Duration::from_secs(env.parse("PILOT_LOADING_RECHECK_SECS", 5)?),
            unmatched_state_as_expected: env.flag("PILOT_UNMATCHED_STATE_AS_EXPECTED", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "PILOT_ACK_TIMEOUT_SECS",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.action_timeout > MAX_ACTION_TIMEOUT {
            return Err(ConfigError::Invalid {
                key: "PILOT_ACTION_TIMEOUT_SECS",
                reason: format!("must not exceed {} seconds", MAX_ACTION_TIMEOUT.as_secs()),
            });
        }
        if self.operator_timeout_minutes > MAX_OPERATOR_TIMEOUT_MINUTES {
            return Err(ConfigError::Invalid {
                key: "OPERATOR_TIMEOUT_MINUTES",
                reason: format!("must not exceed {MAX_OPERATOR_TIMEOUT_MINUTES} minutes"),
            });
        }
        if self.action_timeout < self.ack_timeout {
            return Err(ConfigError::Invalid {
                key: "PILOT_ACTION_TIMEOUT_SECS",
                reason: "must not be shorter than the ack timeout".to_string(),
            });
        }
        if !self.agent_manager_url.starts_with("ws://")
            && !self.agent_manager_url.starts_with("wss://")
        {
            return Err(ConfigError::Invalid {
                key: "AGENT_MANAGER_URL",
                reason: format!("expected ws:// or wss:// URL, got {}", self.agent_manager_url),
            });
        }
        if self.oracle.max_tokens == 0 {
            return Err(ConfigError::Invalid {
                key: "PILOT_ORACLE_MAX_TOKENS",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn operator_timeout(&self) -> Duration {
        Duration::from_secs(self.operator_timeout_minutes.saturating_mul(60))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_manager_url: "wss://agent-manager.local/action".to_string(),
            clerk_api_url: "http://localhost:8000".to_string(),
            clerk_api_key: None,
            operator_queue_url: "http://localhost:1488".to_string(),
            operator_queue_token: None,
            use_operator: false,
            operator_timeout_minutes: 60,
            ack_timeout: Duration::from_secs(10),
            action_timeout: Duration::from_secs(90),
            oracle: OracleSettings {
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o".to_string(),
                recovery_model: "gpt-4o".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                max_tokens: 2000,
                use_ocr: false,
            },
            recovery_max_turns: 5,
            recovery_history_window: 12,
            loading_recheck: Duration::from_secs(5),
            unmatched_state_as_expected: false,
        }
    }
}

/// Search cwd and its ancestors for a `.env` file and load the first one found.
fn load_env_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let path = cwd
        .ancestors()
        .map(|dir| dir.join(".env"))
        .find(|candidate| Path::new(candidate).is_file())?;
    dotenvy::from_path(&path).ok()?;
    Some(path)
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn opt(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn str(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.opt(key) {
            Some(val) => val.trim().parse::<T>().map_err(|e| ConfigError::Parse {
                key: key.to_string(),
                value: val.clone(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(val) = self.opt(key) else {
            return Ok(default);
        };
        match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Parse {
                key: key.to_string(),
                value: val,
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}
