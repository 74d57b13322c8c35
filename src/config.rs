use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Scribe";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "scribe=debug,scribe_lib=debug"
    } else {
        "scribe=info,scribe_lib=info"
    }
}

/// Get the application data directory (~/Scribe/ unless overridden).
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_NAME))
}

// ═══════════════════════════════════════════
// Execution mode
// ═══════════════════════════════════════════

/// Which inference strategy the structurer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    /// Deterministic synthetic generator, no external call.
    Mock,
    /// Remote chat-completion API.
    Cloud,
    /// Self-hosted inference sidecar.
    Local,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "MOCK",
            Self::Cloud => "CLOUD",
            Self::Local => "LOCAL",
        }
    }

    /// Lowercase form used in counter names.
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MOCK" => Ok(Self::Mock),
            "CLOUD" => Ok(Self::Cloud),
            "LOCAL" => Ok(Self::Local),
            _ => Err(ConfigError::InvalidValue {
                key: "AI_MODE".into(),
                value: s.into(),
            }),
        }
    }
}

/// Remote chat-completion provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudProvider {
    Groq,
    OpenAi,
}

impl CloudProvider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::OpenAi => "https://api.openai.com/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Groq => "llama-3.3-70b-versatile",
            Self::OpenAi => "gpt-4o-mini",
        }
    }

    /// Environment key holding this provider's API key.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            Self::Groq => "GROQ_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Cannot determine data directory; set SCRIBE_DATA_DIR")]
    NoDataDir,
}

// ═══════════════════════════════════════════
// Config sections
// ═══════════════════════════════════════════

/// Default result cache TTL: one hour.
pub const DEFAULT_CACHE_TTL_MS: u64 = 3_600_000;

/// Default local sidecar timeout: CPU-bound inference can take minutes.
pub const DEFAULT_LOCAL_TIMEOUT_MS: u64 = 300_000;

/// Default cloud API timeout.
pub const DEFAULT_CLOUD_TIMEOUT_MS: u64 = 30_000;

/// Default semaphore lock TTL.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 120;

/// Default semaphore acquisition budget.
pub const DEFAULT_LOCK_MAX_WAIT_MS: u64 = 60_000;

/// Default semaphore polling interval.
pub const DEFAULT_LOCK_POLL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CloudBackendConfig {
    pub provider: CloudProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub key: String,
    pub permits: usize,
    pub ttl: Duration,
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key: "lock:gpu".into(),
            permits: 1,
            ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            max_wait: Duration::from_millis(DEFAULT_LOCK_MAX_WAIT_MS),
            poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
        }
    }
}

/// Full runtime configuration, read once at start-up.
#[derive(Debug, Clone)]
pub struct ScribeConfig {
    pub mode: ExecutionMode,
    pub cache: CacheConfig,
    /// LOCAL mode goes through the async job worker.
    pub use_job_queue: bool,
    pub local: LocalBackendConfig,
    pub cloud: CloudBackendConfig,
    pub lock: LockConfig,
    pub redis_url: Option<String>,
    pub data_dir: PathBuf,
}

impl ScribeConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mode = match get("AI_MODE") {
            Some(v) => v.parse()?,
            None => ExecutionMode::Mock,
        };

        let provider = match get("CLOUD_PROVIDER").map(|v| v.to_ascii_lowercase()) {
            None => CloudProvider::Groq,
            Some(v) if v == "groq" => CloudProvider::Groq,
            Some(v) if v == "openai" => CloudProvider::OpenAi,
            Some(v) => {
                return Err(ConfigError::InvalidValue {
                    key: "CLOUD_PROVIDER".into(),
                    value: v,
                })
            }
        };

        let data_dir = match get("SCRIBE_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => app_data_dir().ok_or(ConfigError::NoDataDir)?,
        };

        Ok(Self {
            mode,
            cache: CacheConfig {
                enabled: parse_bool(&get, "ENABLE_AI_CACHE", true)?,
                ttl: Duration::from_millis(parse_u64(&get, "AI_CACHE_TTL_MS", DEFAULT_CACHE_TTL_MS)?),
            },
            use_job_queue: parse_bool(&get, "USE_JOB_QUEUE", true)?,
            local: LocalBackendConfig {
                base_url: get("AI_CORTEX_URL").unwrap_or_else(|| "http://localhost:8000".into()),
                timeout: Duration::from_millis(parse_u64(
                    &get,
                    "AI_CORTEX_TIMEOUT_MS",
                    DEFAULT_LOCAL_TIMEOUT_MS,
                )?),
            },
            cloud: CloudBackendConfig {
                provider,
                api_key: get(provider.api_key_var()),
                base_url: get("CLOUD_BASE_URL")
                    .unwrap_or_else(|| provider.default_base_url().into()),
                model: get("CLOUD_MODEL").unwrap_or_else(|| provider.default_model().into()),
                timeout: Duration::from_millis(parse_u64(
                    &get,
                    "CLOUD_TIMEOUT_MS",
                    DEFAULT_CLOUD_TIMEOUT_MS,
                )?),
            },
            lock: LockConfig {
                key: get("GPU_LOCK_KEY").unwrap_or_else(|| "lock:gpu".into()),
                permits: parse_u64(&get, "GPU_LOCK_PERMITS", 1)?.max(1) as usize,
                ttl: Duration::from_secs(parse_u64(
                    &get,
                    "GPU_LOCK_TTL_SECONDS",
                    DEFAULT_LOCK_TTL_SECS,
                )?),
                max_wait: Duration::from_millis(parse_u64(
                    &get,
                    "GPU_LOCK_MAX_WAIT_MS",
                    DEFAULT_LOCK_MAX_WAIT_MS,
                )?),
                poll_interval: Duration::from_millis(parse_u64(
                    &get,
                    "GPU_LOCK_POLL_MS",
                    DEFAULT_LOCK_POLL_MS,
                )?),
            },
            redis_url: get("REDIS_URL"),
            data_dir,
        })
    }

    /// Relational store file (drafts, semantic nodes).
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("scribe.db")
    }

    /// Graph projection store file.
    pub fn graph_path(&self) -> PathBuf {
        self.data_dir.join("graph.db")
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.into(),
                value: v,
            }),
        },
    }
}

fn parse_u64<G>(get: &G, key: &str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.into(),
            value: v,
        }),
    }
}
