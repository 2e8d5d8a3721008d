//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::tasks::model::TaskType;

/// Shared credential for the task API.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: SecretString,
}

/// Coordinator (bridge server) configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// HTTP/WS listen port.
    pub port: u16,
    /// libSQL database file.
    pub db_path: PathBuf,
    pub auth: AuthConfig,
    pub supervisor: SupervisorConfig,
}

impl BridgeConfig {
    /// Read from `BRIDGE_*` and `REDEEM_ALL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = parse_or(&get, "BRIDGE_PORT", 5091)?;
        let db_path = get("BRIDGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/bridge.db"));

        Ok(Self {
            port,
            db_path,
            auth: auth_from(&get)?,
            supervisor: SupervisorConfig::from_lookup(&get)?,
        })
    }
}

/// Redeem-all supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Tick period.
    pub interval: Duration,
    /// Base address of the surface that starts a task; the task type is appended as a query.
    pub entry_url: String,
    /// Which task type the supervisor keeps fed.
    pub task_type: TaskType,
    /// Command that opens or focuses the execution surface. `None` disables launching.
    pub browser_cmd: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            entry_url: "https://getmybonus.ca".to_string(),
            task_type: TaskType::GetmybonusAnycard,
            browser_cmd: None,
        }
    }
}

impl SupervisorConfig {
    fn from_lookup(get: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let interval_secs: u64 = parse_or(get, "REDEEM_ALL_INTERVAL_SECS", 5)?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REDEEM_ALL_INTERVAL_SECS".into(),
                message: "must be at least 1".into(),
            });
        }
        let task_type = match non_blank(get, "REDEEM_ALL_TASK_TYPE") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "REDEEM_ALL_TASK_TYPE".into(),
                message: format!("{e}"),
            })?,
            None => defaults.task_type,
        };

        Ok(Self {
            interval: Duration::from_secs(interval_secs),
            entry_url: non_blank(get, "REDEEM_ALL_ENTRY_URL").unwrap_or(defaults.entry_url),
            task_type,
            browser_cmd: non_blank(get, "REDEEM_ALL_BROWSER_CMD"),
        })
    }
}

/// How long a step may wait for a condition, and how often it looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Per-step wait budgets used by the workflows.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicies {
    /// Save button after entering the serial.
    pub save_button: WaitPolicy,
    /// Next button, gated on a human solving a captcha.
    pub captcha: WaitPolicy,
    /// Email inputs after Next.
    pub email_inputs: WaitPolicy,
    /// "Show & Email Code" button.
    pub show_code: WaitPolicy,
    /// Load-card form controls.
    pub load_form: WaitPolicy,
}

impl Default for WaitPolicies {
    fn default() -> Self {
        Self {
            save_button: WaitPolicy::new(Duration::from_secs(20), Duration::from_millis(300)),
            captcha: WaitPolicy::new(Duration::from_secs(600), Duration::from_secs(1)),
            email_inputs: WaitPolicy::new(Duration::from_secs(60), Duration::from_millis(500)),
            show_code: WaitPolicy::new(Duration::from_secs(600), Duration::from_secs(1)),
            load_form: WaitPolicy::new(Duration::from_secs(20), Duration::from_millis(300)),
        }
    }
}

impl WaitPolicies {
    /// Every wait uses the same budget.
    pub fn uniform(policy: WaitPolicy) -> Self {
        Self {
            save_button: policy,
            captcha: policy,
            email_inputs: policy,
            show_code: policy,
            load_form: policy,
        }
    }
}

/// Agent (executor) configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Where the bridge server listens.
    pub bridge_url: String,
    pub auth: AuthConfig,
    /// Address typed into the bonus claim form.
    pub email: Option<String>,
    /// Directory holding per-scope resumption files.
    pub resume_dir: PathBuf,
    /// Poll period for balance verification.
    pub verify_interval: Duration,
    pub waits: WaitPolicies,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let verify_secs: u64 = parse_or(&get, "AGENT_VERIFY_INTERVAL_SECS", 2)?;
        Ok(Self {
            bridge_url: non_blank(&get, "BRIDGE_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:5091".to_string()),
            auth: auth_from(&get)?,
            email: non_blank(&get, "AGENT_EMAIL"),
            resume_dir: non_blank(&get, "AGENT_RESUME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/resume")),
            verify_interval: Duration::from_secs(verify_secs.max(1)),
            waits: WaitPolicies::default(),
        })
    }
}

fn auth_from(get: &impl Fn(&str) -> Option<String>) -> Result<AuthConfig, ConfigError> {
    let username = non_blank(get, "BRIDGE_AUTH_USERNAME").unwrap_or_else(|| "admin".to_string());
    let password = non_blank(get, "BRIDGE_AUTH_PASSWORD")
        .ok_or_else(|| ConfigError::MissingEnvVar("BRIDGE_AUTH_PASSWORD".into()))?;
    Ok(AuthConfig {
        username,
        password: SecretString::from(password),
    })
}

fn non_blank(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match non_blank(get, key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
