//! Schoolbell configuration system.
//!
//! Loaded from TOML (`~/.schoolbell/config.toml` by default), then provider
//! credentials are overridden from the environment so secrets never have to
//! live in the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SchoolbellError};
use crate::types::{Channel, NotificationCategory};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchoolbellConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub in_app: InAppConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Extra or replacement categories on top of the built-in catalog.
    #[serde(default)]
    pub categories: Vec<NotificationCategory>,
}

impl SchoolbellConfig {
    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::read_file(&path)?
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env();
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchoolbellError::Config(format!("Failed to read config: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| SchoolbellError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SchoolbellError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override credentials and paths from `SCHOOLBELL_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env`](Self::apply_env) with an injectable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SCHOOLBELL_DB_PATH") {
            self.database.path = v;
        }
        if let Some(v) = get("SCHOOLBELL_SMS_URL") {
            self.sms.gateway_url = v;
        }
        if let Some(v) = get("SCHOOLBELL_SMS_TOKEN") {
            self.sms.api_token = v;
        }
        if let Some(v) = get("SCHOOLBELL_SMS_SENDER_ID") {
            self.sms.sender_id = v;
        }
        if let Some(v) = get("SCHOOLBELL_EMAIL_API_KEY") {
            self.email.api_key = v;
        }
        if let Some(v) = get("SCHOOLBELL_EMAIL_USERNAME") {
            self.email.username = v;
        }
        if let Some(v) = get("SCHOOLBELL_EMAIL_FROM") {
            self.email.from_address = v;
        }
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Schoolbell home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".schoolbell")
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits on a locked database before failing.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> String { "~/.schoolbell/schoolbell.db".into() }
fn default_busy_timeout() -> u64 { 5000 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent event workers per run.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per provider call.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Daily ceiling per channel name (`sms`, `email`, `in_app`).
    /// A channel without an entry is unlimited.
    #[serde(default = "default_rate_limits")]
    pub rate_limits: BTreeMap<String, u32>,
    /// Channel preference order, first is tried first.
    #[serde(default = "default_channel_order")]
    pub channel_order: Vec<Channel>,
}

fn default_workers() -> usize { 8 }
fn default_send_timeout() -> u64 { 15 }
fn default_rate_limits() -> BTreeMap<String, u32> {
    BTreeMap::from([("sms".to_string(), 3)])
}
fn default_channel_order() -> Vec<Channel> {
    vec![Channel::InApp, Channel::Sms, Channel::Email]
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            send_timeout_secs: default_send_timeout(),
            rate_limits: default_rate_limits(),
            channel_order: default_channel_order(),
        }
    }
}

impl DispatchConfig {
    /// Parsed per-channel ceilings. Unknown channel names are rejected.
    pub fn ceilings(&self) -> Result<BTreeMap<Channel, u32>> {
        self.rate_limits
            .iter()
            .map(|(name, limit)| Ok((name.parse::<Channel>()?, *limit)))
            .collect()
    }
}

/// SMS gateway (HTTP JSON API with bearer token).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub gateway_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_sender_id")]
    pub sender_id: String,
}

fn default_sender_id() -> String { "SCHOOL".into() }

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway_url: String::new(),
            api_token: String::new(),
            sender_id: default_sender_id(),
        }
    }
}

impl SmsConfig {
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.gateway_url.trim().is_empty() && !self.api_token.trim().is_empty()
    }
}

/// Email transport (SMTP relay authenticated with an API key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// SMTP login; many transactional providers use a fixed name like "apikey".
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_port() -> u16 { 587 }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            api_key: String::new(),
            from_address: String::new(),
            display_name: None,
        }
    }
}

impl EmailConfig {
    pub fn is_configured(&self) -> bool {
        self.enabled
            && !self.smtp_host.trim().is_empty()
            && !self.api_key.trim().is_empty()
            && !self.from_address.trim().is_empty()
    }
}

/// In-app inbox (backed by the Schoolbell database).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InAppConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

impl Default for InAppConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn bool_true() -> bool { true }
