use std::{net::SocketAddr, str::FromStr};

use chrono::{Duration, NaiveTime};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

/// Upper bound for every token and code lifetime (ten years).
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;
/// Upper bound for the soft-deleted session retention window.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key,
            reason: reason.into(),
        }
    }
}

fn ttl(key: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::invalid(key, "must be greater than zero"));
    }
    if secs > MAX_TTL_SECS {
        return Err(ConfigError::invalid(
            key,
            format!("must not exceed {MAX_TTL_SECS} seconds"),
        ));
    }
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| ConfigError::invalid(key, "out of range"))
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Strict,
    Lax,
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

/// Token secrets and lifetimes. Missing secrets are replaced by ephemeral
/// random ones at start-up.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub access_token_secret: Option<String>,
    pub access_token_ttl_secs: u64,
    pub refresh_token_secret: Option<String>,
    pub refresh_token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_secret: None,
            access_token_ttl_secs: 600,
            refresh_token_secret: None,
            refresh_token_ttl_secs: 14 * 24 * 60 * 60,
        }
    }
}

impl AuthConfig {
    pub fn access_ttl(&self) -> Result<Duration, ConfigError> {
        ttl("auth.access_token_ttl_secs", self.access_token_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Result<Duration, ConfigError> {
        ttl("auth.refresh_token_ttl_secs", self.refresh_token_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CookieConfig {
    pub name: String,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: SameSite,
    /// Defaults to the refresh token lifetime.
    pub max_age_secs: Option<u64>,
    pub path: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "refreshToken".to_string(),
            http_only: true,
            secure: true,
            same_site: SameSite::Strict,
            max_age_secs: None,
            path: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub retention_days: u32,
    /// Daily run time in UTC, `HH:MM`.
    pub run_at: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            run_at: "03:00".to_string(),
        }
    }
}

impl CleanupConfig {
    pub fn retention(&self) -> Result<Duration, ConfigError> {
        if self.retention_days == 0 {
            return Err(ConfigError::invalid(
                "cleanup.retention_days",
                "must be at least one day",
            ));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::invalid(
                "cleanup.retention_days",
                format!("must not exceed {MAX_RETENTION_DAYS} days"),
            ));
        }
        Duration::try_days(i64::from(self.retention_days))
            .ok_or_else(|| ConfigError::invalid("cleanup.retention_days", "out of range"))
    }

    pub fn run_at_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.run_at.trim(), "%H:%M")
            .map_err(|err| ConfigError::invalid("cleanup.run_at", err.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccountConfig {
    pub confirmation_ttl_secs: u64,
    pub recovery_ttl_secs: u64,
}

impl AccountConfig {
    pub fn confirmation_ttl(&self) -> Result<Duration, ConfigError> {
        ttl("accounts.confirmation_ttl_secs", self.confirmation_ttl_secs)
    }

    pub fn recovery_ttl(&self) -> Result<Duration, ConfigError> {
        ttl("accounts.recovery_ttl_secs", self.recovery_ttl_secs)
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            confirmation_ttl_secs: 3600,
            recovery_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    /// Take the client IP from `x-forwarded-for`. Only enable behind a
    /// reverse proxy that overwrites the header.
    pub trust_forwarded_for: bool,
    pub metrics: MetricsConfig,
    pub auth: AuthConfig,
    pub cookie: CookieConfig,
    pub cleanup: CleanupConfig,
    pub accounts: AccountConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            trust_forwarded_for: false,
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            cookie: CookieConfig::default(),
            cleanup: CleanupConfig::default(),
            accounts: AccountConfig::default(),
        }
    }
}

/// Values supplied on the command line; they win over files and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub database_url: Option<String>,
    pub access_token_secret: Option<String>,
    pub refresh_token_secret: Option<String>,
    pub cleanup_retention_days: Option<u32>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "QUILLHUB_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?
            .set_default(
                "auth.access_token_ttl_secs",
                defaults.auth.access_token_ttl_secs as i64,
            )?
            .set_default(
                "auth.refresh_token_ttl_secs",
                defaults.auth.refresh_token_ttl_secs as i64,
            )?
            .set_default(
                "cleanup.retention_days",
                defaults.cleanup.retention_days as i64,
            )?
            .set_default("cleanup.run_at", defaults.cleanup.run_at.clone())?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Names of `QUILLHUB_SERVER__*` variables present in the environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();
        keys.sort();
        keys
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(secret) = &overrides.access_token_secret {
            self.auth.access_token_secret = Some(secret.clone());
        }
        if let Some(secret) = &overrides.refresh_token_secret {
            self.auth.refresh_token_secret = Some(secret.clone());
        }
        if let Some(days) = overrides.cleanup_retention_days {
            self.cleanup.retention_days = days;
        }
        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Cookie `Max-Age` in seconds.
    pub fn cookie_max_age_secs(&self) -> u64 {
        self.cookie
            .max_age_secs
            .unwrap_or(self.auth.refresh_token_ttl_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        self.auth.access_ttl()?;
        self.auth.refresh_ttl()?;
        self.accounts.confirmation_ttl()?;
        self.accounts.recovery_ttl()?;
        if let (Some(access), Some(refresh)) = (
            &self.auth.access_token_secret,
            &self.auth.refresh_token_secret,
        ) {
            if access == refresh {
                return Err(ConfigError::invalid(
                    "auth.refresh_token_secret",
                    "must differ from the access token secret",
                ));
            }
        }
        self.cleanup.retention()?;
        self.cleanup.run_at_time()?;
        if self.cookie.name.trim().is_empty() {
            return Err(ConfigError::invalid("cookie.name", "must not be empty"));
        }
        if self.cookie.same_site == SameSite::None && !self.cookie.secure {
            return Err(ConfigError::invalid(
                "cookie.same_site",
                "SameSite=None requires a secure cookie",
            ));
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}

impl SameSite {
    /// Attribute value as written into `Set-Cookie`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl FromStr for SameSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            other => Err(format!("unsupported same_site value '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for SameSite {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        SameSite::from_str(&value).map_err(D::Error::custom)
    }
}
