//! Configuration loading and management (spec §6 "CLI / Env").
//!
//! Loads settings from `./config.toml` (or `$BONUSLAYER_CONFIG_PATH`).
//! Environment variables override file values; file values override
//! defaults. Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration loaded from TOML plus env overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database connection settings.
    pub database: DatabaseConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Optional Redis settings for the (external) rate limiter collaborator.
    pub redis: RedisConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config file path using a custom env resolver (for testing).
    fn config_path(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        match env("BONUSLAYER_CONFIG_PATH") {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("config.toml"),
        }
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var`).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("DB_URL") {
            self.database.url = v;
        }
        if let Some(v) = env("LOG_LEVEL") {
            self.logging.log_level = v;
        }
        if let Some(v) = env("ENABLE_CONSOLE_LOGS") {
            self.logging.enable_console_logs = matches!(v.as_str(), "1" | "true" | "TRUE");
        }
        if let Some(v) = env("REDIS_URL") {
            self.redis.url = Some(v);
        }
        if let Some(v) = env("NEXT_PUBLIC_APP_URL") {
            self.server.public_app_url = v;
        }
        if let Some(v) = env("PORT") {
            match v.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(var = "PORT", value = %v, "ignoring invalid env override"),
            }
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// `true` when the configured public app URL points at a local host,
    /// which selects [`crate::bot::DeliveryMode::Polling`] for every bot
    /// (spec §6, "`NEXT_PUBLIC_APP_URL` ... localhost|127.0.0.1 => PollingMode").
    pub fn prefers_polling(&self) -> bool {
        let url = self.server.public_app_url.to_lowercase();
        url.contains("localhost") || url.contains("127.0.0.1") || url.is_empty()
    }
}

/// Database connection settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
    /// Max pool connections.
    pub max_connections: u32,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"__REDACTED__")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/bonuslayer".to_string(),
            max_connections: 10,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind port for the webhook ingress / broadcast API.
    pub port: u16,
    /// Public base URL, used to select webhook vs. polling bot delivery
    /// and to build referral links.
    pub public_app_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            public_app_url: "http://localhost:3000".to_string(),
        }
    }
}

/// Logging settings (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` env-filter directive, e.g. `"info"` or `"debug"`.
    pub log_level: String,
    /// Whether to also emit human-readable logs to the console.
    pub enable_console_logs: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_console_logs: true,
        }
    }
}

/// Redis settings for the rate-limiter collaborator (out of scope, spec §1;
/// this crate only records whether Redis is configured).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL, if the rate limiter should use Redis instead
    /// of an in-process limiter.
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.redis.url.is_none());
        assert!(config.prefers_polling());
    }

    #[test]
    fn env_overrides_win_over_file() {
        let toml_str = r#"
[database]
url = "postgres://file/db"

[logging]
log_level = "warn"
"#;
        let mut config = Config::from_toml(toml_str).unwrap();
        let env = |key: &str| -> Option<String> {
            match key {
                "DB_URL" => Some("postgres://env/db".to_string()),
                _ => None,
            }
        };
        config.apply_overrides(env);
        assert_eq!(config.database.url, "postgres://env/db");
        // Untouched by env, file value kept.
        assert_eq!(config.logging.log_level, "warn");
    }

    #[test]
    fn public_app_url_selects_polling_for_production_host() {
        let mut config = Config::default();
        config.server.public_app_url = "https://shop.example.com".to_string();
        assert!(!config.prefers_polling());
    }

    #[test]
    fn redis_url_env_is_recorded_but_unused() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "REDIS_URL" => Some("redis://cache:6379".to_string()),
            _ => None,
        });
        assert_eq!(config.redis.url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn config_path_defaults_to_cwd() {
        let path = Config::config_path(|_| None);
        assert_eq!(path, PathBuf::from("config.toml"));
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(Config::from_toml("not [ valid").is_err());
    }
}
