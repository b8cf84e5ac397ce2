//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub influx: InfluxConfig,
    pub push: PushConfig,
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Prefix for absolute image URLs handed to clients.
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub relay_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            public_url: "http://localhost:8080".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:garden.db?mode=rwc".to_string(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            org: "garden".to_string(),
            bucket: "garden".to_string(),
            token: String::new(),
            timeout_secs: 5,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:8090/push".to_string(),
            timeout_secs: 5,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl InfluxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PushConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Shortest alert evaluation period accepted.
const MIN_ALERT_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.server.bind.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind '{}' is not a socket address",
                self.server.bind
            ));
        }
        check_http_url("server.public_url", &self.server.public_url, &mut errors);

        if self.database.url.trim().is_empty() {
            errors.push("database.url is empty".to_string());
        }

        check_http_url("influx.url", &self.influx.url, &mut errors);
        if self.influx.org.trim().is_empty() {
            errors.push("influx.org is empty".to_string());
        }
        if self.influx.bucket.trim().is_empty() {
            errors.push("influx.bucket is empty".to_string());
        }
        if self.influx.timeout_secs == 0 {
            errors.push("influx.timeout_secs must be positive".to_string());
        }

        check_http_url("push.relay_url", &self.push.relay_url, &mut errors);
        if self.push.timeout_secs == 0 {
            errors.push("push.timeout_secs must be positive".to_string());
        }

        if self.alerts.enabled && self.alerts.interval_secs < MIN_ALERT_INTERVAL_SECS {
            errors.push(format!(
                "alerts.interval_secs must be at least {MIN_ALERT_INTERVAL_SECS}, got {}",
                self.alerts.interval_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Environment variables win over the file.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let targets: [(&str, &mut String); 8] = [
            ("WEB_BIND", &mut self.server.bind),
            ("PUBLIC_URL", &mut self.server.public_url),
            ("DB_URL", &mut self.database.url),
            ("INFLUX_URL", &mut self.influx.url),
            ("INFLUX_ORG", &mut self.influx.org),
            ("INFLUX_BUCKET", &mut self.influx.bucket),
            ("INFLUX_TOKEN", &mut self.influx.token),
            ("PUSH_RELAY_URL", &mut self.push.relay_url),
        ];
        for (name, slot) in targets {
            if let Some(value) = var(name) {
                *slot = value;
            }
        }
    }
}

fn check_http_url(key: &str, value: &str, errors: &mut Vec<String>) {
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        errors.push(format!("{key} '{value}' must be an http(s) URL"));
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read the TOML file at `path` (defaults when it doesn't exist), apply
/// environment overrides and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };

    config.apply_env(|name| std::env::var(name).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
