// src/config.rs

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry and dial policy for a session.
///
/// The delays are deliberately fixed (no backoff): the session is a
/// long-lived background client, and the broker being down for a while is
/// the expected case, not an exceptional one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Delay between dial attempts after a connection failure.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,

    /// Delay before rebuilding the channel after a channel exception.
    #[serde(default = "default_reinit_delay")]
    pub reinit_delay: Duration,

    /// How long to wait for a publisher confirm before re-sending, and how
    /// long to wait before retrying a failed publish call.
    #[serde(default = "default_resend_delay")]
    pub resend_delay: Duration,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,

    #[serde(default = "default_locale")]
    pub locale: String,
}

// Default values
fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_reinit_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_resend_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_heartbeat_secs() -> u16 {
    30
}
fn default_locale() -> String {
    "en_US".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            reconnect_delay: default_reconnect_delay(),
            reinit_delay: default_reinit_delay(),
            resend_delay: default_resend_delay(),
            heartbeat_secs: default_heartbeat_secs(),
            locale: default_locale(),
        }
    }
}

impl SessionConfig {
    /// Loads the configuration from environment variables (with `.env`
    /// support), falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let mut config = SessionConfig::default();

        if let Ok(val) = env::var("AMQP_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = Duration::from_secs(
                val.parse().context("AMQP_RECONNECT_DELAY_SECS must be an integer")?,
            );
        }
        if let Ok(val) = env::var("AMQP_REINIT_DELAY_SECS") {
            config.reinit_delay = Duration::from_secs(
                val.parse().context("AMQP_REINIT_DELAY_SECS must be an integer")?,
            );
        }
        if let Ok(val) = env::var("AMQP_RESEND_DELAY_SECS") {
            config.resend_delay = Duration::from_secs(
                val.parse().context("AMQP_RESEND_DELAY_SECS must be an integer")?,
            );
        }
        if let Ok(val) = env::var("AMQP_HEARTBEAT_SECS") {
            config.heartbeat_secs =
                val.parse().context("AMQP_HEARTBEAT_SECS must be an integer")?;
        }
        if let Ok(val) = env::var("AMQP_LOCALE") {
            config.locale = val;
        }

        Ok(config)
    }

    /// Loads the configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file at {}", path.display()))?;
        let config: SessionConfig =
            serde_json::from_str(&content).context("Configuration file contains invalid JSON")?;
        Ok(config)
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_reinit_delay(mut self, delay: Duration) -> Self {
        self.reinit_delay = delay;
        self
    }

    pub fn with_resend_delay(mut self, delay: Duration) -> Self {
        self.resend_delay = delay;
        self
    }

    pub fn with_heartbeat(mut self, secs: u16) -> Self {
        self.heartbeat_secs = secs;
        self
    }
}

/// Looks for `amqp-session.json` in the current directory, a `config/`
/// subdirectory, then the user's home directory.
pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", Path::new("amqp-session.json")),
        ("Current directory (alternative)", Path::new("config/amqp-session.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".amqp-session.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!("Could not find amqp-session.json configuration file"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.reinit_delay, Duration::from_secs(2));
        assert_eq!(config.resend_delay, Duration::from_secs(5));
        assert_eq!(config.heartbeat_secs, 30);
        assert_eq!(config.locale, "en_US");
    }

    #[test]
    fn test_config_builders() {
        let config = SessionConfig::default()
            .with_reconnect_delay(Duration::from_millis(100))
            .with_reinit_delay(Duration::from_millis(50))
            .with_resend_delay(Duration::from_millis(200))
            .with_heartbeat(10);

        assert_eq!(config.reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.reinit_delay, Duration::from_millis(50));
        assert_eq!(config.resend_delay, Duration::from_millis(200));
        assert_eq!(config.heartbeat_secs, 10);
    }

    #[test]
    fn test_config_env_overrides() {
        env::set_var("AMQP_RECONNECT_DELAY_SECS", "9");
        env::set_var("AMQP_HEARTBEAT_SECS", "60");

        let config = SessionConfig::from_env().unwrap();
        assert_eq!(config.reconnect_delay, Duration::from_secs(9));
        assert_eq!(config.heartbeat_secs, 60);
        // Untouched values keep their defaults
        assert_eq!(config.reinit_delay, Duration::from_secs(2));

        env::remove_var("AMQP_RECONNECT_DELAY_SECS");
        env::remove_var("AMQP_HEARTBEAT_SECS");
    }

    #[test]
    fn test_config_from_file() {
        let path = env::temp_dir().join("amqp-session-config-test.json");
        fs::write(
            &path,
            r#"{"reconnect_delay": {"secs": 1, "nanos": 0}, "locale": "en_GB"}"#,
        )
        .unwrap();

        let config = SessionConfig::from_file(&path).unwrap();
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.locale, "en_GB");
        assert_eq!(config.resend_delay, Duration::from_secs(5));

        fs::remove_file(&path).ok();
    }
}
