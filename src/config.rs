use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::attachments::DEFAULT_MAX_BYTES;
use crate::dispatcher::DEFAULT_POLL_INTERVAL;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub server_addr: String,
    pub attachment_dir: String,
    pub attachment_base_url: String,
    pub attachment_max_bytes: u64,
    pub unread_poll_interval: Duration,
    pub delivery_buffer: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; missing keys fall back to
    /// defaults, malformed numbers are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let delivery_buffer: usize = number(&lookup, "DELIVERY_BUFFER", 100)?;
        anyhow::ensure!(delivery_buffer > 0, "DELIVERY_BUFFER must be at least 1");
        let poll_secs = number(&lookup, "UNREAD_POLL_SECS", DEFAULT_POLL_INTERVAL.as_secs())?;
        anyhow::ensure!(poll_secs > 0, "UNREAD_POLL_SECS must be at least 1");
        Ok(Config {
            database_url: text("DATABASE_URL", "./chat.db"),
            server_addr: text("SERVER_ADDR", "127.0.0.1:8080"),
            attachment_dir: text("ATTACHMENT_DIR", "./attachments"),
            attachment_base_url: text("ATTACHMENT_BASE_URL", "http://127.0.0.1:8080/files"),
            attachment_max_bytes: number(&lookup, "ATTACHMENT_MAX_BYTES", DEFAULT_MAX_BYTES)?,
            unread_poll_interval: Duration::from_secs(poll_secs),
            delivery_buffer,
        })
    }
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.database_url, "./chat.db");
        assert_eq!(config.server_addr, "127.0.0.1:8080");
        assert_eq!(config.attachment_max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.unread_poll_interval, Duration::from_secs(30));
        assert_eq!(config.delivery_buffer, 100);
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let vars: HashMap<&str, &str> =
            [("UNREAD_POLL_SECS", "5"), ("DATABASE_URL", ":memory:")].into();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.unread_poll_interval, Duration::from_secs(5));
        assert_eq!(config.database_url, ":memory:");

        let err = Config::from_lookup(|k| (k == "DELIVERY_BUFFER").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("DELIVERY_BUFFER"));

        let err = Config::from_lookup(|k| (k == "UNREAD_POLL_SECS").then(|| "0".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("UNREAD_POLL_SECS"));
    }
}
