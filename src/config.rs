use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::dedup::StopPolicy;
use crate::error::Error;
use crate::scheduler::SchedulerSettings;

pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";
pub const MAX_PAGE_SIZE: u32 = 50;
pub const MAX_SKEW_SECS: u64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Polling {
    pub sweep_interval_secs: u64,
    pub history_interval_secs: u64,
    pub live_interval_secs: u64,
    pub watermark_skew_secs: u64,
    pub page_size: u32,
    pub request_timeout_secs: u64,
    pub clear_signature_on_stop: bool,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            history_interval_secs: 300,
            live_interval_secs: 15,
            watermark_skew_secs: 300,
            page_size: MAX_PAGE_SIZE,
            request_timeout_secs: 10,
            clear_signature_on_stop: false,
        }
    }
}

impl Polling {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn watermark_skew(&self) -> TimeDelta {
        TimeDelta::seconds(self.watermark_skew_secs.min(MAX_SKEW_SECS) as i64)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            history_interval: Duration::from_secs(self.history_interval_secs),
            live_interval: Duration::from_secs(self.live_interval_secs),
            request_timeout: self.request_timeout(),
            watermark_skew: self.watermark_skew(),
            page_size: self.page_size,
            stop_policy: if self.clear_signature_on_stop {
                StopPolicy::Clear
            } else {
                StopPolicy::Keep
            },
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub polling: Polling,
}

fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URI.to_string()
}

fn config_dir() -> PathBuf {
    let fallback = PathBuf::from(".config/turntable");
    dirs::home_dir().map_or(fallback, |home| home.join(".config/turntable"))
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Token caches live next to the config file they belong to.
pub fn token_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map_or_else(config_dir, Path::to_path_buf)
        .join("tokens")
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading config at {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing config at {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating config directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(config).context("Failed serializing config to JSON")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing config at {}", path.display()))?;
    Ok(())
}

pub fn validate(config: &Config) -> std::result::Result<(), Error> {
    let polling = &config.polling;
    for (name, value) in [
        ("sweep_interval_secs", polling.sweep_interval_secs),
        ("history_interval_secs", polling.history_interval_secs),
        ("live_interval_secs", polling.live_interval_secs),
        ("request_timeout_secs", polling.request_timeout_secs),
    ] {
        if value == 0 {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
    }
    if !(1..=MAX_PAGE_SIZE).contains(&polling.page_size) {
        return Err(Error::Config(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
            polling.page_size
        )));
    }
    if polling.watermark_skew_secs > MAX_SKEW_SECS {
        return Err(Error::Config(format!(
            "watermark_skew_secs must be at most {MAX_SKEW_SECS}"
        )));
    }

    let mut seen = HashSet::new();
    for account in &config.accounts {
        if account.username.trim().is_empty() {
            return Err(Error::Config("account with empty username".to_string()));
        }
        if account.client_id.trim().is_empty() || account.client_secret.trim().is_empty() {
            return Err(Error::Config(format!(
                "account {} is missing its client credentials",
                account.username
            )));
        }
        if !seen.insert(account.username.as_str()) {
            return Err(Error::Config(format!(
                "account {} is configured twice",
                account.username
            )));
        }
    }
    Ok(())
}

pub fn add_account(config: &mut Config, account: Account) {
    if let Some(existing) = config
        .accounts
        .iter_mut()
        .find(|existing| existing.username == account.username)
    {
        *existing = account;
        return;
    }
    config.accounts.push(account);
}

pub fn remove_account(config: &mut Config, username: &str) -> bool {
    let original_len = config.accounts.len();
    config
        .accounts
        .retain(|account| account.username != username);
    config.accounts.len() != original_len
}

pub fn iter_accounts<'a>(
    config: &'a Config,
    username: Option<&str>,
) -> impl Iterator<Item = &'a Account> {
    config
        .accounts
        .iter()
        .filter(move |account| username.is_none_or(|name| name == account.username))
}

pub fn find_account<'a>(config: &'a Config, username: &str) -> Option<&'a Account> {
    iter_accounts(config, Some(username)).next()
}
