use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_BASE_URL;

const DEFAULT_ENV_PREFIX: &str = "FEEDSYNC";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub mention: MentionConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub auth_token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
            auth_token: String::new(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("feedsync/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,
    #[serde(default = "default_evict_after", with = "humantime_serde")]
    pub evict_after: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            stale_after: default_stale_after(),
            evict_after: default_evict_after(),
        }
    }
}

fn default_page_size() -> usize {
    10
}

fn default_stale_after() -> Duration {
    Duration::from_secs(30)
}

fn default_evict_after() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MentionConfig {
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for MentionConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            max_candidates: default_max_candidates(),
        }
    }
}

fn default_debounce() -> Duration {
    Duration::from_millis(300)
}

fn default_max_candidates() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

/// Tuning injected into the engine and controllers at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub page_size: usize,
    pub stale_after: Duration,
    pub evict_after: Duration,
    pub debounce: Duration,
    pub max_candidates: usize,
    pub workers: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Config::default().sync_options()
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.page_size > 0, "config: feed.page_size must be positive");
        anyhow::ensure!(
            self.max_candidates > 0,
            "config: mention.max_candidates must be positive"
        );
        anyhow::ensure!(self.workers > 0, "config: runtime.workers must be positive");
        anyhow::ensure!(
            self.stale_after <= self.evict_after,
            "config: feed.stale_after ({}) must not exceed feed.evict_after ({})",
            humantime::format_duration(self.stale_after),
            humantime::format_duration(self.evict_after)
        );
        Ok(())
    }
}

impl Config {
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            page_size: self.feed.page_size,
            stale_after: self.feed.stale_after,
            evict_after: self.feed.evict_after,
            debounce: self.mention.debounce,
            max_candidates: self.mention.max_candidates,
            workers: self.runtime.workers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.gateway.base_url.trim().is_empty(),
            "config: gateway.base_url is required"
        );
        self.sync_options().validate()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            cfg = read_config_file(path)?;
        }
    } else if let Some(default_path) = default_path() {
        if default_path.exists() {
            cfg = read_config_file(&default_path)?;
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    cfg.validate()?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(cfg, &normalized, value);
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "gateway.base_url" => cfg.gateway.base_url = value,
        "gateway.user_agent" => cfg.gateway.user_agent = value,
        "gateway.auth_token" => cfg.gateway.auth_token = value,
        "gateway.timeout" => set_duration(&mut cfg.gateway.timeout, &value),
        "feed.page_size" => set_number(&mut cfg.feed.page_size, &value),
        "feed.stale_after" => set_duration(&mut cfg.feed.stale_after, &value),
        "feed.evict_after" => set_duration(&mut cfg.feed.evict_after, &value),
        "mention.debounce" => set_duration(&mut cfg.mention.debounce, &value),
        "mention.max_candidates" => set_number(&mut cfg.mention.max_candidates, &value),
        "runtime.workers" => set_number(&mut cfg.runtime.workers, &value),
        _ => {}
    }
}

fn set_duration(slot: &mut Duration, value: &str) {
    if let Ok(duration) = humantime::parse_duration(value.trim()) {
        *slot = duration;
    }
}

fn set_number(slot: &mut usize, value: &str) {
    if let Ok(parsed) = value.trim().parse::<usize>() {
        *slot = parsed;
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("feedsync").join("config.yaml"))
}
