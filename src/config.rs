//! Configuration loading: `config.json` on disk plus secrets from the
//! environment, merged once at startup.
//!
//! Two-phase load: the file first, then the required environment secrets;
//! a missing secret is fatal. The two fields the chat command handler can
//! mutate at runtime (`stagnation_alert_enabled`, `stagnation_threshold_minutes`)
//! are split out into [`SharedConfig`], which uses atomics instead of a
//! mutex so the supervisor tick never blocks on the chat task.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
struct RawConfig {
    containers: Vec<String>,
    check_interval_seconds: u64,
    tail_lines: usize,
    grace_period_seconds: u64,
    stagnation_alert_enabled: bool,
    stagnation_threshold_minutes: u64,
    reputation_check_enabled: bool,
    #[serde(default)]
    reputation_api_base_url: String,
    #[serde(default = "default_reputation_window")]
    reputation_check_window: usize,
    #[serde(default = "default_reputation_threshold")]
    reputation_failure_threshold: usize,
    #[serde(default = "default_reputation_cooldown")]
    reputation_restart_cooldown_minutes: u64,
    #[serde(default)]
    node_addresses: HashMap<String, String>,
}

fn default_reputation_window() -> usize {
    20
}

fn default_reputation_threshold() -> usize {
    5
}

fn default_reputation_cooldown() -> u64 {
    30
}

/// Secrets pulled from the environment. Opaque to the rest of the system —
/// only the notifier and the driver connection string consume them.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub rpc_url: String,
}

/// Static configuration, read once and never mutated after startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub containers: IndexSet<String>,
    pub check_interval_seconds: u64,
    pub tail_lines: usize,
    pub grace_period_seconds: u64,
    pub reputation_check_enabled: bool,
    pub reputation_api_base_url: String,
    pub reputation_check_window: usize,
    pub reputation_failure_threshold: usize,
    pub reputation_restart_cooldown_minutes: u64,
    pub node_addresses: HashMap<String, String>,
    pub secrets: Secrets,
}

/// The two fields the command handler can change at runtime. Reads and
/// writes both go through relaxed atomics: each field is independently
/// consistent and the supervisor only ever needs a snapshot taken once per
/// tick, so there is no cross-field invariant to protect with a mutex.
#[derive(Debug)]
pub struct SharedConfig {
    stagnation_alert_enabled: AtomicBool,
    stagnation_threshold_minutes: AtomicU64,
}

impl SharedConfig {
    pub fn new(enabled: bool, threshold_minutes: u64) -> Arc<Self> {
        Arc::new(Self {
            stagnation_alert_enabled: AtomicBool::new(enabled),
            stagnation_threshold_minutes: AtomicU64::new(threshold_minutes),
        })
    }

    pub fn stagnation_alert_enabled(&self) -> bool {
        self.stagnation_alert_enabled.load(Ordering::Relaxed)
    }

    pub fn set_stagnation_alert_enabled(&self, enabled: bool) {
        self.stagnation_alert_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn stagnation_threshold_minutes(&self) -> u64 {
        self.stagnation_threshold_minutes.load(Ordering::Relaxed)
    }

    pub fn set_stagnation_threshold_minutes(&self, minutes: u64) {
        self.stagnation_threshold_minutes.store(minutes, Ordering::Relaxed);
    }
}

/// Loads `config.json` from `path`, then merges in required secrets from
/// the environment. Any failure here is fatal at startup.
pub fn load_and_validate(path: &Path) -> Result<(AppConfig, Arc<SharedConfig>), ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Malformed(path.display().to_string(), e.to_string()))?;
    let raw: RawConfig = serde_json::from_str(&text)
        .map_err(|e| ConfigError::Malformed(path.display().to_string(), e.to_string()))?;

    let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
    let telegram_chat_id = std::env::var("TELEGRAM_CHAT_ID").ok();
    let rpc_url = std::env::var("RPC_URL").ok();

    let mut missing = Vec::new();
    if telegram_bot_token.is_none() {
        missing.push("TELEGRAM_BOT_TOKEN");
    }
    if telegram_chat_id.is_none() {
        missing.push("TELEGRAM_CHAT_ID");
    }
    if rpc_url.is_none() {
        missing.push("RPC_URL");
    }
    if !missing.is_empty() {
        return Err(ConfigError::MissingSecrets(missing.join(", ")));
    }

    let shared = SharedConfig::new(raw.stagnation_alert_enabled, raw.stagnation_threshold_minutes);

    let config = AppConfig {
        containers: raw.containers.into_iter().collect(),
        check_interval_seconds: raw.check_interval_seconds,
        tail_lines: raw.tail_lines,
        grace_period_seconds: raw.grace_period_seconds,
        reputation_check_enabled: raw.reputation_check_enabled,
        reputation_api_base_url: raw.reputation_api_base_url,
        reputation_check_window: raw.reputation_check_window,
        reputation_failure_threshold: raw.reputation_failure_threshold,
        reputation_restart_cooldown_minutes: raw.reputation_restart_cooldown_minutes,
        node_addresses: raw.node_addresses,
        secrets: Secrets {
            telegram_bot_token,
            telegram_chat_id,
            rpc_url: rpc_url.unwrap(),
        },
    };

    Ok((config, shared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load_and_validate(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn malformed_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "{not json");
        let err = load_and_validate(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_, _)));
    }

    #[test]
    fn shared_config_roundtrip() {
        let shared = SharedConfig::new(true, 30);
        assert!(shared.stagnation_alert_enabled());
        assert_eq!(shared.stagnation_threshold_minutes(), 30);
        shared.set_stagnation_alert_enabled(false);
        shared.set_stagnation_threshold_minutes(5);
        assert!(!shared.stagnation_alert_enabled());
        assert_eq!(shared.stagnation_threshold_minutes(), 5);
    }
}
