use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::domain::SYSTEM_STATE_CHANNEL_REL;
use tracing::warn;

pub const SETTINGS_FILE: &str = "system-ctl.toml";

/// Pause between subscribing and issuing the stop command. The event channel
/// never acknowledges a subscription, so this is a guess at how long the
/// server needs to register it, not a tuned value.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub settle_delay: Duration,
    pub request_timeout: Duration,
    /// `None` waits for the remote outcome indefinitely.
    pub completion_timeout: Option<Duration>,
    pub channel_relation: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            completion_timeout: None,
            channel_relation: SYSTEM_STATE_CHANNEL_REL.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    settle_delay_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    completion_timeout_secs: Option<u64>,
    channel_relation: Option<String>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the optional TOML file, then environment variables. Both the
/// `SYSTEM_CTL_*` and `APP__*` spellings are honoured; the latter wins.
pub(crate) fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), %err, "ignoring unreadable settings file"),
        }
    }

    if let Some(ms) = env_u64(&env, "SETTLE_DELAY_MS") {
        settings.settle_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = env_u64(&env, "REQUEST_TIMEOUT_SECS") {
        settings.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = env_u64(&env, "COMPLETION_TIMEOUT_SECS") {
        settings.completion_timeout = timeout_from_secs(secs);
    }
    if let Some(relation) = env_value(&env, "CHANNEL_RELATION") {
        settings.channel_relation = relation;
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(ms) = file_cfg.settle_delay_ms {
        settings.settle_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = file_cfg.request_timeout_secs {
        settings.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = file_cfg.completion_timeout_secs {
        settings.completion_timeout = timeout_from_secs(secs);
    }
    if let Some(relation) = file_cfg.channel_relation {
        settings.channel_relation = relation;
    }
}

/// Zero disables the completion timeout.
fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn env_value(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    env(&format!("APP__{key}"))
        .or_else(|| env(&format!("SYSTEM_CTL_{key}")))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = env_value(env, key)?;
    match raw.parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(key, value = %raw, %err, "ignoring non-numeric setting");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
