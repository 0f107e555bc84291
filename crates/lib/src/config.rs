//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.hrchat/config.json`) and environment.
//! Every field has a default, so an empty `{}` file (or no file at all) is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// History backend connection.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Speech input and avatar output toggles.
    #[serde(default)]
    pub speech: SpeechConfig,
}

/// Where the history backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL of the backend (default "http://127.0.0.1:50505").
    /// Overridden by HRCHAT_BASE_URL env.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Seconds allowed for establishing a connection (default 10).
    /// Response bodies are not time-bounded.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Speech-to-text and avatar toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    /// Speak each final answer through the avatar.
    #[serde(default)]
    pub avatar_enabled: bool,

    /// Re-arm speech recognition after each spoken (or, without avatar, completed) answer.
    #[serde(default)]
    pub speech_to_speech: bool,
}

fn default_base_url() -> String {
    "http://127.0.0.1:50505".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Resolve the backend URL: env HRCHAT_BASE_URL overrides config.
pub fn resolve_base_url(config: &Config) -> String {
    std::env::var("HRCHAT_BASE_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.backend.base_url.trim().to_string())
}

/// True when the backend host is the local loopback. Identity checks are skipped there.
pub fn is_loopback_url(url: &str) -> bool {
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split(['/', '?'])
        .next()
        .unwrap_or("");
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.split(']').next())
        .unwrap_or_else(|| host.rsplit_once(':').map_or(host, |(h, _)| h));
    host == "127.0.0.1" || host == "::1" || host == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HRCHAT_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".hrchat").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
