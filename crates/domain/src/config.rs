//! Server configuration — loaded from `parley.toml`, every field defaulted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path. `:memory:` is accepted for throwaway runs.
    pub db_path: PathBuf,
    /// Maximum serialized event payload size in bytes.
    pub max_payload_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/parley.db"),
            max_payload_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    /// Empty disables the built-in provider (hosted agents then require an
    /// injected reasoner, as in tests).
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub default_model: String,
    pub temperature: f32,
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: "PARLEY_LLM_API_KEY".into(),
            default_model: "gpt-4o-mini".into(),
            temperature: 0.7,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded backoff for transient provider failures inside one turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub sweep_interval_secs: u64,
    /// A conversation is stalled when its last event is older than this.
    pub stall_after_secs: u64,
    /// Fresh conversations younger than this are never swept.
    pub min_age_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 30,
            stall_after_secs: 600,
            min_age_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Hard cap on reasoner steps within a single turn.
    pub max_steps_per_turn: u32,
    /// Deadline hint stamped on guidance events.
    pub guidance_deadline_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_steps_per_turn: 16,
            guidance_deadline_ms: 30_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top level
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub watchdog: WatchdogConfig,
    pub host: HostConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Sanity-check the resolved configuration.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let err = |message: String| ConfigIssue {
            severity: ConfigSeverity::Error,
            message,
        };
        let warn = |message: String| ConfigIssue {
            severity: ConfigSeverity::Warning,
            message,
        };

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            issues.push(err(format!(
                "server.bind '{}' is not a valid socket address",
                self.server.bind
            )));
        }
        if self.storage.max_payload_bytes == 0 {
            issues.push(err("storage.max_payload_bytes must be positive".into()));
        }
        if self.llm.base_url.is_empty() {
            issues.push(warn(
                "llm.base_url is empty — hosted agents will not be able to generate text".into(),
            ));
        }
        if self.llm.retry.max_attempts == 0 {
            issues.push(err("llm.retry.max_attempts must be at least 1".into()));
        }
        if self.watchdog.enabled && self.watchdog.stall_after_secs < self.watchdog.min_age_secs {
            issues.push(warn(
                "watchdog.stall_after_secs is below watchdog.min_age_secs — sweeps will lag the minimum age"
                    .into(),
            ));
        }
        if self.host.max_steps_per_turn == 0 {
            issues.push(err("host.max_steps_per_turn must be at least 1".into()));
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        let errors: Vec<_> = cfg
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn bad_bind_is_an_error() {
        let mut cfg = Config::default();
        cfg.server.bind = "not-an-address".into();
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn toml_round_trip() {
        let cfg = Config::default();
        let raw = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&raw).unwrap();
        assert_eq!(back.server.bind, cfg.server.bind);
        assert_eq!(back.storage.max_payload_bytes, cfg.storage.max_payload_bytes);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str("[server]\nbind = \"0.0.0.0:8080\"\n").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.llm.retry.max_attempts, 3);
    }
}
