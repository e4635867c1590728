use std::path::Path;

use serde::{Deserialize, Serialize};

use relay_providers::{ErpConfig, LlmConfig};

/// Scheduler cadences, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_scan_interval() -> u64 {
    3_600
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Service configuration, read from `config.json` in the state dir with
/// environment overrides for the secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_confidence_threshold")]
    pub default_confidence_threshold: f64,
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,
    #[serde(default = "default_agent_max_steps")]
    pub agent_max_steps: i64,
    #[serde(default = "default_agent_max_tokens")]
    pub agent_max_tokens: i64,
    #[serde(default = "default_agent_loop_threshold")]
    pub agent_loop_threshold: i64,
    #[serde(default = "default_suspension_timeout_hours")]
    pub agent_suspension_timeout_hours: i64,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erp: Option<ErpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_webhook_url: Option<String>,
    /// ERP models routed to an agent instead of the automation dispatch.
    #[serde(default)]
    pub agent_routes: Vec<AgentRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRoute {
    pub model: String,
    pub agent_type: String,
}

fn default_dedup_window() -> u64 {
    300
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_queue_depth() -> usize {
    256
}

fn default_confidence_threshold() -> f64 {
    0.85
}

fn default_auto_approve_threshold() -> f64 {
    0.95
}

fn default_agent_max_steps() -> i64 {
    25
}

fn default_agent_max_tokens() -> i64 {
    50_000
}

fn default_agent_loop_threshold() -> i64 {
    3
}

fn default_suspension_timeout_hours() -> i64 {
    24
}

impl Default for RelayConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults deserialize")
    }
}

impl RelayConfig {
    /// Load from a JSON file (missing file yields defaults), then apply
    /// environment overrides for the secrets.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Self = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err.into()),
        };

        if let Ok(secret) = std::env::var("RELAY_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook_secret = secret;
            }
        }
        if let Ok(key) = std::env::var("RELAY_API_KEY") {
            if !key.is_empty() {
                config.api_key = key;
            }
        }
        if let Ok(url) = std::env::var("RELAY_SLACK_WEBHOOK_URL") {
            if !url.is_empty() {
                config.slack_webhook_url = Some(url);
            }
        }

        if config.auto_approve_threshold < config.default_confidence_threshold {
            anyhow::bail!(
                "auto_approve_threshold ({}) must be >= default_confidence_threshold ({})",
                config.auto_approve_threshold,
                config.default_confidence_threshold
            );
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RelayConfig::default();
        assert_eq!(config.default_confidence_threshold, 0.85);
        assert_eq!(config.auto_approve_threshold, 0.95);
        assert_eq!(config.dedup_window_secs, 300);
        assert!(config.workers >= 1);
    }

    #[test]
    fn load_rejects_inverted_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"default_confidence_threshold": 0.9, "auto_approve_threshold": 0.8}"#,
        )
        .unwrap();
        assert!(RelayConfig::load(&path).is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.workers, RelayConfig::default().workers);
    }
}
