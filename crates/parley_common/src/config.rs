//! Gateway configuration.
//!
//! Lives in a TOML file (default `/etc/parley/config.toml`). Every field has a
//! serde default so a partial file is fine; a missing or malformed file logs a
//! warning and falls back to defaults rather than refusing to start.
//!
//! The near-duplicate thresholds under `[normalizer]` were chosen empirically
//! and are tunable here on purpose, not load-bearing constants.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default configuration path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/parley/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub persist: PersistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address. Localhost only by default.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7610".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// How to invoke the model CLI. The prompt is appended as the final argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Executable name or path.
    #[serde(default = "default_model_command")]
    pub command: String,

    /// Base arguments selecting single-shot, structured-output mode.
    #[serde(default = "default_model_args")]
    pub args: Vec<String>,

    /// Extra arguments for the preflight phase (forbids external lookups).
    #[serde(default = "default_preflight_args")]
    pub preflight_extra_args: Vec<String>,

    /// Fixed instruction prepended to every prompt.
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,

    /// Full-phase deadline in seconds.
    #[serde(default = "default_full_deadline")]
    pub full_deadline_secs: u64,

    /// Preflight-phase deadline in seconds.
    #[serde(default = "default_preflight_deadline")]
    pub preflight_deadline_secs: u64,
}

fn default_model_command() -> String {
    "model-cli".to_string()
}

fn default_model_args() -> Vec<String> {
    vec![
        "--single-shot".to_string(),
        "--format".to_string(),
        "json".to_string(),
    ]
}

fn default_preflight_args() -> Vec<String> {
    vec!["--offline".to_string()]
}

fn default_system_instruction() -> String {
    "Answer in exactly one concise English sentence. \
     Do not mention which model or provider you are, and do not show your working."
        .to_string()
}

fn default_full_deadline() -> u64 {
    120
}

fn default_preflight_deadline() -> u64 {
    3
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: default_model_command(),
            args: default_model_args(),
            preflight_extra_args: default_preflight_args(),
            system_instruction: default_system_instruction(),
            full_deadline_secs: default_full_deadline(),
            preflight_deadline_secs: default_preflight_deadline(),
        }
    }
}

impl ModelConfig {
    pub fn full_deadline(&self) -> Duration {
        Duration::from_secs(self.full_deadline_secs)
    }

    pub fn preflight_deadline(&self) -> Duration {
        Duration::from_secs(self.preflight_deadline_secs)
    }
}

/// Admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests allowed per caller within the sliding window.
    #[serde(default = "default_rate_max")]
    pub rate_max_requests: usize,

    /// Sliding window length in seconds.
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,

    /// Concurrent subprocess invocations across all callers.
    #[serde(default = "default_global_max")]
    pub global_max_active: usize,

    /// Concurrent subprocess invocations per caller.
    #[serde(default = "default_per_caller_max")]
    pub per_caller_max_active: usize,
}

fn default_rate_max() -> usize {
    10
}

fn default_rate_window() -> u64 {
    60
}

fn default_global_max() -> usize {
    2
}

fn default_per_caller_max() -> usize {
    1
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_max_requests: default_rate_max(),
            rate_window_secs: default_rate_window(),
            global_max_active: default_global_max(),
            per_caller_max_active: default_per_caller_max(),
        }
    }
}

impl LimitsConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}

/// Text normalization tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Jaccard similarity at or above which a sentence is a near-duplicate.
    #[serde(default = "default_jaccard")]
    pub jaccard_threshold: f64,

    /// Fraction of the shorter segment's distinct words that, when covered,
    /// also marks a near-duplicate (catches reordered paraphrases).
    #[serde(default = "default_overlap")]
    pub overlap_threshold: f64,

    /// Length ceiling for the concise sentence.
    #[serde(default = "default_concise_max")]
    pub concise_max_chars: usize,

    /// Length ceiling above which full text stays internal-only.
    #[serde(default = "default_external_max")]
    pub external_max_chars: usize,
}

fn default_jaccard() -> f64 {
    0.7
}

fn default_overlap() -> f64 {
    0.85
}

fn default_concise_max() -> usize {
    400
}

fn default_external_max() -> usize {
    600
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            jaccard_threshold: default_jaccard(),
            overlap_threshold: default_overlap(),
            concise_max_chars: default_concise_max(),
            external_max_chars: default_external_max(),
        }
    }
}

/// Ephemeral result store tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long a correlation id stays resolvable after creation.
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,

    /// Sweep interval for expired entries.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_result_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            result_ttl_secs: default_result_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Chat record persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    /// SQLite database path. Empty disables persistence (records are logged).
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_sqlite_path() -> String {
    "/var/lib/parley/records.db".to_string()
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl GatewayConfig {
    /// Load from the given path, falling back to defaults if the file is
    /// absent or malformed. Values are clamped to sane ranges afterwards.
    pub fn load(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => match toml::from_str::<GatewayConfig>(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Malformed config at {}: {} - using defaults", path.display(), e);
                    GatewayConfig::default()
                }
            },
            Err(_) => GatewayConfig::default(),
        };
        config.clamp();
        config
    }

    /// Clamp tunables into valid ranges.
    fn clamp(&mut self) {
        let n = &mut self.normalizer;
        n.jaccard_threshold = n.jaccard_threshold.clamp(0.0, 1.0);
        n.overlap_threshold = n.overlap_threshold.clamp(0.0, 1.0);
        n.concise_max_chars = n.concise_max_chars.max(40);
        n.external_max_chars = n.external_max_chars.max(n.concise_max_chars);

        let l = &mut self.limits;
        l.rate_max_requests = l.rate_max_requests.max(1);
        l.rate_window_secs = l.rate_window_secs.max(1);
        l.global_max_active = l.global_max_active.max(1);
        l.per_caller_max_active = l.per_caller_max_active.clamp(1, l.global_max_active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recommended_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.limits.rate_max_requests, 10);
        assert_eq!(config.limits.rate_window_secs, 60);
        assert_eq!(config.limits.global_max_active, 2);
        assert_eq!(config.limits.per_caller_max_active, 1);
        assert_eq!(config.model.full_deadline_secs, 120);
        assert_eq!(config.model.preflight_deadline_secs, 3);
        assert!((config.normalizer.jaccard_threshold - 0.7).abs() < f64::EPSILON);
        assert!((config.normalizer.overlap_threshold - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = GatewayConfig::load(Path::new("/nonexistent/parley.toml"));
        assert_eq!(config.limits.global_max_active, 2);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[limits]\nglobal_max_active = 4\n\n[normalizer]\njaccard_threshold = 0.5\n",
        )
        .unwrap();

        let config = GatewayConfig::load(&path);
        assert_eq!(config.limits.global_max_active, 4);
        assert!((config.normalizer.jaccard_threshold - 0.5).abs() < f64::EPSILON);
        // Untouched sections keep their defaults
        assert_eq!(config.model.preflight_deadline_secs, 3);
    }

    #[test]
    fn clamp_keeps_per_caller_within_global() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[limits]\nglobal_max_active = 2\nper_caller_max_active = 10\n",
        )
        .unwrap();

        let config = GatewayConfig::load(&path);
        assert_eq!(config.limits.per_caller_max_active, 2);
    }
}
