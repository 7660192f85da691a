use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::ConfidencePolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub dingtalk: DingTalkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_detector_timeout_secs")]
    pub timeout_secs: u64,
    /// Detections below this confidence are dropped before classification.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            provider: default_detector_provider(),
            endpoint: None,
            timeout_secs: default_detector_timeout_secs(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_detector_provider() -> String {
    "disabled".to_string()
}
fn default_detector_timeout_secs() -> u64 {
    30
}
fn default_confidence_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_locked_labels")]
    pub locked: Vec<String>,
    #[serde(default = "default_unlocked_labels")]
    pub unlocked: Vec<String>,
    #[serde(default = "default_ambiguous_labels")]
    pub ambiguous: Vec<String>,
    #[serde(default = "default_true")]
    pub strict_labels: bool,
    #[serde(default)]
    pub confidence_policy: ConfidencePolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            locked: default_locked_labels(),
            unlocked: default_unlocked_labels(),
            ambiguous: default_ambiguous_labels(),
            strict_labels: true,
            confidence_policy: ConfidencePolicy::default(),
        }
    }
}

fn default_locked_labels() -> Vec<String> {
    vec!["locked_lock".to_string(), "locked".to_string()]
}
fn default_unlocked_labels() -> Vec<String> {
    vec!["unlocked_lock".to_string(), "unlocked".to_string()]
}
fn default_ambiguous_labels() -> Vec<String> {
    vec![
        "lock".to_string(),
        "padlock".to_string(),
        "labels".to_string(),
    ]
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    /// Intensity stddev at or below which a crop reads as a smooth, closed shackle.
    #[serde(default = "default_smooth_stddev")]
    pub smooth_stddev: f64,
    /// Intensity stddev at or above which a crop reads as an open shackle.
    #[serde(default = "default_textured_stddev")]
    pub textured_stddev: f64,
    #[serde(default = "default_edge_magnitude")]
    pub edge_magnitude: f64,
    #[serde(default = "default_edge_density")]
    pub edge_density: f64,
    #[serde(default = "default_shackle_fraction")]
    pub shackle_fraction: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            smooth_stddev: default_smooth_stddev(),
            textured_stddev: default_textured_stddev(),
            edge_magnitude: default_edge_magnitude(),
            edge_density: default_edge_density(),
            shackle_fraction: default_shackle_fraction(),
        }
    }
}

fn default_smooth_stddev() -> f64 {
    12.0
}
fn default_textured_stddev() -> f64 {
    60.0
}
fn default_edge_magnitude() -> f64 {
    48.0
}
fn default_edge_density() -> f64 {
    0.18
}
fn default_shackle_fraction() -> f64 {
    0.4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_retrieval_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_retrieval_timeout_secs(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

fn default_retrieval_timeout_secs() -> u64 {
    15
}
fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DingTalkConfig {
    /// Bot identifier as it appears in `atUsers.dingtalkId`.
    #[serde(default)]
    pub app_key: String,
    /// Shared secret for callback signatures. Empty means not configured.
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub bot_display_token: String,
    #[serde(default = "default_true")]
    pub ack_without_image: bool,
    #[serde(default)]
    pub max_clock_skew_secs: Option<u64>,
}

impl DingTalkConfig {
    pub fn is_configured(&self) -> bool {
        !self.app_secret.is_empty()
    }

    /// Fill empty values from `DINGTALK_APP_KEY`, `DINGTALK_APP_SECRET` and
    /// `DINGTALK_WEBHOOK_URL`.
    pub fn apply_env(&mut self) {
        fill_from_env(&mut self.app_key, "DINGTALK_APP_KEY");
        fill_from_env(&mut self.app_secret, "DINGTALK_APP_SECRET");
        fill_from_env(&mut self.webhook_url, "DINGTALK_WEBHOOK_URL");
    }
}

fn fill_from_env(slot: &mut String, var: &str) {
    if slot.is_empty() {
        if let Ok(value) = std::env::var(var) {
            *slot = value;
        }
    }
}

impl DetectorConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.dingtalk.apply_env();

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate detector
    match config.detector.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.detector.endpoint.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!("detector.endpoint must be set when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown detector provider: '{}'. Must be disabled or http.",
            other
        ),
    }
    if !(0.0..=1.0).contains(&config.detector.confidence_threshold) {
        anyhow::bail!("detector.confidence_threshold must be in [0.0, 1.0]");
    }

    // Validate classifier label table
    if config.classifier.locked.is_empty() || config.classifier.unlocked.is_empty() {
        anyhow::bail!("classifier.locked and classifier.unlocked must not be empty");
    }

    // Validate analyzer
    let a = &config.analyzer;
    if a.smooth_stddev < 0.0 || a.textured_stddev <= a.smooth_stddev {
        anyhow::bail!("analyzer.textured_stddev must be greater than analyzer.smooth_stddev");
    }
    if !(0.0..=1.0).contains(&a.edge_density) {
        anyhow::bail!("analyzer.edge_density must be in [0.0, 1.0]");
    }
    if !(a.shackle_fraction > 0.0 && a.shackle_fraction <= 1.0) {
        anyhow::bail!("analyzer.shackle_fraction must be in (0.0, 1.0]");
    }

    // Validate retrieval
    if config.retrieval.timeout_secs == 0 {
        anyhow::bail!("retrieval.timeout_secs must be > 0");
    }
    if config.retrieval.max_image_bytes == 0 {
        anyhow::bail!("retrieval.max_image_bytes must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/lockwatch.sqlite"

[server]
bind = "127.0.0.1:8008"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg: Config = toml::from_str(MINIMAL).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.detector.provider, "disabled");
        assert!(cfg.classifier.strict_labels);
        assert_eq!(cfg.classifier.confidence_policy, ConfidencePolicy::Min);
        assert!(cfg.dingtalk.ack_without_image);
        assert!(cfg.dingtalk.max_clock_skew_secs.is_none());
        assert_eq!(cfg.retrieval.max_image_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let text = format!("{}\n[detector]\nprovider = \"http\"\n", MINIMAL);
        let cfg: Config = toml::from_str(&text).unwrap();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("detector.endpoint"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let text = format!("{}\n[detector]\nprovider = \"onnx\"\n", MINIMAL);
        let cfg: Config = toml::from_str(&text).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_policy_parses_lowercase() {
        let text = format!("{}\n[classifier]\nconfidence_policy = \"max\"\n", MINIMAL);
        let cfg: Config = toml::from_str(&text).unwrap();
        assert_eq!(cfg.classifier.confidence_policy, ConfidencePolicy::Max);
    }

    #[test]
    fn test_inverted_stddev_thresholds_rejected() {
        let text = format!(
            "{}\n[analyzer]\nsmooth_stddev = 50.0\ntextured_stddev = 40.0\n",
            MINIMAL
        );
        let cfg: Config = toml::from_str(&text).unwrap();
        assert!(validate(&cfg).is_err());
    }
}
