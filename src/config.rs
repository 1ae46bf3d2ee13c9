use crate::error::{Result, SentinelError};
use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub analysis: AnalysisConfig,
    pub spf: SpfConfig,
    pub classifier: ClassifierConfig,
    pub reputation: ReputationConfig,
    pub blacklist: BlacklistConfig,
    pub rules_file: Option<String>,
    pub logging: LoggingConfig,
}

/// What the coordinator does when the concurrent phase misses its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Discard everything and return the fallback report.
    Strict,
    /// Keep whatever finished and mark the report as partial.
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub timeout_ms: u64,
    pub failure_policy: FailurePolicy,
    pub enable_headers: bool,
    pub enable_spf: bool,
    pub enable_phishing: bool,
    pub enable_blacklist: bool,
    pub enable_classifier: bool,
    pub enable_reputation: bool,
    pub enable_rules: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            failure_policy: FailurePolicy::Strict,
            enable_headers: true,
            enable_spf: true,
            enable_phishing: true,
            enable_blacklist: true,
            enable_classifier: true,
            enable_reputation: true,
            enable_rules: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpfConfig {
    pub max_lookups: u32,
    pub max_void_lookups: u32,
    /// Exchanges resolved per `mx` mechanism.
    pub max_mx_hosts: usize,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            max_lookups: 10,
            max_void_lookups: 2,
            max_mx_hosts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub spam_threshold: f64,
    pub interesting_tokens: usize,
    pub smoothing: f64,
    pub unknown_token_probability: f64,
    pub min_probability: f64,
    pub max_probability: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            spam_threshold: 0.9,
            interesting_tokens: 15,
            smoothing: 0.01,
            unknown_token_probability: 0.4,
            min_probability: 0.01,
            max_probability: 0.99,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub request_delay_ms: u64,
    pub max_lookups: usize,
    pub timeout_seconds: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            request_delay_ms: 1000,
            max_lookups: 5,
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub zones: Vec<String>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            zones: vec![
                "zen.spamhaus.org".to_string(),
                "bl.spamcop.net".to_string(),
                "b.barracudacentral.org".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn invalid(message: &str) -> SentinelError {
    SentinelError::Config(message.to_string())
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {path}"))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis.timeout_ms == 0 {
            return Err(invalid("analysis.timeout_ms must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.classifier.spam_threshold) {
            return Err(SentinelError::Config(format!(
                "classifier.spam_threshold must be within [0, 1], got {}",
                self.classifier.spam_threshold
            )));
        }
        if self.classifier.interesting_tokens == 0 {
            return Err(invalid("classifier.interesting_tokens must be greater than zero"));
        }
        if self.classifier.smoothing <= 0.0 {
            return Err(invalid("classifier.smoothing must be positive"));
        }
        for (name, value) in [
            ("unknown_token_probability", self.classifier.unknown_token_probability),
            ("min_probability", self.classifier.min_probability),
            ("max_probability", self.classifier.max_probability),
        ] {
            if value.is_nan() || value <= 0.0 || value >= 1.0 {
                return Err(SentinelError::Config(format!(
                    "classifier.{name} must be within (0, 1), got {value}"
                )));
            }
        }
        if self.classifier.min_probability >= self.classifier.max_probability {
            return Err(invalid("classifier.min_probability must be below max_probability"));
        }
        if self.spf.max_lookups == 0 {
            return Err(invalid("spf.max_lookups must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
analysis:
  timeout_ms: 2500
  failure_policy: partial
classifier:
  spam_threshold: 0.8
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.analysis.timeout_ms, 2500);
        assert_eq!(config.analysis.failure_policy, FailurePolicy::Partial);
        assert!(config.analysis.enable_spf);
        assert_eq!(config.classifier.spam_threshold, 0.8);
        assert_eq!(config.classifier.interesting_tokens, 15);
        assert_eq!(config.spf.max_lookups, 10);
        assert!(config.reputation.endpoint.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = Config::default();
        config.classifier.spam_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_classifier_probabilities_must_be_open_unit_interval() {
        let mut config = Config::default();
        config.classifier.unknown_token_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.classifier.min_probability = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.classifier.max_probability = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_round_trips_through_file() {
        let path = std::env::temp_dir().join(format!(
            "mail-sentinel-config-{}.yaml",
            std::process::id()
        ));
        let path = path.to_string_lossy().to_string();

        Config::default().to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.analysis.timeout_ms, 10_000);
        assert_eq!(loaded.analysis.failure_policy, FailurePolicy::Strict);
        assert_eq!(loaded.blacklist.zones.len(), 3);
    }
}
