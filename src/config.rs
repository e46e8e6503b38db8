//! Configuration (ambient component L, spec.md §6).
//!
//! A plain `serde`-derived struct with a hand-written [`Default`] impl
//! documenting each field's default, deserialized from an opaque carrier
//! (here, a TOML document) whose format is a collaborator's concern.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// If false, `nemb_initialize` returns success but all reads are no-ops.
    pub enabled: bool,

    /// Sampler cadence. Valid range 1..1000.
    pub interval_ms: u64,

    /// Sample buffer slots.
    pub buffer_size: usize,

    /// Tick-validity threshold for temporal alignment.
    pub alignment_tolerance_ms: f64,

    /// Ratio above which cross-validation between disjoint-coverage
    /// providers is flagged as failed.
    pub cross_validation_threshold: f64,

    /// Whether the health monitor restarts providers with too many
    /// consecutive failures.
    pub auto_restart: bool,

    /// Health-monitor cadence.
    pub restart_interval_s: u64,

    /// Exponential moving average filtering of power readings (spec.md
    /// §4.F). Internal coordinator behavior, not part of the external
    /// recognized-options table in spec.md §6.
    pub enable_filtering: bool,

    /// 3-sigma-over-100-ticks outlier flagging (spec.md §4.F). Same scope
    /// note as `enable_filtering`.
    pub enable_outlier_detection: bool,

    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub intel_rapl: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Subset of `{package, pp0, pp1, dram, psys}`; `None` means "all available".
    pub domains: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1,
            buffer_size: 1000,
            alignment_tolerance_ms: 0.1,
            cross_validation_threshold: 0.05,
            auto_restart: true,
            restart_interval_s: 30,
            enable_filtering: true,
            enable_outlier_detection: true,
            providers: ProvidersConfig::default(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            intel_rapl: ProviderConfig::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            domains: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("interval_ms must be in 1..=1000, got {0}")]
    IntervalOutOfRange(u64),
    #[error("buffer_size must be at least 2, got {0}")]
    BufferTooSmall(usize),
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.interval_ms) {
            return Err(ConfigError::IntervalOutOfRange(self.interval_ms));
        }
        if self.buffer_size < 2 {
            return Err(ConfigError::BufferTooSmall(self.buffer_size));
        }
        Ok(())
    }

    pub fn measurement_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn temporal_alignment_tolerance(&self) -> Duration {
        Duration::from_secs_f64(self.alignment_tolerance_ms / 1000.0)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert!(config.enabled);
        assert_eq!(config.interval_ms, 1);
        assert_eq!(config.buffer_size, 1000);
        assert!((config.alignment_tolerance_ms - 0.1).abs() < 1e-9);
        assert!((config.cross_validation_threshold - 0.05).abs() < 1e-9);
        assert_eq!(config.restart_interval_s, 30);
    }

    #[test]
    fn parses_partial_toml_with_defaults_filled_in() {
        let config = Config::from_toml_str("interval_ms = 10\n").unwrap();
        assert_eq!(config.interval_ms, 10);
        assert_eq!(config.buffer_size, 1000); // default
    }

    #[test]
    fn parses_nested_provider_domains() {
        let toml = indoc::indoc! {r#"
            [providers.intel_rapl]
            enabled = true
            domains = ["package", "dram"]
        "#};
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(
            config.providers.intel_rapl.domains,
            Some(vec!["package".to_owned(), "dram".to_owned()])
        );
    }

    #[test]
    fn rejects_interval_out_of_range() {
        assert!(Config::from_toml_str("interval_ms = 0\n").is_err());
        assert!(Config::from_toml_str("interval_ms = 2000\n").is_err());
    }

    #[test]
    fn rejects_too_small_buffer() {
        assert!(Config::from_toml_str("buffer_size = 1\n").is_err());
    }
}
