//! Runtime configuration, loaded from an optional TOML file with CLI
//! overrides layered on top.

use serde::Deserialize;

use crate::error::{ProfilerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criteria {
    Byte,
    Packet,
    Combination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutFormat {
    Aguri,
    Json,
    Debug,
}

/// 0 = all heuristics on, 1 = keep strict-sub-attribute threshold only,
/// 2 = disable both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[repr(u8)]
pub enum HeuristicLevel {
    AllOn = 0,
    StrictSubAttrOnly = 1,
    AllOff = 2,
}

impl HeuristicLevel {
    pub fn heuristics_enabled(self) -> bool {
        !matches!(self, HeuristicLevel::AllOff)
    }

    pub fn strict_sub_attr(self) -> bool {
        matches!(self, HeuristicLevel::AllOn | HeuristicLevel::StrictSubAttrOnly)
    }
}

fn default_threshold() -> u32 {
    1
}

fn default_plot_threshold() -> u32 {
    3
}

fn default_max_hashentries() -> u64 {
    1_000_000
}

fn default_criteria() -> Criteria {
    Criteria::Byte
}

fn default_outfmt() -> OutFormat {
    OutFormat::Aguri
}

fn default_heuristics() -> HeuristicLevel {
    HeuristicLevel::AllOn
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Aggregation interval in seconds. Required to obtain per-interval
    /// summaries.
    pub interval: u32,

    /// Optional longer output interval; when set and greater than
    /// `interval`, enables two-stage carry-over.
    #[serde(default)]
    pub output_interval: Option<u32>,

    #[serde(default = "default_threshold")]
    pub threshold: u32,

    #[serde(default = "default_criteria")]
    pub criteria: Criteria,

    #[serde(default)]
    pub nflows: Option<usize>,

    #[serde(default)]
    pub start_time: i64,

    #[serde(default)]
    pub end_time: i64,

    #[serde(default)]
    pub duration: i64,

    #[serde(default = "default_max_hashentries")]
    pub max_hashentries: u64,

    #[serde(default = "default_heuristics")]
    pub heuristics: HeuristicLevel,

    #[serde(default = "default_outfmt")]
    pub outfmt: OutFormat,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interval: 60,
            output_interval: None,
            threshold: default_threshold(),
            criteria: default_criteria(),
            nflows: None,
            start_time: 0,
            end_time: 0,
            duration: 0,
            max_hashentries: default_max_hashentries(),
            heuristics: default_heuristics(),
            outfmt: default_outfmt(),
        }
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config =
            toml::de::from_str(&text).map_err(|e| ProfilerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(ProfilerError::Config("interval must be > 0".to_string()));
        }
        if self.threshold > 100 {
            return Err(ProfilerError::Config(
                "threshold must be between 0 and 100".to_string(),
            ));
        }
        if let Some(out) = self.output_interval {
            if out < self.interval {
                return Err(ProfilerError::Config(
                    "output_interval must be >= interval".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn plot_threshold_default() -> u32 {
        default_plot_threshold()
    }

    pub fn two_stage(&self) -> bool {
        matches!(self.output_interval, Some(out) if out > self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.threshold, 1);
        assert!(!config.two_stage());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = Config::default();
        config.interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn output_interval_shorter_than_interval_is_rejected() {
        let mut config = Config::default();
        config.interval = 300;
        config.output_interval = Some(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn output_interval_longer_enables_two_stage() {
        let mut config = Config::default();
        config.interval = 60;
        config.output_interval = Some(300);
        assert!(config.validate().is_ok());
        assert!(config.two_stage());
    }

    #[test]
    fn parses_from_toml() {
        let toml_text = r#"
            interval = 60
            threshold = 2
            criteria = "combination"
        "#;
        let config: Config = toml::de::from_str(toml_text).unwrap();
        assert_eq!(config.interval, 60);
        assert_eq!(config.threshold, 2);
        assert_eq!(config.criteria, Criteria::Combination);
        assert_eq!(config.max_hashentries, 1_000_000);
    }
}
