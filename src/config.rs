//! Engine configuration
//!
//! Every threshold used by calibration, the tagging rules, and scoring lives
//! here. Defaults reproduce the study protocol; a JSON or TOML file can
//! override any subset of fields.

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Word lengths that receive a calibrated expected duration
pub const CALIBRATED_LENGTHS: [u32; 4] = [5, 6, 7, 8];

/// Lower bound of plausible word-creation time (seconds)
pub const DEFAULT_PLAUSIBLE_MIN_SEC: f64 = 2.0;

/// Upper bound of plausible word-creation time (seconds)
pub const DEFAULT_PLAUSIBLE_MAX_SEC: f64 = 120.0;

/// Fallback expected duration for a 5-letter word (seconds)
pub const DEFAULT_FALLBACK_BASE_SEC: f64 = 10.0;

/// Fallback increment per letter above five (seconds)
pub const DEFAULT_FALLBACK_STEP_SEC: f64 = 5.0;

/// One row of the length → points reward table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEntry {
    pub length: u32,
    pub points: u32,
}

/// Calibration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Word lengths that get a calibrated threshold
    pub lengths: Vec<u32>,
    /// Elapsed times below this are treated as instrumentation noise
    pub plausible_min_sec: f64,
    /// Elapsed times above this are treated as instrumentation noise
    pub plausible_max_sec: f64,
    /// Fallback formula: `base + step * max(0, length - 5)`
    pub fallback_base_sec: f64,
    pub fallback_step_sec: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            lengths: CALIBRATED_LENGTHS.to_vec(),
            plausible_min_sec: DEFAULT_PLAUSIBLE_MIN_SEC,
            plausible_max_sec: DEFAULT_PLAUSIBLE_MAX_SEC,
            fallback_base_sec: DEFAULT_FALLBACK_BASE_SEC,
            fallback_step_sec: DEFAULT_FALLBACK_STEP_SEC,
        }
    }
}

/// Tagging rule thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Rule 1 looks at this many leading words of each window
    pub length_jump_positions: usize,
    /// Rule 1 minimum word length
    pub length_jump_min_length: u32,
    /// Rule 2 minimum word length counted toward the majority
    pub majority_length_min_length: u32,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            length_jump_positions: 2,
            length_jump_min_length: 7,
            majority_length_min_length: 6,
        }
    }
}

/// Scoring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub rewards: Vec<RewardEntry>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            rewards: vec![
                RewardEntry { length: 5, points: 2 },
                RewardEntry { length: 6, points: 4 },
                RewardEntry { length: 7, points: 6 },
                RewardEntry { length: 8, points: 8 },
            ],
        }
    }
}

impl ScoringConfig {
    /// Points awarded for a word of the given length (0 when not in the table)
    pub fn reward_for(&self, length: u32) -> u32 {
        self.rewards
            .iter()
            .find(|r| r.length == length)
            .map(|r| r.points)
            .unwrap_or(0)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub calibration: CalibrationConfig,
    pub rules: RuleConfig,
    pub scoring: ScoringConfig,
    /// Worker threads for per-participant analysis (None = available parallelism)
    pub worker_threads: Option<usize>,
}

impl EngineConfig {
    /// Load configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, AnalysisError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML
    pub fn from_toml(text: &str) -> Result<Self, AnalysisError> {
        let config: Self =
            toml::from_str(text).map_err(|e| AnalysisError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a `.toml` or `.json` file
    pub fn from_path(path: &Path) -> Result<Self, AnalysisError> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            Some("json") => Self::from_json(&text),
            other => Err(AnalysisError::ConfigError(format!(
                "unsupported config extension: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, AnalysisError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject configurations that would make the engine meaningless
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let cal = &self.calibration;
        if cal.plausible_min_sec < 0.0 || cal.plausible_min_sec > cal.plausible_max_sec {
            return Err(AnalysisError::ConfigError(format!(
                "plausibility band [{}, {}] is inverted or negative",
                cal.plausible_min_sec, cal.plausible_max_sec
            )));
        }
        if cal.lengths.is_empty() {
            return Err(AnalysisError::ConfigError(
                "calibration.lengths must not be empty".to_string(),
            ));
        }
        if self.scoring.rewards.is_empty() {
            return Err(AnalysisError::ConfigError(
                "scoring.rewards must not be empty".to_string(),
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(AnalysisError::ConfigError(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reward_table() {
        let scoring = ScoringConfig::default();
        assert_eq!(scoring.reward_for(5), 2);
        assert_eq!(scoring.reward_for(6), 4);
        assert_eq!(scoring.reward_for(7), 6);
        assert_eq!(scoring.reward_for(8), 8);
        assert_eq!(scoring.reward_for(4), 0);
        assert_eq!(scoring.reward_for(9), 0);
    }

    #[test]
    fn test_partial_toml_override() {
        let text = r#"
            worker_threads = 2

            [calibration]
            plausible_max_sec = 90.0
        "#;

        let config = EngineConfig::from_toml(text).unwrap();
        assert_eq!(config.worker_threads, Some(2));
        assert_eq!(config.calibration.plausible_max_sec, 90.0);
        // Untouched fields keep their defaults
        assert_eq!(config.calibration.plausible_min_sec, 2.0);
        assert_eq!(config.rules, RuleConfig::default());
    }

    #[test]
    fn test_json_roundtrip_keeps_defaults() {
        let config = EngineConfig::default();
        let json = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_inverted_band_rejected() {
        let json = r#"{ "calibration": { "plausible_min_sec": 50.0, "plausible_max_sec": 10.0 } }"#;
        assert!(matches!(
            EngineConfig::from_json(json),
            Err(AnalysisError::ConfigError(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let json = r#"{ "worker_threads": 0 }"#;
        assert!(EngineConfig::from_json(json).is_err());
    }
}
