//! Population-wide word-creation window calibration
//!
//! Scans every participant's log once and derives, per word length, the
//! typical time it takes to produce a valid word. The resulting
//! [`DynamicWindow`] is read-only and shared by all per-participant analyses.

use crate::config::CalibrationConfig;
use crate::error::AnalysisError;
use crate::types::{ParticipantLog, Phase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Where a window threshold came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    /// Median of observed creation times
    Calibrated,
    /// Fixed formula, no samples were observed
    Fallback,
}

/// One row of the calibration summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub length: u32,
    pub expected_sec: f64,
    pub samples: usize,
    pub source: WindowSource,
}

/// Expected word-creation duration per word length
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicWindow {
    /// Calibrated medians, only for lengths with at least one sample
    expected_sec: BTreeMap<u32, f64>,
    /// Retained sample counts per calibrated length
    samples: BTreeMap<u32, usize>,
    /// Lengths the calibration covered
    lengths: Vec<u32>,
    fallback_base_sec: f64,
    fallback_step_sec: f64,
}

impl Default for DynamicWindow {
    fn default() -> Self {
        Self::fallback_only(&CalibrationConfig::default())
    }
}

impl DynamicWindow {
    /// A window with no observations: every length uses the fallback formula
    pub fn fallback_only(config: &CalibrationConfig) -> Self {
        Self {
            expected_sec: BTreeMap::new(),
            samples: BTreeMap::new(),
            lengths: config.lengths.clone(),
            fallback_base_sec: config.fallback_base_sec,
            fallback_step_sec: config.fallback_step_sec,
        }
    }

    /// Expected creation time for a word of `length` letters (seconds)
    ///
    /// Lengths without samples (including lengths outside the calibrated
    /// set) use `base + step * max(0, length - 5)`.
    pub fn threshold_for(&self, length: u32) -> f64 {
        self.expected_sec
            .get(&length)
            .copied()
            .unwrap_or_else(|| self.fallback(length))
    }

    fn fallback(&self, length: u32) -> f64 {
        self.fallback_base_sec + self.fallback_step_sec * length.saturating_sub(5) as f64
    }

    /// Per-length summary for auditing the thresholds
    pub fn entries(&self) -> Vec<WindowEntry> {
        self.lengths
            .iter()
            .map(|&length| match self.expected_sec.get(&length) {
                Some(&expected_sec) => WindowEntry {
                    length,
                    expected_sec,
                    samples: self.samples.get(&length).copied().unwrap_or(0),
                    source: WindowSource::Calibrated,
                },
                None => WindowEntry {
                    length,
                    expected_sec: self.fallback(length),
                    samples: 0,
                    source: WindowSource::Fallback,
                },
            })
            .collect()
    }

    /// Load a window from JSON
    pub fn from_json(json: &str) -> Result<Self, AnalysisError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the window to JSON
    pub fn to_json(&self) -> Result<String, AnalysisError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Computes the [`DynamicWindow`] from the full population
pub struct WindowCalibrator {
    config: CalibrationConfig,
}

impl Default for WindowCalibrator {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

impl WindowCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Calibrate over every participant log
    pub fn calibrate<'a, I>(&self, logs: I) -> DynamicWindow
    where
        I: IntoIterator<Item = &'a ParticipantLog>,
    {
        let mut samples: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        let mut participants = 0usize;

        for log in logs {
            participants += 1;
            for phase in [Phase::Practice, Phase::Main] {
                self.collect_phase_samples(log, phase, &mut samples);
            }
        }

        let mut window = DynamicWindow::fallback_only(&self.config);
        for (length, mut values) in samples {
            if let Some(median) = median(&mut values) {
                debug!(length, samples = values.len(), median, "calibrated window");
                window.expected_sec.insert(length, median);
                window.samples.insert(length, values.len());
            }
        }

        info!(
            participants,
            calibrated_lengths = window.expected_sec.len(),
            "window calibration complete"
        );
        window
    }

    /// Elapsed time from the preceding event (any type, same phase) to each
    /// valid word of a calibrated length, filtered by the plausibility band
    fn collect_phase_samples(
        &self,
        log: &ParticipantLog,
        phase: Phase,
        samples: &mut BTreeMap<u32, Vec<f64>>,
    ) {
        let mut previous = None;
        for event in log.phase_events(phase) {
            if let (Some(word), Some(prev)) = (event.as_word_event(), previous) {
                if word.is_valid && self.config.lengths.contains(&word.length) {
                    let elapsed = seconds_between(prev, word.at);
                    if self.is_plausible(elapsed) {
                        samples.entry(word.length).or_default().push(elapsed);
                    }
                }
            }
            previous = event.timestamp;
        }
    }

    fn is_plausible(&self, elapsed_sec: f64) -> bool {
        elapsed_sec >= self.config.plausible_min_sec && elapsed_sec <= self.config.plausible_max_sec
    }
}

/// Fractional seconds from `from` to `to`
pub(crate) fn seconds_between(
    from: chrono::DateTime<chrono::Utc>,
    to: chrono::DateTime<chrono::Utc>,
) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Median of a sample (mean of the two middle values for even counts)
fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
