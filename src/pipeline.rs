//! Pipeline orchestration
//!
//! This module provides the public API of the engine. It runs one
//! participant's log through detection, tagging, confession reconciliation
//! and aggregation, and fans a whole population out across worker threads
//! after a single calibration pass.

use crate::adapter::{AdaptSummary, EventLogAdapter, ParsedRecords};
use crate::calibration::{DynamicWindow, WindowCalibrator, WindowEntry};
use crate::config::EngineConfig;
use crate::confession::{Confession, ConfessionReconciler};
use crate::detector::SequenceDetector;
use crate::error::AnalysisError;
use crate::metrics::{MetricsAggregator, ParticipantMetrics};
use crate::rules::{RuleEngine, WindowEvaluation};
use crate::tags::{CheatingCounts, WordTagStore};
use crate::types::{EventType, ParticipantLog, Phase, Population, WordEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rule windows evaluated for one participant, per phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleAudit {
    pub practice: Vec<WindowEvaluation>,
    pub main: Vec<WindowEvaluation>,
}

/// Everything produced for one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantReport {
    #[serde(flatten)]
    pub metrics: ParticipantMetrics,
    pub rule_windows: RuleAudit,
    /// Word events excluded because they had no usable timestamp
    pub untimed_word_events: usize,
}

/// Analyze a single participant against a calibrated window.
///
/// Pipeline stages:
/// 1. WordTagStore - Register every taggable word of both phases
/// 2. SequenceDetector - Find suspicious intervals per phase
/// 3. RuleEngine - Tag words in the windows after each interval
/// 4. ConfessionReconciler - Merge the self report into main-round tags
/// 5. MetricsAggregator - Reduce everything into the metrics record
///
/// A non-empty log in which no event carries a usable timestamp is
/// rejected as corrupt.
pub fn analyze_participant(
    log: &ParticipantLog,
    window: &DynamicWindow,
    config: &EngineConfig,
) -> Result<ParticipantReport, AnalysisError> {
    if !log.is_empty() && log.timed().is_empty() {
        return Err(AnalysisError::CorruptLog(format!(
            "participant {} has {} events and none with a usable timestamp",
            log.participant_id,
            log.len()
        )));
    }

    let untimed_word_events = log
        .untimed()
        .iter()
        .filter(|e| e.is(&EventType::WordValidation))
        .count();
    if untimed_word_events > 0 {
        debug!(
            participant = %log.participant_id,
            count = untimed_word_events,
            "word events without timestamp excluded from tagging"
        );
    }

    // Stage 1: Register words
    let mut store = WordTagStore::new();
    let practice_words = phase_words(log, Phase::Practice);
    let main_words = phase_words(log, Phase::Main);
    for word in practice_words.iter().chain(main_words.iter()) {
        store.register(word);
    }

    let engine = RuleEngine::new(window, &config.rules);
    let counts = CheatingCounts::default();

    // Stages 2-3: Detect intervals and tag, practice then main
    let practice_intervals = SequenceDetector::detect(log, Phase::Practice);
    let practice = engine.tag_phase(
        Phase::Practice,
        &practice_intervals,
        &practice_words,
        store,
        counts,
    );

    let main_intervals = SequenceDetector::detect(log, Phase::Main);
    let main = engine.tag_phase(
        Phase::Main,
        &main_intervals,
        &main_words,
        practice.store,
        practice.counts,
    );

    // Stage 4: Reconcile confession
    let confession = Confession::from_log(log);
    let reconciliation = ConfessionReconciler::reconcile(&confession, main.store, main.counts);

    // Stage 5: Aggregate
    let metrics =
        MetricsAggregator::new(&config.scoring).aggregate(log, &confession, &reconciliation);

    debug!(
        participant = %log.participant_id,
        practice_flagged = reconciliation.counts.practice,
        main_flagged = reconciliation.counts.main,
        lying_rate = reconciliation.lying_rate,
        "participant analyzed"
    );

    Ok(ParticipantReport {
        metrics,
        rule_windows: RuleAudit {
            practice: practice.windows,
            main: main.windows,
        },
        untimed_word_events,
    })
}

fn phase_words(log: &ParticipantLog, phase: Phase) -> Vec<WordEvent> {
    log.phase_events(phase)
        .filter_map(|e| e.as_word_event())
        .collect()
}

/// A participant left out of the aggregate output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedParticipant {
    pub participant_id: String,
    pub error: String,
}

/// Output of one batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub engine_version: String,
    pub generated_at: DateTime<Utc>,
    /// Thresholds used for this run
    pub window: Vec<WindowEntry>,
    /// Successful reports, ordered by participant id
    pub participants: Vec<ParticipantReport>,
    pub excluded: Vec<ExcludedParticipant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<AdaptSummary>,
}

impl BatchReport {
    /// Metrics records only, in participant order
    pub fn metrics(&self) -> impl Iterator<Item = &ParticipantMetrics> {
        self.participants.iter().map(|r| &r.metrics)
    }
}

/// Batch analyzer for whole populations.
///
/// Every run calibrates on its own population before any participant is
/// analyzed, unless a window was loaded with [`BatchAnalyzer::load_window`].
/// Participants are then analyzed concurrently. Each participant is
/// independent: a failure excludes that participant and the rest of the
/// batch carries on.
pub struct BatchAnalyzer {
    config: EngineConfig,
    window: Option<DynamicWindow>,
    /// Set when the window came from `load_window` and must be reused
    loaded: bool,
}

impl Default for BatchAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchAnalyzer {
    /// Create an analyzer with default settings
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            window: None,
            loaded: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Window used by the last run, or loaded explicitly
    pub fn window(&self) -> Option<&DynamicWindow> {
        self.window.as_ref()
    }

    /// Load a previously saved window; later runs skip calibration
    pub fn load_window(&mut self, json: &str) -> Result<(), AnalysisError> {
        self.window = Some(DynamicWindow::from_json(json)?);
        self.loaded = true;
        Ok(())
    }

    /// Save the current window as JSON
    pub fn save_window(&self) -> Result<String, AnalysisError> {
        match &self.window {
            Some(window) => window.to_json(),
            None => Err(AnalysisError::ConfigError(
                "no window has been calibrated or loaded".to_string(),
            )),
        }
    }

    /// Calibrate the window from a population, replacing any current one,
    /// including a loaded one
    pub fn calibrate(&mut self, population: &Population) -> &DynamicWindow {
        let window =
            WindowCalibrator::new(self.config.calibration.clone()).calibrate(population.values());
        self.loaded = false;
        self.window.insert(window)
    }

    /// Analyze every participant of a population
    pub fn run(&mut self, population: &Population) -> BatchReport {
        if !self.loaded || self.window.is_none() {
            self.calibrate(population);
        }
        let window = self.window.clone().unwrap_or_default();

        let workers = self.worker_count(population.len());
        info!(
            participants = population.len(),
            workers,
            "starting batch analysis"
        );

        let config = &self.config;
        let results = analyze_concurrently(population, workers, &|log: &ParticipantLog| {
            analyze_participant(log, &window, config)
        });

        let mut participants = Vec::with_capacity(results.len());
        let mut excluded = Vec::new();
        for (participant_id, result) in results {
            match result {
                Ok(report) => participants.push(report),
                Err(e) => {
                    warn!(participant = %participant_id, error = %e, "participant excluded");
                    excluded.push(ExcludedParticipant {
                        participant_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            analyzed = participants.len(),
            excluded = excluded.len(),
            "batch analysis complete"
        );

        BatchReport {
            run_id: Uuid::new_v4(),
            engine_version: crate::ENGINE_VERSION.to_string(),
            generated_at: Utc::now(),
            window: window.entries(),
            participants,
            excluded,
            ingest: None,
        }
    }

    /// Parse NDJSON, adapt, and analyze in one call
    pub fn run_ndjson(&mut self, ndjson: &str) -> BatchReport {
        self.run_parsed(EventLogAdapter::parse_ndjson(ndjson))
    }

    /// Adapt already-parsed records and analyze them
    pub fn run_parsed(&mut self, parsed: ParsedRecords) -> BatchReport {
        let (population, summary) = EventLogAdapter::to_population(&parsed.records);
        let mut report = self.run(&population);
        report.ingest = Some(summary);
        report
    }

    fn worker_count(&self, participants: usize) -> usize {
        let configured = match self.config.worker_threads {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|v| v.get())
                .unwrap_or(1),
        };
        configured.clamp(1, participants.max(1))
    }
}

type ParticipantResult = (String, Result<ParticipantReport, AnalysisError>);

/// Split the population into contiguous chunks, one scoped thread each.
/// Results come back in participant-id order.
fn analyze_concurrently<F>(
    population: &Population,
    workers: usize,
    analyze: &F,
) -> Vec<ParticipantResult>
where
    F: Fn(&ParticipantLog) -> Result<ParticipantReport, AnalysisError> + Sync,
{
    let logs: Vec<&ParticipantLog> = population.values().collect();
    if logs.is_empty() {
        return Vec::new();
    }
    let chunk_size = logs.len().div_ceil(workers);

    std::thread::scope(|scope| {
        let handles: Vec<_> = logs
            .chunks(chunk_size)
            .map(|chunk| {
                let handle = scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|log| (log.participant_id.clone(), isolate(analyze, log)))
                        .collect::<Vec<_>>()
                });
                (chunk, handle)
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|(chunk, handle)| match handle.join() {
                Ok(results) => results,
                Err(_) => chunk
                    .iter()
                    .map(|log| {
                        (
                            log.participant_id.clone(),
                            Err(AnalysisError::CorruptLog(
                                "analysis worker panicked".to_string(),
                            )),
                        )
                    })
                    .collect(),
            })
            .collect()
    })
}

/// Run one participant's analysis, turning a panic into a `CorruptLog`
/// for that participant only
fn isolate<F>(analyze: &F, log: &ParticipantLog) -> Result<ParticipantReport, AnalysisError>
where
    F: Fn(&ParticipantLog) -> Result<ParticipantReport, AnalysisError>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(|| analyze(log))) {
        Ok(result) => result,
        Err(_) => Err(AnalysisError::CorruptLog(format!(
            "analysis panicked for participant {}",
            log.participant_id
        ))),
    }
}
