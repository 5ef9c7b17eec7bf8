//! Anagram Integrity - post-hoc cheating detection for word-creation game logs
//!
//! The engine turns raw behavioral event logs into per-participant integrity
//! metrics through a deterministic pipeline: population calibration →
//! suspicious interval detection → rule-based word tagging → confession
//! reconciliation → metrics aggregation.
//!
//! ## Modules
//!
//! - **Ingestion**: parse NDJSON / JSON / CSV exports into participant logs
//! - **Analysis**: calibrate, detect, tag, reconcile and aggregate
//! - **Export**: batch reports and an aggregate CSV table with survey join

pub mod adapter;
pub mod calibration;
pub mod config;
pub mod confession;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod rules;
pub mod table;
pub mod tags;
pub mod types;

pub use adapter::{AdaptSummary, EventLogAdapter, ParsedRecords, RecordIssue, RecordIssueKind};
pub use calibration::{DynamicWindow, WindowCalibrator, WindowEntry, WindowSource};
pub use config::EngineConfig;
pub use confession::{Confession, ConfessionReconciler};
pub use detector::SequenceDetector;
pub use error::AnalysisError;
pub use metrics::{MetricsAggregator, ParticipantMetrics};
pub use pipeline::{analyze_participant, BatchAnalyzer, BatchReport, ParticipantReport};
pub use rules::RuleEngine;
pub use table::{AggregateTable, SurveyTable};
pub use tags::{CheatingCounts, FlagReason, TagKey, WordTag, WordTagStore};
pub use types::{EventType, GameEvent, ParticipantLog, Phase, Population, RawEventRecord};

/// Engine version embedded in every batch report
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for batch reports
pub const PRODUCER_NAME: &str = "anagram-integrity";
