//! Event log adapter
//!
//! Parses the upstream event export (NDJSON, JSON array, or CSV) into raw
//! records, then adapts them into typed events grouped per participant.
//! A single malformed row never aborts ingestion: it is skipped and counted.

use crate::error::AnalysisError;
use crate::types::{
    parse_bool_text, parse_u32_text, EventType, GameEvent, ParticipantLog, Phase, Population,
    RawEventRecord,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Raw records plus the lines that could not be parsed
#[derive(Debug, Default)]
pub struct ParsedRecords {
    pub records: Vec<RawEventRecord>,
    /// (1-based line/row number, parse error)
    pub skipped: Vec<(usize, String)>,
}

/// Counters describing how raw records were adapted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptSummary {
    pub records_in: usize,
    pub events_out: usize,
    pub participants: usize,
    /// Records dropped because they carry no participant id
    pub missing_participant: usize,
    /// Events kept but excluded from timing computations
    pub bad_timestamps: usize,
}

/// Adapter for converting raw export rows into participant logs
pub struct EventLogAdapter;

impl EventLogAdapter {
    /// Parse a JSON string containing an array of records
    pub fn parse_array(json: &str) -> Result<Vec<RawEventRecord>, AnalysisError> {
        let records: Vec<RawEventRecord> = serde_json::from_str(json)?;
        Ok(records)
    }

    /// Parse NDJSON (one record per line), skipping malformed lines
    pub fn parse_ndjson(ndjson: &str) -> ParsedRecords {
        let mut parsed = ParsedRecords::default();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawEventRecord>(trimmed) {
                Ok(record) => parsed.records.push(record),
                Err(e) => {
                    warn!(line = line_num + 1, error = %e, "skipping malformed event line");
                    parsed.skipped.push((line_num + 1, e.to_string()));
                }
            }
        }
        parsed
    }

    /// Parse a CSV export with a header row, skipping malformed rows
    ///
    /// The `details` column, when present, must hold JSON text.
    pub fn parse_csv(csv_text: &str) -> Result<ParsedRecords, AnalysisError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(csv_text.as_bytes());

        let headers = reader.headers()?;
        if !headers
            .iter()
            .any(|h| h == "eventType" || h == "event_type")
        {
            return Err(AnalysisError::ParseError(
                "csv header has no eventType column".to_string(),
            ));
        }

        let mut parsed = ParsedRecords::default();
        for (idx, row) in reader.deserialize::<CsvEventRow>().enumerate() {
            // Header is row 1
            let row_num = idx + 2;
            match row {
                Ok(row) => parsed.records.push(row.into_record()),
                Err(e) => {
                    warn!(row = row_num, error = %e, "skipping malformed csv row");
                    parsed.skipped.push((row_num, e.to_string()));
                }
            }
        }
        Ok(parsed)
    }

    /// Adapt one raw record into a typed event
    pub fn to_event(record: &RawEventRecord) -> Result<GameEvent, AnalysisError> {
        let participant_id = record
            .prolific_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AnalysisError::MissingField("prolificId".to_string()))?;

        let timestamp = match record.timestamp.as_deref() {
            Some(raw) => match parse_timestamp(raw) {
                Ok(ts) => Some(ts),
                Err(e) => {
                    debug!(participant = participant_id, error = %e, "event timestamp unusable");
                    None
                }
            },
            None => None,
        };

        Ok(GameEvent {
            timestamp,
            participant_id: participant_id.to_string(),
            phase: record
                .phase
                .as_deref()
                .map(Phase::from_raw)
                .unwrap_or(Phase::Other),
            event_type: EventType::from_raw(&record.event_type),
            anagram_shown: record.anagram_shown.clone(),
            word: record.word.clone(),
            word_length: record.word_length,
            is_valid: record.is_valid,
            details: record.details.clone(),
        })
    }

    /// Group raw records into per-participant logs
    pub fn to_population(records: &[RawEventRecord]) -> (Population, AdaptSummary) {
        let mut grouped: BTreeMap<String, Vec<GameEvent>> = BTreeMap::new();
        let mut summary = AdaptSummary {
            records_in: records.len(),
            ..AdaptSummary::default()
        };

        for (idx, record) in records.iter().enumerate() {
            match Self::to_event(record) {
                Ok(event) => {
                    if event.timestamp.is_none() {
                        summary.bad_timestamps += 1;
                    }
                    summary.events_out += 1;
                    grouped
                        .entry(event.participant_id.clone())
                        .or_default()
                        .push(event);
                }
                Err(e) => {
                    warn!(record = idx, error = %e, "dropping record");
                    summary.missing_participant += 1;
                }
            }
        }

        if summary.bad_timestamps > 0 {
            warn!(
                count = summary.bad_timestamps,
                "events with missing or malformed timestamps excluded from timing analysis"
            );
        }

        let population: Population = grouped
            .into_iter()
            .map(|(id, events)| {
                let log = ParticipantLog::new(id.clone(), events);
                (id, log)
            })
            .collect();
        summary.participants = population.len();

        (population, summary)
    }

    /// Check a batch of records without adapting them
    pub fn validate_records(records: &[RawEventRecord]) -> Vec<RecordIssue> {
        let mut issues = Vec::new();
        for (index, record) in records.iter().enumerate() {
            let participant_id = record.prolific_id.clone().filter(|s| !s.trim().is_empty());
            let mut push = |kind: RecordIssueKind| {
                issues.push(RecordIssue {
                    index,
                    participant_id: participant_id.clone(),
                    kind,
                })
            };

            if participant_id.is_none() {
                push(RecordIssueKind::MissingParticipantId);
            }

            match record.timestamp.as_deref() {
                None => push(RecordIssueKind::MissingTimestamp),
                Some(raw) => {
                    if parse_timestamp(raw).is_err() {
                        push(RecordIssueKind::MalformedTimestamp(raw.to_string()));
                    }
                }
            }

            if let Some(phase) = record.phase.as_deref() {
                if Phase::from_raw(phase) == Phase::Other && !phase.trim().is_empty() {
                    push(RecordIssueKind::UnknownPhase(phase.to_string()));
                }
            }

            if EventType::from_raw(&record.event_type) == EventType::WordValidation {
                let missing_word = record
                    .word
                    .as_deref()
                    .map(|w| w.trim().is_empty())
                    .unwrap_or(true);
                if missing_word || record.word_length.is_none() {
                    push(RecordIssueKind::IncompleteWordEvent);
                }
            }
        }
        issues
    }
}

/// A problem found in a raw record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordIssue {
    /// 0-based record index
    pub index: usize,
    pub participant_id: Option<String>,
    pub kind: RecordIssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordIssueKind {
    MissingParticipantId,
    MissingTimestamp,
    MalformedTimestamp(String),
    UnknownPhase(String),
    /// Word-validation event without word text or length
    IncompleteWordEvent,
}

impl std::fmt::Display for RecordIssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordIssueKind::MissingParticipantId => write!(f, "missing participant id"),
            RecordIssueKind::MissingTimestamp => write!(f, "missing timestamp"),
            RecordIssueKind::MalformedTimestamp(raw) => write!(f, "malformed timestamp {raw:?}"),
            RecordIssueKind::UnknownPhase(raw) => write!(f, "unknown phase {raw:?}"),
            RecordIssueKind::IncompleteWordEvent => {
                write!(f, "word validation event without word or length")
            }
        }
    }
}

/// Parse an ISO-8601 timestamp
///
/// Accepts RFC 3339 with offset, and naive date-times (`T` or space
/// separated, optional fractional seconds) which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, AnalysisError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AnalysisError::TimestampError("empty timestamp".to_string()));
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(AnalysisError::TimestampError(format!(
        "unrecognized timestamp {trimmed:?}"
    )))
}

/// CSV row shape; every cell is text so spreadsheet quirks can be absorbed
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsvEventRow {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, alias = "prolific_id", alias = "participantId")]
    prolific_id: Option<String>,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, alias = "anagram_shown")]
    anagram_shown: Option<String>,
    #[serde(alias = "event_type")]
    event_type: String,
    #[serde(default)]
    word: Option<String>,
    #[serde(default, alias = "word_length")]
    word_length: Option<String>,
    #[serde(default, alias = "is_valid")]
    is_valid: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

impl CsvEventRow {
    fn into_record(self) -> RawEventRecord {
        let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());
        let details = non_empty(self.details)
            .map(|text| {
                serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
            })
            .unwrap_or(serde_json::Value::Null);

        RawEventRecord {
            timestamp: non_empty(self.timestamp),
            prolific_id: non_empty(self.prolific_id),
            phase: non_empty(self.phase),
            anagram_shown: non_empty(self.anagram_shown),
            event_type: self.event_type,
            word: non_empty(self.word),
            word_length: self.word_length.as_deref().and_then(parse_u32_text),
            is_valid: self.is_valid.as_deref().and_then(parse_bool_text),
            details,
        }
    }
}
