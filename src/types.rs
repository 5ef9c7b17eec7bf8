//! Event and interval types
//!
//! This module defines the records that flow from the raw study export into
//! the analysis pipeline: raw input rows, typed game events, per-participant
//! logs, and the suspicious intervals derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Gameplay phase an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Tutorial / practice round
    Practice,
    /// Main (rewarded) round
    Main,
    /// Anything outside the two analyzed rounds (consent, survey, debrief)
    Other,
}

impl Phase {
    /// Map the free-form phase label used by the game service
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "practice" | "tutorial" | "practice_round" | "tutorial_round" => Phase::Practice,
            "main" | "main_game" | "main_round" | "game" => Phase::Main,
            _ => Phase::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Practice => "practice",
            Phase::Main => "main",
            Phase::Other => "other",
        }
    }
}

/// Event types emitted by the game client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A word was submitted and checked against the dictionary
    WordValidation,
    MouseInactiveStart,
    MouseActive,
    PageLeave,
    PageReturn,
    /// The persuasion message was displayed
    MessageShown,
    /// The participant finished reading the message
    MessageReadComplete,
    /// End-of-study self report of external help
    CheatingConfession,
    /// For event types the engine does not interpret
    #[serde(untagged)]
    Other(String),
}

impl EventType {
    /// Map the free-form event type label used by the game service
    pub fn from_raw(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "word_validation" | "validate_word" | "word_submitted" | "word_submit" => {
                EventType::WordValidation
            }
            "mouse_inactive_start" | "mouse_inactive" => EventType::MouseInactiveStart,
            "mouse_active" | "mouse_active_again" => EventType::MouseActive,
            "page_leave" | "page_hidden" => EventType::PageLeave,
            "page_return" | "page_visible" => EventType::PageReturn,
            "message_shown" | "show_message" => EventType::MessageShown,
            "message_read_complete" | "message_read" => EventType::MessageReadComplete,
            "cheating_confession" | "confessed_external_help" | "external_help_confession" => {
                EventType::CheatingConfession
            }
            _ => EventType::Other(normalized),
        }
    }
}

/// One row of the upstream event export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventRecord {
    /// ISO-8601 timestamp (kept as text; parsed during adaptation)
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Participant identifier
    #[serde(default, alias = "prolific_id", alias = "participantId")]
    pub prolific_id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default, alias = "anagram_shown")]
    pub anagram_shown: Option<String>,
    #[serde(alias = "event_type")]
    pub event_type: String,
    #[serde(default)]
    pub word: Option<String>,
    #[serde(default, alias = "word_length", deserialize_with = "lenient_u32")]
    pub word_length: Option<u32>,
    #[serde(default, alias = "is_valid", deserialize_with = "lenient_bool")]
    pub is_valid: Option<bool>,
    /// Event-type specific payload
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Accept `6`, `6.0`, or `"6"` for numeric columns exported by spreadsheets
fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => parse_u32_text(&s),
        _ => None,
    }))
}

/// Accept `true`, `"True"`, `"1"`, or `1` for boolean columns
fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Bool(b) => Some(b),
        serde_json::Value::Number(n) => n.as_i64().map(|n| n != 0),
        serde_json::Value::String(s) => parse_bool_text(&s),
        _ => None,
    }))
}

pub(crate) fn parse_u32_text(text: &str) -> Option<u32> {
    let trimmed = text.trim();
    trimmed.parse::<u32>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u32::MAX as f64)
            .map(|f| f as u32)
    })
}

pub(crate) fn parse_bool_text(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// A typed game event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEvent {
    /// Parsed timestamp; `None` when the raw value was missing or malformed
    pub timestamp: Option<DateTime<Utc>>,
    pub participant_id: String,
    pub phase: Phase,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anagram_shown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_valid: Option<bool>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// View of a word-validation event with everything the rules need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordEvent {
    pub at: DateTime<Utc>,
    /// Normalized (trimmed, upper-case) word text
    pub word: String,
    pub length: u32,
    pub is_valid: bool,
    pub phase: Phase,
}

impl GameEvent {
    pub fn is(&self, event_type: &EventType) -> bool {
        &self.event_type == event_type
    }

    /// Word-validation view; `None` when the event cannot be tagged
    /// (not a word event, no timestamp, or missing word/length)
    pub fn as_word_event(&self) -> Option<WordEvent> {
        if self.event_type != EventType::WordValidation {
            return None;
        }
        let at = self.timestamp?;
        let word = normalize_word(self.word.as_deref()?)?;
        let length = self.word_length?;
        Some(WordEvent {
            at,
            word,
            length,
            is_valid: self.is_valid.unwrap_or(false),
            phase: self.phase,
        })
    }
}

/// Trim and upper-case a word; empty words are rejected
pub fn normalize_word(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// All events of one participant
///
/// Timed events are sorted ascending by timestamp (stable, so ties keep
/// their export order); events without a usable timestamp are kept apart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantLog {
    pub participant_id: String,
    timed: Vec<GameEvent>,
    untimed: Vec<GameEvent>,
}

impl ParticipantLog {
    pub fn new(participant_id: impl Into<String>, events: Vec<GameEvent>) -> Self {
        let (mut timed, untimed): (Vec<_>, Vec<_>) =
            events.into_iter().partition(|e| e.timestamp.is_some());
        timed.sort_by_key(|e| e.timestamp);
        Self {
            participant_id: participant_id.into(),
            timed,
            untimed,
        }
    }

    /// Timestamped events, ascending
    pub fn timed(&self) -> &[GameEvent] {
        &self.timed
    }

    /// Events whose timestamp was missing or malformed
    pub fn untimed(&self) -> &[GameEvent] {
        &self.untimed
    }

    /// Timestamped events of one phase, ascending
    pub fn phase_events(&self, phase: Phase) -> impl Iterator<Item = &GameEvent> {
        self.timed.iter().filter(move |e| e.phase == phase)
    }

    /// Every event regardless of timestamp
    pub fn all_events(&self) -> impl Iterator<Item = &GameEvent> {
        self.timed.iter().chain(self.untimed.iter())
    }

    pub fn len(&self) -> usize {
        self.timed.len() + self.untimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every participant's log, keyed (and therefore ordered) by participant id
pub type Population = BTreeMap<String, ParticipantLog>;

/// Kind of activity gap anchoring a suspicious interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    MouseInactivity,
    PageAbsence,
}

/// A span of absence or inactivity followed by resumed activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousInterval {
    /// When the absence/inactivity began
    pub start: DateTime<Utc>,
    /// When activity resumed; rule windows open here
    pub end: DateTime<Utc>,
    pub kind: IntervalKind,
}
