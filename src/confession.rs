//! Confession reconciliation
//!
//! Merges the end-of-study "I used external help for these words" report
//! into the main-round tags and measures how many heuristically flagged
//! words went unconfessed.

use crate::tags::{CheatingCounts, FlagReason, TagKey, WordTagStore};
use crate::types::{normalize_word, EventType, GameEvent, ParticipantLog, Phase};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A participant's self report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confession {
    pub used_external_resources: bool,
    /// Normalized, de-duplicated words in the order they were named
    pub words: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfessionPayload {
    #[serde(
        default,
        alias = "used_external_resources",
        alias = "usedExternalHelp",
        alias = "cheated"
    )]
    used_external_resources: Option<bool>,
    #[serde(
        default,
        alias = "confessedWords",
        alias = "confessed_words",
        alias = "cheatedWords"
    )]
    words: Option<WordList>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WordList {
    List(Vec<String>),
    /// Comma or whitespace separated
    Text(String),
}

impl Confession {
    /// Locate and parse the confession event of a participant
    ///
    /// When several confession events exist the latest timed one wins.
    /// A missing event or unparsable payload means no confession.
    pub fn from_log(log: &ParticipantLog) -> Self {
        let is_confession = |e: &&GameEvent| e.is(&EventType::CheatingConfession);
        let event = log
            .timed()
            .iter()
            .rev()
            .find(is_confession)
            .or_else(|| log.untimed().iter().rev().find(is_confession));

        match event {
            Some(event) => Self::from_details(&event.details).unwrap_or_else(|| {
                debug!(participant = %log.participant_id, "confession payload not parseable");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Parse a confession payload; `details` may be an object or JSON text
    pub fn from_details(details: &serde_json::Value) -> Option<Self> {
        let parsed;
        let value = match details {
            serde_json::Value::String(text) => {
                parsed = serde_json::from_str::<serde_json::Value>(text).ok()?;
                &parsed
            }
            other => other,
        };
        if !value.is_object() {
            return None;
        }
        let payload: ConfessionPayload = serde_json::from_value(value.clone()).ok()?;

        let raw_words: Vec<String> = match payload.words {
            Some(WordList::List(list)) => list,
            Some(WordList::Text(text)) => text
                .split(|c: char| c == ',' || c.is_whitespace())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };

        let mut words: Vec<String> = Vec::new();
        for word in raw_words.iter().filter_map(|w| normalize_word(w)) {
            if !words.contains(&word) {
                words.push(word);
            }
        }

        Some(Self {
            used_external_resources: payload
                .used_external_resources
                .unwrap_or(!words.is_empty()),
            words,
        })
    }
}

/// Output of reconciliation
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub store: WordTagStore,
    pub counts: CheatingCounts,
    /// Main-round words flagged by the rules before reconciliation
    pub heuristic_flagged: usize,
    /// How many of those the participant confessed
    pub confessed_flagged: usize,
    /// Fraction of heuristic flags left unconfessed, in [0, 1]
    pub lying_rate: f64,
}

/// Merges confessions into the tag store
pub struct ConfessionReconciler;

impl ConfessionReconciler {
    /// Apply a confession to the main-round tags
    ///
    /// Confessed words that exist as main-round tags are marked confessed;
    /// those not yet flagged become flagged and add to the main counter.
    /// Nothing is ever un-flagged.
    pub fn reconcile(
        confession: &Confession,
        mut store: WordTagStore,
        mut counts: CheatingCounts,
    ) -> Reconciliation {
        let heuristic_flagged = store.flagged_count(Phase::Main);
        let mut confessed_flagged = 0;

        for word in &confession.words {
            let key = TagKey::new(word.clone(), Phase::Main);
            if !store.contains(&key) {
                continue;
            }
            if store.is_flagged(&key) {
                confessed_flagged += 1;
            } else if store.flag(&key, FlagReason::Confession, None) {
                counts = counts.incremented(Phase::Main);
            }
            store.mark_confessed(&key);
        }

        let lying_rate = lying_rate(confessed_flagged, heuristic_flagged);
        Reconciliation {
            store,
            counts,
            heuristic_flagged,
            confessed_flagged,
            lying_rate,
        }
    }
}

/// `1 - confessed / flagged`, clamped to [0, 1]; 0 when nothing was flagged
fn lying_rate(confessed_flagged: usize, total_flagged: usize) -> f64 {
    if total_flagged == 0 {
        return 0.0;
    }
    (1.0 - confessed_flagged as f64 / total_flagged as f64).clamp(0.0, 1.0)
}
