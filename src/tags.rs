//! Per-participant word tag store
//!
//! One [`WordTag`] exists per distinct `(word, phase)` pair. Tags are created
//! from word-validation events, flagged by the rule engine and the confession
//! reconciler, and never deleted or un-flagged.

use crate::types::{IntervalKind, Phase, WordEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Composite identity of a tag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagKey {
    pub word: String,
    pub phase: Phase,
}

impl TagKey {
    pub fn new(word: impl Into<String>, phase: Phase) -> Self {
        Self {
            word: word.into(),
            phase,
        }
    }
}

/// Why a word was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    /// Rule 1: long word among the first words after an interval
    LengthJump,
    /// Rule 2: most words in the window are long
    MajorityLength,
    /// Rule 3: most words in the window were produced faster than expected
    MajoritySpeed,
    /// The participant named the word in the end-of-study confession
    Confession,
}

/// Tag record for one word in one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTag {
    pub word: String,
    pub length: u32,
    pub phase: Phase,
    pub is_valid: bool,
    /// Timestamp of the first validation event for this word in this phase
    pub timestamp: DateTime<Utc>,
    pub cheating: bool,
    /// Every reason that matched, in rule order
    pub reasons: BTreeSet<FlagReason>,
    /// Interval kind that anchored the first rule flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchored_by: Option<IntervalKind>,
    pub counted_in_rule_three: bool,
    pub confessed: bool,
}

impl WordTag {
    /// Phase-specific name of the cheating flag used in study exports
    pub fn flag_label(&self) -> &'static str {
        match self.phase {
            Phase::Practice => "cheating_intention_tag",
            _ => "cheating_tag_main_round",
        }
    }
}

/// Keyed store of word tags for one participant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WordTagStore {
    tags: BTreeMap<TagKey, WordTag>,
}

impl WordTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the tag for a word event if this `(word, phase)` is new
    ///
    /// Returns the key either way. Later events for the same word never
    /// overwrite the first tag's length, validity, or timestamp.
    pub fn register(&mut self, word: &WordEvent) -> TagKey {
        let key = TagKey::new(word.word.clone(), word.phase);
        self.tags.entry(key.clone()).or_insert_with(|| WordTag {
            word: word.word.clone(),
            length: word.length,
            phase: word.phase,
            is_valid: word.is_valid,
            timestamp: word.at,
            cheating: false,
            reasons: BTreeSet::new(),
            anchored_by: None,
            counted_in_rule_three: false,
            confessed: false,
        });
        key
    }

    pub fn get(&self, key: &TagKey) -> Option<&WordTag> {
        self.tags.get(key)
    }

    pub fn contains(&self, key: &TagKey) -> bool {
        self.tags.contains_key(key)
    }

    /// Flag a word, recording the reason
    ///
    /// Returns `true` only when the tag goes from unflagged to flagged, so
    /// callers can count each word at most once. Unknown keys are ignored.
    pub fn flag(&mut self, key: &TagKey, reason: FlagReason, anchor: Option<IntervalKind>) -> bool {
        let Some(tag) = self.tags.get_mut(key) else {
            return false;
        };
        tag.reasons.insert(reason);
        if tag.anchored_by.is_none() {
            tag.anchored_by = anchor;
        }
        let newly_flagged = !tag.cheating;
        tag.cheating = true;
        newly_flagged
    }

    pub fn mark_counted_in_rule_three(&mut self, key: &TagKey) {
        if let Some(tag) = self.tags.get_mut(key) {
            tag.counted_in_rule_three = true;
        }
    }

    pub fn mark_confessed(&mut self, key: &TagKey) {
        if let Some(tag) = self.tags.get_mut(key) {
            tag.confessed = true;
        }
    }

    pub fn is_flagged(&self, key: &TagKey) -> bool {
        self.tags.get(key).map(|t| t.cheating).unwrap_or(false)
    }

    pub fn is_counted_in_rule_three(&self, key: &TagKey) -> bool {
        self.tags
            .get(key)
            .map(|t| t.counted_in_rule_three)
            .unwrap_or(false)
    }

    /// Tags of one phase, ordered by word
    pub fn phase_tags(&self, phase: Phase) -> impl Iterator<Item = &WordTag> {
        self.tags.values().filter(move |t| t.phase == phase)
    }

    /// Tags of one phase, ordered by first appearance
    pub fn phase_tags_chronological(&self, phase: Phase) -> Vec<&WordTag> {
        let mut tags: Vec<_> = self.phase_tags(phase).collect();
        tags.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.word.cmp(&b.word)));
        tags
    }

    pub fn word_count(&self, phase: Phase) -> usize {
        self.phase_tags(phase).count()
    }

    pub fn flagged_count(&self, phase: Phase) -> usize {
        self.phase_tags(phase).filter(|t| t.cheating).count()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Cheating counters threaded through the pipeline stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheatingCounts {
    pub practice: u32,
    pub main: u32,
}

impl CheatingCounts {
    pub fn get(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Practice => self.practice,
            Phase::Main => self.main,
            Phase::Other => 0,
        }
    }

    /// Return the counts with one more flagged word in `phase`
    #[must_use]
    pub fn incremented(self, phase: Phase) -> Self {
        match phase {
            Phase::Practice => Self {
                practice: self.practice + 1,
                ..self
            },
            Phase::Main => Self {
                main: self.main + 1,
                ..self
            },
            Phase::Other => self,
        }
    }
}
