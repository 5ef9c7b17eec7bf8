//! Per-participant metrics aggregation
//!
//! Reduces the final tag store plus the raw activity signals (page absence,
//! mouse inactivity, message reading) into one immutable metrics record.

use crate::calibration::seconds_between;
use crate::config::ScoringConfig;
use crate::confession::{Confession, Reconciliation};
use crate::tags::{FlagReason, WordTag, WordTagStore};
use crate::types::{EventType, GameEvent, IntervalKind, ParticipantLog, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Practice-round summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PracticePhaseMetrics {
    pub total_words: usize,
    pub flagged_words: u32,
    pub cheating_rate: f64,
}

/// Main-round summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainPhaseMetrics {
    pub total_words: usize,
    pub flagged_words: u32,
    pub cheating_rate: f64,
    pub lying_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfessedCheating {
    pub used_external_resources: bool,
    pub confessed_words_count: usize,
    pub words: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageNavigation {
    pub has_page_left: bool,
    pub page_leave_count: usize,
    /// Seconds
    pub total_time_page_left: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseInactivity {
    pub has_mouse_inactivity: bool,
    pub inactivity_count: usize,
    /// Seconds
    pub total_time_mouse_inactivity: f64,
}

/// Which persuasion message the participant saw and how long they read it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageExposure {
    pub message_id: Option<String>,
    pub theory: Option<String>,
    /// Seconds; 0 when either event is missing
    pub time_spent_reading: f64,
}

/// Audit view of one word tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagListing {
    pub word: String,
    pub length: u32,
    pub is_valid: bool,
    pub timestamp: DateTime<Utc>,
    /// Phase-specific flag name
    pub flag_name: String,
    pub cheating: bool,
    pub reasons: BTreeSet<FlagReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchored_by: Option<IntervalKind>,
    pub counted_in_rule_three: bool,
    pub confessed: bool,
}

impl From<&WordTag> for TagListing {
    fn from(tag: &WordTag) -> Self {
        Self {
            word: tag.word.clone(),
            length: tag.length,
            is_valid: tag.is_valid,
            timestamp: tag.timestamp,
            flag_name: tag.flag_label().to_string(),
            cheating: tag.cheating,
            reasons: tag.reasons.clone(),
            anchored_by: tag.anchored_by,
            counted_in_rule_three: tag.counted_in_rule_three,
            confessed: tag.confessed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WordTagListings {
    pub practice: Vec<TagListing>,
    pub main: Vec<TagListing>,
}

/// Terminal output of one participant's pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantMetrics {
    pub participant_id: String,
    pub practice_round_phase: PracticePhaseMetrics,
    pub main_phase: MainPhaseMetrics,
    pub confessed_cheating: ConfessedCheating,
    pub page_navigation: PageNavigation,
    pub mouse_inactivity: MouseInactivity,
    pub performance_score_excluding_cheated_words: u32,
    pub performance_score_including_cheated_words: u32,
    pub message: MessageExposure,
    pub word_tags: WordTagListings,
}

/// Builds [`ParticipantMetrics`]
pub struct MetricsAggregator<'a> {
    scoring: &'a ScoringConfig,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(scoring: &'a ScoringConfig) -> Self {
        Self { scoring }
    }

    pub fn aggregate(
        &self,
        log: &ParticipantLog,
        confession: &Confession,
        reconciliation: &Reconciliation,
    ) -> ParticipantMetrics {
        let store = &reconciliation.store;
        let counts = reconciliation.counts;

        let practice_total = store.word_count(Phase::Practice);
        let main_total = store.word_count(Phase::Main);

        let (page_leave_count, page_time) = absence_time(log, &EventType::PageLeave);
        let (inactivity_count, inactive_time) = absence_time(log, &EventType::MouseInactiveStart);

        let (excluding, including) = self.performance_scores(store);

        ParticipantMetrics {
            participant_id: log.participant_id.clone(),
            practice_round_phase: PracticePhaseMetrics {
                total_words: practice_total,
                flagged_words: counts.practice,
                cheating_rate: ratio(counts.practice as usize, practice_total),
            },
            main_phase: MainPhaseMetrics {
                total_words: main_total,
                flagged_words: counts.main,
                cheating_rate: ratio(counts.main as usize, main_total),
                lying_rate: reconciliation.lying_rate,
            },
            confessed_cheating: ConfessedCheating {
                used_external_resources: confession.used_external_resources,
                confessed_words_count: confession.words.len(),
                words: confession.words.clone(),
            },
            page_navigation: PageNavigation {
                has_page_left: page_leave_count > 0,
                page_leave_count,
                total_time_page_left: page_time,
            },
            mouse_inactivity: MouseInactivity {
                has_mouse_inactivity: inactivity_count > 0,
                inactivity_count,
                total_time_mouse_inactivity: inactive_time,
            },
            performance_score_excluding_cheated_words: excluding,
            performance_score_including_cheated_words: including,
            message: message_exposure(log),
            word_tags: WordTagListings {
                practice: listings(store, Phase::Practice),
                main: listings(store, Phase::Main),
            },
        }
    }

    /// (excluding cheated, including cheated) over the main-round words
    pub fn performance_scores(&self, store: &WordTagStore) -> (u32, u32) {
        store
            .phase_tags(Phase::Main)
            .filter(|t| t.is_valid)
            .fold((0, 0), |(excluding, including), tag| {
                let reward = self.scoring.reward_for(tag.length);
                let honest = if tag.cheating { 0 } else { reward };
                (excluding + honest, including + reward)
            })
    }
}

fn listings(store: &WordTagStore, phase: Phase) -> Vec<TagListing> {
    store
        .phase_tags_chronological(phase)
        .into_iter()
        .map(TagListing::from)
        .collect()
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Count of `opener` events, and the summed gap from each timed opener to
/// the immediately following timed event of any type
fn absence_time(log: &ParticipantLog, opener: &EventType) -> (usize, f64) {
    let count = log.all_events().filter(|e| e.is(opener)).count();

    let timed = log.timed();
    let total = timed
        .windows(2)
        .filter(|pair| pair[0].is(opener))
        .filter_map(|pair| Some(seconds_between(pair[0].timestamp?, pair[1].timestamp?)))
        .sum();

    (count, total)
}

fn detail_text(event: &GameEvent, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match event.details.get(*key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Message id and theory from `message_shown`; reading time from the gap to
/// the following `message_read_complete`
fn message_exposure(log: &ParticipantLog) -> MessageExposure {
    let shown = log
        .timed()
        .iter()
        .chain(log.untimed())
        .find(|e| e.is(&EventType::MessageShown));
    let Some(shown) = shown else {
        return MessageExposure::default();
    };

    let read_complete = log
        .timed()
        .iter()
        .find(|e| {
            e.is(&EventType::MessageReadComplete)
                && match (shown.timestamp, e.timestamp) {
                    (Some(s), Some(r)) => r >= s,
                    _ => false,
                }
        });

    let time_spent_reading = match (shown.timestamp, read_complete.and_then(|e| e.timestamp)) {
        (Some(s), Some(r)) => seconds_between(s, r),
        _ => 0.0,
    };

    MessageExposure {
        message_id: detail_text(shown, &["messageId", "message_id", "id"]),
        theory: detail_text(shown, &["theory", "theoryTag", "theory_tag"]),
        time_spent_reading,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confession::ConfessionReconciler;
    use crate::tags::CheatingCounts;
    use crate::types::WordEvent;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn ev(secs: i64, event_type: EventType) -> GameEvent {
        GameEvent {
            timestamp: Some(at(secs)),
            participant_id: "p".to_string(),
            phase: Phase::Main,
            event_type,
            anagram_shown: None,
            word: None,
            word_length: None,
            is_valid: None,
            details: serde_json::Value::Null,
        }
    }

    fn store_with(words: &[(&str, bool, bool)]) -> WordTagStore {
        let mut store = WordTagStore::new();
        for (word, valid, flagged) in words {
            let key = store.register(&WordEvent {
                at: at(0),
                word: word.to_string(),
                length: word.len() as u32,
                is_valid: *valid,
                phase: Phase::Main,
            });
            if *flagged {
                store.flag(&key, FlagReason::MajorityLength, None);
            }
        }
        store
    }

    fn aggregate(log: &ParticipantLog, store: WordTagStore, main_flags: u32) -> ParticipantMetrics {
        let scoring = ScoringConfig::default();
        let confession = Confession::default();
        let reconciliation = ConfessionReconciler::reconcile(
            &confession,
            store,
            CheatingCounts { practice: 0, main: main_flags },
        );
        MetricsAggregator::new(&scoring).aggregate(log, &confession, &reconciliation)
    }

    #[test]
    fn test_scores_for_able_tables_scenario() {
        let scoring = ScoringConfig::default();
        // ABLE is scored as a 5-letter entry per its reported length
        let mut store = WordTagStore::new();
        store.register(&WordEvent {
            at: at(0),
            word: "ABLE".to_string(),
            length: 5,
            is_valid: true,
            phase: Phase::Main,
        });
        let tables = store.register(&WordEvent {
            at: at(10),
            word: "TABLES".to_string(),
            length: 6,
            is_valid: true,
            phase: Phase::Main,
        });
        store.flag(&tables, FlagReason::MajorityLength, None);

        let (excluding, including) = MetricsAggregator::new(&scoring).performance_scores(&store);
        assert_eq!(excluding, 2);
        assert_eq!(including, 6);
    }

    #[test]
    fn test_invalid_words_score_nothing() {
        let scoring = ScoringConfig::default();
        let store = store_with(&[("STABLE", false, false), ("ABLATION", true, false)]);
        let (excluding, including) = MetricsAggregator::new(&scoring).performance_scores(&store);
        assert_eq!((excluding, including), (8, 8));
    }

    #[test]
    fn test_including_score_dominates_excluding() {
        let scoring = ScoringConfig::default();
        let aggregator = MetricsAggregator::new(&scoring);

        let clean = store_with(&[("TABLE", true, false), ("BALLOTS", true, false)]);
        let (e, i) = aggregator.performance_scores(&clean);
        assert_eq!(e, i);

        let mixed = store_with(&[("TABLE", true, false), ("BALLOTS", true, true)]);
        let (e, i) = aggregator.performance_scores(&mixed);
        assert!(i > e);

        // A flagged invalid word does not break equality
        let invalid_flag = store_with(&[("TABLE", true, false), ("QQQQQQ", false, true)]);
        let (e, i) = aggregator.performance_scores(&invalid_flag);
        assert_eq!(e, i);
    }

    #[test]
    fn test_empty_log_yields_zeros() {
        let log = ParticipantLog::new("p", vec![]);
        let metrics = aggregate(&log, WordTagStore::new(), 0);

        assert_eq!(metrics.practice_round_phase.total_words, 0);
        assert_eq!(metrics.practice_round_phase.cheating_rate, 0.0);
        assert_eq!(metrics.main_phase.total_words, 0);
        assert_eq!(metrics.main_phase.cheating_rate, 0.0);
        assert_eq!(metrics.main_phase.lying_rate, 0.0);
        assert!(!metrics.confessed_cheating.used_external_resources);
        assert_eq!(metrics.performance_score_excluding_cheated_words, 0);
        assert_eq!(metrics.performance_score_including_cheated_words, 0);
        assert!(!metrics.page_navigation.has_page_left);
        assert_eq!(metrics.message, MessageExposure::default());
    }

    #[test]
    fn test_cheating_rate_per_phase() {
        let log = ParticipantLog::new("p", vec![]);
        let store = store_with(&[("TABLE", true, true), ("STABLE", true, false)]);
        let metrics = aggregate(&log, store, 1);
        assert_eq!(metrics.main_phase.cheating_rate, 0.5);
        assert_eq!(metrics.word_tags.main.len(), 2);
        assert_eq!(metrics.word_tags.main[0].flag_name, "cheating_tag_main_round");
    }

    #[test]
    fn test_absence_durations_use_next_event() {
        let log = ParticipantLog::new(
            "p",
            vec![
                ev(0, EventType::PageLeave),
                // Next event of any type closes the gap
                ev(12, EventType::MouseActive),
                ev(20, EventType::MouseInactiveStart),
                ev(25, EventType::PageReturn),
                ev(30, EventType::PageLeave),
                ev(33, EventType::PageReturn),
                // Trailing opener with nothing after it adds no time
                ev(40, EventType::MouseInactiveStart),
            ],
        );
        let metrics = aggregate(&log, WordTagStore::new(), 0);

        assert!(metrics.page_navigation.has_page_left);
        assert_eq!(metrics.page_navigation.page_leave_count, 2);
        assert_eq!(metrics.page_navigation.total_time_page_left, 15.0);
        assert!(metrics.mouse_inactivity.has_mouse_inactivity);
        assert_eq!(metrics.mouse_inactivity.inactivity_count, 2);
        assert_eq!(metrics.mouse_inactivity.total_time_mouse_inactivity, 5.0);
    }

    #[test]
    fn test_message_exposure() {
        let mut shown = ev(100, EventType::MessageShown);
        shown.details = json!({ "messageId": "msg-7", "theory": "social_norms" });
        let log = ParticipantLog::new(
            "p",
            vec![
                ev(50, EventType::MessageReadComplete),
                shown,
                ev(145, EventType::MessageReadComplete),
            ],
        );
        let metrics = aggregate(&log, WordTagStore::new(), 0);

        assert_eq!(metrics.message.message_id.as_deref(), Some("msg-7"));
        assert_eq!(metrics.message.theory.as_deref(), Some("social_norms"));
        assert_eq!(metrics.message.time_spent_reading, 45.0);
    }

    #[test]
    fn test_message_without_read_complete() {
        let mut shown = ev(100, EventType::MessageShown);
        shown.details = json!({ "message_id": 3 });
        let log = ParticipantLog::new("p", vec![shown]);
        let metrics = aggregate(&log, WordTagStore::new(), 0);

        assert_eq!(metrics.message.message_id.as_deref(), Some("3"));
        assert_eq!(metrics.message.time_spent_reading, 0.0);
    }

    #[test]
    fn test_metrics_serialize_with_camel_case() {
        let log = ParticipantLog::new("p", vec![]);
        let metrics = aggregate(&log, WordTagStore::new(), 0);
        let value = serde_json::to_value(&metrics).unwrap();

        assert!(value["practiceRoundPhase"]["totalWords"].is_number());
        assert!(value["mainPhase"]["lyingRate"].is_number());
        assert_eq!(value["confessedCheating"]["usedExternalResources"], false);
        assert!(value["pageNavigation"]["totalTimePageLeft"].is_number());
        assert!(value["mouseInactivity"]["hasMouseInactivity"].is_boolean());
        assert!(value["performanceScoreExcludingCheatedWords"].is_number());
        assert!(value["performanceScoreIncludingCheatedWords"].is_number());
    }
}
