//! Rule-based cheating tagging
//!
//! For every suspicious interval, the words validated after it (up to the
//! next interval's end, or the end of the phase) form a window. Three
//! independent rules inspect that window:
//!
//! 1. **Length jump**: one of the first words is long (>= 7 letters).
//! 2. **Majority length**: more than half the words are >= 6 letters; all
//!    words in the window are flagged.
//! 3. **Majority speed**: more than half the words were produced within the
//!    calibrated window for their length; the fast words are flagged.
//!
//! Matches accumulate by set union and a word adds to the phase counter only
//! the first time it is flagged.

use crate::calibration::{seconds_between, DynamicWindow};
use crate::config::RuleConfig;
use crate::tags::{CheatingCounts, FlagReason, TagKey, WordTagStore};
use crate::types::{Phase, SuspiciousInterval, WordEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Audit record for one evaluated window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEvaluation {
    pub interval: SuspiciousInterval,
    /// Words considered (after excluding words already counted by rule 3)
    pub word_count: usize,
    /// Words flagged by rule 1
    pub length_jump: Vec<String>,
    pub majority_length: bool,
    pub majority_speed: bool,
    /// Words flagged by rule 3
    pub fast_words: Vec<String>,
    /// Words that went from unflagged to flagged in this window
    pub newly_flagged: u32,
}

/// Output of tagging one phase
#[derive(Debug, Clone)]
pub struct PhaseTagging {
    pub store: WordTagStore,
    pub counts: CheatingCounts,
    pub windows: Vec<WindowEvaluation>,
}

/// Applies the tagging rules against a calibrated window
pub struct RuleEngine<'a> {
    window: &'a DynamicWindow,
    config: &'a RuleConfig,
}

impl<'a> RuleEngine<'a> {
    pub fn new(window: &'a DynamicWindow, config: &'a RuleConfig) -> Self {
        Self { window, config }
    }

    /// Tag the words of one phase
    ///
    /// `intervals` must be ascending by end and `words` ascending by time;
    /// every word must already be registered in `store`. The store and
    /// counters are taken by value and handed back updated.
    pub fn tag_phase(
        &self,
        phase: Phase,
        intervals: &[SuspiciousInterval],
        words: &[WordEvent],
        mut store: WordTagStore,
        mut counts: CheatingCounts,
    ) -> PhaseTagging {
        let mut windows = Vec::with_capacity(intervals.len());

        for (idx, interval) in intervals.iter().enumerate() {
            let upper = intervals.get(idx + 1).map(|next| next.end);
            let in_window: Vec<(&WordEvent, TagKey)> = words
                .iter()
                .filter(|w| w.at > interval.end && upper.map_or(true, |u| w.at < u))
                .map(|w| (w, TagKey::new(w.word.clone(), phase)))
                .filter(|(_, key)| !store.is_counted_in_rule_three(key))
                .collect();

            if in_window.is_empty() {
                continue;
            }

            let evaluation = self.evaluate_window(interval, &in_window);

            let mut matched: BTreeSet<(usize, FlagReason)> = BTreeSet::new();
            for &i in &evaluation.length_jump_idx {
                matched.insert((i, FlagReason::LengthJump));
            }
            if evaluation.majority_length {
                matched.extend((0..in_window.len()).map(|i| (i, FlagReason::MajorityLength)));
            }
            if evaluation.majority_speed {
                matched.extend(evaluation.fast_idx.iter().map(|&i| (i, FlagReason::MajoritySpeed)));
            }

            let mut newly_flagged = 0;
            for (i, reason) in matched {
                let key = &in_window[i].1;
                if store.flag(key, reason, Some(interval.kind)) {
                    counts = counts.incremented(phase);
                    newly_flagged += 1;
                }
            }
            if evaluation.majority_speed {
                for &i in &evaluation.fast_idx {
                    store.mark_counted_in_rule_three(&in_window[i].1);
                }
            }

            debug!(
                phase = phase.as_str(),
                kind = ?interval.kind,
                words = in_window.len(),
                length_jump = evaluation.length_jump_idx.len(),
                majority_length = evaluation.majority_length,
                majority_speed = evaluation.majority_speed,
                newly_flagged,
                "rule window evaluated"
            );

            let names = |idx: &[usize]| -> Vec<String> {
                idx.iter().map(|&i| in_window[i].0.word.clone()).collect()
            };
            windows.push(WindowEvaluation {
                interval: *interval,
                word_count: in_window.len(),
                length_jump: names(&evaluation.length_jump_idx),
                majority_length: evaluation.majority_length,
                majority_speed: evaluation.majority_speed,
                fast_words: if evaluation.majority_speed {
                    names(&evaluation.fast_idx)
                } else {
                    Vec::new()
                },
                newly_flagged,
            });
        }

        PhaseTagging {
            store,
            counts,
            windows,
        }
    }

    fn evaluate_window(
        &self,
        interval: &SuspiciousInterval,
        in_window: &[(&WordEvent, TagKey)],
    ) -> RuleMatches {
        let n = in_window.len();

        // Rule 1
        let length_jump_idx: Vec<usize> = in_window
            .iter()
            .take(self.config.length_jump_positions)
            .enumerate()
            .filter(|(_, (w, _))| w.length >= self.config.length_jump_min_length)
            .map(|(i, _)| i)
            .collect();

        // Rule 2
        let long_words = in_window
            .iter()
            .filter(|(w, _)| w.length >= self.config.majority_length_min_length)
            .count();
        let majority_length = is_majority(long_words, n);

        // Rule 3: creation time from the previous word, or the interval end
        let mut previous = interval.end;
        let mut fast_idx = Vec::new();
        for (i, (w, _)) in in_window.iter().enumerate() {
            let gap = seconds_between(previous, w.at);
            if gap <= self.window.threshold_for(w.length) {
                fast_idx.push(i);
            }
            previous = w.at;
        }
        let majority_speed = is_majority(fast_idx.len(), n);

        RuleMatches {
            length_jump_idx,
            majority_length,
            fast_idx,
            majority_speed,
        }
    }
}

struct RuleMatches {
    length_jump_idx: Vec<usize>,
    majority_length: bool,
    fast_idx: Vec<usize>,
    majority_speed: bool,
}

/// Strictly more than half
fn is_majority(count: usize, total: usize) -> bool {
    total > 0 && count * 2 > total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntervalKind;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn interval(end: i64) -> SuspiciousInterval {
        SuspiciousInterval {
            start: at(end - 30),
            end: at(end),
            kind: IntervalKind::PageAbsence,
        }
    }

    fn word(secs: i64, text: &str) -> WordEvent {
        WordEvent {
            at: at(secs),
            word: text.to_string(),
            length: text.len() as u32,
            is_valid: true,
            phase: Phase::Main,
        }
    }

    /// Fallback thresholds: 5 -> 10s, 6 -> 15s, 7 -> 20s, 8 -> 25s
    fn slow_window() -> DynamicWindow {
        DynamicWindow::default()
    }

    fn run(intervals: &[SuspiciousInterval], words: &[WordEvent]) -> PhaseTagging {
        let window = slow_window();
        let config = RuleConfig::default();
        let engine = RuleEngine::new(&window, &config);
        let mut store = WordTagStore::new();
        for w in words {
            store.register(w);
        }
        engine.tag_phase(Phase::Main, intervals, words, store, CheatingCounts::default())
    }

    fn flagged(result: &PhaseTagging, text: &str) -> bool {
        result.store.is_flagged(&TagKey::new(text, Phase::Main))
    }

    #[test]
    fn test_rule_one_flags_long_first_word() {
        // 100s gap keeps rule 3 quiet (8-letter threshold is 25s)
        let words = vec![word(100, "ABLATION")];
        let result = run(&[interval(0)], &words);

        assert!(flagged(&result, "ABLATION"));
        assert_eq!(result.counts.main, 1);
        assert_eq!(result.windows[0].length_jump, vec!["ABLATION".to_string()]);
    }

    #[test]
    fn test_rule_one_ignores_short_first_word() {
        let words = vec![word(100, "TABLE")];
        let result = run(&[interval(0)], &words);

        assert!(!flagged(&result, "TABLE"));
        assert_eq!(result.counts.main, 0);
    }

    #[test]
    fn test_rule_one_flags_long_second_word() {
        let words = vec![word(100, "TABLE"), word(200, "ABLATION")];
        let result = run(&[interval(0)], &words);

        assert_eq!(result.windows[0].length_jump, vec!["ABLATION".to_string()]);
        assert!(!result.windows[0].majority_length);
        assert!(!result.windows[0].majority_speed);
        assert!(flagged(&result, "ABLATION"));
        assert!(!flagged(&result, "TABLE"));
        assert_eq!(result.counts.main, 1);
    }

    #[test]
    fn test_rule_one_checks_second_position_only() {
        // Third word is long but only the first two positions count
        let words = vec![
            word(100, "TABLE"),
            word(200, "STABLE"),
            word(300, "BALLOTS"),
        ];
        let result = run(&[interval(0)], &words);

        assert!(result.windows[0].length_jump.is_empty());
        let tag = result.store.get(&TagKey::new("BALLOTS", Phase::Main)).unwrap();
        assert!(!tag.reasons.contains(&FlagReason::LengthJump));
        // Rule 2: 2 of 3 are >= 6, so all three are flagged anyway
        assert!(flagged(&result, "TABLE"));
        assert_eq!(result.counts.main, 3);
    }

    #[test]
    fn test_rule_two_majority_flags_all() {
        let words = vec![
            word(100, "TABLE"),
            word(200, "STABLE"),
            word(300, "BLEATS"),
            word(400, "ABLEST"),
            word(500, "BEAST"),
        ];
        let result = run(&[interval(0)], &words);

        for w in &words {
            assert!(flagged(&result, &w.word), "{} should be flagged", w.word);
        }
        assert_eq!(result.counts.main, 5);
        assert!(result.windows[0].majority_length);
    }

    #[test]
    fn test_rule_two_minority_flags_none() {
        let words = vec![
            word(100, "TABLE"),
            word(200, "STABLE"),
            word(300, "BLEATS"),
            word(400, "BEAST"),
            word(500, "BATES"),
        ];
        let result = run(&[interval(0)], &words);

        assert_eq!(result.counts.main, 0);
        assert!(!result.windows[0].majority_length);
    }

    #[test]
    fn test_rule_three_flags_fast_majority() {
        // 5-letter threshold is 10s: 3s and 4s are fast, 100s is not
        let words = vec![word(3, "TABLE"), word(7, "BEAST"), word(107, "BATES")];
        let result = run(&[interval(0)], &words);

        assert!(flagged(&result, "TABLE"));
        assert!(flagged(&result, "BEAST"));
        assert!(!flagged(&result, "BATES"));
        assert_eq!(result.counts.main, 2);

        let tag = result.store.get(&TagKey::new("TABLE", Phase::Main)).unwrap();
        assert!(tag.counted_in_rule_three);
        assert!(tag.reasons.contains(&FlagReason::MajoritySpeed));
    }

    #[test]
    fn test_rule_three_minority_not_flagged() {
        let words = vec![word(3, "TABLE"), word(100, "BEAST"), word(200, "BATES")];
        let result = run(&[interval(0)], &words);
        assert_eq!(result.counts.main, 0);
    }

    #[test]
    fn test_union_counts_each_word_once() {
        // Rule 1, 2 and 3 all hit ABLATION
        let words = vec![word(2, "ABLATION"), word(4, "STABLE")];
        let result = run(&[interval(0)], &words);

        assert_eq!(result.counts.main, 2);
        let tag = result.store.get(&TagKey::new("ABLATION", Phase::Main)).unwrap();
        assert_eq!(tag.reasons.len(), 3);
    }

    #[test]
    fn test_window_stops_at_next_interval_end() {
        // Word at 150 belongs to the second interval's window only
        let words = vec![word(100, "TABLE"), word(150, "ABLATION")];
        let result = run(&[interval(0), interval(120)], &words);

        assert_eq!(result.windows.len(), 2);
        assert_eq!(result.windows[0].word_count, 1);
        assert_eq!(result.windows[1].word_count, 1);
        assert!(flagged(&result, "ABLATION"));
        assert!(!flagged(&result, "TABLE"));
    }

    #[test]
    fn test_words_at_interval_end_are_excluded() {
        let words = vec![word(0, "ABLATION")];
        let result = run(&[interval(0)], &words);
        assert!(result.windows.is_empty());
        assert_eq!(result.counts.main, 0);
    }

    #[test]
    fn test_already_flagged_word_not_recounted() {
        let words = vec![word(100, "ABLATION")];
        let window = slow_window();
        let config = RuleConfig::default();
        let engine = RuleEngine::new(&window, &config);
        let mut store = WordTagStore::new();
        let key = store.register(&words[0]);
        store.flag(&key, FlagReason::Confession, None);

        let result = engine.tag_phase(
            Phase::Main,
            &[interval(0)],
            &words,
            store,
            CheatingCounts::default(),
        );
        assert_eq!(result.counts.main, 0);
        assert!(result
            .store
            .get(&key)
            .unwrap()
            .reasons
            .contains(&FlagReason::LengthJump));
    }

    #[test]
    fn test_rule_three_words_skipped_by_later_windows() {
        // TABLE is fast in the first window; its repeat after the second
        // interval is excluded, leaving BEAST alone (slow, 5 letters)
        let words = vec![
            word(2, "TABLE"),
            word(4, "BATES"),
            word(200, "TABLE"),
            word(400, "BEAST"),
        ];
        let result = run(&[interval(0), interval(100)], &words);

        assert_eq!(result.windows[1].word_count, 1);
        assert_eq!(result.counts.main, 2);
    }

    #[test]
    fn test_no_intervals_no_flags() {
        let words = vec![word(1, "ABLATION")];
        let result = run(&[], &words);
        assert!(result.windows.is_empty());
        assert_eq!(result.counts, CheatingCounts::default());
    }
}
