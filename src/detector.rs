//! Suspicious interval detection
//!
//! Finds spans of mouse inactivity or page absence that end with resumed
//! activity. Each such end point anchors a rule window downstream.

use crate::types::{EventType, GameEvent, IntervalKind, ParticipantLog, Phase, SuspiciousInterval};
use tracing::debug;

/// Detector for suspicious intervals in one participant's log
pub struct SequenceDetector;

impl SequenceDetector {
    /// Suspicious intervals of one phase, ascending by end timestamp
    ///
    /// Each `mouse_inactive_start` pairs with the next `mouse_active` after
    /// it and each `page_leave` with the next `page_return`; openers with no
    /// closer are dropped. Overlapping or nested pairs are all kept.
    pub fn detect(log: &ParticipantLog, phase: Phase) -> Vec<SuspiciousInterval> {
        let events: Vec<&GameEvent> = log.phase_events(phase).collect();

        let mut intervals = pair_events(
            &events,
            &EventType::MouseInactiveStart,
            &EventType::MouseActive,
            IntervalKind::MouseInactivity,
        );
        intervals.extend(pair_events(
            &events,
            &EventType::PageLeave,
            &EventType::PageReturn,
            IntervalKind::PageAbsence,
        ));

        // Stable: ties keep mouse-before-page, then log order
        intervals.sort_by_key(|i| i.end);

        debug!(
            participant = %log.participant_id,
            phase = phase.as_str(),
            intervals = intervals.len(),
            "suspicious intervals detected"
        );
        intervals
    }
}

/// Pair every opener with the first closer that follows it in the log
fn pair_events(
    events: &[&GameEvent],
    opener: &EventType,
    closer: &EventType,
    kind: IntervalKind,
) -> Vec<SuspiciousInterval> {
    let mut intervals = Vec::new();
    for (idx, event) in events.iter().enumerate() {
        if !event.is(opener) {
            continue;
        }
        let (Some(start), Some(end)) = (
            event.timestamp,
            events[idx + 1..]
                .iter()
                .find(|e| e.is(closer))
                .and_then(|e| e.timestamp),
        ) else {
            continue;
        };
        intervals.push(SuspiciousInterval { start, end, kind });
    }
    intervals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn ev(secs: i64, phase: Phase, event_type: EventType) -> GameEvent {
        GameEvent {
            timestamp: Some(at(secs)),
            participant_id: "p".to_string(),
            phase,
            event_type,
            anagram_shown: None,
            word: None,
            word_length: None,
            is_valid: None,
            details: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_pairs_both_kinds_sorted_by_end() {
        let log = ParticipantLog::new(
            "p",
            vec![
                ev(0, Phase::Main, EventType::PageLeave),
                ev(5, Phase::Main, EventType::MouseInactiveStart),
                ev(8, Phase::Main, EventType::MouseActive),
                ev(20, Phase::Main, EventType::PageReturn),
            ],
        );

        let intervals = SequenceDetector::detect(&log, Phase::Main);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].kind, IntervalKind::MouseInactivity);
        assert_eq!(intervals[0].end, at(8));
        assert_eq!(intervals[1].kind, IntervalKind::PageAbsence);
        assert_eq!(intervals[1].start, at(0));
        assert_eq!(intervals[1].end, at(20));
    }

    #[test]
    fn test_unclosed_opener_is_skipped() {
        let log = ParticipantLog::new(
            "p",
            vec![
                ev(0, Phase::Main, EventType::PageReturn),
                ev(5, Phase::Main, EventType::PageLeave),
            ],
        );
        assert!(SequenceDetector::detect(&log, Phase::Main).is_empty());
    }

    #[test]
    fn test_nested_openers_are_preserved() {
        // Two inactivity starts share the same closer: both intervals kept
        let log = ParticipantLog::new(
            "p",
            vec![
                ev(0, Phase::Main, EventType::MouseInactiveStart),
                ev(3, Phase::Main, EventType::MouseInactiveStart),
                ev(10, Phase::Main, EventType::MouseActive),
            ],
        );
        let intervals = SequenceDetector::detect(&log, Phase::Main);
        assert_eq!(intervals.len(), 2);
        assert!(intervals.iter().all(|i| i.end == at(10)));
        assert_eq!(intervals[0].start, at(0));
        assert_eq!(intervals[1].start, at(3));
    }

    #[test]
    fn test_phases_are_independent() {
        let log = ParticipantLog::new(
            "p",
            vec![
                ev(0, Phase::Practice, EventType::PageLeave),
                ev(10, Phase::Main, EventType::PageReturn),
            ],
        );
        assert!(SequenceDetector::detect(&log, Phase::Practice).is_empty());
        assert!(SequenceDetector::detect(&log, Phase::Main).is_empty());
    }

    #[test]
    fn test_untimed_events_do_not_pair() {
        let mut closer = ev(10, Phase::Main, EventType::PageReturn);
        closer.timestamp = None;
        let log = ParticipantLog::new("p", vec![ev(0, Phase::Main, EventType::PageLeave), closer]);
        assert!(SequenceDetector::detect(&log, Phase::Main).is_empty());
    }
}
