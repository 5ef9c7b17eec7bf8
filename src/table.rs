//! Aggregate table export
//!
//! Flattens every participant's metrics into one CSV row and optionally
//! left-joins survey responses keyed by participant id.

use crate::error::AnalysisError;
use crate::metrics::ParticipantMetrics;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::warn;

/// Default participant id column in survey exports
pub const DEFAULT_SURVEY_ID_COLUMN: &str = "prolificId";

/// Metric columns, in output order
pub const METRIC_COLUMNS: &[&str] = &[
    "prolificId",
    "practiceTotalWords",
    "practiceCheatingRate",
    "mainTotalWords",
    "mainCheatingRate",
    "mainLyingRate",
    "usedExternalResources",
    "confessedWordsCount",
    "confessedWords",
    "hasPageLeft",
    "totalTimePageLeft",
    "hasMouseInactivity",
    "totalTimeMouseInactivity",
    "performanceScoreExcludingCheatedWords",
    "performanceScoreIncludingCheatedWords",
    "messageId",
    "theory",
    "timeSpentReading",
];

fn metric_cells(m: &ParticipantMetrics) -> Vec<String> {
    vec![
        m.participant_id.clone(),
        m.practice_round_phase.total_words.to_string(),
        m.practice_round_phase.cheating_rate.to_string(),
        m.main_phase.total_words.to_string(),
        m.main_phase.cheating_rate.to_string(),
        m.main_phase.lying_rate.to_string(),
        m.confessed_cheating.used_external_resources.to_string(),
        m.confessed_cheating.confessed_words_count.to_string(),
        m.confessed_cheating.words.join(";"),
        m.page_navigation.has_page_left.to_string(),
        m.page_navigation.total_time_page_left.to_string(),
        m.mouse_inactivity.has_mouse_inactivity.to_string(),
        m.mouse_inactivity.total_time_mouse_inactivity.to_string(),
        m.performance_score_excluding_cheated_words.to_string(),
        m.performance_score_including_cheated_words.to_string(),
        m.message.message_id.clone().unwrap_or_default(),
        m.message.theory.clone().unwrap_or_default(),
        m.message.time_spent_reading.to_string(),
    ]
}

/// Survey responses indexed by participant id
#[derive(Debug, Clone, Default)]
pub struct SurveyTable {
    /// Survey columns other than the id column
    headers: Vec<String>,
    rows: HashMap<String, Vec<String>>,
}

impl SurveyTable {
    /// Read a survey CSV; `id_column` names the participant id header
    pub fn from_reader<R: Read>(reader: R, id_column: &str) -> Result<Self, AnalysisError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let header_row = reader.headers()?.clone();
        let id_idx = header_row
            .iter()
            .position(|h| h == id_column)
            .ok_or_else(|| {
                AnalysisError::TableError(format!("survey has no '{id_column}' column"))
            })?;

        let headers: Vec<String> = header_row
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != id_idx)
            .map(|(_, h)| h.to_string())
            .collect();

        let mut rows = HashMap::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let Some(id) = record.get(id_idx).filter(|id| !id.is_empty()) else {
                warn!(row = idx + 2, "survey row without participant id skipped");
                continue;
            };
            let cells: Vec<String> = (0..header_row.len())
                .filter(|i| *i != id_idx)
                .map(|i| record.get(i).unwrap_or_default().to_string())
                .collect();
            if rows.contains_key(id) {
                warn!(participant = id, "duplicate survey row ignored");
                continue;
            }
            rows.insert(id.to_string(), cells);
        }

        Ok(Self { headers, rows })
    }

    pub fn from_path(path: &Path, id_column: &str) -> Result<Self, AnalysisError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file, id_column)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn get(&self, participant_id: &str) -> Option<&[String]> {
        self.rows.get(participant_id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One row per participant, metrics first, survey columns after
#[derive(Debug, Clone, Default)]
pub struct AggregateTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl AggregateTable {
    pub fn from_metrics<'a, I>(metrics: I) -> Self
    where
        I: IntoIterator<Item = &'a ParticipantMetrics>,
    {
        Self {
            headers: METRIC_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: metrics.into_iter().map(metric_cells).collect(),
        }
    }

    /// Left-join survey columns; participants without a survey row get
    /// empty cells. Survey headers that clash with a metric column are
    /// prefixed with `survey_`.
    pub fn join_survey(mut self, survey: &SurveyTable) -> Self {
        for header in survey.headers() {
            if self.headers.contains(header) {
                self.headers.push(format!("survey_{header}"));
            } else {
                self.headers.push(header.clone());
            }
        }

        let blanks = vec![String::new(); survey.headers().len()];
        let mut unmatched = 0;
        for row in &mut self.rows {
            match survey.get(&row[0]) {
                Some(cells) => row.extend(cells.iter().cloned()),
                None => {
                    unmatched += 1;
                    row.extend(blanks.iter().cloned());
                }
            }
        }
        if unmatched > 0 {
            warn!(unmatched, "participants without survey responses");
        }
        self
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), AnalysisError> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String, AnalysisError> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        String::from_utf8(buf).map_err(|e| AnalysisError::TableError(e.to_string()))
    }

    pub fn write_to_path(&self, path: &Path) -> Result<(), AnalysisError> {
        let file = std::fs::File::create(path)?;
        self.write_csv(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{
        ConfessedCheating, MainPhaseMetrics, MessageExposure, MouseInactivity, PageNavigation,
        PracticePhaseMetrics, WordTagListings,
    };
    use pretty_assertions::assert_eq;

    fn metrics(id: &str, excluding: u32, including: u32) -> ParticipantMetrics {
        ParticipantMetrics {
            participant_id: id.to_string(),
            practice_round_phase: PracticePhaseMetrics {
                total_words: 2,
                flagged_words: 0,
                cheating_rate: 0.0,
            },
            main_phase: MainPhaseMetrics {
                total_words: 4,
                flagged_words: 1,
                cheating_rate: 0.25,
                lying_rate: 1.0,
            },
            confessed_cheating: ConfessedCheating {
                used_external_resources: false,
                confessed_words_count: 0,
                words: vec![],
            },
            page_navigation: PageNavigation {
                has_page_left: true,
                page_leave_count: 1,
                total_time_page_left: 12.5,
            },
            mouse_inactivity: MouseInactivity {
                has_mouse_inactivity: false,
                inactivity_count: 0,
                total_time_mouse_inactivity: 0.0,
            },
            performance_score_excluding_cheated_words: excluding,
            performance_score_including_cheated_words: including,
            message: MessageExposure::default(),
            word_tags: WordTagListings::default(),
        }
    }

    const SURVEY: &str = "prolificId,age,theory\np1,34,control\np3,29,norms\n";

    #[test]
    fn test_metric_row_shape() {
        let all = [metrics("p1", 6, 10)];
        let table = AggregateTable::from_metrics(&all);
        assert_eq!(table.headers().len(), METRIC_COLUMNS.len());
        assert_eq!(table.rows()[0].len(), METRIC_COLUMNS.len());
        assert_eq!(table.rows()[0][0], "p1");
        assert_eq!(table.rows()[0][4], "0.25");
        assert_eq!(table.rows()[0][13], "6");
        assert_eq!(table.rows()[0][14], "10");
    }

    #[test]
    fn test_survey_left_join() {
        let survey = SurveyTable::from_reader(SURVEY.as_bytes(), DEFAULT_SURVEY_ID_COLUMN).unwrap();
        assert_eq!(survey.len(), 2);

        let all = [metrics("p1", 6, 10), metrics("p2", 0, 0)];
        let table = AggregateTable::from_metrics(&all).join_survey(&survey);

        let n = METRIC_COLUMNS.len();
        assert_eq!(table.headers()[n], "age");
        // Clashes with the metric column of the same name
        assert_eq!(table.headers()[n + 1], "survey_theory");
        assert_eq!(table.rows()[0][n..].to_vec(), vec!["34", "control"]);
        assert_eq!(table.rows()[1][n..].to_vec(), vec!["", ""]);
        // Unmatched survey rows never add participants
        assert_eq!(table.rows().len(), 2);
    }

    #[test]
    fn test_custom_id_column() {
        let survey = SurveyTable::from_reader("pid,score\np1,7\n".as_bytes(), "pid").unwrap();
        assert_eq!(survey.get("p1"), Some(&["7".to_string()][..]));
        assert_eq!(survey.headers(), &["score".to_string()]);
    }

    #[test]
    fn test_missing_id_column_is_error() {
        let result = SurveyTable::from_reader(SURVEY.as_bytes(), "participant");
        assert!(matches!(result, Err(AnalysisError::TableError(_))));
    }

    #[test]
    fn test_write_csv_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregate.csv");
        let all = [metrics("p1", 6, 10)];
        AggregateTable::from_metrics(&all).write_to_path(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next().unwrap(), METRIC_COLUMNS.join(","));
        assert!(lines.next().unwrap().starts_with("p1,2,0,4,0.25,1,false,0,,true,12.5"));
    }
}
