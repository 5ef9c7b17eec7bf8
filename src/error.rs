//! Error types for the integrity engine

use thiserror::Error;

/// Errors that can occur while ingesting or analyzing event logs
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Failed to parse event log: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid CSV: {0}")]
    CsvError(#[from] csv::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Timestamp parse error: {0}")]
    TimestampError(String),

    #[error("Corrupt participant log: {0}")]
    CorruptLog(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Table error: {0}")]
    TableError(String),
}
