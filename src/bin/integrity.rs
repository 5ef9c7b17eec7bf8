//! Integrity CLI - Command-line interface for Anagram Integrity
//!
//! Commands:
//! - analyze: Run the full batch analysis over an event export
//! - calibrate: Calibrate the expected-duration window and save it
//! - validate: Check raw event records without analyzing them

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

use anagram_integrity::adapter::{EventLogAdapter, ParsedRecords};
use anagram_integrity::calibration::WindowSource;
use anagram_integrity::table::{AggregateTable, SurveyTable, DEFAULT_SURVEY_ID_COLUMN};
use anagram_integrity::{AnalysisError, BatchAnalyzer, BatchReport, EngineConfig};
use anagram_integrity::{ENGINE_VERSION, PRODUCER_NAME};

/// Integrity - cheating detection and honesty-adjusted scoring for anagram studies
#[derive(Parser)]
#[command(name = "integrity")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Analyze anagram game event logs for external-help cheating", long_about = None)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log format
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze every participant in an event export
    Analyze {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Engine configuration (.toml or .json)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Load a calibrated window instead of calibrating from the input
        #[arg(long)]
        load_window: Option<PathBuf>,

        /// Save the window used for this run
        #[arg(long)]
        save_window: Option<PathBuf>,

        /// Survey CSV to left-join onto the aggregate table (csv output)
        #[arg(long)]
        survey: Option<PathBuf>,

        /// Participant id column in the survey CSV
        #[arg(long, default_value = DEFAULT_SURVEY_ID_COLUMN)]
        survey_id_column: String,
    },

    /// Calibrate the expected word-creation window from a population
    Calibrate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the window JSON (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Engine configuration (.toml or .json)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print a per-length summary to stderr
        #[arg(long)]
        summary: bool,
    },

    /// Validate raw event records
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
    /// CSV export with a header row
    Csv,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one participant report per line)
    Ndjson,
    /// Full batch report as JSON
    Json,
    /// Pretty-printed batch report
    JsonPretty,
    /// Aggregate table, one row per participant
    Csv,
}

#[derive(Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init(),
    }
}

fn run(cli: Cli) -> Result<(), IntegrityCliError> {
    match cli.command {
        Commands::Analyze {
            input,
            output,
            input_format,
            output_format,
            config,
            load_window,
            save_window,
            survey,
            survey_id_column,
        } => cmd_analyze(AnalyzeArgs {
            input: &input,
            output: &output,
            input_format,
            output_format,
            config: config.as_deref(),
            load_window: load_window.as_deref(),
            save_window: save_window.as_deref(),
            survey: survey.as_deref(),
            survey_id_column: &survey_id_column,
        }),

        Commands::Calibrate {
            input,
            output,
            input_format,
            config,
            summary,
        } => cmd_calibrate(&input, &output, input_format, config.as_deref(), summary),

        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),
    }
}

struct AnalyzeArgs<'a> {
    input: &'a Path,
    output: &'a Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    config: Option<&'a Path>,
    load_window: Option<&'a Path>,
    save_window: Option<&'a Path>,
    survey: Option<&'a Path>,
    survey_id_column: &'a str,
}

fn cmd_analyze(args: AnalyzeArgs<'_>) -> Result<(), IntegrityCliError> {
    let parsed = read_records(args.input, &args.input_format)?;
    if parsed.records.is_empty() {
        return Err(IntegrityCliError::NoEvents);
    }

    let mut analyzer = BatchAnalyzer::with_config(load_config(args.config)?);

    if let Some(window_path) = args.load_window {
        let window_json = fs::read_to_string(window_path)?;
        analyzer.load_window(&window_json)?;
        info!(path = %window_path.display(), "loaded calibrated window");
    }

    let report = analyzer.run_parsed(parsed);

    if let Some(window_path) = args.save_window {
        fs::write(window_path, analyzer.save_window()?)?;
    }

    if report.participants.is_empty() && !report.excluded.is_empty() {
        return Err(IntegrityCliError::AllExcluded(report.excluded.len()));
    }

    let survey = match args.survey {
        Some(survey_path) => Some(SurveyTable::from_path(survey_path, args.survey_id_column)?),
        None => None,
    };
    let output_data = format_output(&report, &args.output_format, survey.as_ref())?;

    write_output(args.output, &output_data)
}

fn cmd_calibrate(
    input: &Path,
    output: &Path,
    input_format: InputFormat,
    config: Option<&Path>,
    summary: bool,
) -> Result<(), IntegrityCliError> {
    let parsed = read_records(input, &input_format)?;
    if parsed.records.is_empty() {
        return Err(IntegrityCliError::NoEvents);
    }
    let (population, _) = EventLogAdapter::to_population(&parsed.records);

    let mut analyzer = BatchAnalyzer::with_config(load_config(config)?);
    let window = analyzer.calibrate(&population);

    if summary {
        eprintln!("Calibrated Window ({} participants)", population.len());
        eprintln!("==========================");
        for entry in window.entries() {
            let source = match entry.source {
                WindowSource::Calibrated => "calibrated",
                WindowSource::Fallback => "fallback",
            };
            eprintln!(
                "  {} letters: {:>6.2}s  ({} samples, {})",
                entry.length, entry.expected_sec, entry.samples, source
            );
        }
    }

    write_output(output, &window.to_json()?)
}

#[derive(Serialize)]
struct ValidationReport {
    producer: String,
    total_records: usize,
    unparsable_lines: usize,
    records_with_issues: usize,
    issues: Vec<ValidationIssueDetail>,
}

#[derive(Serialize)]
struct ValidationIssueDetail {
    index: usize,
    participant_id: Option<String>,
    issue: String,
}

fn cmd_validate(
    input: &Path,
    input_format: InputFormat,
    json: bool,
) -> Result<(), IntegrityCliError> {
    let parsed = read_records(input, &input_format)?;
    let issues = EventLogAdapter::validate_records(&parsed.records);

    let mut flagged_records: Vec<usize> = issues.iter().map(|i| i.index).collect();
    flagged_records.dedup();

    let report = ValidationReport {
        producer: PRODUCER_NAME.to_string(),
        total_records: parsed.records.len(),
        unparsable_lines: parsed.skipped.len(),
        records_with_issues: flagged_records.len(),
        issues: issues
            .iter()
            .map(|i| ValidationIssueDetail {
                index: i.index,
                participant_id: i.participant_id.clone(),
                issue: i.kind.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total records:       {}", report.total_records);
        println!("Unparsable lines:    {}", report.unparsable_lines);
        println!("Records with issues: {}", report.records_with_issues);

        if !report.issues.is_empty() {
            println!("\nIssues:");
            for issue in &report.issues {
                println!(
                    "  - Record {} ({}): {}",
                    issue.index,
                    issue.participant_id.as_deref().unwrap_or("unknown"),
                    issue.issue
                );
            }
        }
    }

    let failed = report.records_with_issues + report.unparsable_lines;
    if failed > 0 {
        Err(IntegrityCliError::ValidationFailed(failed))
    } else {
        Ok(())
    }
}

// Helper functions

fn load_config(path: Option<&Path>) -> Result<EngineConfig, IntegrityCliError> {
    match path {
        Some(path) => Ok(EngineConfig::from_path(path)?),
        None => Ok(EngineConfig::default()),
    }
}

fn read_input(input: &Path) -> Result<String, IntegrityCliError> {
    if input.to_string_lossy() == "-" {
        if atty::is(atty::Stream::Stdin) {
            return Err(IntegrityCliError::InteractiveStdin);
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn read_records(input: &Path, format: &InputFormat) -> Result<ParsedRecords, IntegrityCliError> {
    let input_data = read_input(input)?;
    let parsed = match format {
        InputFormat::Ndjson => EventLogAdapter::parse_ndjson(&input_data),
        InputFormat::Json => ParsedRecords {
            records: EventLogAdapter::parse_array(&input_data)?,
            skipped: Vec::new(),
        },
        InputFormat::Csv => EventLogAdapter::parse_csv(&input_data)?,
    };
    info!(
        records = parsed.records.len(),
        skipped = parsed.skipped.len(),
        "input parsed"
    );
    Ok(parsed)
}

fn write_output(output: &Path, data: &str) -> Result<(), IntegrityCliError> {
    if output.to_string_lossy() == "-" {
        print!("{}", data);
    } else {
        fs::write(output, data)?;
    }
    Ok(())
}

/// Render a batch report; the survey join only applies to the CSV table
fn format_output(
    report: &BatchReport,
    format: &OutputFormat,
    survey: Option<&SurveyTable>,
) -> Result<String, IntegrityCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for participant in &report.participants {
                lines.push(serde_json::to_string(participant)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(report)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Csv => {
            let mut table = AggregateTable::from_metrics(report.metrics());
            if let Some(survey) = survey {
                table = table.join_survey(survey);
            }
            Ok(table.to_csv_string()?)
        }
    }
}

// Error handling

#[derive(Debug)]
enum IntegrityCliError {
    Io(io::Error),
    Analysis(AnalysisError),
    Json(serde_json::Error),
    NoEvents,
    InteractiveStdin,
    AllExcluded(usize),
    ValidationFailed(usize),
}

impl From<io::Error> for IntegrityCliError {
    fn from(e: io::Error) -> Self {
        IntegrityCliError::Io(e)
    }
}

impl From<AnalysisError> for IntegrityCliError {
    fn from(e: AnalysisError) -> Self {
        IntegrityCliError::Analysis(e)
    }
}

impl From<serde_json::Error> for IntegrityCliError {
    fn from(e: serde_json::Error) -> Self {
        IntegrityCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<IntegrityCliError> for CliError {
    fn from(e: IntegrityCliError) -> Self {
        match e {
            IntegrityCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            IntegrityCliError::Analysis(AnalysisError::ConfigError(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Check the --config file and any loaded window".to_string()),
            },
            IntegrityCliError::Analysis(AnalysisError::TableError(msg)) => CliError {
                code: "TABLE_ERROR".to_string(),
                message: msg,
                hint: Some("Check --survey-id-column against the survey header".to_string()),
            },
            IntegrityCliError::Analysis(e) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Ensure input matches the event export schema".to_string()),
            },
            IntegrityCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            IntegrityCliError::NoEvents => CliError {
                code: "NO_EVENTS".to_string(),
                message: "No events found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            IntegrityCliError::InteractiveStdin => CliError {
                code: "NO_INPUT".to_string(),
                message: "stdin is a terminal".to_string(),
                hint: Some("Pipe an event export or pass --input <file>".to_string()),
            },
            IntegrityCliError::AllExcluded(count) => CliError {
                code: "ALL_EXCLUDED".to_string(),
                message: format!("All {} participants were excluded", count),
                hint: Some("See the warnings logged on stderr for each participant".to_string()),
            },
            IntegrityCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} records failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
        }
    }
}
