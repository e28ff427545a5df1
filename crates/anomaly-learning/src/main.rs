//! CLI entry point for the anomaly detection jobs.
//!
//! The binary is what a scheduler invokes. The exit status tells it what went
//! wrong: `0` success, then one code per [`ErrorCategory`].

use anomaly_learning::{
    AnomalyError, Contamination, ErrorCategory, FileReporter, ForestConfig, LabelFormat,
    MaxSamples, ModelReference, ProgressUpdate, RetryPolicy, RuntimeConfig, ScoringConfig,
    Scorer, Trainer, TrainingConfig, Workflow, open_registry,
};
use anomaly_processing::{
    CategoricalImputation, DEFAULT_DATE_COLUMN, NumericImputation, PreprocessingConfig,
    ProcessingError, load_csv_with_fallbacks,
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Report directory created next to `--out` when `--viz-dir` is not given.
const DEFAULT_VIZ_DIR: &str = "visualizations";

/// CLI-compatible numeric imputation strategy enum
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliNumericImputation {
    /// Use the median of non-null values
    Median,
    /// Use the mean of non-null values
    Mean,
}

impl From<CliNumericImputation> for NumericImputation {
    fn from(cli: CliNumericImputation) -> Self {
        match cli {
            CliNumericImputation::Median => NumericImputation::Median,
            CliNumericImputation::Mean => NumericImputation::Mean,
        }
    }
}

/// CLI-compatible categorical imputation strategy enum
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliCategoricalImputation {
    /// Use the most frequent value (mode)
    Mode,
    /// Use a constant value ("Unknown")
    Constant,
}

impl From<CliCategoricalImputation> for CategoricalImputation {
    fn from(cli: CliCategoricalImputation) -> Self {
        match cli {
            CliCategoricalImputation::Mode => CategoricalImputation::Mode,
            CliCategoricalImputation::Constant => CategoricalImputation::Constant,
        }
    }
}

/// CLI-compatible label encoding enum
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLabelFormat {
    /// -1 for anomalies, 1 for normal records
    Numeric,
    /// "anomaly" / "normal"
    Text,
}

impl From<CliLabelFormat> for LabelFormat {
    fn from(cli: CliLabelFormat) -> Self {
        match cli {
            CliLabelFormat::Numeric => LabelFormat::Numeric,
            CliLabelFormat::Text => LabelFormat::Text,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "anomaly-pipeline",
    version,
    about = "Traffic accident anomaly detection: train and score isolation forests",
    long_about = "Trains an isolation forest on traffic accident records, logs it to a run \
                  registry, and scores new records with the latest or a chosen run.\n\n\
                  ENVIRONMENT VARIABLES:\n  \
                  ANOMALY_REGISTRY_URI     Registry endpoint (file:<dir>, memory:, http(s)://...)\n  \
                  MLFLOW_TRACKING_URI      Fallback registry endpoint\n  \
                  ANOMALY_EXPERIMENT_NAME  Experiment name (default traffic_anomaly_detection)\n\n\
                  EXIT CODES:\n  \
                  0 success, 1 internal, 2 input, 3 resolution, 4 schema drift, 5 registry\n\n\
                  EXAMPLES:\n  \
                  anomaly-pipeline train --data traffic_accidents.csv --use-date-features\n  \
                  anomaly-pipeline score --data new.csv --out scored.csv --viz-dir viz/\n  \
                  anomaly-pipeline run --data traffic_accidents.csv --out scored.csv"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Suppress progress output (only show errors and final result)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print the result as JSON on stdout; disables logging
    #[arg(long, global = true)]
    json: bool,

    /// Registry URI, overriding the environment
    #[arg(long, global = true)]
    registry_uri: Option<String>,

    /// Experiment name, overriding the environment
    #[arg(long, global = true)]
    experiment: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit the pipeline on a dataset and log it as a new run
    Train(TrainArgs),
    /// Score a dataset with a logged pipeline
    Score(ScoreArgs),
    /// Train, then score the same dataset, with retries
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct TrainArgs {
    /// Path to the training CSV
    #[arg(long)]
    data: PathBuf,

    #[command(flatten)]
    preprocessing: PreprocessingArgs,

    #[command(flatten)]
    forest: ForestArgs,

    /// Artifact path of the logged pipeline
    #[arg(long, default_value = anomaly_learning::DEFAULT_ARTIFACT_PATH)]
    artifact_path: String,
}

#[derive(Args, Debug, Clone)]
struct PreprocessingArgs {
    /// Expand the date column into year, month and day
    #[arg(long)]
    use_date_features: bool,

    /// Column holding the accident timestamp
    #[arg(long, default_value = DEFAULT_DATE_COLUMN)]
    date_column: String,

    /// Extra chrono format tried when parsing dates (repeatable)
    #[arg(long = "date-format")]
    date_formats: Vec<String>,

    /// Strategy for imputing missing numeric values
    #[arg(long, value_enum, default_value = "median")]
    numeric_imputation: CliNumericImputation,

    /// Strategy for imputing missing categorical values
    #[arg(long, value_enum, default_value = "mode")]
    categorical_imputation: CliCategoricalImputation,
}

#[derive(Args, Debug, Clone)]
struct ForestArgs {
    /// Number of isolation trees
    #[arg(long, default_value = "200")]
    n_estimators: usize,

    /// Records per tree: "auto", a count, or a fraction in (0, 1]
    #[arg(long, default_value = "auto", value_parser = parse_max_samples)]
    max_samples: MaxSamples,

    /// Expected anomaly fraction: "auto" or a value in (0, 0.5]
    #[arg(long, default_value = "auto", value_parser = parse_contamination)]
    contamination: Contamination,

    /// Draw records with replacement
    #[arg(long)]
    bootstrap: bool,

    /// Random seed for reproducibility
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Worker threads (-1 for all cores)
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    n_jobs: i32,
}

#[derive(Args, Debug, Clone)]
struct ScoreArgs {
    /// Path to the CSV to score
    #[arg(long)]
    data: PathBuf,

    /// "latest" or runs:/<run_id>/<artifact_path>
    #[arg(long, default_value = "latest")]
    model_uri: String,

    /// Where to write the scored CSV
    #[arg(long)]
    out: PathBuf,

    /// Directory for summary statistics and the JSON report
    /// [default: visualizations next to --out]
    #[arg(long)]
    viz_dir: Option<PathBuf>,

    /// Skip writing the summary statistics and the JSON report
    #[arg(long, conflicts_with = "viz_dir")]
    no_report: bool,

    /// Encoding of the anomaly_label column
    #[arg(long, value_enum, default_value = "numeric")]
    label_format: CliLabelFormat,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    train: TrainArgs,

    /// Where to write the scored CSV
    #[arg(long)]
    out: PathBuf,

    /// Directory for summary statistics and the JSON report
    /// [default: visualizations next to --out]
    #[arg(long)]
    viz_dir: Option<PathBuf>,

    /// Skip writing the summary statistics and the JSON report
    #[arg(long, conflicts_with = "viz_dir")]
    no_report: bool,

    /// Encoding of the anomaly_label column
    #[arg(long, value_enum, default_value = "numeric")]
    label_format: CliLabelFormat,

    /// Retries per task after a failure
    #[arg(long, default_value = "1")]
    retries: u32,

    /// Seconds to wait between attempts
    #[arg(long, default_value = "60")]
    retry_delay_secs: u64,
}

fn parse_max_samples(s: &str) -> Result<MaxSamples, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(MaxSamples::Auto);
    }
    if s.contains('.') {
        return s
            .parse::<f64>()
            .map(MaxSamples::Fraction)
            .map_err(|e| format!("invalid fraction '{s}': {e}"));
    }
    s.parse::<usize>()
        .map(MaxSamples::Count)
        .map_err(|e| format!("invalid count '{s}': {e}"))
}

fn parse_contamination(s: &str) -> Result<Contamination, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(Contamination::Auto);
    }
    s.parse::<f64>()
        .map(Contamination::Fixed)
        .map_err(|e| format!("invalid contamination '{s}': {e}"))
}

/// Initialize the tracing subscriber for logging.
///
/// When `json_output` is true, logging is disabled so stdout only carries JSON.
fn init_logging(level: &str, quiet: bool, json_output: bool) {
    if json_output {
        return;
    }

    use tracing_subscriber::EnvFilter;

    let effective_level = if quiet { "warn" } else { level };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(effective_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.quiet, cli.json);

    // Load environment variables from .env file
    dotenv().ok();

    let mut runtime = RuntimeConfig::from_env();
    if let Some(uri) = &cli.registry_uri {
        runtime.registry_uri = uri.clone();
    }
    if let Some(name) = &cli.experiment {
        runtime.experiment_name = name.clone();
    }
    debug!("Runtime configuration: {:?}", runtime);

    if let Err(e) = run(&cli, &runtime) {
        let code = exit_code(&e);
        if cli.json {
            let payload = serde_json::json!({ "error": format!("{e:#}"), "exit_code": code });
            println!("{payload}");
        } else {
            error!("{:#}", e);
        }
        std::process::exit(code);
    }
}

fn run(cli: &Cli, runtime: &RuntimeConfig) -> Result<()> {
    match &cli.command {
        Command::Train(args) => cmd_train(args, runtime, cli.json),
        Command::Score(args) => cmd_score(args, runtime, cli.json),
        Command::Run(args) => cmd_run(args, runtime, cli.json),
    }
}

fn training_config(args: &TrainArgs, runtime: &RuntimeConfig) -> Result<TrainingConfig> {
    let p = &args.preprocessing;
    let mut preprocessing = PreprocessingConfig::builder()
        .use_date_features(p.use_date_features)
        .date_column(&p.date_column)
        .numeric_imputation(p.numeric_imputation.into())
        .categorical_imputation(p.categorical_imputation.into());
    for format in &p.date_formats {
        preprocessing = preprocessing.date_format(format);
    }
    let preprocessing = preprocessing
        .build()
        .map_err(|e| AnomalyError::InvalidConfig(e.to_string()))?;

    let f = &args.forest;
    let forest = ForestConfig::builder()
        .n_estimators(f.n_estimators)
        .max_samples(f.max_samples)
        .contamination(f.contamination)
        .bootstrap(f.bootstrap)
        .random_seed(f.seed)
        .n_jobs(f.n_jobs)
        .build()?;

    Ok(TrainingConfig::builder()
        .preprocessing(preprocessing)
        .forest(forest)
        .experiment_name(&runtime.experiment_name)
        .artifact_path(&args.artifact_path)
        .build()?)
}

fn build_trainer(config: TrainingConfig) -> Trainer {
    Trainer::builder()
        .config(config)
        .on_progress(|update: ProgressUpdate| {
            info!(
                "[{}] {:.0}% - {}",
                update.stage,
                update.progress * 100.0,
                update.message
            );
        })
        .build()
}

fn load_dataset(path: &Path) -> anomaly_learning::Result<polars::prelude::DataFrame> {
    info!("Loading dataset from: {}", path.display());
    let df = load_csv_with_fallbacks(path)?;
    info!("Dataset loaded successfully: {:?}", df.shape());
    Ok(df)
}

fn cmd_train(args: &TrainArgs, runtime: &RuntimeConfig, json: bool) -> Result<()> {
    let trainer = build_trainer(training_config(args, runtime)?);
    let registry = open_registry(&runtime.registry_uri)
        .with_context(|| format!("Opening registry '{}'", runtime.registry_uri))?;

    let data = load_dataset(&args.data)?;
    let outcome = trainer.train(&data, registry.as_ref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.result)?);
    } else {
        info!("Run ID: {}", outcome.result.run_id);
        info!("Model URI: {}", outcome.result.model_uri);
        info!("Anomaly rate: {:.4}", outcome.result.anomaly_rate);
    }
    Ok(())
}

fn cmd_score(args: &ScoreArgs, runtime: &RuntimeConfig, json: bool) -> Result<()> {
    let reference: ModelReference = args
        .model_uri
        .parse()
        .map_err(AnomalyError::from)?;
    let scorer = build_scorer(runtime, args.label_format.into())?;
    let registry = open_registry(&runtime.registry_uri)
        .with_context(|| format!("Opening registry '{}'", runtime.registry_uri))?;

    let data = load_dataset(&args.data)?;
    let mut scored = scorer.score(&data, registry.as_ref(), &reference)?;
    let reports = report_dir(&args.out, args.viz_dir.as_deref(), args.no_report);
    scorer.write(&mut scored, &args.out, reports.as_deref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&scored.result)?);
    }
    Ok(())
}

fn build_scorer(runtime: &RuntimeConfig, label_format: LabelFormat) -> Result<Scorer> {
    let config = ScoringConfig::builder()
        .experiment_name(&runtime.experiment_name)
        .label_format(label_format)
        .build()?;
    Ok(Scorer::new(config).with_reporter(FileReporter))
}

fn cmd_run(args: &RunArgs, runtime: &RuntimeConfig, json: bool) -> Result<()> {
    let trainer = build_trainer(training_config(&args.train, runtime)?);
    let scorer = build_scorer(runtime, args.label_format.into())?;
    let registry = open_registry(&runtime.registry_uri)
        .with_context(|| format!("Opening registry '{}'", runtime.registry_uri))?;
    let registry = registry.as_ref();
    let reports = report_dir(&args.out, args.viz_dir.as_deref(), args.no_report);

    let report = Workflow::new("traffic_anomaly_detection")
        .retry_policy(RetryPolicy {
            retries: args.retries,
            delay: Duration::from_secs(args.retry_delay_secs),
        })
        .task("train_model", || {
            let data = load_dataset(&args.train.data)?;
            trainer.train(&data, registry).map(drop)
        })
        .task("score_model", || {
            let data = load_dataset(&args.train.data)?;
            let mut scored = scorer.score(&data, registry, &ModelReference::Latest)?;
            scorer.write(&mut scored, &args.out, reports.as_deref())
        })
        .run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Where scoring reports go: `--viz-dir` if given, else `visualizations`
/// beside the scored CSV. `None` when reports are switched off.
fn report_dir(out: &Path, viz_dir: Option<&Path>, no_report: bool) -> Option<PathBuf> {
    if no_report {
        return None;
    }
    let dir = match viz_dir {
        Some(dir) => dir.to_path_buf(),
        None => out
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(DEFAULT_VIZ_DIR),
    };
    Some(dir)
}

/// Map an error to the exit code of its category.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<AnomalyError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ProcessingError>() {
            let category = if e.is_schema_drift() {
                ErrorCategory::SchemaDrift
            } else if e.is_input_error() {
                ErrorCategory::Input
            } else {
                ErrorCategory::Internal
            };
            return category.exit_code();
        }
    }
    ErrorCategory::Internal.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_max_samples() {
        assert_eq!(parse_max_samples("auto").unwrap(), MaxSamples::Auto);
        assert_eq!(parse_max_samples("128").unwrap(), MaxSamples::Count(128));
        assert_eq!(parse_max_samples("0.5").unwrap(), MaxSamples::Fraction(0.5));
        assert!(parse_max_samples("lots").is_err());
    }

    #[test]
    fn test_parse_contamination() {
        assert_eq!(parse_contamination("AUTO").unwrap(), Contamination::Auto);
        assert_eq!(parse_contamination("0.1").unwrap(), Contamination::Fixed(0.1));
    }

    #[test]
    fn test_cli_parses_score_defaults() {
        let cli = Cli::try_parse_from([
            "anomaly-pipeline",
            "score",
            "--data",
            "new.csv",
            "--out",
            "scored.csv",
        ])
        .unwrap();
        match cli.command {
            Command::Score(args) => {
                assert_eq!(args.model_uri, "latest");
                assert!(args.viz_dir.is_none());
                assert!(!args.no_report);
                assert_eq!(
                    report_dir(&args.out, args.viz_dir.as_deref(), args.no_report),
                    Some(PathBuf::from("visualizations"))
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_report_dir_resolution() {
        let out = Path::new("/data/out/scored.csv");
        assert_eq!(
            report_dir(out, None, false),
            Some(PathBuf::from("/data/out/visualizations"))
        );
        assert_eq!(
            report_dir(out, Some(Path::new("/tmp/viz")), false),
            Some(PathBuf::from("/tmp/viz"))
        );
        assert_eq!(report_dir(out, None, true), None);
    }

    #[test]
    fn test_cli_run_reports_by_default() {
        let cli = Cli::try_parse_from([
            "anomaly-pipeline",
            "run",
            "--data",
            "accidents.csv",
            "--out",
            "results/scored.csv",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(
            report_dir(&args.out, args.viz_dir.as_deref(), args.no_report),
            Some(PathBuf::from("results/visualizations"))
        );

        let cli = Cli::try_parse_from([
            "anomaly-pipeline",
            "score",
            "--data",
            "new.csv",
            "--out",
            "scored.csv",
            "--no-report",
        ])
        .unwrap();
        let Command::Score(args) = cli.command else {
            panic!("expected score");
        };
        assert_eq!(report_dir(&args.out, args.viz_dir.as_deref(), args.no_report), None);

        let conflicting = Cli::try_parse_from([
            "anomaly-pipeline",
            "score",
            "--data",
            "new.csv",
            "--out",
            "scored.csv",
            "--viz-dir",
            "viz",
            "--no-report",
        ]);
        assert!(conflicting.is_err());
    }

    #[test]
    fn test_cli_parses_train_options() {
        let cli = Cli::try_parse_from([
            "anomaly-pipeline",
            "train",
            "--data",
            "train.csv",
            "--use-date-features",
            "--n-estimators",
            "50",
            "--n-jobs",
            "-1",
            "--contamination",
            "0.05",
        ])
        .unwrap();
        let Command::Train(args) = cli.command else {
            panic!("expected train");
        };
        let config = training_config(&args, &RuntimeConfig::default()).unwrap();
        assert!(config.preprocessing.use_date_features);
        assert_eq!(config.forest.n_estimators, 50);
        assert_eq!(config.forest.contamination, Contamination::Fixed(0.05));
    }

    #[test]
    fn test_exit_code_through_context() {
        let err = anyhow::Error::new(AnomalyError::from(ProcessingError::MissingColumns(vec![
            "year".into(),
        ])))
        .context("Scoring");
        assert_eq!(exit_code(&err), 4);

        let err = anyhow::Error::new(ProcessingError::EmptyDataset);
        assert_eq!(exit_code(&err), 2);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
