//! End-to-end tests: train, publish, resolve and score.
//!
//! The synthetic accident frame mirrors the production extract: five numeric
//! columns, two categorical columns and a `crash_date` timestamp.

use anomaly_learning::{
    AnomalyReport, ErrorCategory, FileReporter, ForestConfig, InMemoryRegistry, LabelFormat,
    LocalRegistry, ModelReference, ModelUri, RunRegistry, RunStatus, SCORE_COLUMN, ScoringConfig,
    Scorer, Trainer, TrainingConfig, TrainingOutcome, resolve_latest_run,
};
use anomaly_learning::{LABEL_COLUMN, DEFAULT_EXPERIMENT_NAME};
use anomaly_processing::{PreprocessingConfig, load_csv_with_fallbacks};
use polars::prelude::*;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Helper Functions
// ============================================================================

const WEATHER: [&str; 3] = ["CLEAR", "RAIN", "SNOW"];
const LIGHTING: [&str; 2] = ["DAYLIGHT", "DARKNESS, LIGHTED ROAD"];

fn accidents(n: usize, seed: u64) -> DataFrame {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut dates = Vec::with_capacity(n);
    let mut weather = Vec::with_capacity(n);
    let mut lighting = Vec::with_capacity(n);
    let mut speed = Vec::with_capacity(n);
    let mut units = Vec::with_capacity(n);
    let mut injuries = Vec::with_capacity(n);
    let mut hour = Vec::with_capacity(n);
    let mut damage = Vec::with_capacity(n);

    for i in 0..n {
        let month = rng.gen_range(1..=12);
        let day = rng.gen_range(1..=28);
        let h12 = rng.gen_range(1..=12);
        let meridiem = if rng.gen_bool(0.5) { "AM" } else { "PM" };
        dates.push(format!("{month:02}/{day:02}/2023 {h12:02}:00:00 {meridiem}"));
        weather.push(WEATHER[rng.gen_range(0..WEATHER.len())]);
        lighting.push(LIGHTING[rng.gen_range(0..LIGHTING.len())]);
        speed.push(30.0 + rng.gen_range(-5.0..5.0));
        units.push(rng.gen_range(1i64..=3));
        injuries.push(rng.gen_range(0.0..2.0f64).floor());
        hour.push(rng.gen_range(0i64..24));
        // a handful of extreme records
        damage.push(if i % 97 == 0 {
            50_000.0
        } else {
            1_500.0 + rng.gen_range(-300.0..300.0)
        });
    }

    df!(
        "crash_date" => dates,
        "weather_condition" => weather,
        "lighting_condition" => lighting,
        "posted_speed_limit" => speed,
        "num_units" => units,
        "injuries_total" => injuries,
        "crash_hour" => hour,
        "damage_cost" => damage,
    )
    .unwrap()
}

fn training_config(seed: u64, n_jobs: i32) -> TrainingConfig {
    TrainingConfig::builder()
        .preprocessing(
            PreprocessingConfig::builder()
                .use_date_features(true)
                .build()
                .unwrap(),
        )
        .forest(
            ForestConfig::builder()
                .n_estimators(50)
                .random_seed(seed)
                .n_jobs(n_jobs)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

fn train(registry: &dyn RunRegistry, seed: u64) -> TrainingOutcome {
    Trainer::builder()
        .config(training_config(seed, -1))
        .build()
        .train(&accidents(1000, 7), registry)
        .unwrap()
}

fn scorer(format: LabelFormat) -> Scorer {
    Scorer::new(ScoringConfig::builder().label_format(format).build().unwrap())
}

fn score_column(df: &DataFrame) -> Vec<f64> {
    df.column(SCORE_COLUMN)
        .unwrap()
        .as_materialized_series()
        .f64()
        .unwrap()
        .into_no_null_iter()
        .collect()
}

// ============================================================================
// Training
// ============================================================================

#[test]
fn test_train_freezes_expanded_schema() {
    let registry = InMemoryRegistry::new();
    let outcome = train(&registry, 42);

    let schema = outcome.pipeline.schema();
    let numeric: Vec<&str> = schema.numeric().map(|c| c.name.as_str()).collect();
    assert_eq!(
        numeric,
        vec![
            "posted_speed_limit",
            "num_units",
            "injuries_total",
            "crash_hour",
            "damage_cost",
            "year",
            "month",
            "day"
        ]
    );
    assert_eq!(schema.categorical().count(), 2);

    assert_eq!(outcome.result.n_rows, 1000);
    assert!((0.0..=0.5).contains(&outcome.result.anomaly_rate));

    let run = registry.get_run(&outcome.result.run_id).unwrap();
    assert_eq!(run.status, RunStatus::Finished);
}

#[test]
fn test_training_is_deterministic_across_thread_counts() {
    let df = accidents(1000, 7);
    let (_, single) = Trainer::builder()
        .config(training_config(42, 1))
        .build()
        .fit(&df)
        .unwrap();
    let (_, parallel) = Trainer::builder()
        .config(training_config(42, 4))
        .build()
        .fit(&df)
        .unwrap();

    assert_eq!(single, parallel);
}

#[test]
fn test_seed_changes_scores() {
    let df = accidents(300, 7);
    let (_, a) = Trainer::builder()
        .config(training_config(1, 1))
        .build()
        .fit(&df)
        .unwrap();
    let (_, b) = Trainer::builder()
        .config(training_config(2, 1))
        .build()
        .fit(&df)
        .unwrap();

    assert_ne!(a.scores, b.scores);
}

// ============================================================================
// Scoring
// ============================================================================

#[test]
fn test_reloaded_pipeline_replays_self_check_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let registry = LocalRegistry::open(dir.path()).unwrap();
    let outcome = train(&registry, 42);

    let uri: ModelUri = outcome.result.model_uri.parse().unwrap();
    let scored = scorer(LabelFormat::Numeric)
        .score(&accidents(1000, 7), &registry, &ModelReference::Explicit(uri))
        .unwrap();

    assert_eq!(scored.predictions, outcome.self_check);
}

#[test]
fn test_score_new_records_with_latest() {
    let registry = InMemoryRegistry::new();
    let outcome = train(&registry, 42);

    let new_data = accidents(100, 99);
    let scored = scorer(LabelFormat::Numeric)
        .score(&new_data, &registry, &ModelReference::Latest)
        .unwrap();

    assert_eq!(scored.result.model_uri, outcome.result.model_uri);
    assert_eq!(scored.frame.height(), 100);
    assert_eq!(scored.frame.width(), new_data.width() + 2);

    let scores = score_column(&scored.frame);
    assert!(scores.iter().all(|s| s.is_finite()));

    let labels: Vec<i32> = scored
        .frame
        .column(LABEL_COLUMN)
        .unwrap()
        .as_materialized_series()
        .i32()
        .unwrap()
        .into_no_null_iter()
        .collect();
    for (label, score) in labels.iter().zip(&scores) {
        assert_eq!(*label == -1, *score < 0.0, "label {label} for score {score}");
    }
}

#[test]
fn test_latest_finds_pipeline_under_custom_artifact_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = LocalRegistry::open(dir.path().join("mlruns")).unwrap();

    let base = training_config(3, 1);
    let config = TrainingConfig::builder()
        .preprocessing(base.preprocessing)
        .forest(base.forest)
        .artifact_path("models/iforest")
        .build()
        .unwrap();
    let outcome = Trainer::builder()
        .config(config)
        .build()
        .train(&accidents(300, 7), &registry)
        .unwrap();
    assert!(outcome.result.model_uri.ends_with("/models/iforest"));

    let scored = scorer(LabelFormat::Numeric)
        .score(&accidents(50, 8), &registry, &ModelReference::Latest)
        .unwrap();
    assert_eq!(scored.result.model_uri, outcome.result.model_uri);
    assert_eq!(scored.frame.height(), 50);
}

#[test]
fn test_text_labels_match_scores() {
    let registry = InMemoryRegistry::new();
    train(&registry, 42);

    let scored = scorer(LabelFormat::Text)
        .score(&accidents(100, 5), &registry, &ModelReference::Latest)
        .unwrap();

    let scores = score_column(&scored.frame);
    let labels = scored.frame.column(LABEL_COLUMN).unwrap();
    let labels = labels.as_materialized_series().str().unwrap();
    for (label, score) in labels.into_no_null_iter().zip(&scores) {
        let expected = if *score < 0.0 { "anomaly" } else { "normal" };
        assert_eq!(label, expected);
    }
}

#[test]
fn test_unseen_categories_score_without_error() {
    let registry = InMemoryRegistry::new();
    train(&registry, 42);

    let mut new_data = accidents(20, 3);
    new_data
        .with_column(Series::new(
            "weather_condition".into(),
            vec!["VOLCANIC ASH"; 20],
        ))
        .unwrap();

    let scored = scorer(LabelFormat::Numeric)
        .score(&new_data, &registry, &ModelReference::Latest)
        .unwrap();
    assert_eq!(scored.predictions.len(), 20);
    assert!(scored.predictions.scores.iter().all(|s| s.is_finite()));
}

#[test]
fn test_missing_column_is_schema_drift() {
    let registry = InMemoryRegistry::new();
    train(&registry, 42);

    let new_data = accidents(20, 3).drop("damage_cost").unwrap();
    let err = scorer(LabelFormat::Numeric)
        .score(&new_data, &registry, &ModelReference::Latest)
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::SchemaDrift);
    assert_eq!(err.exit_code(), 4);
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn test_latest_follows_newest_finished_run() {
    let registry = InMemoryRegistry::new();
    let first = train(&registry, 1);
    assert_eq!(
        resolve_latest_run(&registry, DEFAULT_EXPERIMENT_NAME)
            .unwrap()
            .run_id,
        first.result.run_id
    );

    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = train(&registry, 2);
    assert_eq!(
        resolve_latest_run(&registry, DEFAULT_EXPERIMENT_NAME)
            .unwrap()
            .run_id,
        second.result.run_id
    );
}

#[test]
fn test_latest_without_runs_is_resolution_error() {
    let registry = InMemoryRegistry::new();
    let err = scorer(LabelFormat::Numeric)
        .score(&accidents(10, 1), &registry, &ModelReference::Latest)
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Resolution);
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn test_explicit_unknown_run_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = LocalRegistry::open(dir.path()).unwrap();
    train(&registry, 42);

    let reference: ModelReference = "runs:/0123456789abcdef/model".parse().unwrap();
    let err = scorer(LabelFormat::Numeric)
        .score(&accidents(10, 1), &registry, &reference)
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Resolution);
}

// ============================================================================
// Output
// ============================================================================

#[test]
fn test_write_scored_csv_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let registry = LocalRegistry::open(dir.path().join("mlruns")).unwrap();
    train(&registry, 42);

    let scorer = scorer(LabelFormat::Numeric).with_reporter(FileReporter);
    let mut scored = scorer
        .score(&accidents(100, 11), &registry, &ModelReference::Latest)
        .unwrap();

    let out = dir.path().join("out/scored.csv");
    let viz = dir.path().join("viz");
    scorer.write(&mut scored, &out, Some(&viz)).unwrap();

    let written = load_csv_with_fallbacks(&out).unwrap();
    assert_eq!(written.height(), 100);
    assert!(
        written
            .get_column_names_str()
            .ends_with(&[LABEL_COLUMN, SCORE_COLUMN])
    );

    let summary = std::fs::read_to_string(viz.join("summary_statistics.txt")).unwrap();
    assert!(summary.contains("Total Records: 100"));

    let report: AnomalyReport =
        serde_json::from_slice(&std::fs::read(viz.join("anomaly_report.json")).unwrap()).unwrap();
    assert_eq!(report.summary.total_records, 100);
    assert_eq!(
        report.summary.anomalies_detected,
        scored.predictions.n_anomalies()
    );
}

#[test]
fn test_write_without_report_dir_skips_reports() {
    let dir = tempfile::tempdir().unwrap();
    let registry = InMemoryRegistry::new();
    train(&registry, 42);

    let scorer = scorer(LabelFormat::Numeric).with_reporter(FileReporter);
    let mut scored = scorer
        .score(&accidents(10, 11), &registry, &ModelReference::Latest)
        .unwrap();
    let out = dir.path().join("scored.csv");
    scorer.write(&mut scored, &out, None).unwrap();

    assert!(out.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}
