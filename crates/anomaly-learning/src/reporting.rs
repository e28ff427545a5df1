//! Reports over a scored dataset.
//!
//! The scoring job hands its output frame to a [`Reporter`] after the CSV has
//! been written. The default [`FileReporter`] writes two files into the
//! destination directory:
//!
//! - `summary_statistics.txt` - record counts, anomaly rate and score range
//! - `anomaly_report.json` - the summary plus the score histogram by label,
//!   the most anomalous records and the anomaly count per `year-month`
//!
//! Reporting is presentation only: [`Scorer`](crate::Scorer) logs reporter
//! errors and carries on.

use crate::error::{AnomalyError, Result, ResultExt};
use crate::scoring::{LABEL_COLUMN, SCORE_COLUMN};
use anomaly_processing::utils::{numeric_values, string_values};
use anomaly_processing::is_numeric_dtype;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

pub const SUMMARY_FILE_NAME: &str = "summary_statistics.txt";
pub const REPORT_FILE_NAME: &str = "anomaly_report.json";

/// Number of histogram bins over the score range.
pub const HISTOGRAM_BINS: usize = 50;

/// Number of records listed in [`AnomalyReport::top_anomalies`].
pub const TOP_ANOMALIES: usize = 20;

/// Produces presentation output for a scored dataset.
pub trait Reporter: Send + Sync {
    /// Write the report for `scored` into `destination`.
    fn report(&self, scored: &DataFrame, destination: &Path) -> Result<()>;
}

/// Aggregate counts and score range of a scored batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub total_records: usize,
    pub normal_records: usize,
    pub anomalies_detected: usize,
    /// Percentage, rounded to 2 decimals.
    pub anomaly_rate_pct: f64,
    /// Rounded to 4 decimals.
    pub min_score: f64,
    pub max_score: f64,
    pub mean_score: f64,
}

impl SummaryStatistics {
    /// Plain-text rendering written to `summary_statistics.txt`.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("ANOMALY DETECTION SUMMARY\n");
        out.push_str(&"=".repeat(50));
        out.push_str("\n\n");
        let _ = writeln!(out, "Total Records: {}", self.total_records);
        let _ = writeln!(out, "Normal Records: {}", self.normal_records);
        let _ = writeln!(out, "Anomalies Detected: {}", self.anomalies_detected);
        let _ = writeln!(out, "Anomaly Rate (%): {}", self.anomaly_rate_pct);
        let _ = writeln!(out, "Min Anomaly Score: {}", self.min_score);
        let _ = writeln!(out, "Max Anomaly Score: {}", self.max_score);
        let _ = writeln!(out, "Mean Anomaly Score: {}", self.mean_score);
        out
    }
}

/// Score histogram with shared bin edges for both labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreHistogram {
    /// `HISTOGRAM_BINS + 1` edges from the lowest to the highest score.
    pub edges: Vec<f64>,
    pub normal: Vec<usize>,
    pub anomaly: Vec<usize>,
}

/// One of the most anomalous records, by input row position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRecord {
    pub row: usize,
    pub score: f64,
}

/// Anomalies within one `YYYY-MM` period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCount {
    pub period: String,
    pub anomaly_count: usize,
}

/// Everything written to `anomaly_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub summary: SummaryStatistics,
    pub histogram: ScoreHistogram,
    pub top_anomalies: Vec<RankedRecord>,
    /// Present when the dataset has `year` and `month` columns.
    pub monthly_trend: Option<Vec<PeriodCount>>,
}

impl AnomalyReport {
    /// Build the report from a frame carrying `anomaly_label` and `anomaly_score`.
    ///
    /// # Errors
    ///
    /// [`AnomalyError::InvalidData`] when the frame is empty, lacks either
    /// column, or has a missing score.
    pub fn from_frame(scored: &DataFrame) -> Result<Self> {
        if scored.height() == 0 {
            return Err(AnomalyError::InvalidData(
                "cannot report on an empty dataset".to_string(),
            ));
        }
        let labels = read_labels(scored)?;
        let scores = read_scores(scored)?;

        Ok(Self {
            summary: summarize(&labels, &scores),
            histogram: histogram(&labels, &scores),
            top_anomalies: top_anomalies(&labels, &scores),
            monthly_trend: monthly_trend(scored, &labels)?,
        })
    }
}

/// Writes `summary_statistics.txt` and `anomaly_report.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileReporter;

impl Reporter for FileReporter {
    fn report(&self, scored: &DataFrame, destination: &Path) -> Result<()> {
        let report = AnomalyReport::from_frame(scored)?;

        fs::create_dir_all(destination).context(format!(
            "Creating report directory '{}'",
            destination.display()
        ))?;
        fs::write(destination.join(SUMMARY_FILE_NAME), report.summary.to_text())
            .context("Writing summary statistics")?;
        fs::write(
            destination.join(REPORT_FILE_NAME),
            serde_json::to_vec_pretty(&report)?,
        )
        .context("Writing anomaly report")?;

        info!(
            "Report written to {}: {} anomalies of {} records ({}%)",
            destination.display(),
            report.summary.anomalies_detected,
            report.summary.total_records,
            report.summary.anomaly_rate_pct
        );
        Ok(())
    }
}

/// `true` for anomalous rows. Accepts the numeric (`-1`/`1`) and text encodings.
fn read_labels(df: &DataFrame) -> Result<Vec<bool>> {
    let series = df
        .column(LABEL_COLUMN)
        .map_err(|_| missing_column(LABEL_COLUMN))?
        .as_materialized_series();

    if is_numeric_dtype(series.dtype()) {
        Ok(numeric_values(series)?
            .into_iter()
            .map(|v| v.is_some_and(|x| x < 0.0))
            .collect())
    } else {
        Ok(string_values(series)?
            .into_iter()
            .map(|v| matches!(v.as_deref(), Some("anomaly" | "-1")))
            .collect())
    }
}

fn read_scores(df: &DataFrame) -> Result<Vec<f64>> {
    let series = df
        .column(SCORE_COLUMN)
        .map_err(|_| missing_column(SCORE_COLUMN))?
        .as_materialized_series();

    numeric_values(series)?
        .into_iter()
        .enumerate()
        .map(|(row, v)| {
            v.ok_or_else(|| AnomalyError::InvalidData(format!("row {row} has no anomaly score")))
        })
        .collect()
}

fn missing_column(name: &str) -> AnomalyError {
    AnomalyError::InvalidData(format!("scored dataset has no '{name}' column"))
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn summarize(labels: &[bool], scores: &[f64]) -> SummaryStatistics {
    let total = scores.len();
    let anomalies = labels.iter().filter(|a| **a).count();
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = scores.iter().sum::<f64>() / total as f64;

    SummaryStatistics {
        total_records: total,
        normal_records: total - anomalies,
        anomalies_detected: anomalies,
        anomaly_rate_pct: round_to(anomalies as f64 / total as f64 * 100.0, 2),
        min_score: round_to(min, 4),
        max_score: round_to(max, 4),
        mean_score: round_to(mean, 4),
    }
}

fn histogram(labels: &[bool], scores: &[f64]) -> ScoreHistogram {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = (max - min) / HISTOGRAM_BINS as f64;

    let edges = (0..=HISTOGRAM_BINS).map(|i| min + width * i as f64).collect();
    let mut normal = vec![0; HISTOGRAM_BINS];
    let mut anomaly = vec![0; HISTOGRAM_BINS];

    for (is_anomaly, score) in labels.iter().zip(scores) {
        let bin = if width > 0.0 {
            // the maximum falls into the last, closed bin
            (((score - min) / width) as usize).min(HISTOGRAM_BINS - 1)
        } else {
            0
        };
        if *is_anomaly {
            anomaly[bin] += 1;
        } else {
            normal[bin] += 1;
        }
    }

    ScoreHistogram {
        edges,
        normal,
        anomaly,
    }
}

fn top_anomalies(labels: &[bool], scores: &[f64]) -> Vec<RankedRecord> {
    let mut ranked: Vec<RankedRecord> = labels
        .iter()
        .zip(scores)
        .enumerate()
        .filter(|(_, (is_anomaly, _))| **is_anomaly)
        .map(|(row, (_, score))| RankedRecord { row, score: *score })
        .collect();
    ranked.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.row.cmp(&b.row)));
    ranked.truncate(TOP_ANOMALIES);
    ranked
}

fn monthly_trend(df: &DataFrame, labels: &[bool]) -> Result<Option<Vec<PeriodCount>>> {
    let (Ok(year), Ok(month)) = (df.column("year"), df.column("month")) else {
        return Ok(None);
    };
    let years = numeric_values(year.as_materialized_series())?;
    let months = numeric_values(month.as_materialized_series())?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for ((y, m), is_anomaly) in years.iter().zip(&months).zip(labels) {
        let (Some(y), Some(m)) = (y, m) else { continue };
        let count = counts
            .entry(format!("{}-{:02}", *y as i64, *m as i64))
            .or_insert(0);
        if *is_anomaly {
            *count += 1;
        }
    }

    Ok(Some(
        counts
            .into_iter()
            .map(|(period, anomaly_count)| PeriodCount {
                period,
                anomaly_count,
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;
    use pretty_assertions::assert_eq;

    fn scored() -> DataFrame {
        df!(
            "year" => [2023i64, 2023, 2023, 2024, 2024, 2024],
            "month" => [1i64, 1, 12, 2, 2, 2],
            LABEL_COLUMN => [1i32, -1, 1, -1, -1, 1],
            SCORE_COLUMN => [0.12, -0.05, 0.2, -0.2, -0.01, 0.08],
        )
        .unwrap()
    }

    #[test]
    fn test_summary_statistics() {
        let report = AnomalyReport::from_frame(&scored()).unwrap();
        let summary = &report.summary;

        assert_eq!(summary.total_records, 6);
        assert_eq!(summary.anomalies_detected, 3);
        assert_eq!(summary.normal_records, 3);
        assert_eq!(summary.anomaly_rate_pct, 50.0);
        assert_eq!(summary.min_score, -0.2);
        assert_eq!(summary.max_score, 0.2);
        assert_eq!(summary.mean_score, 0.0233);
    }

    #[test]
    fn test_summary_text_layout() {
        let text = AnomalyReport::from_frame(&scored()).unwrap().summary.to_text();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "ANOMALY DETECTION SUMMARY");
        assert_eq!(lines[1], "=".repeat(50));
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "Total Records: 6");
        assert_eq!(lines[6], "Anomaly Rate (%): 50");
        assert_eq!(lines[7], "Min Anomaly Score: -0.2");
    }

    #[test]
    fn test_top_anomalies_are_lowest_scores() {
        let report = AnomalyReport::from_frame(&scored()).unwrap();
        let rows: Vec<usize> = report.top_anomalies.iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![3, 1, 4]);
    }

    #[test]
    fn test_histogram_counts() {
        let report = AnomalyReport::from_frame(&scored()).unwrap();
        let histogram = &report.histogram;

        assert_eq!(histogram.edges.len(), HISTOGRAM_BINS + 1);
        assert_eq!(histogram.normal.iter().sum::<usize>(), 3);
        assert_eq!(histogram.anomaly.iter().sum::<usize>(), 3);
        assert_eq!(histogram.anomaly[0], 1);
        assert_eq!(histogram.normal[HISTOGRAM_BINS - 1], 1);
    }

    #[test]
    fn test_monthly_trend_zero_pads() {
        let report = AnomalyReport::from_frame(&scored()).unwrap();
        let trend = report.monthly_trend.unwrap();
        assert_eq!(
            trend,
            vec![
                PeriodCount { period: "2023-01".into(), anomaly_count: 1 },
                PeriodCount { period: "2023-12".into(), anomaly_count: 0 },
                PeriodCount { period: "2024-02".into(), anomaly_count: 2 },
            ]
        );
    }

    #[test]
    fn test_text_labels_and_no_trend() {
        let df = df!(
            LABEL_COLUMN => ["normal", "anomaly"],
            SCORE_COLUMN => [0.1, -0.1],
        )
        .unwrap();
        let report = AnomalyReport::from_frame(&df).unwrap();
        assert_eq!(report.summary.anomalies_detected, 1);
        assert!(report.monthly_trend.is_none());
    }

    #[test]
    fn test_file_reporter_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("viz");
        FileReporter.report(&scored(), &out).unwrap();

        assert!(out.join(SUMMARY_FILE_NAME).is_file());
        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(out.join(REPORT_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(json["summary"]["anomalies_detected"], 3);
        assert_eq!(json["top_anomalies"][0]["row"], 3);
    }

    #[test]
    fn test_missing_score_column() {
        let df = df!(LABEL_COLUMN => [1i32]).unwrap();
        let err = AnomalyReport::from_frame(&df).unwrap_err();
        assert!(err.to_string().contains(SCORE_COLUMN));
    }
}
