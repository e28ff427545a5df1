//! Calendar feature derivation.
//!
//! Replaces a timestamp column with numeric `year`, `month` and `day` columns.
//! Parsing is tolerant: every value is tried against a list of common export
//! formats and values that match none of them become missing.

use crate::error::Result;
use crate::utils::{DtypeCategory, get_dtype_category, numeric_values};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tracing::{debug, warn};

/// Names of the derived calendar columns, in output order.
pub const DATE_FEATURE_COLUMNS: [&str; 3] = ["year", "month", "day"];

/// Datetime layouts, tried before the date-only layouts.
const DATETIME_FORMATS: [&str; 10] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Date-only layouts. Month-first wins over day-first for ambiguous values.
const DATE_FORMATS: [&str; 9] = [
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%Y%m%d",
];

/// Expands a timestamp column into calendar features.
#[derive(Debug, Clone)]
pub struct DateFeatureExpander<'a> {
    column: &'a str,
    extra_formats: &'a [String],
}

impl<'a> DateFeatureExpander<'a> {
    /// Create an expander for `column`, trying `extra_formats` after the built-in ones.
    pub fn new(column: &'a str, extra_formats: &'a [String]) -> Self {
        Self {
            column,
            extra_formats,
        }
    }

    /// Name of the timestamp column this expander reads.
    pub fn column(&self) -> &str {
        self.column
    }

    /// Replace the timestamp column with `year`/`month`/`day`.
    ///
    /// Returns `Ok(None)` when the column is absent; the input is never mutated.
    pub fn expand(&self, df: &DataFrame) -> Result<Option<DataFrame>> {
        let Ok(column) = df.column(self.column) else {
            debug!("Date column '{}' not present, skipping expansion", self.column);
            return Ok(None);
        };

        let dates = self.parse_series(column.as_materialized_series())?;
        let unparsed = dates.iter().filter(|d| d.is_none()).count();
        if unparsed > 0 {
            warn!(
                "{} of {} values in '{}' could not be parsed as dates",
                unparsed,
                dates.len(),
                self.column
            );
        }

        let years: Vec<Option<i32>> = dates.iter().map(|d| d.map(|d| d.year())).collect();
        let months: Vec<Option<i32>> = dates.iter().map(|d| d.map(|d| d.month() as i32)).collect();
        let days: Vec<Option<i32>> = dates.iter().map(|d| d.map(|d| d.day() as i32)).collect();

        let mut expanded = df.drop(self.column)?;
        expanded.with_column(Series::new(DATE_FEATURE_COLUMNS[0].into(), years))?;
        expanded.with_column(Series::new(DATE_FEATURE_COLUMNS[1].into(), months))?;
        expanded.with_column(Series::new(DATE_FEATURE_COLUMNS[2].into(), days))?;

        debug!(
            "Expanded '{}' into {:?} ({} rows)",
            self.column,
            DATE_FEATURE_COLUMNS,
            expanded.height()
        );

        Ok(Some(expanded))
    }

    /// Parse every value of a series into a calendar date.
    fn parse_series(&self, series: &Series) -> Result<Vec<Option<NaiveDate>>> {
        match get_dtype_category(series.dtype()) {
            DtypeCategory::Numeric => Ok(numeric_values(series)?
                .into_iter()
                .map(|v| {
                    v.filter(|n| n.fract() == 0.0)
                        .and_then(|n| integer_to_date(n as i64))
                })
                .collect()),
            _ => {
                let str_series = series.cast(&DataType::String)?;
                Ok(str_series
                    .str()?
                    .into_iter()
                    .map(|v| v.and_then(|raw| self.parse_date(raw)))
                    .collect())
            }
        }
    }

    /// Parse one raw value, trying every known layout in order.
    pub fn parse_date(&self, raw: &str) -> Option<NaiveDate> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(dt.date_naive());
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
            return Some(dt.date_naive());
        }

        let custom = self.extra_formats.iter().map(String::as_str);

        for format in DATETIME_FORMATS.iter().copied().chain(custom.clone()) {
            if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Some(dt.date());
            }
        }

        for format in DATE_FORMATS.iter().copied().chain(custom) {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                return Some(date);
            }
        }

        if let Ok(n) = trimmed.parse::<i64>() {
            return integer_to_date(n);
        }

        None
    }
}

/// Interpret an integer as a compact `YYYYMMDD` date, else as an epoch timestamp.
fn integer_to_date(value: i64) -> Option<NaiveDate> {
    if (10_000_101..=99_991_231).contains(&value) {
        let (year, month, day) = (value / 10_000, (value / 100) % 100, value % 100);
        return NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32);
    }
    epoch_to_date(value)
}

/// Interpret an integer as a unix timestamp in seconds or milliseconds.
fn epoch_to_date(timestamp: i64) -> Option<NaiveDate> {
    // Seconds and milliseconds ranges for dates between 2001 and 2033
    let millis = if timestamp > 1_000_000_000 && timestamp < 2_000_000_000 {
        timestamp * 1000
    } else if timestamp > 1_000_000_000_000 && timestamp < 2_000_000_000_000 {
        timestamp
    } else {
        return None;
    };

    DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
}
