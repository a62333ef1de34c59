/// Core data types for the weather-station QA/QC service.
///
/// This module defines the shared domain model imported by all other modules:
/// the hourly observation series, the water-year window that every filter
/// stage is restricted to, per-stage flag vectors, and the crate error type.
/// It contains no I/O.

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// A measured (or derived) weather-station variable.
///
/// The snake_case code is what station profiles, the CLI and the database
/// use. Column names and units live on the variable descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    AirTemp,
    #[serde(rename = "rh")]
    RelativeHumidity,
    WindSpeed,
    #[serde(rename = "wind_dir")]
    WindDirection,
    SnowDepth,
    Swe,
    #[serde(rename = "pp_tipper")]
    PrecipIncrement,
    #[serde(rename = "pc_tipper")]
    PrecipCumulative,
    #[serde(rename = "pc_pipe")]
    PrecipPipe,
    #[serde(rename = "bp")]
    Pressure,
}

impl Variable {
    pub const ALL: [Variable; 10] = [
        Variable::AirTemp,
        Variable::RelativeHumidity,
        Variable::WindSpeed,
        Variable::WindDirection,
        Variable::SnowDepth,
        Variable::Swe,
        Variable::PrecipIncrement,
        Variable::PrecipCumulative,
        Variable::PrecipPipe,
        Variable::Pressure,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Variable::AirTemp => "air_temp",
            Variable::RelativeHumidity => "rh",
            Variable::WindSpeed => "wind_speed",
            Variable::WindDirection => "wind_dir",
            Variable::SnowDepth => "snow_depth",
            Variable::Swe => "swe",
            Variable::PrecipIncrement => "pp_tipper",
            Variable::PrecipCumulative => "pc_tipper",
            Variable::PrecipPipe => "pc_pipe",
            Variable::Pressure => "bp",
        }
    }

    /// Parses a variable code as used in `stations.toml` and on the CLI.
    pub fn from_code(code: &str) -> Option<Variable> {
        Variable::ALL.iter().copied().find(|v| v.code() == code)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Raw observations
// ---------------------------------------------------------------------------

/// A single (timestamp, value) pair at the station's native cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawObservation {
    pub timestamp: NaiveDateTime,
    pub value: Option<f64>,
}

impl RawObservation {
    pub fn new(timestamp: NaiveDateTime, value: Option<f64>) -> Self {
        Self { timestamp, value }
    }
}

// ---------------------------------------------------------------------------
// Hourly series
// ---------------------------------------------------------------------------

/// A strictly hourly series: slot `i` holds the value observed at
/// `start + i hours`. Missing hours are `None`.
///
/// Positions are always derived from timestamps through `index_of` /
/// `timestamp_at`, so windows built from timestamps cannot drift against
/// the values they address.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlySeries {
    start: NaiveDateTime,
    values: Vec<Option<f64>>,
}

impl HourlySeries {
    /// Builds a series from values starting at `start`. `start` must lie on
    /// the hour.
    pub fn new(start: NaiveDateTime, values: Vec<Option<f64>>) -> Self {
        debug_assert!(start.minute() == 0 && start.second() == 0);
        Self { start, values }
    }

    /// An all-null series covering `len` hours from `start`.
    pub fn nulls(start: NaiveDateTime, len: usize) -> Self {
        Self::new(start, vec![None; len])
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Timestamp of the last slot, `None` for an empty series.
    pub fn end(&self) -> Option<NaiveDateTime> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.timestamp_at(self.values.len() - 1))
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn timestamp_at(&self, index: usize) -> NaiveDateTime {
        self.start + Duration::hours(index as i64)
    }

    /// Position of `ts` in the series, or `None` if it is off the hourly grid
    /// or outside the covered span.
    pub fn index_of(&self, ts: NaiveDateTime) -> Option<usize> {
        let delta = ts - self.start;
        if delta < Duration::zero() || delta.num_seconds() % 3600 != 0 {
            return None;
        }
        let idx = delta.num_hours() as usize;
        (idx < self.values.len()).then_some(idx)
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied().flatten()
    }

    pub fn set(&mut self, index: usize, value: Option<f64>) {
        self.values[index] = value;
    }

    /// Value at a timestamp, `None` if missing or outside the series.
    pub fn value_at(&self, ts: NaiveDateTime) -> Option<f64> {
        self.index_of(ts).and_then(|i| self.get(i))
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    /// The values covered by `window`.
    pub fn window_values(&self, window: &YearWindow) -> &[Option<f64>] {
        &self.values[window.range()]
    }

    /// Indices within `window` that currently hold a value.
    pub fn non_null_indices(&self, window: &YearWindow) -> Vec<usize> {
        window.range().filter(|&i| self.values[i].is_some()).collect()
    }

    /// True if every slot in `window` is null.
    pub fn is_all_null(&self, window: &YearWindow) -> bool {
        self.window_values(window).iter().all(Option::is_none)
    }

    /// Re-expresses this series on another hourly grid, matching slots by
    /// timestamp. Slots with no counterpart are null.
    pub fn aligned_to(&self, start: NaiveDateTime, len: usize) -> HourlySeries {
        let values = (0..len)
            .map(|i| self.value_at(start + Duration::hours(i as i64)))
            .collect();
        HourlySeries::new(start, values)
    }
}

// ---------------------------------------------------------------------------
// Water-year windows
// ---------------------------------------------------------------------------

/// How the boundaries of a water year were resolved against the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    /// Both Oct 1 00:00 and Sep 30 23:00 exist in the series.
    Full,
    /// Data begins after Oct 1 but within the short-start tolerance.
    ShortStart,
    /// Data ends before Sep 30 but within the short-end tolerance.
    ShortEnd,
    /// Both ends fell back to the tolerance rule.
    ShortBoth,
}

/// The inclusive index range of one water year inside an `HourlySeries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearWindow {
    /// Calendar year in which the water year starts (Oct 1).
    pub water_year: i32,
    pub start: usize,
    pub end: usize,
    pub start_ts: NaiveDateTime,
    pub end_ts: NaiveDateTime,
    pub kind: BoundaryKind,
}

impl YearWindow {
    /// Builds a window from boundary timestamps already present in `series`.
    pub fn from_timestamps(
        series: &HourlySeries,
        water_year: i32,
        start_ts: NaiveDateTime,
        end_ts: NaiveDateTime,
        kind: BoundaryKind,
    ) -> Option<Self> {
        let start = series.index_of(start_ts)?;
        let end = series.index_of(end_ts)?;
        (start <= end).then_some(Self {
            water_year,
            start,
            end,
            start_ts,
            end_ts,
            kind,
        })
    }

    /// A window spanning the whole series; used by tests and by callers that
    /// run a single stage outside the water-year loop.
    pub fn whole(series: &HourlySeries, water_year: i32) -> Option<Self> {
        let end_ts = series.end()?;
        Self::from_timestamps(series, water_year, series.start(), end_ts, BoundaryKind::Full)
    }

    pub fn range(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index <= self.end
    }

    /// Offset of a series index relative to the window start.
    pub fn offset(&self, index: usize) -> usize {
        index - self.start
    }

    /// Label such as `2021-2022`.
    pub fn label(&self) -> String {
        format!("{}-{}", self.water_year, self.water_year + 1)
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Per-window flags produced by one stage: 0 where the stage did not act,
/// its code where it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagVector {
    codes: Vec<u8>,
}

impl FlagVector {
    pub fn new(len: usize) -> Self {
        Self { codes: vec![0; len] }
    }

    pub fn for_window(window: &YearWindow) -> Self {
        Self::new(window.len())
    }

    pub fn from_codes(codes: Vec<u8>) -> Self {
        Self { codes }
    }

    /// Marks window offset `offset` with `code`.
    pub fn mark(&mut self, offset: usize, code: u8) {
        self.codes[offset] = code;
    }

    pub fn get(&self, offset: usize) -> u8 {
        self.codes[offset]
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Number of timestamps this stage acted on.
    pub fn count(&self) -> usize {
        self.codes.iter().filter(|&&c| c != 0).count()
    }

    pub fn is_clear(&self) -> bool {
        self.count() == 0
    }

    pub fn codes(&self) -> &[u8] {
        &self.codes
    }

    /// Window offsets that were flagged.
    pub fn flagged_offsets(&self) -> Vec<usize> {
        self.codes
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0)
            .map(|(i, _)| i)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Vetted output
// ---------------------------------------------------------------------------

/// One water year of cleaned values plus merged flag codes, ready for the
/// output sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VettedSlice {
    pub water_year: i32,
    pub start: NaiveDateTime,
    pub values: Vec<Option<f64>>,
    pub flags: Vec<String>,
}

impl VettedSlice {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn timestamp_at(&self, offset: usize) -> NaiveDateTime {
        self.start + Duration::hours(offset as i64)
    }

    /// Rows as (timestamp, value, flag).
    pub fn rows(&self) -> impl Iterator<Item = (NaiveDateTime, Option<f64>, &str)> + '_ {
        self.values
            .iter()
            .zip(self.flags.iter())
            .enumerate()
            .map(|(i, (v, f))| (self.timestamp_at(i), *v, f.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised while cleaning a (station, variable, water-year) unit.
///
/// Every variant is local to one unit; the batch runner records it and moves
/// on to the next unit.
#[derive(Debug, thiserror::Error)]
pub enum QcError {
    /// No usable water-year start/end timestamp within tolerance.
    #[error("water year {water_year}-{}: {detail}", .water_year + 1)]
    MissingBoundary { water_year: i32, detail: String },

    /// The variable has no non-null samples in the water year.
    #[error("water year {water_year}-{}: no non-null samples", .water_year + 1)]
    AllNull { water_year: i32 },

    /// Cleaned slice length disagrees with the persisted target length.
    #[error("cleaned slice has {actual} rows but target expects {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A numeric transform had no defined result (zero division, empty window).
    #[error("numeric degenerate: {0}")]
    NumericDegenerate(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("repository error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
