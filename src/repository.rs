/// Collaborator traits for the pipeline, plus in-memory and CSV adapters.
///
/// The cleaning engine never talks to a database or the filesystem
/// directly. It reads series through `SeriesRepository`, reports skipped
/// or failed units to an `IssueLog`, and may dump before/after series to a
/// `ComparisonSink`. The PostgreSQL repository lives in `db`.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::model::{QcError, RawObservation, Variable, VettedSlice};
use crate::variables;

// ---------------------------------------------------------------------------
// Series repository
// ---------------------------------------------------------------------------

/// Which copy of a variable to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SeriesKind {
    Raw,
    Vetted,
}

/// Source of raw series and sink for vetted slices.
pub trait SeriesRepository {
    /// Station ids with data in the raw store.
    fn stations(&mut self) -> Result<Vec<String>, QcError>;

    /// All observations for a station/variable, ordered by timestamp. An
    /// unknown station or variable yields an empty vector.
    fn load(
        &mut self,
        station: &str,
        variable: Variable,
        kind: SeriesKind,
    ) -> Result<Vec<RawObservation>, QcError>;

    /// Upserts one vetted water-year slice and returns the number of rows
    /// written. Rows outside the slice are left untouched.
    fn save(&mut self, station: &str, variable: Variable, slice: &VettedSlice) -> Result<usize, QcError>;
}

/// A vetted value and its merged flag label.
#[derive(Debug, Clone, PartialEq)]
pub struct VettedRow {
    pub value: Option<f64>,
    pub flag: String,
}

#[derive(Debug, Default)]
struct MemoryStore {
    raw: BTreeMap<(String, Variable), Vec<RawObservation>>,
    vetted: BTreeMap<(String, Variable), BTreeMap<NaiveDateTime, VettedRow>>,
}

/// Thread-safe in-memory repository. Clones share the same store, so one
/// clone can be handed to each worker of a parallel batch.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryStore>, QcError> {
        self.store
            .lock()
            .map_err(|_| QcError::Repository("memory store lock poisoned".into()))
    }

    /// Seeds the raw store for a station/variable.
    pub fn insert_raw(&self, station: &str, variable: Variable, observations: Vec<RawObservation>) -> Result<(), QcError> {
        self.lock()?.raw.insert((station.to_string(), variable), observations);
        Ok(())
    }

    /// Vetted rows for a station/variable, ordered by timestamp.
    pub fn vetted_rows(&self, station: &str, variable: Variable) -> Result<Vec<(NaiveDateTime, VettedRow)>, QcError> {
        Ok(self
            .lock()?
            .vetted
            .get(&(station.to_string(), variable))
            .map(|rows| rows.iter().map(|(ts, r)| (*ts, r.clone())).collect())
            .unwrap_or_default())
    }
}

impl SeriesRepository for MemoryRepository {
    fn stations(&mut self) -> Result<Vec<String>, QcError> {
        let store = self.lock()?;
        let mut ids: Vec<String> = store.raw.keys().map(|(s, _)| s.clone()).collect();
        ids.dedup();
        Ok(ids)
    }

    fn load(&mut self, station: &str, variable: Variable, kind: SeriesKind) -> Result<Vec<RawObservation>, QcError> {
        let store = self.lock()?;
        let key = (station.to_string(), variable);
        Ok(match kind {
            SeriesKind::Raw => store.raw.get(&key).cloned().unwrap_or_default(),
            SeriesKind::Vetted => store
                .vetted
                .get(&key)
                .map(|rows| rows.iter().map(|(ts, r)| RawObservation::new(*ts, r.value)).collect())
                .unwrap_or_default(),
        })
    }

    fn save(&mut self, station: &str, variable: Variable, slice: &VettedSlice) -> Result<usize, QcError> {
        let mut store = self.lock()?;
        let rows = store.vetted.entry((station.to_string(), variable)).or_default();
        let mut written = 0;
        for (ts, value, flag) in slice.rows() {
            rows.insert(ts, VettedRow { value, flag: flag.to_string() });
            written += 1;
        }
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Issue log
// ---------------------------------------------------------------------------

/// One skipped or failed unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub station: String,
    pub variable: Variable,
    /// `None` when the failure happened before any water year was located
    /// (e.g. the series could not be loaded).
    pub water_year: Option<i32>,
    pub outcome: String,
    pub reason: String,
}

pub trait IssueLog {
    fn record(&mut self, issue: &Issue) -> Result<(), QcError>;
}

/// Keeps issues in memory; used by tests and by callers that report them
/// some other way.
#[derive(Debug, Default)]
pub struct MemoryIssueLog {
    pub issues: Vec<Issue>,
}

impl IssueLog for MemoryIssueLog {
    fn record(&mut self, issue: &Issue) -> Result<(), QcError> {
        self.issues.push(issue.clone());
        Ok(())
    }
}

/// Appends issues to a CSV file with a header row.
pub struct CsvIssueLog {
    writer: csv::Writer<fs::File>,
}

impl CsvIssueLog {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, QcError> {
        let writer = csv::Writer::from_path(path.as_ref())
            .map_err(|e| QcError::Repository(format!("cannot create {}: {}", path.as_ref().display(), e)))?;
        Ok(Self { writer })
    }
}

impl IssueLog for CsvIssueLog {
    fn record(&mut self, issue: &Issue) -> Result<(), QcError> {
        self.writer
            .serialize(issue)
            .and_then(|_| self.writer.flush().map_err(csv::Error::from))
            .map_err(|e| QcError::Repository(format!("issue log write failed: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// Comparison sink
// ---------------------------------------------------------------------------

/// Raw, intermediate (before the last stage) and final series of one unit.
#[derive(Debug)]
pub struct Comparison<'a> {
    pub station: &'a str,
    pub variable: Variable,
    pub water_year: i32,
    pub start: NaiveDateTime,
    pub raw: &'a [Option<f64>],
    pub intermediate: &'a [Option<f64>],
    pub cleaned: &'a [Option<f64>],
    pub flags: &'a [String],
}

/// Observational sink for before/after series. Failures are logged by the
/// caller and never affect the unit outcome.
pub trait ComparisonSink: Send + Sync {
    fn write(&self, comparison: &Comparison<'_>) -> Result<(), QcError>;
}

/// Discards everything.
pub struct NullComparisonSink;

impl ComparisonSink for NullComparisonSink {
    fn write(&self, _comparison: &Comparison<'_>) -> Result<(), QcError> {
        Ok(())
    }
}

/// Header named after the variable's station-table columns, e.g.
/// `timestamp,SWE_raw,SWE_intermediate,SWE,SWE_flags`.
fn comparison_header(variable: Variable) -> [String; 5] {
    let (column, flag_column) = match variables::descriptor(variable) {
        Some(d) => (d.column.to_string(), d.flag_column()),
        None => (variable.code().to_string(), format!("{}_flags", variable.code())),
    };
    [
        "timestamp".to_string(),
        format!("{}_raw", column),
        format!("{}_intermediate", column),
        column,
        flag_column,
    ]
}

#[derive(Serialize)]
struct ComparisonRow<'a> {
    timestamp: NaiveDateTime,
    raw: Option<f64>,
    intermediate: Option<f64>,
    cleaned: Option<f64>,
    flag: &'a str,
}

/// Writes one CSV per unit: `<dir>/<station>/<variable>_<label>.csv`.
pub struct CsvComparisonWriter {
    dir: PathBuf,
}

impl CsvComparisonWriter {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, station: &str, variable: Variable, water_year: i32) -> PathBuf {
        self.dir
            .join(station)
            .join(format!("{}_{}-{}.csv", variable, water_year, water_year + 1))
    }
}

impl ComparisonSink for CsvComparisonWriter {
    fn write(&self, c: &Comparison<'_>) -> Result<(), QcError> {
        let path = self.path_for(c.station, c.variable, c.water_year);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| QcError::Repository(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let to_repo_err = |e: csv::Error| QcError::Repository(format!("{}: {}", path.display(), e));
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .map_err(to_repo_err)?;
        writer.write_record(comparison_header(c.variable)).map_err(to_repo_err)?;
        for (i, cleaned) in c.cleaned.iter().enumerate() {
            writer
                .serialize(ComparisonRow {
                    timestamp: c.start + chrono::Duration::hours(i as i64),
                    raw: c.raw.get(i).copied().flatten(),
                    intermediate: c.intermediate.get(i).copied().flatten(),
                    cleaned: *cleaned,
                    flag: c.flags.get(i).map(String::as_str).unwrap_or("0"),
                })
                .map_err(to_repo_err)?;
        }
        writer
            .flush()
            .map_err(|e| QcError::Repository(format!("{}: {}", path.display(), e)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
