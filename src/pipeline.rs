/// Batch orchestration for the QA/QC service
///
/// This module drives the cleaning of every (station, variable) job:
/// 1. Loads the raw series (or the vetted source series for derived variables)
/// 2. Reindexes it to a strict hourly grid, honouring the station's record end
/// 3. Resolves each water year to a window and skips unusable years
/// 4. Runs the variable's stage list, then merges flags
/// 5. Emits the vetted slice to the repository and the comparison sink
///
/// Every failure is local to one (station, variable, water-year) unit. The
/// batch records it in a `UnitReport` and moves on.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use threadpool::ThreadPool;

use crate::config::{QcConfig, StationProfile};
use crate::filters::{self, StageContext};
use crate::flags;
use crate::model::{BoundaryKind, FlagVector, HourlySeries, QcError, Variable, VettedSlice, YearWindow};
use crate::repository::{Comparison, ComparisonSink, Issue, IssueLog, NullComparisonSink, SeriesKind, SeriesRepository};
use crate::segment::{self, BoundaryPolicy};
use crate::variables::{self, VariableDescriptor};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Batch runner configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker threads for `run_parallel` (default: 1)
    pub workers: usize,

    /// Only process these stations (default: every station in the repository)
    pub stations: Option<Vec<String>>,

    /// Only process these variables (default: every registered variable)
    pub variables: Option<Vec<Variable>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            stations: None,
            variables: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Terminal state of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Emitted { rows: usize, boundary: BoundaryKind },
    SkippedNoBoundary,
    SkippedAllNull,
    Excluded,
    /// The series could not be read from the repository.
    LoadFailed,
    WriteFailed,
}

impl UnitOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Emitted { .. } => "emitted",
            UnitOutcome::SkippedNoBoundary => "skipped_no_boundary",
            UnitOutcome::SkippedAllNull => "skipped_all_null",
            UnitOutcome::Excluded => "excluded",
            UnitOutcome::LoadFailed => "load_failed",
            UnitOutcome::WriteFailed => "write_failed",
        }
    }

    pub fn is_emitted(&self) -> bool {
        matches!(self, UnitOutcome::Emitted { .. })
    }
}

/// What happened to one (station, variable, water-year) unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub station: String,
    pub variable: Variable,
    /// `None` for job-level failures that happen before any water year is known.
    pub water_year: Option<i32>,
    pub outcome: UnitOutcome,
    pub detail: String,
    /// Rows whose merged flag is not "0".
    pub flagged_rows: usize,
}

impl UnitReport {
    fn new(station: &str, variable: Variable, water_year: Option<i32>, outcome: UnitOutcome, detail: String) -> Self {
        Self {
            station: station.to_string(),
            variable,
            water_year,
            outcome,
            detail,
            flagged_rows: 0,
        }
    }

    /// The issue-log record for a unit that was not emitted.
    pub fn to_issue(&self) -> Option<Issue> {
        if self.outcome.is_emitted() {
            return None;
        }
        Some(Issue {
            station: self.station.clone(),
            variable: self.variable,
            water_year: self.water_year,
            outcome: self.outcome.label().to_string(),
            reason: self.detail.clone(),
        })
    }
}

/// Totals over a batch, exported as JSON by the binary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub units: usize,
    pub emitted: usize,
    pub rows_written: usize,
    /// Unit count per outcome label.
    pub outcomes: BTreeMap<String, usize>,
    pub reports: Vec<UnitReport>,
}

impl BatchSummary {
    pub fn from_reports(mut reports: Vec<UnitReport>) -> Self {
        reports.sort_by(|a, b| {
            (&a.station, a.variable, a.water_year).cmp(&(&b.station, b.variable, b.water_year))
        });
        let mut summary = BatchSummary {
            units: reports.len(),
            ..Default::default()
        };
        for r in &reports {
            *summary.outcomes.entry(r.outcome.label().to_string()).or_insert(0) += 1;
            if let UnitOutcome::Emitted { rows, .. } = r.outcome {
                summary.emitted += 1;
                summary.rows_written += rows;
            }
        }
        summary.reports = reports;
        summary
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitReport> {
        self.reports.iter().filter(|r| !r.outcome.is_emitted())
    }

    pub fn to_json(&self) -> Result<String, QcError> {
        serde_json::to_string_pretty(self).map_err(|e| QcError::Repository(format!("summary serialization: {}", e)))
    }
}

/// Writes an issue-log record for every unit that was not emitted.
pub fn record_issues(reports: &[UnitReport], log: &mut dyn IssueLog) -> Result<usize, QcError> {
    let mut written = 0;
    for issue in reports.iter().filter_map(UnitReport::to_issue) {
        log.record(&issue)?;
        written += 1;
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The batch runner. Cloning is cheap; parallel workers each get a clone.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    qc: Arc<QcConfig>,
    comparisons: Arc<dyn ComparisonSink>,
}

impl Pipeline {
    /// Create a pipeline with default batch configuration
    pub fn new(qc: QcConfig) -> Self {
        Self::with_config(qc, PipelineConfig::default())
    }

    /// Create a pipeline with custom batch configuration
    pub fn with_config(qc: QcConfig, config: PipelineConfig) -> Self {
        Self {
            config,
            qc: Arc::new(qc),
            comparisons: Arc::new(NullComparisonSink),
        }
    }

    /// Sends raw / intermediate / final series of every emitted unit to `sink`.
    pub fn with_comparison_sink(mut self, sink: Arc<dyn ComparisonSink>) -> Self {
        self.comparisons = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The profile for a station, or a plain one when the file has none.
    pub fn profile(&self, station: &str) -> StationProfile {
        self.qc
            .station(station)
            .cloned()
            .unwrap_or_else(|| StationProfile::plain(station))
    }

    fn wants_variable(&self, variable: Variable) -> bool {
        self.config
            .variables
            .as_ref()
            .is_none_or(|vars| vars.contains(&variable))
    }

    fn station_ids(&self, repo: &mut dyn SeriesRepository) -> Result<Vec<String>, QcError> {
        match &self.config.stations {
            Some(ids) => Ok(ids.clone()),
            None => repo.stations(),
        }
    }

    /// Jobs grouped by dependency tier, tier 0 first. A station's RH job
    /// lands in a later tier than its temperature job.
    pub fn plan(&self, station_ids: &[String]) -> Vec<Vec<(StationProfile, Variable)>> {
        variables::tiers()
            .into_iter()
            .map(|tier| {
                let mut jobs = Vec::new();
                for id in station_ids {
                    let profile = self.profile(id);
                    for &variable in &tier {
                        if self.wants_variable(variable) && profile.handles(variable) {
                            jobs.push((profile.clone(), variable));
                        }
                    }
                }
                jobs
            })
            .filter(|jobs| !jobs.is_empty())
            .collect()
    }

    /// Processes every job on the calling thread.
    pub fn run_batch(&self, repo: &mut dyn SeriesRepository) -> Result<BatchSummary, QcError> {
        let station_ids = self.station_ids(repo)?;
        info!("Batch over {} stations", station_ids.len());

        let mut reports = Vec::new();
        for (tier, jobs) in self.plan(&station_ids).into_iter().enumerate() {
            debug!("Tier {}: {} jobs", tier, jobs.len());
            for (profile, variable) in &jobs {
                reports.extend(self.process_variable(repo, profile, *variable));
            }
        }
        Ok(BatchSummary::from_reports(reports))
    }

    /// Processes jobs on a thread pool of `config.workers` threads. Each job
    /// gets its own repository from `factory`; tiers run one after another.
    pub fn run_parallel<R, F>(&self, factory: F) -> Result<BatchSummary, QcError>
    where
        R: SeriesRepository + 'static,
        F: Fn() -> Result<R, QcError> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let station_ids = {
            let mut repo = factory()?;
            self.station_ids(&mut repo)?
        };
        let workers = self.config.workers.max(1);
        info!("Batch over {} stations with {} workers", station_ids.len(), workers);

        let pool = ThreadPool::new(workers);
        let mut reports = Vec::new();
        for (tier, jobs) in self.plan(&station_ids).into_iter().enumerate() {
            debug!("Tier {}: {} jobs", tier, jobs.len());
            let (tx, rx) = mpsc::channel();
            for (profile, variable) in jobs {
                let tx = tx.clone();
                let pipeline = self.clone();
                let factory = Arc::clone(&factory);
                pool.execute(move || {
                    let job_reports = match factory() {
                        Ok(mut repo) => pipeline.process_variable(&mut repo, &profile, variable),
                        Err(e) => vec![UnitReport::new(
                            &profile.id,
                            variable,
                            None,
                            UnitOutcome::LoadFailed,
                            e.to_string(),
                        )],
                    };
                    // The receiver outlives every job of the tier.
                    let _ = tx.send(job_reports);
                });
            }
            drop(tx);
            // Ends once every sender is gone, including those of panicked jobs.
            for job_reports in rx {
                reports.extend(job_reports);
            }
            pool.join();
        }
        Ok(BatchSummary::from_reports(reports))
    }

    // -----------------------------------------------------------------------
    // One (station, variable) job
    // -----------------------------------------------------------------------

    /// Cleans every water year of one variable at one station.
    pub fn process_variable(
        &self,
        repo: &mut dyn SeriesRepository,
        profile: &StationProfile,
        variable: Variable,
    ) -> Vec<UnitReport> {
        let station = profile.id.as_str();
        let Some(descriptor) = variables::descriptor(variable) else {
            return vec![UnitReport::new(
                station,
                variable,
                None,
                UnitOutcome::LoadFailed,
                format!("no descriptor registered for {}", variable),
            )];
        };

        let (source, kind) = match descriptor.derived_from {
            Some(source) => (source, SeriesKind::Vetted),
            None => (variable, SeriesKind::Raw),
        };
        let observations = match repo.load(station, source, kind) {
            Ok(obs) => obs,
            Err(e) => {
                warn!("{} {}: load failed: {}", station, variable, e);
                return vec![UnitReport::new(station, variable, None, UnitOutcome::LoadFailed, e.to_string())];
            }
        };

        let Some(series) = segment::reindex_hourly(&observations, profile.record_end) else {
            warn!("{} {}: no usable observations", station, variable);
            return vec![UnitReport::new(
                station,
                variable,
                None,
                UnitOutcome::SkippedAllNull,
                format!("no usable {:?} observations of {}", kind, source),
            )];
        };

        let companion = descriptor
            .companion
            .and_then(|c| self.load_companion(repo, station, c, &series));

        let Some(years) = segment::water_year_range(&series) else {
            return Vec::new();
        };
        years
            .map(|wy| self.process_unit(repo, profile, descriptor, &series, companion.as_ref(), wy))
            .collect()
    }

    /// The vetted companion series re-expressed on the grid of `series`.
    fn load_companion(
        &self,
        repo: &mut dyn SeriesRepository,
        station: &str,
        companion: Variable,
        series: &HourlySeries,
    ) -> Option<HourlySeries> {
        match repo.load(station, companion, SeriesKind::Vetted) {
            Ok(obs) => segment::reindex_hourly(&obs, None).map(|c| c.aligned_to(series.start(), series.len())),
            Err(e) => {
                warn!("{}: vetted {} unavailable: {}", station, companion, e);
                None
            }
        }
    }

    fn process_unit(
        &self,
        repo: &mut dyn SeriesRepository,
        profile: &StationProfile,
        descriptor: &VariableDescriptor,
        series: &HourlySeries,
        companion: Option<&HourlySeries>,
        water_year: i32,
    ) -> UnitReport {
        let station = profile.id.as_str();
        let variable = descriptor.variable;
        let report = |outcome, detail: String| UnitReport::new(station, variable, Some(water_year), outcome, detail);

        if profile.is_year_excluded(variable, water_year) {
            info!("{} {} {}-{}: excluded by station profile", station, variable, water_year, water_year + 1);
            return report(UnitOutcome::Excluded, "excluded by station profile".into());
        }

        let policy = BoundaryPolicy::from(&self.qc.settings);
        let window = match segment::locate_water_year(series, water_year, &policy) {
            Ok(w) => w,
            Err(e) => {
                warn!("{} {}: {}", station, variable, e);
                return report(UnitOutcome::SkippedNoBoundary, e.to_string());
            }
        };
        if let Err(e) = segment::ensure_has_data(series, &window) {
            warn!("{} {}: {}", station, variable, e);
            return report(UnitOutcome::SkippedAllNull, e.to_string());
        }

        info!("{} {} {}: cleaning {} hours ({:?})", station, variable, window.label(), window.len(), window.kind);
        let (working, intermediate, stage_flags) = self.run_stages(profile, descriptor, series, companion, &window);

        let merged = flags::merge_flags(&stage_flags, descriptor.dominance, self.qc.settings.retain_interpolation_history);
        let slice = VettedSlice {
            water_year,
            start: window.start_ts,
            values: working.window_values(&window).to_vec(),
            flags: merged,
        };

        if let Err(e) = check_slice(&slice, &window) {
            warn!("{} {} {}: {}", station, variable, window.label(), e);
            return report(UnitOutcome::WriteFailed, e.to_string());
        }

        let rows = match repo.save(station, variable, &slice) {
            Ok(rows) if rows == window.len() => rows,
            Ok(rows) => {
                let e = QcError::LengthMismatch { expected: window.len(), actual: rows };
                warn!("{} {} {}: {}", station, variable, window.label(), e);
                return report(UnitOutcome::WriteFailed, e.to_string());
            }
            Err(e) => {
                warn!("{} {} {}: {}", station, variable, window.label(), e);
                return report(UnitOutcome::WriteFailed, e.to_string());
            }
        };

        let comparison = Comparison {
            station,
            variable,
            water_year,
            start: window.start_ts,
            raw: series.window_values(&window),
            intermediate: &intermediate,
            cleaned: &slice.values,
            flags: &slice.flags,
        };
        if let Err(e) = self.comparisons.write(&comparison) {
            warn!("{} {} {}: comparison dump failed: {}", station, variable, window.label(), e);
        }

        let flagged_rows = slice.flags.iter().filter(|f| f.as_str() != "0").count();
        info!("{} {} {}: wrote {} rows, {} flagged", station, variable, window.label(), rows, flagged_rows);
        UnitReport {
            flagged_rows,
            ..report(UnitOutcome::Emitted { rows, boundary: window.kind }, String::new())
        }
    }

    /// Runs the descriptor's stages on a fresh copy of `series`. Returns the
    /// cleaned copy, the window values before the last stage, and the
    /// per-stage flags in stage order.
    fn run_stages(
        &self,
        profile: &StationProfile,
        descriptor: &VariableDescriptor,
        series: &HourlySeries,
        companion: Option<&HourlySeries>,
        window: &YearWindow,
    ) -> (HourlySeries, Vec<Option<f64>>, Vec<FlagVector>) {
        let ctx = StageContext {
            profile,
            settings: &self.qc.settings,
            variable: descriptor.variable,
            companion,
        };
        let mut working = series.clone();
        let mut intermediate = Vec::new();
        let mut stage_flags = Vec::with_capacity(descriptor.stages.len());
        let last = descriptor.stages.len().saturating_sub(1);

        for (pos, spec) in descriptor.stages.iter().enumerate() {
            if pos == last {
                intermediate = working.window_values(window).to_vec();
            }
            let flags = filters::apply_stage(&mut working, window, spec, &ctx);
            debug!(
                "{} {} {}: stage {} ({}) flagged {}",
                profile.id,
                descriptor.variable,
                window.label(),
                pos,
                spec.kind.name(),
                flags.count()
            );
            stage_flags.push(flags);
        }
        (working, intermediate, stage_flags)
    }
}

/// Values and flags must both cover exactly the window.
fn check_slice(slice: &VettedSlice, window: &YearWindow) -> Result<(), QcError> {
    for actual in [slice.values.len(), slice.flags.len()] {
        if actual != window.len() {
            return Err(QcError::LengthMismatch { expected: window.len(), actual });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawObservation;
    use crate::repository::{MemoryIssueLog, MemoryRepository};
    use chrono::{Duration, NaiveDate, NaiveDateTime};

    fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn hourly(start: NaiveDateTime, hours: i64, value: impl Fn(i64) -> Option<f64>) -> Vec<RawObservation> {
        (0..hours)
            .map(|h| RawObservation::new(start + Duration::hours(h), value(h)))
            .collect()
    }

    #[test]
    fn test_pipeline_creation() {
        let pipeline = Pipeline::new(QcConfig::default());
        assert_eq!(pipeline.config().workers, 1);
        assert!(pipeline.config().stations.is_none());
    }

    #[test]
    fn test_custom_pipeline_config() {
        let config = PipelineConfig {
            workers: 4,
            stations: Some(vec!["tetrahedron".into()]),
            variables: Some(vec![Variable::Swe]),
        };
        let pipeline = Pipeline::with_config(QcConfig::default(), config);
        assert_eq!(pipeline.config().workers, 4);
        let plan = pipeline.plan(&["tetrahedron".to_string()]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0][0].1, Variable::Swe);
    }

    #[test]
    fn test_plan_puts_dependents_in_later_tier() {
        let pipeline = Pipeline::new(QcConfig::default());
        let plan = pipeline.plan(&["a".to_string()]);
        assert_eq!(plan.len(), 2);
        let later: Vec<Variable> = plan[1].iter().map(|(_, v)| *v).collect();
        assert!(later.contains(&Variable::RelativeHumidity));
        assert!(later.contains(&Variable::PrecipCumulative));
        assert!(plan[0].iter().any(|(_, v)| *v == Variable::AirTemp));
    }

    #[test]
    fn test_missing_raw_series_reports_once() {
        let mut repo = MemoryRepository::new();
        let pipeline = Pipeline::new(QcConfig::default());
        let reports = pipeline.process_variable(&mut repo, &StationProfile::plain("a"), Variable::AirTemp);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, UnitOutcome::SkippedAllNull);
        assert_eq!(reports[0].water_year, None);
    }

    #[test]
    fn test_short_year_is_skipped_without_boundary() {
        let mut repo = MemoryRepository::new();
        // Data begins in February: past the default Dec 15 short-start cutoff.
        repo.insert_raw("a", Variable::Pressure, hourly(ts(2021, 2, 1, 0), 24 * 30, |_| Some(90.0)))
            .unwrap();
        let pipeline = Pipeline::new(QcConfig::default());
        let reports = pipeline.process_variable(&mut repo, &StationProfile::plain("a"), Variable::Pressure);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, UnitOutcome::SkippedNoBoundary);
        assert_eq!(reports[0].water_year, Some(2020));
        assert!(repo.vetted_rows("a", Variable::Pressure).unwrap().is_empty());
    }

    #[test]
    fn test_summary_counts_and_issues() {
        let reports = vec![
            UnitReport::new("b", Variable::Swe, Some(2020), UnitOutcome::Excluded, "excluded".into()),
            UnitReport::new(
                "a",
                Variable::Swe,
                Some(2020),
                UnitOutcome::Emitted { rows: 10, boundary: BoundaryKind::Full },
                String::new(),
            ),
        ];
        let summary = BatchSummary::from_reports(reports.clone());
        assert_eq!(summary.units, 2);
        assert_eq!(summary.emitted, 1);
        assert_eq!(summary.rows_written, 10);
        assert_eq!(summary.outcomes.get("excluded"), Some(&1));
        assert_eq!(summary.reports[0].station, "a");
        assert_eq!(summary.failures().count(), 1);
        assert!(summary.to_json().unwrap().contains("\"rows_written\": 10"));

        let mut log = MemoryIssueLog::default();
        assert_eq!(record_issues(&reports, &mut log).unwrap(), 1);
        assert_eq!(log.issues[0].outcome, "excluded");
    }

    #[test]
    fn test_check_slice_rejects_short_flags() {
        let series = HourlySeries::nulls(ts(2020, 10, 1, 0), 3);
        let window = YearWindow::whole(&series, 2020).unwrap();
        let slice = VettedSlice {
            water_year: 2020,
            start: window.start_ts,
            values: vec![None; 3],
            flags: vec!["0".into(); 2],
        };
        assert!(matches!(
            check_slice(&slice, &window),
            Err(QcError::LengthMismatch { expected: 3, actual: 2 })
        ));
    }
}
