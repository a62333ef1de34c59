/// Station profile loader - parses stations.toml
///
/// Separates station special cases from code, making it easy to exclude a
/// bad water year, add a manual correction window, or tune a threshold
/// without recompiling the service. The file has one `[settings]` table and
/// one `[[station]]` table per station; timestamps are written as quoted
/// ISO strings (`"2023-01-05T21:00:00"`).

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::model::{QcError, Variable};
use crate::variables::{self, StageKind};

pub const DEFAULT_CONFIG_PATH: &str = "stations.toml";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Service-wide parameters from the `[settings]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Latest (month, day) of the water year's first calendar year at which
    /// a partial year may start.
    #[serde(default = "default_short_start_cutoff")]
    pub short_start_cutoff: (u32, u32),

    /// Earliest (month, day) of the second calendar year at which a partial
    /// year may end.
    #[serde(default = "default_short_end_cutoff")]
    pub short_end_cutoff: (u32, u32),

    /// Consecutive samples further apart than this are not compared by the
    /// static range test.
    #[serde(default = "default_range_gap_hours")]
    pub range_gap_hours: i64,

    /// Keep the interpolation code next to a post-interpolation range code.
    #[serde(default)]
    pub retain_interpolation_history: bool,

    /// Longest null run that interpolation may fill.
    #[serde(default = "default_max_interpolation_hours")]
    pub max_interpolation_hours: usize,
}

fn default_short_start_cutoff() -> (u32, u32) {
    (12, 15)
}

fn default_short_end_cutoff() -> (u32, u32) {
    (7, 15)
}

fn default_range_gap_hours() -> i64 {
    12
}

fn default_max_interpolation_hours() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            short_start_cutoff: default_short_start_cutoff(),
            short_end_cutoff: default_short_end_cutoff(),
            range_gap_hours: default_range_gap_hours(),
            retain_interpolation_history: false,
            max_interpolation_hours: default_max_interpolation_hours(),
        }
    }
}

// ---------------------------------------------------------------------------
// Station profiles
// ---------------------------------------------------------------------------

/// Per-station special cases loaded from stations.toml
#[derive(Debug, Clone, Deserialize)]
pub struct StationProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,

    /// Variables processed for this station. `None` means every variable.
    #[serde(default)]
    pub variables: Option<Vec<Variable>>,

    /// Raw observations after this timestamp are dropped (station went
    /// offline or the record was frozen).
    #[serde(default)]
    pub record_end: Option<NaiveDateTime>,

    #[serde(default, rename = "exclusion")]
    pub exclusions: Vec<YearExclusion>,

    #[serde(default, rename = "correction")]
    pub corrections: Vec<ManualCorrection>,

    #[serde(default, rename = "threshold")]
    pub thresholds: Vec<ThresholdOverride>,

    #[serde(default, rename = "melt_out")]
    pub melt_outs: Vec<MeltOutOverride>,

    #[serde(default, rename = "drainage")]
    pub drainage: Vec<DrainageEvent>,
}

/// Water years skipped entirely, for one variable or (without `variable`)
/// for all of them.
#[derive(Debug, Clone, Deserialize)]
pub struct YearExclusion {
    #[serde(default)]
    pub variable: Option<Variable>,
    pub water_years: Vec<i32>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionAction {
    Null,
    Set,
}

/// A manual correction window. `end = None` runs to the end of the record.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualCorrection {
    pub variable: Variable,
    pub start: NaiveDateTime,
    #[serde(default)]
    pub end: Option<NaiveDateTime>,
    pub action: CorrectionAction,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ManualCorrection {
    pub fn covers(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && self.end.is_none_or(|end| ts <= end)
    }
}

/// Replaces stage parameters for one station/variable. With `stage_code`
/// set, only stages carrying that flag code are affected; without it, every
/// stage the parameters apply to is affected. Validation rejects an
/// untargeted override that would reach stages with different codes (snow
/// depth has a static range test at code 1 and again at code 9).
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdOverride {
    pub variable: Variable,
    #[serde(default)]
    pub stage_code: Option<u8>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub sigma: Option<f64>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub summer_floor: Option<f64>,
    #[serde(default)]
    pub window_hours: Option<usize>,
    #[serde(default)]
    pub max_gap_hours: Option<usize>,
}

impl ThresholdOverride {
    /// An override for `variable` that changes nothing yet.
    pub fn for_variable(variable: Variable) -> Self {
        ThresholdOverride {
            variable,
            stage_code: None,
            step: None,
            min: None,
            max: None,
            sigma: None,
            threshold: None,
            summer_floor: None,
            window_hours: None,
            max_gap_hours: None,
        }
    }

    /// True if any parameter set here is read by a stage of this kind.
    pub fn applies_to(&self, kind: &StageKind) -> bool {
        match kind {
            StageKind::StaticRange { .. } => self.step.is_some(),
            StageKind::Clamp { .. } => self.min.is_some() || self.max.is_some(),
            StageKind::MonthlyOutlier { .. } => self.sigma.is_some(),
            StageKind::SlidingWindow { .. } => self.window_hours.is_some() || self.threshold.is_some(),
            StageKind::WindowedDuplicates { .. } => self.window_hours.is_some(),
            StageKind::FalseZero { .. } => self.threshold.is_some(),
            StageKind::SeasonalZero { .. } => self.summer_floor.is_some(),
            StageKind::Interpolate { .. } | StageKind::HumidityInterpolate { .. } => self.max_gap_hours.is_some(),
            _ => false,
        }
    }
}

/// Hand-picked melt-out date for a seasonal variable in one water year.
#[derive(Debug, Clone, Deserialize)]
pub struct MeltOutOverride {
    pub variable: Variable,
    pub water_year: i32,
    pub date: NaiveDateTime,
}

/// A gauge drain: the reading drops between `pre` and `post` and must be
/// shifted back up.
#[derive(Debug, Clone, Deserialize)]
pub struct DrainageEvent {
    pub variable: Variable,
    pub pre: NaiveDateTime,
    pub post: NaiveDateTime,
}

impl StationProfile {
    /// A profile with no special cases; used for stations missing from the
    /// file and in tests.
    pub fn plain(id: &str) -> Self {
        StationProfile {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            variables: None,
            record_end: None,
            exclusions: Vec::new(),
            corrections: Vec::new(),
            thresholds: Vec::new(),
            melt_outs: Vec::new(),
            drainage: Vec::new(),
        }
    }

    pub fn handles(&self, variable: Variable) -> bool {
        self.variables
            .as_ref()
            .is_none_or(|vars| vars.contains(&variable))
    }

    pub fn is_year_excluded(&self, variable: Variable, water_year: i32) -> bool {
        self.exclusions.iter().any(|e| {
            e.variable.is_none_or(|v| v == variable) && e.water_years.contains(&water_year)
        })
    }

    pub fn corrections_for(&self, variable: Variable) -> impl Iterator<Item = &ManualCorrection> {
        self.corrections.iter().filter(move |c| c.variable == variable)
    }

    /// Overrides that apply to a stage with flag `code` of `variable`.
    /// Later entries win, so the caller applies them in order.
    pub fn overrides_for(
        &self,
        variable: Variable,
        code: u8,
    ) -> impl Iterator<Item = &ThresholdOverride> {
        self.thresholds.iter().filter(move |t| {
            t.variable == variable && t.stage_code.is_none_or(|c| c == code)
        })
    }

    pub fn melt_out_date(&self, variable: Variable, water_year: i32) -> Option<NaiveDateTime> {
        self.melt_outs
            .iter()
            .find(|m| m.variable == variable && m.water_year == water_year)
            .map(|m| m.date)
    }

    pub fn drainage_events(&self, variable: Variable) -> impl Iterator<Item = &DrainageEvent> {
        self.drainage.iter().filter(move |d| d.variable == variable)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Root configuration structure for TOML parsing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QcConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub station: Vec<StationProfile>,
}

impl QcConfig {
    pub fn station(&self, id: &str) -> Option<&StationProfile> {
        self.station.iter().find(|s| s.id == id)
    }

    /// Rejects profiles the pipeline could not apply consistently.
    pub fn validate(&self) -> Result<(), QcError> {
        let s = &self.settings;
        check_month_day("short_start_cutoff", s.short_start_cutoff, (10, 12))?;
        check_month_day("short_end_cutoff", s.short_end_cutoff, (1, 9))?;
        if s.range_gap_hours < 1 {
            return Err(QcError::Config("range_gap_hours must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for station in &self.station {
            if station.id.trim().is_empty() {
                return Err(QcError::Config("station id must not be empty".into()));
            }
            if !seen.insert(station.id.as_str()) {
                return Err(QcError::Config(format!("duplicate station id '{}'", station.id)));
            }
            for c in &station.corrections {
                if c.action == CorrectionAction::Set && c.value.is_none() {
                    return Err(QcError::Config(format!(
                        "{}: 'set' correction for {} starting {} has no value",
                        station.id, c.variable, c.start
                    )));
                }
                if let Some(end) = c.end {
                    if end < c.start {
                        return Err(QcError::Config(format!(
                            "{}: correction for {} ends ({}) before it starts ({})",
                            station.id, c.variable, end, c.start
                        )));
                    }
                }
            }
            for t in &station.thresholds {
                check_override_target(&station.id, t)?;
            }
            for d in &station.drainage {
                if d.post <= d.pre {
                    return Err(QcError::Config(format!(
                        "{}: drainage event for {} has post ({}) not after pre ({})",
                        station.id, d.variable, d.post, d.pre
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An override without `stage_code` must reach a single flag code.
fn check_override_target(station: &str, t: &ThresholdOverride) -> Result<(), QcError> {
    if t.stage_code.is_some() {
        return Ok(());
    }
    let Some(descriptor) = variables::descriptor(t.variable) else {
        return Ok(());
    };
    let mut codes: Vec<u8> = descriptor
        .stages
        .iter()
        .filter(|s| t.applies_to(&s.kind))
        .map(|s| s.code)
        .collect();
    codes.sort_unstable();
    codes.dedup();
    if codes.len() > 1 {
        return Err(QcError::Config(format!(
            "{}: threshold override for {} reaches stage codes {:?}; set stage_code",
            station, t.variable, codes
        )));
    }
    Ok(())
}

/// Cutoffs must exist in every year, so Feb 29 is rejected too.
fn check_month_day(field: &str, (month, day): (u32, u32), months: (u32, u32)) -> Result<(), QcError> {
    let in_range = month >= months.0 && month <= months.1;
    if !in_range || NaiveDate::from_ymd_opt(2001, month, day).is_none() {
        return Err(QcError::Config(format!(
            "{} = [{}, {}] is not a valid cutoff (month must be {}-{})",
            field, month, day, months.0, months.1
        )));
    }
    Ok(())
}

/// Parses and validates a configuration document.
pub fn parse_config(contents: &str) -> Result<QcConfig, QcError> {
    let config: QcConfig =
        toml::from_str(contents).map_err(|e| QcError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Loads station profiles from a file.
pub fn load_config_from<P: AsRef<Path>>(path: P) -> Result<QcConfig, QcError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| QcError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&contents)
        .map_err(|e| QcError::Config(format!("{}: {}", path.display(), e)))
}

/// Loads station profiles from `stations.toml` in the current working
/// directory (project root when running via `cargo run`).
pub fn load_config() -> Result<QcConfig, QcError> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
