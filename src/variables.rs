/// Variable registry for the weather-station QA/QC service.
///
/// Defines, for every cleaned variable, the ordered list of filter stages
/// with their flag codes and default parameters, plus the flag dominance
/// rules. This is the single source of truth for stage order; the pipeline
/// never hardcodes a per-variable sequence. Station-specific tweaks live in
/// stations.toml and are layered on top by `filters::resolve_stage`.
///
/// Flag codes (shared meaning across variables where the stage repeats):
///
/// | Code | Stage |
/// |------|-------|
/// | 1 | static range test, manual correction |
/// | 2 | clamp to valid range, negative to zero |
/// | 3 | duplicate runs, reset to zero at year start |
/// | 4 | monthly outlier, drainage jump |
/// | 5 | sliding-window deviation, evaporation trend |
/// | 6 | seasonal zeroing, false zero |
/// | 7 | multi-level range shave |
/// | 8 | interpolation, cumulative reconstruction |
/// | 9 | post-interpolation range test |

use crate::model::Variable;

// ---------------------------------------------------------------------------
// Stage and rule types
// ---------------------------------------------------------------------------

/// How the seasonal zero baseline (melt-out) is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeasonalPolicy {
    /// Steepest drop after Jun 1 of the second calendar year.
    Gradient,
    /// Start of the longest run below the summer baseline, second half of
    /// the year only.
    LongestBelow,
}

/// One filter stage and its default parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageKind {
    ManualCorrections,
    StaticRange { step: f64 },
    RangeShave { steps: &'static [f64] },
    Duplicates,
    /// `target: None` flags runs of any repeated value.
    WindowedDuplicates { target: Option<f64>, window_hours: usize },
    MonthlyOutlier { sigma: f64 },
    SlidingWindow { window: usize, threshold: f64 },
    NegativeToZero,
    Clamp { min: f64, max: f64 },
    FalseZero { threshold: f64 },
    SeasonalZero { policy: SeasonalPolicy, summer_floor: f64 },
    ResetZero,
    Cumulative { decimals: u32 },
    DrainageJump,
    EvaporationTrend,
    /// `max_hours: None` uses the service-wide setting.
    Interpolate { max_hours: Option<usize> },
    HumidityInterpolate { max_hours: Option<usize> },
}

impl StageKind {
    /// Short name used in logs and the issue log.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::ManualCorrections => "manual_corrections",
            StageKind::StaticRange { .. } => "static_range",
            StageKind::RangeShave { .. } => "range_shave",
            StageKind::Duplicates => "duplicates",
            StageKind::WindowedDuplicates { .. } => "windowed_duplicates",
            StageKind::MonthlyOutlier { .. } => "monthly_outlier",
            StageKind::SlidingWindow { .. } => "sliding_window",
            StageKind::NegativeToZero => "negative_to_zero",
            StageKind::Clamp { .. } => "clamp",
            StageKind::FalseZero { .. } => "false_zero",
            StageKind::SeasonalZero { .. } => "seasonal_zero",
            StageKind::ResetZero => "reset_zero",
            StageKind::Cumulative { .. } => "cumulative",
            StageKind::DrainageJump => "drainage_jump",
            StageKind::EvaporationTrend => "evaporation_trend",
            StageKind::Interpolate { .. } => "interpolate",
            StageKind::HumidityInterpolate { .. } => "humidity_interpolate",
        }
    }
}

/// A stage in a variable's sequence, tagged with the flag code it emits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSpec {
    pub code: u8,
    pub kind: StageKind,
}

const fn stage(code: u8, kind: StageKind) -> StageSpec {
    StageSpec { code, kind }
}

/// Flag-merge rule applied per timestamp after all stages ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DominanceRule {
    /// When this code fires, it is the only code reported.
    Sole(u8),
    /// When `later` fired at a later stage than `earlier`, drop `earlier`.
    Supersedes { later: u8, earlier: u8 },
}

/// Everything the pipeline needs to clean one variable.
#[derive(Debug)]
pub struct VariableDescriptor {
    pub variable: Variable,
    /// Column name in the station tables and comparison dumps.
    pub column: &'static str,
    pub stages: &'static [StageSpec],
    pub dominance: &'static [DominanceRule],
    /// Vetted series of another variable needed at the same timestamps
    /// (humidity interpolation needs temperature).
    pub companion: Option<Variable>,
    /// The series is computed from another variable's vetted series
    /// instead of this variable's raw series.
    pub derived_from: Option<Variable>,
}

impl VariableDescriptor {
    /// The variable whose vetted output this one consumes, if any.
    pub fn dependency(&self) -> Option<Variable> {
        self.companion.or(self.derived_from)
    }

    /// Batch tier: 0 for independent variables, 1 for those that read
    /// another variable's vetted series.
    pub fn tier(&self) -> usize {
        if self.dependency().is_some() { 1 } else { 0 }
    }

    /// Name of the flag column that pairs with `column`.
    pub fn flag_column(&self) -> String {
        format!("{}_flags", self.column)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const SUPERSEDE_INTERPOLATION: DominanceRule = DominanceRule::Supersedes { later: 9, earlier: 8 };

/// All cleaned variables, in the order the batch runner visits them.
pub static VARIABLE_REGISTRY: &[VariableDescriptor] = &[
    VariableDescriptor {
        variable: Variable::AirTemp,
        column: "Air_Temp",
        stages: &[
            stage(1, StageKind::StaticRange { step: 10.0 }),
            stage(1, StageKind::ManualCorrections),
            stage(3, StageKind::Duplicates),
            stage(4, StageKind::MonthlyOutlier { sigma: 4.0 }),
            stage(6, StageKind::FalseZero { threshold: 3.0 }),
            stage(8, StageKind::Interpolate { max_hours: None }),
        ],
        dominance: &[],
        companion: None,
        derived_from: None,
    },
    VariableDescriptor {
        variable: Variable::RelativeHumidity,
        column: "RH",
        stages: &[
            // Field processing used a 5% floor; a station override with
            // `stage_code = 2` and `min = 5.0` restores it.
            stage(2, StageKind::Clamp { min: 0.0, max: 100.0 }),
            stage(1, StageKind::ManualCorrections),
            stage(1, StageKind::StaticRange { step: 85.0 }),
            stage(3, StageKind::WindowedDuplicates { target: Some(100.0), window_hours: 120 }),
            stage(3, StageKind::WindowedDuplicates { target: Some(0.0), window_hours: 2 }),
            stage(6, StageKind::FalseZero { threshold: 75.0 }),
            stage(8, StageKind::HumidityInterpolate { max_hours: None }),
            stage(2, StageKind::Clamp { min: 0.0, max: 100.0 }),
            stage(9, StageKind::StaticRange { step: 85.0 }),
        ],
        dominance: &[SUPERSEDE_INTERPOLATION],
        companion: Some(Variable::AirTemp),
        derived_from: None,
    },
    VariableDescriptor {
        variable: Variable::WindSpeed,
        column: "Wind_Speed",
        stages: &[
            stage(2, StageKind::Clamp { min: 0.0, max: 120.0 }),
            stage(1, StageKind::ManualCorrections),
            stage(3, StageKind::WindowedDuplicates { target: None, window_hours: 5 }),
        ],
        dominance: &[],
        companion: None,
        derived_from: None,
    },
    VariableDescriptor {
        variable: Variable::WindDirection,
        column: "Wind_Dir",
        stages: &[
            stage(2, StageKind::Clamp { min: 0.0, max: 360.0 }),
            stage(1, StageKind::ManualCorrections),
            stage(3, StageKind::WindowedDuplicates { target: None, window_hours: 5 }),
        ],
        dominance: &[],
        companion: None,
        derived_from: None,
    },
    VariableDescriptor {
        variable: Variable::SnowDepth,
        column: "Snow_Depth",
        stages: &[
            stage(1, StageKind::StaticRange { step: 25.0 }),
            stage(1, StageKind::ManualCorrections),
            stage(2, StageKind::NegativeToZero),
            stage(3, StageKind::Duplicates),
            stage(4, StageKind::MonthlyOutlier { sigma: 4.0 }),
            stage(6, StageKind::SeasonalZero { policy: SeasonalPolicy::LongestBelow, summer_floor: 12.0 }),
            stage(7, StageKind::RangeShave { steps: &[20.0, 15.0, 10.0, 5.0] }),
            stage(8, StageKind::Interpolate { max_hours: None }),
            stage(9, StageKind::StaticRange { step: 5.0 }),
        ],
        dominance: &[DominanceRule::Sole(6), SUPERSEDE_INTERPOLATION],
        companion: None,
        derived_from: None,
    },
    VariableDescriptor {
        variable: Variable::Swe,
        column: "SWE",
        stages: &[
            stage(1, StageKind::StaticRange { step: 20.0 }),
            stage(1, StageKind::ManualCorrections),
            stage(2, StageKind::NegativeToZero),
            stage(3, StageKind::ResetZero),
            stage(6, StageKind::SeasonalZero { policy: SeasonalPolicy::Gradient, summer_floor: 12.0 }),
            stage(7, StageKind::RangeShave { steps: &[15.0, 10.0] }),
            stage(8, StageKind::Interpolate { max_hours: None }),
            stage(9, StageKind::StaticRange { step: 10.0 }),
        ],
        dominance: &[DominanceRule::Sole(6), SUPERSEDE_INTERPOLATION],
        companion: None,
        derived_from: None,
    },
    VariableDescriptor {
        variable: Variable::PrecipIncrement,
        column: "PP_Tipper",
        stages: &[
            stage(2, StageKind::Clamp { min: 0.0, max: 100.0 }),
            stage(1, StageKind::ManualCorrections),
        ],
        dominance: &[],
        companion: None,
        derived_from: None,
    },
    VariableDescriptor {
        variable: Variable::PrecipCumulative,
        column: "PC_Tipper",
        stages: &[stage(8, StageKind::Cumulative { decimals: 2 })],
        dominance: &[],
        companion: None,
        derived_from: Some(Variable::PrecipIncrement),
    },
    VariableDescriptor {
        variable: Variable::PrecipPipe,
        column: "PC_Raw_Pipe",
        stages: &[
            stage(1, StageKind::ManualCorrections),
            stage(4, StageKind::DrainageJump),
            stage(5, StageKind::EvaporationTrend),
            stage(8, StageKind::Interpolate { max_hours: None }),
        ],
        dominance: &[],
        companion: None,
        derived_from: None,
    },
    VariableDescriptor {
        variable: Variable::Pressure,
        column: "BP",
        stages: &[
            stage(2, StageKind::Clamp { min: 60.0, max: 110.0 }),
            stage(1, StageKind::ManualCorrections),
            stage(1, StageKind::StaticRange { step: 2.0 }),
            stage(5, StageKind::SlidingWindow { window: 24, threshold: 3.0 }),
            stage(8, StageKind::Interpolate { max_hours: None }),
        ],
        dominance: &[],
        companion: None,
        derived_from: None,
    },
];

/// Looks up a descriptor by variable.
pub fn descriptor(variable: Variable) -> Option<&'static VariableDescriptor> {
    VARIABLE_REGISTRY.iter().find(|d| d.variable == variable)
}

/// Variables grouped by batch tier, tier 0 first.
pub fn tiers() -> Vec<Vec<Variable>> {
    let max_tier = VARIABLE_REGISTRY.iter().map(|d| d.tier()).max().unwrap_or(0);
    (0..=max_tier)
        .map(|t| {
            VARIABLE_REGISTRY
                .iter()
                .filter(|d| d.tier() == t)
                .map(|d| d.variable)
                .collect()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
