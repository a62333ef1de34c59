/// Filter stage library.
///
/// Every stage takes the full working series and a water-year window,
/// changes values only inside the window (null out, clamp, or replace,
/// never reorder or resize), and returns a flag vector marking the window
/// offsets it changed with the stage's code.
///
/// `apply_stage` is the single dispatch point used by the pipeline: it
/// resolves station overrides into the stage parameters and calls the
/// matching function.

pub mod duplicates;
pub mod manual;
pub mod outliers;
pub mod precip;
pub mod range;
pub mod seasonal;
pub mod thresholds;

use log::warn;

use crate::config::{Settings, StationProfile};
use crate::interpolate;
use crate::model::{FlagVector, HourlySeries, Variable, YearWindow};
use crate::variables::{StageKind, StageSpec};

use seasonal::SeasonalParams;

/// Everything a stage may need beyond the series itself.
pub struct StageContext<'a> {
    pub profile: &'a StationProfile,
    pub settings: &'a Settings,
    pub variable: Variable,
    /// Vetted companion series on the same grid (temperature for RH).
    pub companion: Option<&'a HourlySeries>,
}

/// Applies the station's threshold overrides for this stage on top of the
/// registry defaults. Overrides are applied in file order.
///
/// An override without `stage_code` reaches every stage of a matching kind;
/// `QcConfig::validate` rejects one that would reach two different codes.
pub fn resolve_stage(spec: &StageSpec, profile: &StationProfile, variable: Variable) -> StageKind {
    let mut kind = spec.kind;
    for o in profile.overrides_for(variable, spec.code) {
        kind = match kind {
            StageKind::StaticRange { step } => StageKind::StaticRange {
                step: o.step.unwrap_or(step),
            },
            StageKind::Clamp { min, max } => StageKind::Clamp {
                min: o.min.unwrap_or(min),
                max: o.max.unwrap_or(max),
            },
            StageKind::MonthlyOutlier { sigma } => StageKind::MonthlyOutlier {
                sigma: o.sigma.unwrap_or(sigma),
            },
            StageKind::SlidingWindow { window, threshold } => StageKind::SlidingWindow {
                window: o.window_hours.unwrap_or(window),
                threshold: o.threshold.unwrap_or(threshold),
            },
            StageKind::WindowedDuplicates { target, window_hours } => StageKind::WindowedDuplicates {
                target,
                window_hours: o.window_hours.unwrap_or(window_hours),
            },
            StageKind::FalseZero { threshold } => StageKind::FalseZero {
                threshold: o.threshold.unwrap_or(threshold),
            },
            StageKind::SeasonalZero { policy, summer_floor } => StageKind::SeasonalZero {
                policy,
                summer_floor: o.summer_floor.unwrap_or(summer_floor),
            },
            StageKind::Interpolate { max_hours } => StageKind::Interpolate {
                max_hours: o.max_gap_hours.or(max_hours),
            },
            StageKind::HumidityInterpolate { max_hours } => StageKind::HumidityInterpolate {
                max_hours: o.max_gap_hours.or(max_hours),
            },
            other => other,
        };
    }
    kind
}

/// Runs one stage over `window` and returns its flags.
pub fn apply_stage(
    series: &mut HourlySeries,
    window: &YearWindow,
    spec: &StageSpec,
    ctx: &StageContext<'_>,
) -> FlagVector {
    let code = spec.code;
    let gap = ctx.settings.range_gap_hours;
    let max_interp = |max_hours: Option<usize>| max_hours.unwrap_or(ctx.settings.max_interpolation_hours);

    match resolve_stage(spec, ctx.profile, ctx.variable) {
        StageKind::ManualCorrections => {
            manual::apply_corrections(series, window, ctx.profile.corrections_for(ctx.variable), code)
        }
        StageKind::StaticRange { step } => range::static_range(series, window, step, gap, code),
        StageKind::RangeShave { steps } => range::range_shave(series, window, steps, gap, code),
        StageKind::Duplicates => duplicates::remove_duplicates(series, window, code),
        StageKind::WindowedDuplicates { target, window_hours } => {
            duplicates::remove_windowed_duplicates(series, window, target, window_hours, code)
        }
        StageKind::MonthlyOutlier { sigma } => outliers::monthly_outlier(series, window, sigma, code),
        StageKind::SlidingWindow { window: n, threshold } => {
            outliers::sliding_window(series, window, n, threshold, code)
        }
        StageKind::NegativeToZero => thresholds::negative_to_zero(series, window, code),
        StageKind::Clamp { min, max } => thresholds::clamp(series, window, min, max, code),
        StageKind::FalseZero { threshold } => outliers::false_zero(series, window, threshold, code),
        StageKind::SeasonalZero { policy, summer_floor } => {
            let params = SeasonalParams {
                policy,
                summer_floor,
                override_date: ctx.profile.melt_out_date(ctx.variable, window.water_year),
            };
            seasonal::seasonal_zero(series, window, &params, code)
        }
        StageKind::ResetZero => precip::reset_zero(series, window, code),
        StageKind::Cumulative { decimals } => precip::cumulative(series, window, decimals, code),
        StageKind::DrainageJump => {
            let events: Vec<_> = ctx
                .profile
                .drainage_events(ctx.variable)
                .map(|d| (d.pre, d.post))
                .collect();
            precip::drainage_jump(series, window, &events, code)
        }
        StageKind::EvaporationTrend => precip::evaporation_trend(series, window, code),
        StageKind::Interpolate { max_hours } => {
            interpolate::interpolate_linear(series, window, max_interp(max_hours), code)
        }
        StageKind::HumidityInterpolate { max_hours } => match ctx.companion {
            Some(temperature) => {
                interpolate::interpolate_humidity(series, window, temperature, max_interp(max_hours), code)
            }
            None => {
                warn!(
                    "{} {}: no vetted companion series, humidity gaps left unfilled",
                    ctx.profile.id,
                    window.label()
                );
                FlagVector::for_window(window)
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdOverride;
    use chrono::NaiveDate;

    fn profile_with(overrides: Vec<ThresholdOverride>) -> StationProfile {
        let mut p = StationProfile::plain("test");
        p.thresholds = overrides;
        p
    }

    #[test]
    fn test_resolve_without_overrides_returns_default() {
        let spec = StageSpec { code: 1, kind: StageKind::StaticRange { step: 10.0 } };
        let kind = resolve_stage(&spec, &StationProfile::plain("a"), Variable::AirTemp);
        assert_eq!(kind, StageKind::StaticRange { step: 10.0 });
    }

    #[test]
    fn test_resolve_override_targets_stage_code() {
        let profile = profile_with(vec![ThresholdOverride {
            stage_code: Some(9),
            step: Some(8.0),
            ..ThresholdOverride::for_variable(Variable::SnowDepth)
        }]);
        let first = StageSpec { code: 1, kind: StageKind::StaticRange { step: 25.0 } };
        let post = StageSpec { code: 9, kind: StageKind::StaticRange { step: 5.0 } };
        assert_eq!(resolve_stage(&first, &profile, Variable::SnowDepth), StageKind::StaticRange { step: 25.0 });
        assert_eq!(resolve_stage(&post, &profile, Variable::SnowDepth), StageKind::StaticRange { step: 8.0 });
    }

    #[test]
    fn test_resolve_partial_clamp_override() {
        let profile = profile_with(vec![ThresholdOverride {
            max: Some(150.0),
            ..ThresholdOverride::for_variable(Variable::WindSpeed)
        }]);
        let spec = StageSpec { code: 2, kind: StageKind::Clamp { min: 0.0, max: 120.0 } };
        assert_eq!(
            resolve_stage(&spec, &profile, Variable::WindSpeed),
            StageKind::Clamp { min: 0.0, max: 150.0 }
        );
    }

    #[test]
    fn test_apply_stage_uses_settings_for_interpolation_limit() {
        let start = NaiveDate::from_ymd_opt(2020, 10, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut series = HourlySeries::new(start, vec![Some(0.0), None, None, Some(3.0)]);
        let window = YearWindow::whole(&series, 2020).unwrap();
        let profile = StationProfile::plain("a");
        let settings = Settings { max_interpolation_hours: 1, ..Settings::default() };
        let ctx = StageContext { profile: &profile, settings: &settings, variable: Variable::AirTemp, companion: None };
        let spec = StageSpec { code: 8, kind: StageKind::Interpolate { max_hours: None } };
        assert!(apply_stage(&mut series, &window, &spec, &ctx).is_clear());

        let settings = Settings::default();
        let ctx = StageContext { settings: &settings, ..ctx };
        assert_eq!(apply_stage(&mut series, &window, &spec, &ctx).count(), 2);
    }

    #[test]
    fn test_humidity_interpolation_without_companion_is_a_no_op() {
        let start = NaiveDate::from_ymd_opt(2020, 10, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut series = HourlySeries::new(start, vec![Some(50.0), None, Some(60.0)]);
        let window = YearWindow::whole(&series, 2020).unwrap();
        let profile = StationProfile::plain("a");
        let settings = Settings::default();
        let ctx = StageContext {
            profile: &profile,
            settings: &settings,
            variable: Variable::RelativeHumidity,
            companion: None,
        };
        let spec = StageSpec { code: 8, kind: StageKind::HumidityInterpolate { max_hours: None } };
        assert!(apply_stage(&mut series, &window, &spec, &ctx).is_clear());
        assert_eq!(series.get(1), None);
    }
}
