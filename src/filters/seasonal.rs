/// Seasonal breakpoint zeroing for snow variables.
///
/// Once the snowpack has melted out, snow depth and SWE sensors keep
/// reporting drift, vegetation, or site-visit noise. This stage finds the
/// melt-out hour for a water year and forces everything from there to the
/// end of the year to zero. The melt-out hour comes from, in order:
///
/// 1. a hand-picked date in the station profile,
/// 2. the hour after the steepest one-hour drop after Jun 1
///    (`SeasonalPolicy::Gradient`),
/// 3. the start of the longest run below the summer baseline
///    (`SeasonalPolicy::LongestBelow`, also used when the gradient finds no
///    drop).

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::model::{FlagVector, HourlySeries, YearWindow};
use crate::variables::SeasonalPolicy;

/// Parameters for one application of the stage.
#[derive(Debug, Clone, Copy)]
pub struct SeasonalParams {
    pub policy: SeasonalPolicy,
    /// Minimum baseline for the longest-below search.
    pub summer_floor: f64,
    /// Melt-out override for this station, variable and year.
    pub override_date: Option<NaiveDateTime>,
}

fn at(year: i32, month: u32, day: u32, hour: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, 0, 0)
}

/// Zeroes the window from the detected melt-out hour to its end.
pub fn seasonal_zero(
    series: &mut HourlySeries,
    window: &YearWindow,
    params: &SeasonalParams,
    code: u8,
) -> FlagVector {
    let mut flags = FlagVector::for_window(window);

    let breakpoint = match params.override_date.and_then(|d| series.index_of(d)) {
        Some(idx) if window.contains(idx) => Some(idx),
        _ => detect_breakpoint(series, window, params),
    };

    if let Some(from) = breakpoint {
        for i in from..=window.end {
            if series.get(i) != Some(0.0) {
                series.set(i, Some(0.0));
                flags.mark(window.offset(i), code);
            }
        }
    }
    flags
}

fn detect_breakpoint(series: &HourlySeries, window: &YearWindow, params: &SeasonalParams) -> Option<usize> {
    let summer_start = at(window.water_year + 1, 7, 1, 0)?;
    if window.end_ts < summer_start {
        return None;
    }
    match params.policy {
        SeasonalPolicy::Gradient => gradient_breakpoint(series, window)
            .or_else(|| longest_below_breakpoint(series, window, params.summer_floor)),
        SeasonalPolicy::LongestBelow => longest_below_breakpoint(series, window, params.summer_floor),
    }
}

/// One-hour forward differences: element `i` is `x[i + 1] - x[i]`, null
/// when either side is null.
pub fn gradient(values: &[Option<f64>]) -> Vec<Option<f64>> {
    values
        .windows(2)
        .map(|pair| Some(pair[1]? - pair[0]?))
        .collect()
}

/// Lower end of the first, most negative one-hour drop from Jun 1 of the
/// second calendar year onward.
///
/// Zeroing from there only deepens that drop and flattens everything after
/// it, so a second run lands on the same hour.
fn gradient_breakpoint(series: &HourlySeries, window: &YearWindow) -> Option<usize> {
    let june = at(window.water_year + 1, 7, 1, 0)? - Duration::days(30);
    let first = if june <= window.start_ts {
        0
    } else {
        window.offset(series.index_of(june)?)
    };

    let grad = gradient(series.window_values(window));
    grad.iter()
        .enumerate()
        .skip(first)
        .filter_map(|(k, g)| g.filter(|g| *g < 0.0).map(|g| (k, g)))
        .fold(None, |best: Option<(usize, f64)>, (k, g)| match best {
            Some((_, b)) if b <= g => best,
            _ => Some((k, g)),
        })
        .map(|(k, _)| window.start + k + 1)
}

/// Start of the longest run of "below baseline" hours in the second half
/// of the window. Nulls count as below. The baseline is the Jul 1 to
/// Sep 23 mean, raised to `floor` when smaller.
fn longest_below_breakpoint(series: &HourlySeries, window: &YearWindow, floor: f64) -> Option<usize> {
    let summer_from = at(window.water_year + 1, 7, 1, 0)?;
    let summer_to = at(window.water_year + 1, 9, 23, 0)?;
    let summer: Vec<f64> = window
        .range()
        .filter(|&i| {
            let ts = series.timestamp_at(i);
            ts >= summer_from && ts <= summer_to
        })
        .filter_map(|i| series.get(i))
        .collect();
    let baseline = if summer.is_empty() {
        floor
    } else {
        (summer.iter().sum::<f64>() / summer.len() as f64).max(floor)
    };

    let half = (window.len() as f64 / 2.0).round() as usize;
    let mut best: Option<(usize, usize)> = None;
    let mut run_start: Option<usize> = None;
    for k in half..=window.len() {
        let below = k < window.len()
            && series.get(window.start + k).is_none_or(|x| x < baseline);
        match (below, run_start) {
            (true, None) => run_start = Some(k),
            (false, Some(s)) => {
                let len = k - s;
                if best.is_none_or(|(_, l)| len > l) {
                    best = Some((s, len));
                }
                run_start = None;
            }
            _ => {}
        }
    }
    best.map(|(s, _)| window.start + s)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{locate_water_year, BoundaryPolicy};

    fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        at(y, m, d, h).unwrap()
    }

    /// One full water year of SWE: accumulation to 500 by April, melt to a
    /// noisy 3-7 by mid July, steepest drop on Jul 10.
    fn swe_year() -> (HourlySeries, YearWindow) {
        let start = ts(2020, 10, 1, 0);
        let len = 8760;
        let mut values = Vec::with_capacity(len);
        let peak = ts(2021, 4, 1, 0);
        let melt_end = ts(2021, 7, 10, 12);
        for i in 0..len {
            let t = start + Duration::hours(i as i64);
            let v = if t < peak {
                500.0 * (t - start).num_hours() as f64 / (peak - start).num_hours() as f64
            } else if t < ts(2021, 7, 10, 0) {
                let frac = (t - peak).num_hours() as f64 / (ts(2021, 7, 10, 0) - peak).num_hours() as f64;
                500.0 - 400.0 * frac
            } else if t < melt_end {
                100.0 - 8.0 * (t - ts(2021, 7, 10, 0)).num_hours() as f64
            } else {
                3.0 + (i % 5) as f64
            };
            values.push(Some(v));
        }
        let s = HourlySeries::new(start, values);
        let w = locate_water_year(&s, 2020, &BoundaryPolicy::default()).unwrap();
        (s, w)
    }

    #[test]
    fn test_gradient_is_forward_difference() {
        let g = gradient(&[Some(1.0), Some(2.0), Some(4.0), Some(7.0), None, Some(1.0)]);
        assert_eq!(g, vec![Some(1.0), Some(2.0), Some(3.0), None, None]);
        assert!(gradient(&[Some(1.0)]).is_empty());
    }

    fn assert_zeroed_from(s: &HourlySeries, w: &YearWindow, from: usize) {
        assert!(s.get(from - 1).unwrap() > 0.0, "value before the breakpoint is kept");
        assert!((from..=w.end).all(|i| s.get(i) == Some(0.0)), "everything after is zero");
    }

    #[test]
    fn test_gradient_policy_zeroes_from_steepest_summer_drop() {
        let (mut s, w) = swe_year();
        let params = SeasonalParams { policy: SeasonalPolicy::Gradient, summer_floor: 12.0, override_date: None };
        let flags = seasonal_zero(&mut s, &w, &params, 6);

        // Jul 10 11:00 (12) to 12:00 (3) is the steepest one-hour drop.
        let drop = s.index_of(ts(2021, 7, 10, 12)).unwrap();
        assert_zeroed_from(&s, &w, drop);
        assert_eq!(flags.get(w.offset(drop)), 6);
        assert_eq!(flags.get(w.offset(drop - 1)), 0);
        assert_eq!(flags.count(), w.end - drop + 1);
    }

    #[test]
    fn test_longest_below_policy_zeroes_from_start_of_summer_low_run() {
        let (mut s, w) = swe_year();
        let params = SeasonalParams { policy: SeasonalPolicy::LongestBelow, summer_floor: 12.0, override_date: None };
        seasonal_zero(&mut s, &w, &params, 6);
        // Summer mean is about 17; the first value under it is 12 at 11:00.
        let expected = s.index_of(ts(2021, 7, 10, 11)).unwrap();
        assert_zeroed_from(&s, &w, expected);
    }

    #[test]
    fn test_longest_below_ignores_first_half_of_window() {
        // June: 720 low hours; Jul 1-5: 50; Jul 6-31: 2 (624 hours).
        let start = ts(2021, 6, 1, 0);
        let mut values = vec![Some(1.0); 720];
        values.extend(vec![Some(50.0); 120]);
        values.extend(vec![Some(2.0); 624]);
        let mut s = HourlySeries::new(start, values);
        let w = YearWindow::whole(&s, 2020).unwrap();
        let params = SeasonalParams { policy: SeasonalPolicy::LongestBelow, summer_floor: 12.0, override_date: None };
        let flags = seasonal_zero(&mut s, &w, &params, 6);
        let expected = s.index_of(ts(2021, 7, 6, 0)).unwrap();
        assert_eq!(s.get(0), Some(1.0), "June run is in the masked first half");
        assert_zeroed_from(&s, &w, expected);
        assert_eq!(flags.count(), 624);
    }

    #[test]
    fn test_override_date_wins() {
        let (mut s, w) = swe_year();
        let date = ts(2021, 8, 15, 6);
        let params = SeasonalParams { policy: SeasonalPolicy::Gradient, summer_floor: 12.0, override_date: Some(date) };
        let flags = seasonal_zero(&mut s, &w, &params, 6);
        let idx = s.index_of(date).unwrap();
        assert_zeroed_from(&s, &w, idx);
        assert_eq!(flags.get(w.offset(idx - 1)), 0);
        assert_eq!(flags.get(w.offset(idx)), 6);
    }

    #[test]
    fn test_rerun_on_zeroed_year_changes_nothing() {
        for policy in [SeasonalPolicy::Gradient, SeasonalPolicy::LongestBelow] {
            let (mut s, w) = swe_year();
            let params = SeasonalParams { policy, summer_floor: 12.0, override_date: None };
            assert!(!seasonal_zero(&mut s, &w, &params, 6).is_clear());
            let once = s.clone();
            assert!(seasonal_zero(&mut s, &w, &params, 6).is_clear(), "{:?}", policy);
            assert_eq!(s, once);
        }
    }

    #[test]
    fn test_no_op_when_window_ends_before_summer() {
        let start = ts(2020, 10, 1, 0);
        let mut s = HourlySeries::new(start, vec![Some(50.0); 24 * 200]);
        let w = YearWindow::whole(&s, 2020).unwrap();
        let params = SeasonalParams { policy: SeasonalPolicy::Gradient, summer_floor: 12.0, override_date: None };
        assert!(seasonal_zero(&mut s, &w, &params, 6).is_clear());
    }
}
