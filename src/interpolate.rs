/// Gap-aware interpolation.
///
/// Only short gaps are filled: a null run is interpolated when it has a
/// value on both sides inside the year window and is at most `max_hours`
/// long. Longer outages stay null.
///
/// Humidity is not interpolated directly. RH depends on temperature, so the
/// gap is filled in actual vapour pressure and converted back with the
/// (already vetted) temperature at each gap hour.

use crate::model::{FlagVector, HourlySeries, QcError, YearWindow};

/// Maximal null runs inside `window` that have a non-null neighbour on
/// both sides. Returned as inclusive series index pairs.
pub fn bounded_null_runs(series: &HourlySeries, window: &YearWindow) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut seen_value = false;
    for i in window.range() {
        match (series.get(i), run_start) {
            (None, None) if seen_value => run_start = Some(i),
            (Some(_), Some(s)) => {
                runs.push((s, i - 1));
                run_start = None;
                seen_value = true;
            }
            (Some(_), None) => seen_value = true,
            _ => {}
        }
    }
    runs
}

/// Fills bounded null runs of at most `max_hours` by linear interpolation.
pub fn interpolate_linear(
    series: &mut HourlySeries,
    window: &YearWindow,
    max_hours: usize,
    code: u8,
) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    for (s, e) in bounded_null_runs(series, window) {
        if e - s + 1 > max_hours {
            continue;
        }
        let (Some(left), Some(right)) = (series.get(s - 1), series.get(e + 1)) else {
            continue;
        };
        let span = (e + 2 - s) as f64;
        for i in s..=e {
            let frac = (i + 1 - s) as f64 / span;
            series.set(i, Some(left + (right - left) * frac));
            flags.mark(window.offset(i), code);
        }
    }
    flags
}

// ---------------------------------------------------------------------------
// Humidity
// ---------------------------------------------------------------------------

/// Saturation vapour pressure (kPa) over water above 0 degC and over ice at
/// or below it.
pub fn saturation_vapor_pressure(temp_c: f64) -> Result<f64, QcError> {
    let (a, b) = if temp_c > 0.0 { (17.27, 237.3) } else { (21.87, 265.5) };
    let denom = temp_c + b;
    if denom.abs() < f64::EPSILON {
        return Err(QcError::NumericDegenerate("saturation vapour pressure pole"));
    }
    let es = 0.611 * (a * temp_c / denom).exp();
    if es.is_finite() && es > 0.0 {
        Ok(es)
    } else {
        Err(QcError::NumericDegenerate("saturation vapour pressure out of range"))
    }
}

fn vapor_pressure(rh: f64, temp_c: f64) -> Option<f64> {
    saturation_vapor_pressure(temp_c).ok().map(|es| rh / 100.0 * es)
}

fn relative_humidity(ea: f64, temp_c: f64) -> Option<f64> {
    let es = saturation_vapor_pressure(temp_c).ok()?;
    let rh = 100.0 * ea / es;
    rh.is_finite().then(|| rh.clamp(0.0, 100.0))
}

/// Fills short RH gaps through vapour pressure.
///
/// `temperature` must be on the same hourly grid as `series`. Gap hours
/// without a temperature stay null, as do gaps whose bounding hours have no
/// temperature.
pub fn interpolate_humidity(
    series: &mut HourlySeries,
    window: &YearWindow,
    temperature: &HourlySeries,
    max_hours: usize,
    code: u8,
) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    for (s, e) in bounded_null_runs(series, window) {
        if e - s + 1 > max_hours {
            continue;
        }
        let left = series.get(s - 1).zip(temperature.get(s - 1)).and_then(|(rh, t)| vapor_pressure(rh, t));
        let right = series.get(e + 1).zip(temperature.get(e + 1)).and_then(|(rh, t)| vapor_pressure(rh, t));
        let (Some(left), Some(right)) = (left, right) else {
            continue;
        };
        let span = (e + 2 - s) as f64;
        for i in s..=e {
            let Some(t) = temperature.get(i) else { continue };
            let ea = left + (right - left) * (i + 1 - s) as f64 / span;
            if let Some(rh) = relative_humidity(ea, t) {
                series.set(i, Some(rh));
                flags.mark(window.offset(i), code);
            }
        }
    }
    flags
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
