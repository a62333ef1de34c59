/// Accumulating-gauge stages: reset to zero at year start, cumulative
/// reconstruction from increments, drainage-jump and evaporation-trend
/// correction for standpipe gauges.

use chrono::NaiveDateTime;

use crate::model::{FlagVector, HourlySeries, QcError, YearWindow};

/// Values closer than this are treated as unchanged when flagging.
const CHANGE_EPSILON: f64 = 1e-9;

fn changed(a: f64, b: f64) -> bool {
    (a - b).abs() > CHANGE_EPSILON
}

/// Shifts the window so that its first non-null value becomes zero,
/// clamping anything that would go negative.
pub fn reset_zero(series: &mut HourlySeries, window: &YearWindow, code: u8) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    let Some(first) = window.range().find_map(|i| series.get(i)) else {
        return flags;
    };
    if first == 0.0 {
        return flags;
    }
    for i in window.range() {
        if let Some(x) = series.get(i) {
            let shifted = (x - first).max(0.0);
            if changed(shifted, x) {
                series.set(i, Some(shifted));
                flags.mark(window.offset(i), code);
            }
        }
    }
    flags
}

/// Replaces an increment series by its running total over the window,
/// rounded to `decimals`. A null increment stays null and is flagged; the
/// total carries across it.
pub fn cumulative(series: &mut HourlySeries, window: &YearWindow, decimals: u32, code: u8) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    let scale = 10f64.powi(decimals as i32);
    let mut total = 0.0;
    for i in window.range() {
        match series.get(i) {
            Some(x) => {
                total += x;
                series.set(i, Some((total * scale).round() / scale));
            }
            None => flags.mark(window.offset(i), code),
        }
    }
    flags
}

/// Drops between `pre` and `post` are removed by adding
/// `value(pre) - value(post)` to every value from `post` to the window end.
///
/// A missing value at `pre` falls back to the nearest earlier value, and at
/// `post` to the nearest later one. Events outside the window are ignored.
pub fn drainage_jump(
    series: &mut HourlySeries,
    window: &YearWindow,
    events: &[(NaiveDateTime, NaiveDateTime)],
    code: u8,
) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    let mut events = events.to_vec();
    events.sort_by_key(|(_, post)| *post);

    for (pre, post) in events {
        let (Some(pre_idx), Some(post_idx)) = (series.index_of(pre), series.index_of(post)) else {
            continue;
        };
        if !window.contains(pre_idx) || !window.contains(post_idx) || post_idx <= pre_idx {
            continue;
        }
        let before = (window.start..=pre_idx).rev().find_map(|i| series.get(i));
        let after = (post_idx..=window.end).find_map(|i| series.get(i));
        let (Some(before), Some(after)) = (before, after) else {
            continue;
        };
        let offset = before - after;
        if !changed(offset, 0.0) {
            continue;
        }
        for i in post_idx..=window.end {
            if let Some(x) = series.get(i) {
                series.set(i, Some(x + offset));
                flags.mark(window.offset(i), code);
            }
        }
    }
    flags
}

/// Removes evaporation losses from a cumulative gauge.
///
/// The non-null values are differenced, negative increments are set to
/// zero, the increments are re-accumulated, and the result is rescaled to
/// the original minimum and maximum. Nulls stay where they were.
pub fn evaporation_trend(series: &mut HourlySeries, window: &YearWindow, code: u8) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    let idx = series.non_null_indices(window);
    let original: Vec<f64> = idx.iter().filter_map(|&i| series.get(i)).collect();
    if original.len() < 2 {
        return flags;
    }

    let corrected = match remove_losses(&original) {
        Ok(values) => values,
        Err(e) => {
            log::debug!("evaporation trend left unscaled: {}", e);
            accumulate_gains(&original)
        }
    };

    for (k, &i) in idx.iter().enumerate() {
        if changed(corrected[k], original[k]) {
            series.set(i, Some(corrected[k]));
            flags.mark(window.offset(i), code);
        }
    }
    flags
}

fn accumulate_gains(values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut total = values[0];
    out.push(total);
    for pair in values.windows(2) {
        total += (pair[1] - pair[0]).max(0.0);
        out.push(total);
    }
    out
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)))
}

fn remove_losses(values: &[f64]) -> Result<Vec<f64>, QcError> {
    let (orig_min, orig_max) = min_max(values);
    let accumulated = accumulate_gains(values);
    let (acc_min, acc_max) = min_max(&accumulated);
    let range = acc_max - acc_min;
    if range.abs() < CHANGE_EPSILON {
        return Err(QcError::NumericDegenerate("corrected series has zero range"));
    }
    Ok(accumulated
        .iter()
        .map(|x| orig_min + (x - acc_min) / range * (orig_max - orig_min))
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
