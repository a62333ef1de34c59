/// Statistical outlier stages: monthly mean/std, sliding-window mean
/// deviation, and false zeros.
///
/// The sliding window compares against the values as they were when the
/// stage started. The monthly and false-zero tests repeat until a pass
/// removes nothing, so their output is stable under a second run.

use chrono::Datelike;

use crate::model::{FlagVector, HourlySeries, YearWindow};

/// Nulls values above `mean + sigma * std` of their calendar month.
///
/// Only the upper tail is tested. Each month is re-tested against its
/// remaining values until nothing more is removed. Months with fewer than
/// two samples or no spread are left alone.
pub fn monthly_outlier(series: &mut HourlySeries, window: &YearWindow, sigma: f64, code: u8) -> FlagVector {
    let mut flags = FlagVector::for_window(window);

    let mut segment_start = window.start;
    for i in window.range() {
        let next_is_new_month = i == window.end || {
            let (a, b) = (series.timestamp_at(i), series.timestamp_at(i + 1));
            a.month() != b.month() || a.year() != b.year()
        };
        if next_is_new_month {
            flag_month(series, window, segment_start, i, sigma, code, &mut flags);
            segment_start = i + 1;
        }
    }
    flags
}

fn flag_month(
    series: &mut HourlySeries,
    window: &YearWindow,
    from: usize,
    to: usize,
    sigma: f64,
    code: u8,
    flags: &mut FlagVector,
) {
    loop {
        let values: Vec<f64> = (from..=to).filter_map(|i| series.get(i)).collect();
        let Some((mean, std)) = mean_and_sample_std(&values) else { return };
        if std <= 0.0 || !std.is_finite() {
            return;
        }
        let limit = mean + sigma * std;
        let mut removed = false;
        for i in from..=to {
            if series.get(i).is_some_and(|x| x > limit) {
                series.set(i, None);
                flags.mark(window.offset(i), code);
                removed = true;
            }
        }
        if !removed {
            return;
        }
    }
}

/// Mean and sample (n - 1) standard deviation; `None` below two samples.
pub fn mean_and_sample_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, var.sqrt()))
}

/// Nulls a sample whose distance from the mean of a forward or a backward
/// window of `n` non-null samples exceeds `threshold`.
///
/// The forward window starts at the sample itself, the backward window ends
/// just before it. Windows shrink at the ends of the year; an empty window
/// is skipped.
pub fn sliding_window(
    series: &mut HourlySeries,
    window: &YearWindow,
    n: usize,
    threshold: f64,
    code: u8,
) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    let idx = series.non_null_indices(window);
    let vals: Vec<f64> = idx.iter().filter_map(|&i| series.get(i)).collect();
    if n == 0 {
        return flags;
    }

    let mean = |s: &[f64]| (!s.is_empty()).then(|| s.iter().sum::<f64>() / s.len() as f64);

    for (j, &x) in vals.iter().enumerate() {
        let forward = mean(&vals[j..(j + n).min(vals.len())]);
        let backward = mean(&vals[j.saturating_sub(n)..j]);
        let deviates = [forward, backward]
            .into_iter()
            .flatten()
            .any(|m| (x - m).abs() > threshold);
        if deviates {
            series.set(idx[j], None);
            flags.mark(window.offset(idx[j]), code);
        }
    }
    flags
}

/// Nulls an exact zero whose previous or next non-null neighbour is further
/// than `threshold` from zero; a dropout reading rather than a real zero.
///
/// Removing one zero can expose the next zero of a dropout run to a large
/// neighbour, so passes repeat until none removes anything.
pub fn false_zero(series: &mut HourlySeries, window: &YearWindow, threshold: f64, code: u8) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    loop {
        let idx = series.non_null_indices(window);
        let vals: Vec<f64> = idx.iter().filter_map(|&i| series.get(i)).collect();

        let mut removed = false;
        for (j, &x) in vals.iter().enumerate() {
            if x != 0.0 {
                continue;
            }
            let prev = j.checked_sub(1).map(|k| vals[k]);
            let next = vals.get(j + 1).copied();
            if [prev, next].into_iter().flatten().any(|nb| nb.abs() > threshold) {
                series.set(idx[j], None);
                flags.mark(window.offset(idx[j]), code);
                removed = true;
            }
        }
        if !removed {
            return flags;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn series(values: &[Option<f64>]) -> (HourlySeries, YearWindow) {
        let s = HourlySeries::new(at(2020, 10, 1, 0), values.to_vec());
        let w = YearWindow::whole(&s, 2020).unwrap();
        (s, w)
    }

    #[test]
    fn test_mean_and_sample_std() {
        let (mean, std) = mean_and_sample_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((mean - 5.0).abs() < 1e-12);
        assert!((std - 2.138089935).abs() < 1e-6);
        assert!(mean_and_sample_std(&[1.0]).is_none());
    }

    #[test]
    fn test_monthly_outlier_flags_upper_spike_only() {
        let mut values = vec![Some(1.0); 40];
        values[10] = Some(50.0);
        values[20] = Some(-50.0);
        let (mut s, w) = series(&values);
        let flags = monthly_outlier(&mut s, &w, 4.0, 4);
        assert_eq!(flags.flagged_offsets(), vec![10]);
        assert_eq!(s.get(20), Some(-50.0));
    }

    #[test]
    fn test_monthly_outlier_partitions_at_month_change() {
        // Two days of September at 100 then October at 1: the October spike
        // is judged against October only.
        let start = at(2020, 9, 29, 0);
        let mut values = vec![Some(100.0); 48];
        values.extend(vec![Some(1.0); 40]);
        values[48 + 5] = Some(30.0);
        let mut s = HourlySeries::new(start, values);
        let w = YearWindow::whole(&s, 2019).unwrap();
        let flags = monthly_outlier(&mut s, &w, 4.0, 4);
        assert_eq!(flags.flagged_offsets(), vec![53]);
    }

    #[test]
    fn test_monthly_outlier_skips_constant_and_tiny_months() {
        let (mut s, w) = series(&[Some(5.0), Some(5.0), Some(5.0)]);
        assert!(monthly_outlier(&mut s, &w, 1.0, 4).is_clear());
        let (mut s, w) = series(&[None, Some(5.0), None]);
        assert!(monthly_outlier(&mut s, &w, 1.0, 4).is_clear());
    }

    #[test]
    fn test_sliding_window_flags_pressure_jump() {
        let mut values = vec![Some(95.0); 30];
        values[15] = Some(100.0);
        let (mut s, w) = series(&values);
        let flags = sliding_window(&mut s, &w, 24, 3.0, 5);
        assert_eq!(flags.flagged_offsets(), vec![15]);
    }

    #[test]
    fn test_sliding_window_uses_original_values_and_shrinks_at_edges() {
        // First sample has no backward window; 10 at index 1 is 10 from the
        // backward mean 0.
        let (mut s, w) = series(&[Some(0.0), Some(10.0), Some(10.0), Some(10.0)]);
        let flags = sliding_window(&mut s, &w, 1, 3.0, 5);
        assert_eq!(flags.flagged_offsets(), vec![1]);
        assert_eq!(s.get(0), Some(0.0));
    }

    #[test]
    fn test_sliding_window_forward_mean_includes_the_sample() {
        // Backward mean of 10 is 10 from the step but the forward window
        // [10, 20] averages 15: deviation 5 is not above 5, so it stays.
        let (mut s, w) = series(&[Some(10.0), Some(10.0), Some(10.0), Some(20.0)]);
        let flags = sliding_window(&mut s, &w, 2, 5.0, 5);
        assert_eq!(s.get(2), Some(10.0));
        assert_eq!(flags.flagged_offsets(), vec![3]);
    }

    #[test]
    fn test_sliding_window_rerun_changes_nothing() {
        let mut values = vec![Some(95.0); 48];
        values[20] = Some(101.0);
        let (mut s, w) = series(&values);
        sliding_window(&mut s, &w, 24, 3.0, 5);
        let once = s.clone();
        assert!(sliding_window(&mut s, &w, 24, 3.0, 5).is_clear());
        assert_eq!(s, once);
    }

    #[test]
    fn test_false_zero_between_large_neighbours() {
        let (mut s, w) = series(&[Some(80.0), Some(0.0), Some(82.0), Some(1.0), Some(0.0), Some(2.0)]);
        let flags = false_zero(&mut s, &w, 75.0, 6);
        assert_eq!(flags.codes(), &[0, 6, 0, 0, 0, 0]);
        assert_eq!(s.get(1), None);
    }

    #[test]
    fn test_monthly_outlier_retests_remaining_values() {
        // 50 inflates the spread enough to hide 20; without it 20 stands out.
        let mut values = vec![Some(1.0); 42];
        values[5] = Some(50.0);
        values[30] = Some(20.0);
        let (mut s, w) = series(&values);
        let flags = monthly_outlier(&mut s, &w, 4.0, 4);
        assert_eq!(flags.flagged_offsets(), vec![5, 30]);

        let once = s.clone();
        assert!(monthly_outlier(&mut s, &w, 4.0, 4).is_clear());
        assert_eq!(s, once);
    }

    #[test]
    fn test_false_zero_removes_whole_dropout_run() {
        let (mut s, w) = series(&[Some(80.0), Some(0.0), Some(0.0), Some(0.0), Some(1.0), Some(0.0), Some(2.0)]);
        let flags = false_zero(&mut s, &w, 75.0, 6);
        assert_eq!(flags.codes(), &[0, 6, 6, 6, 0, 0, 0]);

        let once = s.clone();
        assert!(false_zero(&mut s, &w, 75.0, 6).is_clear());
        assert_eq!(s, once);
    }

    #[test]
    fn test_false_zero_looks_across_nulls() {
        let (mut s, w) = series(&[Some(5.0), None, Some(0.0), None, None, Some(0.5)]);
        let flags = false_zero(&mut s, &w, 3.0, 6);
        assert_eq!(flags.flagged_offsets(), vec![2]);
    }
}
