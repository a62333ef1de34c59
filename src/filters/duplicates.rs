/// Stuck-sensor detection: repeated values and long constant runs.

use crate::model::{FlagVector, HourlySeries, YearWindow};

/// Nulls a sample equal to the sample before it (previous non-null value in
/// the original series). The first value of a repeated run survives.
pub fn remove_duplicates(series: &mut HourlySeries, window: &YearWindow, code: u8) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    let mut prev: Option<f64> = None;
    for i in window.range() {
        let Some(x) = series.get(i) else { continue };
        if prev == Some(x) {
            series.set(i, None);
            flags.mark(window.offset(i), code);
        }
        prev = Some(x);
    }
    flags
}

/// Nulls every run of at least `min_run` consecutive hours holding the same
/// value. With `target` set only runs of that value count; with `None` any
/// repeated value does. A null hour ends a run.
pub fn remove_windowed_duplicates(
    series: &mut HourlySeries,
    window: &YearWindow,
    target: Option<f64>,
    min_run: usize,
    code: u8,
) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    if min_run == 0 {
        return flags;
    }

    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut run: Option<(usize, f64)> = None;
    for i in window.range() {
        let value = series.get(i).filter(|x| target.is_none_or(|t| *x == t));
        match (run, value) {
            (Some((_, v)), Some(x)) if v == x => {}
            (Some((s, _)), _) => {
                runs.push((s, i - 1));
                run = value.map(|x| (i, x));
            }
            (None, _) => run = value.map(|x| (i, x)),
        }
    }
    if let Some((s, _)) = run {
        runs.push((s, window.end));
    }

    for (s, e) in runs {
        if e - s + 1 >= min_run {
            for i in s..=e {
                series.set(i, None);
                flags.mark(window.offset(i), code);
            }
        }
    }
    flags
}
