/// Fixed-threshold stages: physical-range clamp and negative-to-zero.

use crate::model::{FlagVector, HourlySeries, YearWindow};

/// Nulls values outside `[min, max]`.
pub fn clamp(series: &mut HourlySeries, window: &YearWindow, min: f64, max: f64, code: u8) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    for i in window.range() {
        if let Some(x) = series.get(i) {
            if x < min || x > max {
                series.set(i, None);
                flags.mark(window.offset(i), code);
            }
        }
    }
    flags
}

/// Replaces negative values with zero (sensor noise around an empty gauge).
pub fn negative_to_zero(series: &mut HourlySeries, window: &YearWindow, code: u8) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    for i in window.range() {
        if series.get(i).is_some_and(|x| x < 0.0) {
            series.set(i, Some(0.0));
            flags.mark(window.offset(i), code);
        }
    }
    flags
}
