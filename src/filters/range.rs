/// Step-change tests: the static range test and the multi-level shave.
///
/// Both compare each sample to the last sample that survived, so a spike
/// never becomes the reference for the samples after it. A jump that the
/// next sample confirms is a level change (a new snow plateau, the first
/// zero after melt-out) and becomes the new reference instead.

use crate::model::{FlagVector, HourlySeries, YearWindow};

/// Nulls any sample that differs from the last retained sample by more
/// than `step`, unless the next non-null sample within `max_gap_hours`
/// agrees with it to within `step`.
///
/// Samples more than `max_gap_hours` after the last retained one are not
/// compared and become the new reference, so a level change across a long
/// outage is kept. Running the test again on its own output changes nothing:
/// retained samples see the same reference and the same follower.
pub fn static_range(
    series: &mut HourlySeries,
    window: &YearWindow,
    step: f64,
    max_gap_hours: i64,
    code: u8,
) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    let idx = series.non_null_indices(window);
    let vals: Vec<f64> = idx.iter().filter_map(|&i| series.get(i)).collect();
    let within_gap = |from: usize, to: usize| (to - from) as i64 <= max_gap_hours;
    let mut anchor: Option<(usize, f64)> = None;

    for (j, (&i, &x)) in idx.iter().zip(&vals).enumerate() {
        if let Some((a, prev)) = anchor {
            let jumped = within_gap(a, i) && (x - prev).abs() > step;
            let confirmed = idx
                .get(j + 1)
                .is_some_and(|&next| within_gap(i, next) && (vals[j + 1] - x).abs() <= step);
            if jumped && !confirmed {
                series.set(i, None);
                flags.mark(window.offset(i), code);
                continue;
            }
        }
        anchor = Some((i, x));
    }
    flags
}

/// Static range test for each step of a descending list.
///
/// Every level is repeated until it removes nothing more before moving to
/// the next, tighter step.
pub fn range_shave(
    series: &mut HourlySeries,
    window: &YearWindow,
    steps: &[f64],
    max_gap_hours: i64,
    code: u8,
) -> FlagVector {
    let mut flags = FlagVector::for_window(window);
    for &step in steps {
        loop {
            let pass = static_range(series, window, step, max_gap_hours, code);
            if pass.is_clear() {
                break;
            }
            for offset in pass.flagged_offsets() {
                flags.mark(offset, code);
            }
        }
    }
    flags
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 10, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn series(values: &[Option<f64>]) -> (HourlySeries, YearWindow) {
        let s = HourlySeries::new(start(), values.to_vec());
        let w = YearWindow::whole(&s, 2020).unwrap();
        (s, w)
    }

    #[test]
    fn test_static_range_nulls_step_violation_only() {
        let (mut s, w) = series(&[Some(0.0), Some(5.0), Some(25.0)]);
        let flags = static_range(&mut s, &w, 10.0, 12, 1);
        assert_eq!(s.values(), &[Some(0.0), Some(5.0), None]);
        assert_eq!(flags.codes(), &[0, 0, 1]);
    }

    #[test]
    fn test_static_range_compares_against_retained_sample() {
        // 50 is a spike; 1 should be compared to 0, not to the spike.
        let (mut s, w) = series(&[Some(0.0), Some(50.0), Some(1.0), Some(2.0)]);
        let flags = static_range(&mut s, &w, 10.0, 12, 1);
        assert_eq!(s.values(), &[Some(0.0), None, Some(1.0), Some(2.0)]);
        assert_eq!(flags.count(), 1);
    }

    #[test]
    fn test_static_range_first_sample_and_single_runs_pass() {
        let (mut s, w) = series(&[None, Some(100.0), None]);
        let flags = static_range(&mut s, &w, 1.0, 12, 1);
        assert!(flags.is_clear());
    }

    #[test]
    fn test_static_range_is_idempotent() {
        let (mut s, w) = series(&[
            Some(0.0), Some(30.0), Some(31.0), Some(2.0), None, Some(40.0), Some(3.0), Some(-20.0), Some(4.0),
        ]);
        static_range(&mut s, &w, 10.0, 12, 1);
        let once = s.clone();
        let second = static_range(&mut s, &w, 10.0, 12, 1);
        assert!(second.is_clear());
        assert_eq!(s, once);
    }

    #[test]
    fn test_static_range_reanchors_after_long_gap() {
        let mut values = vec![Some(0.0)];
        values.extend(std::iter::repeat_n(None, 20));
        values.push(Some(50.0));
        values.push(Some(51.0));
        let (mut s, w) = series(&values);
        let flags = static_range(&mut s, &w, 10.0, 12, 1);
        assert!(flags.is_clear(), "level change after a 21h outage is kept");
    }

    #[test]
    fn test_static_range_keeps_confirmed_level_shift() {
        let mut values = vec![Some(0.0); 3];
        values.extend(vec![Some(30.0); 20]);
        let (mut s, w) = series(&values);
        let flags = static_range(&mut s, &w, 10.0, 12, 1);
        assert!(flags.is_clear(), "a new plateau is not a spike");
        assert!(s.values().iter().all(Option::is_some));
    }

    #[test]
    fn test_static_range_keeps_first_zero_after_drop() {
        let (mut s, w) = series(&[Some(80.0), Some(79.0), Some(0.0), Some(0.0), Some(0.0)]);
        assert!(static_range(&mut s, &w, 20.0, 12, 1).is_clear());
    }

    #[test]
    fn test_static_range_spike_followed_by_disagreeing_sample_is_nulled() {
        // 50 and 30 disagree with each other, so neither starts a new level.
        let (mut s, w) = series(&[Some(0.0), Some(50.0), Some(30.0), Some(1.0)]);
        let flags = static_range(&mut s, &w, 10.0, 12, 1);
        assert_eq!(s.values(), &[Some(0.0), None, None, Some(1.0)]);
        assert_eq!(flags.codes(), &[0, 1, 1, 0]);
    }

    #[test]
    fn test_static_range_level_shift_output_is_stable() {
        let (mut s, w) = series(&[
            Some(0.0), Some(1.0), Some(40.0), Some(41.0), Some(90.0), Some(42.0), None, Some(43.0), Some(-5.0),
        ]);
        static_range(&mut s, &w, 10.0, 12, 1);
        assert_eq!(
            s.values(),
            &[Some(0.0), Some(1.0), Some(40.0), Some(41.0), None, Some(42.0), None, Some(43.0), None]
        );
        let once = s.clone();
        assert!(static_range(&mut s, &w, 10.0, 12, 1).is_clear());
        assert_eq!(s, once);
    }

    #[test]
    fn test_range_shave_runs_each_level() {
        let (mut s, w) = series(&[Some(0.0), Some(4.0), Some(30.0), Some(7.0), Some(9.0), Some(20.0), Some(10.0)]);
        let flags = range_shave(&mut s, &w, &[20.0, 5.0], 12, 7);
        // 30 goes at step 20, 20 goes at step 5.
        assert_eq!(s.values(), &[Some(0.0), Some(4.0), None, Some(7.0), Some(9.0), None, Some(10.0)]);
        assert_eq!(flags.codes(), &[0, 0, 7, 0, 0, 7, 0]);
    }
}
