/// Series segmentation: hourly reindexing and water-year boundary lookup.
///
/// Raw station tables are irregular: loggers skip hours, write sub-hourly
/// rows, and occasionally repeat a timestamp. Everything downstream assumes
/// one slot per hour, so this module builds that grid once per
/// station/variable and then resolves each water year (Oct 1 00:00 to
/// Sep 30 23:00) to an index window on it.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::ops::RangeInclusive;

use crate::config::Settings;
use crate::model::{BoundaryKind, HourlySeries, QcError, RawObservation, YearWindow};

/// How far a partial water year may deviate from the nominal boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryPolicy {
    /// (month, day) in the first calendar year; a later start is rejected.
    pub short_start: (u32, u32),
    /// (month, day) in the second calendar year; an earlier end is rejected.
    pub short_end: (u32, u32),
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        BoundaryPolicy {
            short_start: (12, 15),
            short_end: (7, 15),
        }
    }
}

impl From<&Settings> for BoundaryPolicy {
    fn from(settings: &Settings) -> Self {
        BoundaryPolicy {
            short_start: settings.short_start_cutoff,
            short_end: settings.short_end_cutoff,
        }
    }
}

// ---------------------------------------------------------------------------
// Reindexing
// ---------------------------------------------------------------------------

/// Builds the strict hourly grid for a raw series.
///
/// The grid runs from the first to the last on-the-hour timestamp. Off-grid
/// timestamps are dropped, as is anything after `record_end`. When a
/// timestamp repeats, a later non-null value replaces an earlier one but a
/// later null never erases a value. Returns `None` if nothing usable is left.
pub fn reindex_hourly(
    observations: &[RawObservation],
    record_end: Option<NaiveDateTime>,
) -> Option<HourlySeries> {
    let mut on_grid: Vec<&RawObservation> = observations
        .iter()
        .filter(|o| o.timestamp.minute() == 0 && o.timestamp.second() == 0 && o.timestamp.nanosecond() == 0)
        .filter(|o| record_end.is_none_or(|end| o.timestamp <= end))
        .collect();

    // Stable: repeated timestamps keep their input order.
    on_grid.sort_by_key(|o| o.timestamp);

    let first = on_grid.first()?.timestamp;
    let last = on_grid.last()?.timestamp;
    let len = (last - first).num_hours() as usize + 1;

    let mut series = HourlySeries::nulls(first, len);
    for obs in on_grid {
        if obs.value.is_some() {
            if let Some(idx) = series.index_of(obs.timestamp) {
                series.set(idx, obs.value);
            }
        }
    }
    Some(series)
}

// ---------------------------------------------------------------------------
// Water years
// ---------------------------------------------------------------------------

/// Water year containing `ts`, identified by the calendar year of its Oct 1.
pub fn water_year_of(ts: NaiveDateTime) -> i32 {
    if ts.month() >= 10 { ts.year() } else { ts.year() - 1 }
}

/// Water years from the one containing the first slot to the one containing
/// the last.
pub fn water_year_range(series: &HourlySeries) -> Option<RangeInclusive<i32>> {
    let end = series.end()?;
    Some(water_year_of(series.start())..=water_year_of(end))
}

pub fn nominal_start(water_year: i32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(water_year, 10, 1)?.and_hms_opt(0, 0, 0)
}

pub fn nominal_end(water_year: i32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(water_year + 1, 9, 30)?.and_hms_opt(23, 0, 0)
}

fn cutoff_date(year: i32, (month, day): (u32, u32), water_year: i32) -> Result<NaiveDate, QcError> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| QcError::MissingBoundary {
        water_year,
        detail: format!("invalid boundary cutoff {:02}-{:02}", month, day),
    })
}

/// Resolves water year `water_year` to an index window on `series`.
///
/// Nominal boundaries are used when the series covers them. Otherwise the
/// nearest slot is taken, provided it lies inside the water year and within
/// the tolerance given by `policy`; if not, the year is unprocessable.
pub fn locate_water_year(
    series: &HourlySeries,
    water_year: i32,
    policy: &BoundaryPolicy,
) -> Result<YearWindow, QcError> {
    let missing = |detail: String| QcError::MissingBoundary { water_year, detail };

    let first = series.start();
    let Some(last) = series.end() else {
        return Err(missing("series is empty".into()));
    };
    let (Some(start), Some(end)) = (nominal_start(water_year), nominal_end(water_year)) else {
        return Err(missing("water year out of calendar range".into()));
    };

    if last < start || first > end {
        return Err(missing(format!(
            "series ({} to {}) does not overlap the water year",
            first, last
        )));
    }

    let mut short_start = false;
    let start_ts = if first <= start {
        start
    } else {
        let cutoff = cutoff_date(water_year, policy.short_start, water_year)?;
        if first.date() > cutoff {
            return Err(missing(format!(
                "data starts {} which is after the {} short-start cutoff",
                first, cutoff
            )));
        }
        short_start = true;
        first
    };

    let mut short_end = false;
    let end_ts = if last >= end {
        end
    } else {
        let cutoff = cutoff_date(water_year + 1, policy.short_end, water_year)?;
        if last.date() < cutoff {
            return Err(missing(format!(
                "data ends {} which is before the {} short-end cutoff",
                last, cutoff
            )));
        }
        short_end = true;
        last
    };

    let kind = match (short_start, short_end) {
        (false, false) => BoundaryKind::Full,
        (true, false) => BoundaryKind::ShortStart,
        (false, true) => BoundaryKind::ShortEnd,
        (true, true) => BoundaryKind::ShortBoth,
    };

    YearWindow::from_timestamps(series, water_year, start_ts, end_ts, kind)
        .ok_or_else(|| missing(format!("boundaries {} / {} not on the series grid", start_ts, end_ts)))
}

/// Fails with `AllNull` when the variable has no data in the window.
pub fn ensure_has_data(series: &HourlySeries, window: &YearWindow) -> Result<(), QcError> {
    if series.is_all_null(window) {
        Err(QcError::AllNull { water_year: window.water_year })
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn span(from: NaiveDateTime, to: NaiveDateTime) -> HourlySeries {
        let len = (to - from).num_hours() as usize + 1;
        HourlySeries::new(from, vec![Some(1.0); len])
    }

    #[test]
    fn test_reindex_fills_missing_hours_with_nulls() {
        let obs = vec![
            RawObservation::new(ts(2020, 10, 1, 0), Some(1.0)),
            RawObservation::new(ts(2020, 10, 1, 3), Some(4.0)),
        ];
        let series = reindex_hourly(&obs, None).unwrap();
        assert_eq!(series.values(), &[Some(1.0), None, None, Some(4.0)]);
    }

    #[test]
    fn test_reindex_drops_sub_hourly_rows() {
        let obs = vec![
            RawObservation::new(ts(2020, 10, 1, 0) + Duration::minutes(15), Some(9.0)),
            RawObservation::new(ts(2020, 10, 1, 1), Some(1.0)),
            RawObservation::new(ts(2020, 10, 1, 1) + Duration::minutes(30), Some(9.0)),
            RawObservation::new(ts(2020, 10, 1, 2), Some(2.0)),
        ];
        let series = reindex_hourly(&obs, None).unwrap();
        assert_eq!(series.start(), ts(2020, 10, 1, 1), "anchored at first on-the-hour row");
        assert_eq!(series.values(), &[Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_reindex_duplicate_timestamps_later_value_wins_but_null_never_overwrites() {
        let obs = vec![
            RawObservation::new(ts(2020, 10, 1, 0), Some(1.0)),
            RawObservation::new(ts(2020, 10, 1, 0), Some(2.0)),
            RawObservation::new(ts(2020, 10, 1, 1), Some(5.0)),
            RawObservation::new(ts(2020, 10, 1, 1), None),
        ];
        let series = reindex_hourly(&obs, None).unwrap();
        assert_eq!(series.values(), &[Some(2.0), Some(5.0)]);
    }

    #[test]
    fn test_reindex_truncates_at_record_end() {
        let obs: Vec<_> = (0..10)
            .map(|h| RawObservation::new(ts(2020, 10, 1, h), Some(h as f64)))
            .collect();
        let series = reindex_hourly(&obs, Some(ts(2020, 10, 1, 4))).unwrap();
        assert_eq!(series.len(), 5);
        assert!(reindex_hourly(&obs, Some(ts(2019, 1, 1, 0))).is_none());
    }

    #[test]
    fn test_water_year_of() {
        assert_eq!(water_year_of(ts(2020, 10, 1, 0)), 2020);
        assert_eq!(water_year_of(ts(2020, 9, 30, 23)), 2019);
        assert_eq!(water_year_of(ts(2021, 1, 15, 0)), 2020);
    }

    #[test]
    fn test_water_year_range_spans_first_to_last() {
        let series = HourlySeries::nulls(ts(2019, 11, 3, 0), 24 * 500);
        let range = water_year_range(&series).unwrap();
        assert_eq!(range, 2019..=2020);
    }

    #[test]
    fn test_full_water_year() {
        let series = span(ts(2019, 9, 1, 0), ts(2021, 11, 1, 0));
        let window = locate_water_year(&series, 2020, &BoundaryPolicy::default()).unwrap();
        assert_eq!(window.kind, BoundaryKind::Full);
        assert_eq!(window.start_ts, ts(2020, 10, 1, 0));
        assert_eq!(window.end_ts, ts(2021, 9, 30, 23));
        assert_eq!(window.len(), 8760);
    }

    #[test]
    fn test_short_start_within_tolerance() {
        let series = span(ts(2020, 11, 20, 5), ts(2021, 10, 5, 0));
        let window = locate_water_year(&series, 2020, &BoundaryPolicy::default()).unwrap();
        assert_eq!(window.kind, BoundaryKind::ShortStart);
        assert_eq!(window.start_ts, ts(2020, 11, 20, 5));
        assert_eq!(window.start, 0);
    }

    #[test]
    fn test_start_after_cutoff_is_missing_boundary() {
        let series = span(ts(2020, 12, 16, 0), ts(2021, 10, 5, 0));
        let err = locate_water_year(&series, 2020, &BoundaryPolicy::default()).unwrap_err();
        assert!(matches!(err, QcError::MissingBoundary { water_year: 2020, .. }));
    }

    #[test]
    fn test_short_end_and_short_both() {
        let series = span(ts(2020, 9, 1, 0), ts(2021, 8, 1, 0));
        let window = locate_water_year(&series, 2020, &BoundaryPolicy::default()).unwrap();
        assert_eq!(window.kind, BoundaryKind::ShortEnd);
        assert_eq!(window.end_ts, ts(2021, 8, 1, 0));

        let series = span(ts(2020, 10, 10, 0), ts(2021, 7, 20, 0));
        let window = locate_water_year(&series, 2020, &BoundaryPolicy::default()).unwrap();
        assert_eq!(window.kind, BoundaryKind::ShortBoth);
    }

    #[test]
    fn test_end_before_cutoff_is_missing_boundary() {
        let series = span(ts(2020, 9, 1, 0), ts(2021, 6, 30, 0));
        assert!(locate_water_year(&series, 2020, &BoundaryPolicy::default()).is_err());
    }

    #[test]
    fn test_nearest_outside_water_year_is_never_accepted() {
        // Series ends in the previous water year: nearest "start" would be
        // Sep 2020, which belongs to water year 2019.
        let series = span(ts(2019, 10, 1, 0), ts(2020, 9, 15, 0));
        assert!(locate_water_year(&series, 2020, &BoundaryPolicy::default()).is_err());
    }

    #[test]
    fn test_tolerance_is_configurable() {
        let series = span(ts(2020, 11, 20, 0), ts(2021, 10, 5, 0));
        assert!(locate_water_year(&series, 2020, &BoundaryPolicy::default()).is_ok());
        let strict = BoundaryPolicy { short_start: (10, 15), short_end: (7, 15) };
        assert!(locate_water_year(&series, 2020, &strict).is_err());

        let settings = Settings { short_start_cutoff: (11, 1), ..Settings::default() };
        assert_eq!(BoundaryPolicy::from(&settings).short_start, (11, 1));
    }

    #[test]
    fn test_ensure_has_data() {
        let mut series = HourlySeries::nulls(ts(2020, 10, 1, 0), 24);
        let window = YearWindow::whole(&series, 2020).unwrap();
        assert!(matches!(ensure_has_data(&series, &window), Err(QcError::AllNull { .. })));
        series.set(5, Some(0.0));
        assert!(ensure_has_data(&series, &window).is_ok());
    }
}
