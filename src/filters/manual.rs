/// Manual corrections from the station profile.

use crate::config::{CorrectionAction, ManualCorrection};
use crate::model::{FlagVector, HourlySeries, YearWindow};

/// Applies every correction window that overlaps the year window. A window
/// forces its hours to null or to a fixed value; hours already holding the
/// target value are not flagged.
pub fn apply_corrections<'a, I>(
    series: &mut HourlySeries,
    window: &YearWindow,
    corrections: I,
    code: u8,
) -> FlagVector
where
    I: IntoIterator<Item = &'a ManualCorrection>,
{
    let mut flags = FlagVector::for_window(window);
    for correction in corrections {
        let target = match correction.action {
            CorrectionAction::Null => None,
            CorrectionAction::Set => correction.value,
        };
        if correction.action == CorrectionAction::Set && target.is_none() {
            continue;
        }
        for i in window.range() {
            if correction.covers(series.timestamp_at(i)) && series.get(i) != target {
                series.set(i, target);
                flags.mark(window.offset(i), code);
            }
        }
    }
    flags
}
