/// Flag aggregation: per-stage flag vectors to one label per timestamp.
///
/// A label is `"0"` when no stage acted, otherwise the codes of the stages
/// that acted, comma-separated in stage order, each code once. Dominance
/// rules from the variable descriptor then collapse the list:
///
/// - `Sole(c)`: if `c` is present it is the only code reported.
/// - `Supersedes { later, earlier }`: if `later` fired at a stage after the
///   one where `earlier` fired, `earlier` is dropped (unless interpolation
///   history is retained).

use crate::model::FlagVector;
use crate::variables::DominanceRule;

/// Merges the flag vectors of one water year. `stage_flags` must be in
/// stage order and all of the same length.
pub fn merge_flags(
    stage_flags: &[FlagVector],
    dominance: &[DominanceRule],
    retain_interpolation_history: bool,
) -> Vec<String> {
    let len = stage_flags.first().map(FlagVector::len).unwrap_or(0);
    (0..len)
        .map(|row| {
            let fired: Vec<(usize, u8)> = stage_flags
                .iter()
                .enumerate()
                .map(|(pos, f)| (pos, f.get(row)))
                .filter(|(_, code)| *code != 0)
                .collect();
            merge_row(&fired, dominance, retain_interpolation_history)
        })
        .collect()
}

/// Merges one row given the (stage position, code) pairs that fired.
pub fn merge_row(fired: &[(usize, u8)], dominance: &[DominanceRule], retain_interpolation_history: bool) -> String {
    if fired.is_empty() {
        return "0".to_string();
    }

    for rule in dominance {
        if let DominanceRule::Sole(code) = rule {
            if fired.iter().any(|(_, c)| c == code) {
                return code.to_string();
            }
        }
    }

    let mut dropped: Vec<u8> = Vec::new();
    if !retain_interpolation_history {
        for rule in dominance {
            if let DominanceRule::Supersedes { later, earlier } = *rule {
                let last_later = fired.iter().filter(|(_, c)| *c == later).map(|(p, _)| *p).max();
                let first_earlier = fired.iter().filter(|(_, c)| *c == earlier).map(|(p, _)| *p).min();
                if let (Some(l), Some(e)) = (last_later, first_earlier) {
                    if l > e {
                        dropped.push(earlier);
                    }
                }
            }
        }
    }

    let mut codes: Vec<u8> = Vec::new();
    for (_, code) in fired {
        if !dropped.contains(code) && !codes.contains(code) {
            codes.push(*code);
        }
    }
    codes.iter().map(u8::to_string).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNOW_RULES: &[DominanceRule] = &[
        DominanceRule::Sole(6),
        DominanceRule::Supersedes { later: 9, earlier: 8 },
    ];

    fn fv(codes: &[u8]) -> FlagVector {
        FlagVector::from_codes(codes.to_vec())
    }

    #[test]
    fn test_no_flags_is_zero() {
        let merged = merge_flags(&[fv(&[0, 0]), fv(&[0, 0])], &[], false);
        assert_eq!(merged, vec!["0", "0"]);
    }

    #[test]
    fn test_codes_joined_in_stage_order() {
        let merged = merge_flags(&[fv(&[1, 0]), fv(&[0, 0]), fv(&[3, 3])], &[], false);
        assert_eq!(merged, vec!["1,3", "3"]);
    }

    #[test]
    fn test_repeated_code_appears_once_at_first_position() {
        let merged = merge_flags(&[fv(&[2]), fv(&[1]), fv(&[2])], &[], false);
        assert_eq!(merged, vec!["2,1"]);
    }

    #[test]
    fn test_sole_code_suppresses_everything_else() {
        let merged = merge_flags(&[fv(&[1, 1]), fv(&[6, 0]), fv(&[7, 7])], SNOW_RULES, false);
        assert_eq!(merged, vec!["6", "1,7"]);
    }

    #[test]
    fn test_post_interpolation_range_supersedes_interpolation() {
        let merged = merge_flags(&[fv(&[1]), fv(&[8]), fv(&[9])], SNOW_RULES, false);
        assert_eq!(merged, vec!["1,9"]);
    }

    #[test]
    fn test_history_retained_when_configured() {
        let merged = merge_flags(&[fv(&[8]), fv(&[9])], SNOW_RULES, true);
        assert_eq!(merged, vec!["8,9"]);
    }

    #[test]
    fn test_supersede_requires_later_stage() {
        // 9 fired before 8: both kept.
        let merged = merge_flags(&[fv(&[9]), fv(&[8])], SNOW_RULES, false);
        assert_eq!(merged, vec!["9,8"]);
    }
}
