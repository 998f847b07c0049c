//! Credit engine: pure functions for upload credits and download costs.
//!
//! All arithmetic is in KiB with sub-KiB transfers rounded up to one unit.
//! The engine never mutates user state; the session applies the computed
//! values through the user store, which serializes balance updates on its
//! lock.

use crate::store::section::Section;
use crate::store::user::Group;

/// Multiplicative adjustments contributed by the rule engine, applied on
/// top of the section/group multiplier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleAdjust {
    pub upload_bonus: f64,
    pub cost_multiplier: f64,
}

impl Default for RuleAdjust {
    fn default() -> Self {
        RuleAdjust { upload_bonus: 1.0, cost_multiplier: 1.0 }
    }
}

/// KiB units for a byte count; anything below 1 KiB still counts as one.
pub fn kib(bytes: u64) -> u64 {
    (bytes / 1024).max(1)
}

/// Credits awarded for an upload of `bytes` into `section`.
///
/// The section's upload multiplier applies unless the uploader's primary
/// group carries a per-section override; the rule bonus then composes
/// multiplicatively (section/group first, rule last).
pub fn upload_credits(
    section: &Section,
    primary_group: Option<&Group>,
    rules: &RuleAdjust,
    bytes: u64,
) -> u64 {
    let base = primary_group
        .and_then(|g| g.ratio_for(&section.name))
        .and_then(|r| r.upload_multiplier)
        .unwrap_or(section.upload_multiplier);
    let multiplier = base * rules.upload_bonus;
    (kib(bytes) as f64 * multiplier).floor() as u64
}

/// Cost in KiB of downloading `bytes` from `section`. Free-leech sections
/// cost nothing regardless of multipliers; otherwise the same override
/// rule as uploads applies to the download multiplier.
pub fn download_cost(
    section: &Section,
    primary_group: Option<&Group>,
    rules: &RuleAdjust,
    bytes: u64,
) -> u64 {
    if section.free_leech {
        return 0;
    }
    let base = primary_group
        .and_then(|g| g.ratio_for(&section.name))
        .and_then(|r| r.download_multiplier)
        .unwrap_or(section.download_multiplier);
    let multiplier = base * rules.cost_multiplier;
    (kib(bytes) as f64 * multiplier).floor() as u64
}

/// Applies a cost to a balance. `(true, new_balance)` when it fits,
/// `(false, old_balance)` otherwise.
pub fn try_consume(balance_kib: u64, cost_kib: u64) -> (bool, u64) {
    if cost_kib > balance_kib {
        (false, balance_kib)
    } else {
        (true, balance_kib - cost_kib)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::user::GroupRatio;
    use crate::vfs::path::fold_key;

    fn section(up: f64, down: f64) -> Section {
        let mut s = Section::new("APPS", "/apps");
        s.upload_multiplier = up;
        s.download_multiplier = down;
        s
    }

    #[test]
    fn sub_kib_counts_as_one() {
        assert_eq!(kib(0), 1);
        assert_eq!(kib(1), 1);
        assert_eq!(kib(1023), 1);
        assert_eq!(kib(1024), 1);
        assert_eq!(kib(2048), 2);
        assert_eq!(kib(4096), 4);
    }

    #[test]
    fn upload_uses_section_multiplier() {
        let s = section(3.0, 1.0);
        // 4096 bytes = 4 KiB, floor(4 * 3) = 12.
        assert_eq!(upload_credits(&s, None, &RuleAdjust::default(), 4096), 12);
    }

    #[test]
    fn group_override_replaces_section_multiplier() {
        let s = section(3.0, 2.0);
        let mut g = Group::new("CREW");
        g.section_ratios.insert(
            fold_key("APPS"),
            GroupRatio { upload_multiplier: Some(5.0), download_multiplier: None },
        );
        assert_eq!(upload_credits(&s, Some(&g), &RuleAdjust::default(), 2048), 10);
        // No download override, so the section multiplier stands.
        assert_eq!(download_cost(&s, Some(&g), &RuleAdjust::default(), 2048), 4);
    }

    #[test]
    fn rule_adjust_composes_multiplicatively() {
        let s = section(2.0, 2.0);
        let rules = RuleAdjust { upload_bonus: 1.5, cost_multiplier: 0.5 };
        assert_eq!(upload_credits(&s, None, &rules, 2048), 6); // floor(2 * 2 * 1.5)
        assert_eq!(download_cost(&s, None, &rules, 2048), 2); // floor(2 * 2 * 0.5)
    }

    #[test]
    fn free_leech_costs_nothing() {
        let mut s = section(1.0, 9.0);
        s.free_leech = true;
        for bytes in [0u64, 1, 1024, 10 << 20] {
            assert_eq!(download_cost(&s, None, &RuleAdjust::default(), bytes), 0);
        }
    }

    #[test]
    fn consume_leaves_balance_on_failure() {
        assert_eq!(try_consume(10, 20), (false, 10));
        assert_eq!(try_consume(10, 10), (true, 0));
        assert_eq!(try_consume(10, 4), (true, 6));
        assert_eq!(try_consume(0, 0), (true, 0));
    }
}
