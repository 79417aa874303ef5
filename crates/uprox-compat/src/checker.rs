//! Storage schema compatibility checking
//!
//! Ledger storage is addressed by slot, so an upgrade is safe only if every
//! entry of the old schema is still found, unchanged, at the same position
//! of the new one. Appending entries is the only permitted evolution.
//!
//! The check is conservative: it never tries to prove that a changed entry
//! reinterprets the old bytes harmlessly.

use crate::verdict::{CompatibilityVerdict, SchemaViolation, ViolationKind};
use uprox_artifact::{SlotEntry, StorageSchema};

/// Compares an old and a new storage schema
#[derive(Debug, Clone, Copy, Default)]
pub struct CompatibilityChecker;

impl CompatibilityChecker {
    /// Create checker
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Check whether `new` can replace `old` behind the same proxy
    ///
    /// Reports at most one violation per old entry, in old-schema order.
    #[must_use]
    pub fn check(&self, old: &StorageSchema, new: &StorageSchema) -> CompatibilityVerdict {
        let mut violations = Vec::new();

        for (index, before) in old.entries().iter().enumerate() {
            let kind = match new.get(index) {
                Some(after) => Self::compare(index, before, after, old, new),
                None => Some(Self::missing(index, before, new)),
            };
            if let Some(kind) = kind {
                violations.push(SchemaViolation {
                    index,
                    slot: before.slot,
                    offset: before.offset,
                    name: before.name.clone(),
                    kind,
                });
            }
        }

        CompatibilityVerdict::from_violations(violations)
    }

    /// Compare entries sharing a position
    fn compare(
        index: usize,
        before: &SlotEntry,
        after: &SlotEntry,
        old: &StorageSchema,
        new: &StorageSchema,
    ) -> Option<ViolationKind> {
        // An old entry from elsewhere now occupies this position, so the
        // entry that used to be here was removed or moved.
        if before.name != after.name
            && old
                .position_of(&after.name, &after.type_tag)
                .is_some_and(|from| from != index)
        {
            return Some(Self::missing(index, before, new));
        }

        if before.type_tag != after.type_tag {
            // A different name with a different type usually means the old
            // entry moved; report where it went if it is still there.
            if before.name != after.name {
                if let Some(to) = Self::moved_to(index, before, new) {
                    return Some(ViolationKind::Reordered { to });
                }
            }
            return Some(ViolationKind::TypeChanged {
                from: before.type_tag.clone(),
                to: after.type_tag.clone(),
            });
        }

        if before.width != after.width {
            return Some(ViolationKind::WidthChanged {
                from: before.width,
                to: after.width,
            });
        }

        if (before.slot, before.offset) != (after.slot, after.offset) {
            return Some(ViolationKind::Shifted {
                slot: after.slot,
                offset: after.offset,
            });
        }

        if before.name != after.name {
            return Some(match Self::moved_to(index, before, new) {
                Some(to) => ViolationKind::Reordered { to },
                None => ViolationKind::Renamed {
                    to: after.name.clone(),
                },
            });
        }

        None
    }

    /// Classify an old entry no longer found at its position
    fn missing(index: usize, before: &SlotEntry, new: &StorageSchema) -> ViolationKind {
        match Self::moved_to(index, before, new) {
            Some(to) => ViolationKind::Reordered { to },
            None => ViolationKind::Removed,
        }
    }

    fn moved_to(index: usize, before: &SlotEntry, new: &StorageSchema) -> Option<usize> {
        new.position_of(&before.name, &before.type_tag)
            .filter(|to| *to != index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uprox_artifact::{LayoutAnalyzer, LayoutBuilder, TypeTag};

    fn schema(vars: &[(&str, &str)]) -> StorageSchema {
        let raw = vars
            .iter()
            .fold(LayoutBuilder::new(), |b, (name, ty)| b.var(name, ty))
            .build()
            .unwrap();
        LayoutAnalyzer::new().analyze_raw(&raw).unwrap()
    }

    fn kinds(verdict: &CompatibilityVerdict) -> Vec<(usize, ViolationKind)> {
        verdict
            .violations
            .iter()
            .map(|v| (v.index, v.kind.clone()))
            .collect()
    }

    #[test]
    fn identical_schemas_are_compatible() {
        let s = schema(&[("value", "t_uint256"), ("owner", "t_address")]);
        assert!(CompatibilityChecker::new().check(&s, &s).is_safe());
    }

    #[test]
    fn appending_is_compatible() {
        let old = schema(&[("value", "t_uint256")]);
        let new = schema(&[("value", "t_uint256"), ("owner", "t_address")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);
        assert!(verdict.is_safe());
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn appending_into_a_partially_used_slot_is_compatible() {
        let old = schema(&[("owner", "t_address")]);
        let new = schema(&[("owner", "t_address"), ("paused", "t_bool")]);
        assert!(CompatibilityChecker::new().check(&old, &new).is_safe());
    }

    #[test]
    fn type_change_reports_slot() {
        let old = schema(&[("value", "t_uint256")]);
        let new = schema(&[("value", "t_address")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);

        assert!(!verdict.is_safe());
        assert_eq!(
            kinds(&verdict),
            vec![(
                0,
                ViolationKind::TypeChanged {
                    from: TypeTag::Uint { bits: 256 },
                    to: TypeTag::Address,
                }
            )]
        );
        assert_eq!(verdict.violations[0].slot, 0);
    }

    #[test]
    fn removal_is_reported() {
        let old = schema(&[("value", "t_uint256"), ("owner", "t_address")]);
        let new = schema(&[("value", "t_uint256")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);
        assert_eq!(kinds(&verdict), vec![(1, ViolationKind::Removed)]);
    }

    #[test]
    fn removing_a_middle_entry_is_reported_as_removal() {
        let old = schema(&[("a", "t_uint256"), ("b", "t_uint256"), ("c", "t_uint256")]);
        let new = schema(&[("a", "t_uint256"), ("c", "t_uint256")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);

        assert_eq!(
            kinds(&verdict),
            vec![
                (1, ViolationKind::Removed),
                (2, ViolationKind::Reordered { to: 1 }),
            ]
        );
        assert_eq!(verdict.violations[0].to_string(), "slot 1 (offset 0) `b`: removed");
    }

    #[test]
    fn removing_an_entry_of_another_type_is_still_a_removal() {
        let old = schema(&[("a", "t_uint256"), ("owner", "t_address"), ("c", "t_uint256")]);
        let new = schema(&[("a", "t_uint256"), ("c", "t_uint256")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);
        assert_eq!(verdict.violation_at(1).map(|v| &v.kind), Some(&ViolationKind::Removed));
    }

    #[test]
    fn swap_is_reported_as_reorder() {
        let old = schema(&[("a", "t_uint256"), ("b", "t_address")]);
        let new = schema(&[("b", "t_address"), ("a", "t_uint256")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);
        assert_eq!(
            kinds(&verdict),
            vec![
                (0, ViolationKind::Reordered { to: 1 }),
                (1, ViolationKind::Reordered { to: 0 }),
            ]
        );
    }

    #[test]
    fn rename_is_a_violation() {
        let old = schema(&[("value", "t_uint256")]);
        let new = schema(&[("amount", "t_uint256")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);
        assert_eq!(
            kinds(&verdict),
            vec![(
                0,
                ViolationKind::Renamed {
                    to: "amount".to_string()
                }
            )]
        );
    }

    #[test]
    fn inserting_before_shifts_later_entries() {
        let old = schema(&[("a", "t_uint256"), ("b", "t_uint256")]);
        let new = schema(&[("a", "t_uint256"), ("x", "t_bool"), ("b", "t_uint256")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);

        assert!(!verdict.is_safe());
        assert_eq!(verdict.violations.len(), 1);
        assert_eq!(verdict.violations[0].index, 1);
        assert_eq!(verdict.violations[0].kind, ViolationKind::Reordered { to: 2 });
    }

    #[test]
    fn narrowing_a_packed_entry_shifts_its_neighbour() {
        let old = schema(&[("a", "t_uint128"), ("b", "t_uint64")]);
        let new = schema(&[("a", "t_uint64"), ("b", "t_uint64")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);
        assert_eq!(
            kinds(&verdict),
            vec![
                (
                    0,
                    ViolationKind::TypeChanged {
                        from: TypeTag::Uint { bits: 128 },
                        to: TypeTag::Uint { bits: 64 },
                    }
                ),
                (1, ViolationKind::Shifted { slot: 0, offset: 8 }),
            ]
        );
    }

    #[test]
    fn mapping_value_change_is_type_change() {
        let old = schema(&[("balances", "t_mapping(t_address,t_uint256)")]);
        let new = schema(&[("balances", "t_mapping(t_address,t_uint128)")]);
        let verdict = CompatibilityChecker::new().check(&old, &new);
        assert!(matches!(
            verdict.violations[0].kind,
            ViolationKind::TypeChanged { .. }
        ));
    }

    #[test]
    fn empty_old_schema_accepts_anything() {
        let old = StorageSchema::default();
        let new = schema(&[("value", "t_uint256")]);
        assert!(CompatibilityChecker::new().check(&old, &new).is_safe());
    }
}
