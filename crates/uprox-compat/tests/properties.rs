use proptest::prelude::*;
use uprox_artifact::{LayoutAnalyzer, LayoutBuilder, StorageSchema};
use uprox_compat::{CompatibilityChecker, ViolationKind};

const TYPES: &[&str] = &[
    "t_uint256",
    "t_uint128",
    "t_uint64",
    "t_uint8",
    "t_int32",
    "t_address",
    "t_bool",
    "t_bytes32",
    "t_bytes4",
    "t_string_storage",
    "t_mapping(t_address,t_uint256)",
    "t_array(t_uint256)dyn_storage",
];

fn schema(vars: &[(String, &str)]) -> StorageSchema {
    let raw = vars
        .iter()
        .fold(LayoutBuilder::new(), |b, (name, ty)| b.var(name, ty))
        .build()
        .unwrap();
    LayoutAnalyzer::new().analyze_raw(&raw).unwrap()
}

fn named(prefix: &str, picks: &[usize]) -> Vec<(String, &'static str)> {
    picks
        .iter()
        .enumerate()
        .map(|(i, t)| (format!("{prefix}{i}"), TYPES[*t]))
        .collect()
}

fn picks(max: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..TYPES.len(), 1..max)
}

proptest! {
    #[test]
    fn prop_identity_upgrade_is_safe(types in picks(12)) {
        let s = schema(&named("v", &types));
        prop_assert!(CompatibilityChecker::new().check(&s, &s).is_safe());
    }

    #[test]
    fn prop_appending_is_safe(types in picks(10), extra in picks(5)) {
        let old = named("v", &types);
        let mut new = old.clone();
        new.extend(named("appended", &extra));

        let verdict = CompatibilityChecker::new().check(&schema(&old), &schema(&new));
        prop_assert!(verdict.is_safe(), "violations: {:?}", verdict.violations);
    }

    #[test]
    fn prop_retyping_reports_that_entry(
        types in picks(10),
        at in any::<prop::sample::Index>(),
        shift in 1..TYPES.len(),
    ) {
        let k = at.index(types.len());
        let mut mutated = types.clone();
        mutated[k] = (types[k] + shift) % TYPES.len();

        let old = schema(&named("v", &types));
        let verdict = CompatibilityChecker::new().check(&old, &schema(&named("v", &mutated)));

        prop_assert!(!verdict.is_safe());
        let violation = verdict.violation_at(k);
        prop_assert!(violation.is_some());
        let violation = violation.unwrap();
        let is_type_change = matches!(violation.kind, ViolationKind::TypeChanged { .. });
        prop_assert!(is_type_change);
        prop_assert_eq!(violation.slot, old.entries()[k].slot);
    }

    #[test]
    fn prop_removal_is_unsafe(types in picks(10), at in any::<prop::sample::Index>()) {
        let old = named("v", &types);
        let mut new = old.clone();
        let k = at.index(old.len());
        new.remove(k);

        let verdict = CompatibilityChecker::new().check(&schema(&old), &schema(&new));
        prop_assert!(!verdict.is_safe());
        prop_assert_eq!(verdict.violation_at(k).map(|v| &v.kind), Some(&ViolationKind::Removed));
    }

    #[test]
    fn prop_at_most_one_violation_per_entry(a in picks(10), b in picks(10)) {
        let old = schema(&named("v", &a));
        let verdict = CompatibilityChecker::new().check(&old, &schema(&named("v", &b)));

        prop_assert!(verdict.violations.len() <= old.len());
        prop_assert!(verdict.violations.windows(2).all(|w| w[0].index < w[1].index));
        prop_assert_eq!(verdict.safe, verdict.violations.is_empty());
    }
}

#[test]
fn violations_serialize_for_reports() {
    let old = schema(&named("v", &[0]));
    let new = schema(&named("v", &[5]));
    let verdict = CompatibilityChecker::new().check(&old, &new);

    let json = serde_json::to_value(&verdict).unwrap();
    assert_eq!(json["safe"], false);
    assert_eq!(json["violations"][0]["kind"]["kind"], "type_changed");
    assert_eq!(json["violations"][0]["kind"]["to"]["kind"], "address");
}
