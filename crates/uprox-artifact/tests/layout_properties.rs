//! Property tests for storage layout placement

use proptest::prelude::*;
use uprox_artifact::{LayoutAnalyzer, LayoutBuilder, StorageSchema, SLOT_BYTES};

const TYPES: [&str; 7] = [
    "t_bool",
    "t_uint8",
    "t_uint64",
    "t_address",
    "t_uint256",
    "t_bytes32",
    "t_string_storage",
];

fn schema_of(types: &[usize]) -> StorageSchema {
    let builder = types
        .iter()
        .enumerate()
        .fold(LayoutBuilder::new(), |b, (i, t)| b.var(&format!("v{i}"), TYPES[*t]));
    let raw = builder.build().unwrap();
    LayoutAnalyzer::new().analyze_raw(&raw).unwrap()
}

proptest! {
    #[test]
    fn placed_variables_never_overlap(
        types in proptest::collection::vec(0..TYPES.len(), 0..40)
    ) {
        let schema = schema_of(&types);
        prop_assert_eq!(schema.len(), types.len());

        let mut end = 0u64;
        for entry in schema.entries() {
            prop_assert!(entry.offset + entry.width <= SLOT_BYTES);
            let start = entry.slot * u64::from(SLOT_BYTES) + u64::from(entry.offset);
            prop_assert!(start >= end, "{} overlaps its predecessor", entry.name);
            end = start + u64::from(entry.width);
        }
    }

    #[test]
    fn appending_keeps_existing_positions(
        base in proptest::collection::vec(0..TYPES.len(), 1..20),
        extra in proptest::collection::vec(0..TYPES.len(), 1..10)
    ) {
        let before = schema_of(&base);
        let mut extended = base.clone();
        extended.extend(extra);
        let after = schema_of(&extended);

        prop_assert_eq!(&after.entries()[..before.len()], before.entries());
        prop_assert!(after.slots_used() >= before.slots_used());
    }
}
