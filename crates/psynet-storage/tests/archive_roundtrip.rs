//! Property tests for the NPAR archive format

use proptest::prelude::*;
use psynet_storage::{ArrayArchive, ArrayData};

fn arb_array() -> impl Strategy<Value = ArrayData> {
    prop_oneof![
        prop::collection::vec(any::<i8>(), 0..64).prop_map(ArrayData::I8),
        prop::collection::vec(any::<i16>(), 0..64).prop_map(ArrayData::I16),
        prop::collection::vec(any::<i32>(), 0..64).prop_map(ArrayData::I32),
        prop::collection::vec(any::<i32>(), 0..64)
            .prop_map(|v| ArrayData::F32(v.into_iter().map(|x| x as f32).collect())),
    ]
}

proptest! {
    #[test]
    fn roundtrip_preserves_entries(
        entries in prop::collection::btree_map("[a-z_]{1,24}", arb_array(), 0..12)
    ) {
        let mut archive = ArrayArchive::new();
        for (name, data) in &entries {
            archive.insert(name.clone(), data.clone());
        }

        let loaded = ArrayArchive::from_bytes(&archive.to_bytes()).unwrap();
        prop_assert_eq!(archive, loaded);
    }

    #[test]
    fn header_flip_is_detected(flip in 4usize..12) {
        let mut archive = ArrayArchive::new();
        archive.insert_f32("a", vec![1.0, 2.0, 3.0]);
        let mut bytes = archive.to_bytes();
        bytes[flip] ^= 0x55;
        // Any header corruption must surface as an error, never as silent data
        prop_assert!(ArrayArchive::from_bytes(&bytes).is_err());
    }
}
