//! Encode/decode roundtrips over generated values.

use jungledb_codec::{from_canonical_bytes, to_canonical_bytes, Value};
use proptest::prelude::*;

fn value_strategy() -> impl Strategy<Value = Value> {
    let scalar = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[a-z0-9 ]{0,24}".prop_map(Value::Text),
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(Value::Bytes),
    ];
    scalar.prop_recursive(3, 48, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            proptest::collection::vec(("[a-z]{1,8}", inner), 0..6)
                .prop_map(|pairs| Value::map(pairs)),
        ]
    })
}

proptest! {
    #[test]
    fn roundtrip_preserves_value(value in value_strategy()) {
        let bytes = to_canonical_bytes(&value);
        prop_assert_eq!(from_canonical_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn encoding_is_deterministic(value in value_strategy()) {
        prop_assert_eq!(to_canonical_bytes(&value), to_canonical_bytes(&value));
    }

    #[test]
    fn order_is_total_and_antisymmetric(a in value_strategy(), b in value_strategy()) {
        use std::cmp::Ordering;
        match a.cmp(&b) {
            Ordering::Less => prop_assert_eq!(b.cmp(&a), Ordering::Greater),
            Ordering::Greater => prop_assert_eq!(b.cmp(&a), Ordering::Less),
            Ordering::Equal => prop_assert_eq!(&a, &b),
        }
    }
}
