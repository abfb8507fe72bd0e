//! Property-based tests for codec determinism

use creation_kernel::codec::{self, canonical_bytes, state_hash, Json};
use creation_kernel::{Creation, KernelError, ObjectRef, Props, Value};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn no_creations(_: &Creation) -> Result<Json, KernelError> {
    Err(KernelError::Codec("unexpected creation".to_string()))
}

fn no_loader(json: &Json) -> Result<Creation, KernelError> {
    Err(KernelError::Codec(format!("unexpected reference {}", json)))
}

/// Trees of plain objects and arrays over the primitive values.
fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Undefined),
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| Value::Number(n as f64)),
        any::<f64>().prop_map(Value::Number),
        "[a-z$]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6)
                .prop_map(|items| Value::Object(ObjectRef::array(items))),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                .prop_map(|props: BTreeMap<String, Value>| Value::Object(ObjectRef::plain(props))),
        ]
    })
}

/// Encoding the same graph twice yields identical bytes and hash
#[test]
fn test_encode_determinism_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&value_strategy(), |value| {
            let first = codec::encode(&value, &no_creations).unwrap();
            let second = codec::encode(&value, &no_creations).unwrap();
            assert_eq!(canonical_bytes(&first).unwrap(), canonical_bytes(&second).unwrap());
            assert_eq!(state_hash(&first).unwrap(), state_hash(&second).unwrap());

            // A deep copy is a different graph with the same encoding.
            let copy = codec::clone_value(&value);
            let copied = codec::encode(&copy, &no_creations).unwrap();
            assert_eq!(first, copied);

            Ok(())
        })
        .unwrap();
}

/// Decoding an encoded tree and encoding it again is a fixed point
#[test]
fn test_canonical_form_is_stable_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&value_strategy(), |value| {
            let encoded = codec::encode(&value, &no_creations).unwrap();
            let decoded = codec::decode(&encoded, &no_loader).unwrap();
            let again = codec::encode(&decoded, &no_creations).unwrap();
            assert_eq!(state_hash(&encoded).unwrap(), state_hash(&again).unwrap());

            Ok(())
        })
        .unwrap();
}

/// Every f64, including the special values, survives the codec bit for bit
#[test]
fn test_number_encoding_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<f64>(), |n| {
            let encoded = codec::encode(&Value::Number(n), &no_creations).unwrap();
            let decoded = codec::decode(&encoded, &no_loader).unwrap();
            let back = decoded.as_number().unwrap();
            if n.is_nan() {
                assert!(back.is_nan());
            } else {
                assert_eq!(back.to_bits(), n.to_bits());
            }
            if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0 && !(n == 0.0 && n.is_sign_negative()) {
                assert!(encoded.is_i64());
            }

            Ok(())
        })
        .unwrap();
}

/// Key order of the source object never changes the hash
#[test]
fn test_state_hash_ignores_insertion_order_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &prop::collection::vec(("[a-z]{1,6}", any::<i64>()), 0..12),
            |entries| {
                let mut forward = serde_json::Map::new();
                for (k, v) in entries.iter() {
                    forward.insert(k.clone(), Json::from(*v));
                }
                let mut backward = serde_json::Map::new();
                for (k, _) in entries.iter().rev() {
                    backward.insert(k.clone(), forward[k].clone());
                }
                assert_eq!(
                    state_hash(&Json::Object(forward)).unwrap(),
                    state_hash(&Json::Object(backward)).unwrap()
                );

                Ok(())
            },
        )
        .unwrap();
}

/// A container reachable twice is written once and shared again after decoding
#[test]
fn test_shared_containers_stay_shared_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(any::<i32>(), 0..8), |items| {
            let shared = Value::Object(ObjectRef::array(
                items.iter().map(|n| Value::Number(*n as f64)).collect(),
            ));
            let mut props = Props::new();
            props.insert("a".to_string(), shared.clone());
            props.insert("b".to_string(), shared);
            let root = Value::Object(ObjectRef::plain(props));

            let encoded = codec::encode(&root, &no_creations).unwrap();
            let decoded = codec::decode(&encoded, &no_loader).unwrap();
            let object = decoded.as_object().unwrap();
            let a = object.get("a").unwrap();
            let b = object.get("b").unwrap();
            assert!(a.as_object().unwrap().ptr_eq(b.as_object().unwrap()));

            Ok(())
        })
        .unwrap();
}
