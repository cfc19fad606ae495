//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::{json, Value};

use covalue::core::{AgentSecret, MapOp};

/// Generate a random agent secret.
pub fn agent_secret() -> impl Strategy<Value = AgentSecret> {
    any::<[u8; 32]>().prop_map(|seed| AgentSecret::from_seed(&seed))
}

/// Generate a CoMap key from a small alphabet, so writes collide.
pub fn map_key() -> impl Strategy<Value = String> {
    "[a-d]{1,2}".prop_map(String::from)
}

/// Generate a JSON value, nested at most two levels.
pub fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
    ];
    leaf.prop_recursive(2, 8, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Generate a CoMap operation.
pub fn map_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        3 => (map_key(), json_value()).prop_map(|(key, value)| MapOp::Set { key, value }),
        1 => map_key().prop_map(|key| MapOp::Del { key }),
    ]
}

/// Generate a script of CoMap operations.
pub fn map_ops(max_len: usize) -> impl Strategy<Value = Vec<MapOp>> {
    prop::collection::vec(map_op(), 0..=max_len)
}

/// The map a single writer ends up with after `ops`, in order.
pub fn fold_map_ops(ops: &[MapOp]) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    for op in ops {
        match op {
            MapOp::Set { key, value } => {
                map.insert(key.clone(), value.clone());
            }
            MapOp::Del { key } => {
                map.remove(key);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestFixture;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_single_writer_map_matches_model(ops in map_ops(12), seed in any::<[u8; 32]>()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let view = rt.block_on(async {
                let fixture = TestFixture::with_seed(seed);
                let group = fixture.node.create_group().unwrap();
                let map = fixture.node.create_map(&group, None).unwrap();
                for op in &ops {
                    match op {
                        MapOp::Set { key, value } => fixture.node.set(&map, key, value.clone()).unwrap(),
                        MapOp::Del { key } => fixture.node.remove_key(&map, key).unwrap(),
                    }
                }
                let view = fixture.node.read_map(&map).unwrap();
                fixture.node.shutdown().await.unwrap();
                view
            });

            let expected = fold_map_ops(&ops);
            prop_assert_eq!(view.len(), expected.len());
            for (key, value) in &expected {
                prop_assert_eq!(view.get(key), Some(value));
            }
            prop_assert_eq!(view.skipped(), 0);
        }
    }
}
