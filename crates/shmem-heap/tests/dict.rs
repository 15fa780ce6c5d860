//! Map scenarios: the block-by-block layout of a small dict, overwrite
//! semantics, deletion, and red-black structure under churn.

use std::collections::BTreeMap;

use anyhow::Result;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use shmem_heap::{ErrorKind, Key, Value};

mod common;

use common::{check, heap};

fn map(entries: Vec<(Key, Value)>) -> Value {
    Value::Map(entries.into_iter().collect())
}

#[test]
fn single_entry_layout_block_by_block() -> Result<()> {
    let heap = heap("layout1");
    let hcap = heap.heap_capacity()?;

    heap.access()
        .set(map(vec![("9".into(), Value::I32(2))]))?;
    check(&heap);

    // Dict header, sentinel node, sentinel key, value, node, key "9", rest.
    assert_eq!(
        heap.layout()?,
        vec![
            (24, true),
            (56, true),
            (24, true),
            (24, true),
            (56, true),
            (24, true),
            (hcap - 264, false),
        ]
    );
    assert_eq!(heap.access().index("9").get()?, Value::I32(2));
    Ok(())
}

#[test]
fn long_keys_take_bigger_blocks() -> Result<()> {
    let heap = heap("longkey");
    let hcap = heap.heap_capacity()?;
    let key: String = "A".repeat(100);

    heap.access()
        .set(map(vec![(key.clone().into(), Value::I32(2))]))?;
    check(&heap);

    // The 100-char key plus terminator pads to a 112-byte payload.
    assert_eq!(
        heap.layout()?,
        vec![
            (24, true),
            (56, true),
            (24, true),
            (24, true),
            (56, true),
            (112, true),
            (hcap - 352, false),
        ]
    );
    assert_eq!(heap.access().index(key.as_str()).get()?, Value::I32(2));
    Ok(())
}

#[test]
fn inserting_and_overwriting_entries() -> Result<()> {
    let heap = heap("overwrite");
    let hcap = heap.heap_capacity()?;

    heap.access()
        .set(map(vec![("9".into(), Value::I32(2))]))?;
    heap.access().index("new").set(5i32)?;
    check(&heap);
    assert_eq!(
        heap.layout()?,
        vec![
            (24, true),
            (56, true),
            (24, true),
            (24, true),
            (56, true),
            (24, true),
            (24, true),
            (56, true),
            (24, true),
            (hcap - 392, false),
        ]
    );

    // Overwriting allocates the new value first, then frees the old one,
    // leaving a hole where 5 lived.
    heap.access()
        .index("new")
        .set(vec![1i32, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16])?;
    check(&heap);
    assert_eq!(
        heap.layout()?,
        vec![
            (24, true),
            (56, true),
            (24, true),
            (24, true),
            (56, true),
            (24, true),
            (24, false),
            (56, true),
            (24, true),
            (72, true),
            (hcap - 472, false),
        ]
    );
    assert_eq!(
        heap.access().index("new").get()?,
        Value::I32Vec(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16])
    );
    assert_eq!(heap.access().index("9").get()?, Value::I32(2));
    assert_eq!(heap.access().len()?, 2);
    Ok(())
}

#[test]
fn deleting_returns_the_map_to_empty() -> Result<()> {
    let heap = heap("delete");

    heap.access()
        .set(map(vec![("9".into(), Value::I32(2))]))?;
    heap.access().index("new").set(5i32)?;
    assert_eq!(heap.access().len()?, 2);

    // Integer 9 is a different key from string "9".
    let err = heap.access().del(9).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::KeyNotFound { .. }));

    heap.access().del("9")?;
    check(&heap);
    assert_eq!(heap.access().len()?, 1);

    heap.access().del("new")?;
    check(&heap);
    assert_eq!(heap.access().len()?, 0);
    assert_eq!(heap.access().get()?, Value::Map(BTreeMap::new()));

    let err = heap.access().del("9").unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::KeyNotFound { .. }));
    Ok(())
}

#[test]
fn mixed_key_types_round_trip() -> Result<()> {
    let heap = heap("mixed");
    let expected: BTreeMap<Key, Value> = [
        (Key::Int(1), Value::I32(11)),
        (Key::Int(2), Value::F64(2.5)),
        (Key::Str("name".to_owned()), Value::Str("alpha".to_owned())),
        (Key::Str("seq".to_owned()), Value::I64Vec(vec![1, 2, 3])),
    ]
    .into_iter()
    .collect();

    heap.access().set(Value::Map(expected.clone()))?;
    check(&heap);
    assert_eq!(heap.access().get()?, Value::Map(expected));
    assert!(heap.access().contains_key(1)?);
    assert!(heap.access().contains_key("name")?);
    assert!(!heap.access().contains_key("absent")?);
    Ok(())
}

#[test]
fn nested_maps_resolve_and_tear_down() -> Result<()> {
    let heap = heap("nested");
    let hcap = heap.heap_capacity()?;

    heap.access().set(map(vec![(
        "outer".into(),
        map(vec![("inner".into(), Value::I32(7))]),
    )]))?;
    check(&heap);
    assert_eq!(
        heap.access().index("outer").index("inner").get()?,
        Value::I32(7)
    );

    // Replacing the root tears the whole graph down.
    heap.access().set(Value::I32(0))?;
    check(&heap);
    assert_eq!(heap.layout_string()?, format!("24A, {}E", hcap - 40));
    Ok(())
}

#[test]
fn many_int_keys_stay_balanced_and_ordered() -> Result<()> {
    let heap = common::heap_with("balance", 32, 65536);
    heap.access().set(Value::Map(BTreeMap::new()))?;

    let mut rng = SmallRng::seed_from_u64(42);
    let mut keys: Vec<i32> = (0..128).collect();
    // Insert in a shuffled order so the fix-up actually rotates.
    for index in (1..keys.len()).rev() {
        let other = rng.random_range(0..=index);
        keys.swap(index, other);
    }
    for key in &keys {
        heap.access().index(*key).set(*key * 10)?;
        check(&heap);
    }
    assert_eq!(heap.access().len()?, 128);

    // Integer keys hash to themselves, so iteration order is numeric order.
    let listed = heap.access().keys()?;
    let expected: Vec<Key> = (0..128).map(Key::Int).collect();
    assert_eq!(listed, expected);

    // Delete every third key; the tree must stay a red-black tree.
    for key in (0..128).step_by(3) {
        heap.access().del(key)?;
        check(&heap);
    }
    assert_eq!(heap.access().len()?, 128 - 43);
    for key in 0..128 {
        assert_eq!(heap.access().contains_key(key)?, key % 3 != 0);
    }
    Ok(())
}

#[test]
fn iteration_walks_keys_in_order() -> Result<()> {
    let heap = heap("iter");
    heap.access().set(map(vec![
        (Key::Int(3), Value::I32(30)),
        (Key::Int(1), Value::I32(10)),
        (Key::Int(2), Value::I32(20)),
    ]))?;

    let mut seen = Vec::new();
    let mut cursor = heap.access().begin_idx()?;
    while let Some(key) = cursor {
        seen.push(key.clone());
        cursor = heap.access().next_idx(&key)?;
    }
    assert_eq!(seen, vec![Key::Int(1), Key::Int(2), Key::Int(3)]);
    Ok(())
}

#[test]
fn render_switches_between_compact_and_indented() -> Result<()> {
    let heap = heap("render");
    heap.access().set(Value::Map(BTreeMap::new()))?;
    assert_eq!(heap.access().render(4)?, "{}");

    heap.access().index("k").set(1i32)?;
    let compact = heap.access().render(4)?;
    assert!(compact.starts_with('{') && compact.ends_with('}'));
    assert!(compact.contains("\"k\": (P:int:1)[1]"));

    for key in ["alpha", "beta", "gamma", "delta"] {
        heap.access().index(key).set(Value::I32Vec(vec![1, 2, 3]))?;
    }
    let indented = heap.access().render(2)?;
    assert!(indented.contains('\n'));
    Ok(())
}
