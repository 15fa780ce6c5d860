//! Accessor scenarios: path resolution, element writes, error surfaces,
//! nested lists, strings and iteration.

use std::collections::BTreeMap;

use anyhow::Result;
use shmem_heap::{ErrorKind, Key, TypeTag, Value};

mod common;

use common::{check, heap};

fn root_map(heap: &shmem_heap::Heap) -> Result<()> {
    heap.access().set(Value::Map(BTreeMap::from([(
        "a".into(),
        Value::I32Vec(vec![10, 20, 30]),
    )])))?;
    Ok(())
}

#[test]
fn element_writes_update_in_place() -> Result<()> {
    let heap = heap("elem");
    root_map(&heap)?;

    heap.access().index("a").index(1).set(99i32)?;
    check(&heap);
    assert_eq!(
        heap.access().index("a").get()?,
        Value::I32Vec(vec![10, 99, 30])
    );
    assert_eq!(heap.access().index("a").index(1).get()?, Value::I32(99));

    // Negative indices count from the end.
    assert_eq!(heap.access().index("a").index(-1).get()?, Value::I32(30));
    heap.access().index("a").index(-3).set(1i32)?;
    assert_eq!(heap.access().index("a").index(0).get()?, Value::I32(1));
    Ok(())
}

#[test]
fn path_errors_match_the_shape_of_the_miss() -> Result<()> {
    let heap = heap("errors");
    root_map(&heap)?;

    let err = heap.access().index("a").index(5).get().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IndexOutOfBounds { .. }));
    let err = heap.access().index("a").index(5).set(1i32).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IndexOutOfBounds { .. }));

    let err = heap.access().index("b").get().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::KeyNotFound { .. }));

    let err = heap.access().index("a").index("x").get().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TypeMismatch { .. }));

    // A wrong-width write to an int array is refused.
    let err = heap.access().index("a").index(0).set(1i64).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TypeMismatch { .. }));

    // Extra path below a primitive cannot resolve.
    let err = heap.access().index("a").index(0).index(0).get().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IndexOutOfBounds { .. }));
    Ok(())
}

#[test]
fn missing_dict_keys_are_created_on_write() -> Result<()> {
    let heap = heap("insert");
    root_map(&heap)?;

    heap.access().index("b").set("fresh")?;
    check(&heap);
    assert_eq!(heap.access().index("b").get()?, Value::Str("fresh".to_owned()));
    assert_eq!(heap.access().len()?, 2);
    Ok(())
}

#[test]
fn nested_lists_lay_out_header_slots_children() -> Result<()> {
    let heap = heap("nestedlist");
    let hcap = heap.heap_capacity()?;

    let inner: Vec<Value> = (0..10).map(|_| Value::I32Vec(vec![1; 10])).collect();
    heap.access().set(Value::List(inner))?;
    check(&heap);

    // List header, ten-slot space block, ten inner arrays, remainder.
    let mut expected = vec![(24usize, true), (80, true)];
    expected.extend(std::iter::repeat_n((48, true), 10));
    expected.push((hcap - 32 - 88 - 10 * 56 - 8, false));
    assert_eq!(heap.layout()?, expected);

    assert_eq!(
        heap.access().index(3).get()?,
        Value::I32Vec(vec![1; 10])
    );
    assert_eq!(heap.access().type_tag()?, TypeTag::List);
    Ok(())
}

#[test]
fn list_mutation_operations() -> Result<()> {
    let heap = heap("listops");
    heap.access().set(Value::List(vec![
        Value::I32(1),
        Value::I32(2),
        Value::I32(3),
    ]))?;

    heap.access().index(1).set(22i32)?;
    check(&heap);
    assert_eq!(
        heap.access().get()?,
        Value::List(vec![Value::I32(1), Value::I32(22), Value::I32(3)])
    );

    heap.access().append(4i32)?;
    heap.access().insert(0, 0i32)?;
    check(&heap);
    assert_eq!(heap.access().len()?, 5);
    assert_eq!(heap.access().index(0).get()?, Value::I32(0));
    assert_eq!(heap.access().index(4).get()?, Value::I32(4));

    assert_eq!(heap.access().pop(0)?, Value::I32(0));
    heap.access().del(1)?;
    check(&heap);
    assert_eq!(
        heap.access().get()?,
        Value::List(vec![Value::I32(1), Value::I32(3), Value::I32(4)])
    );

    heap.access().extend([Value::I32(7), Value::Str("tail".to_owned())])?;
    assert_eq!(heap.access().len()?, 5);
    assert_eq!(heap.access().index(-1).get()?, Value::Str("tail".to_owned()));

    heap.access().clear()?;
    check(&heap);
    assert_eq!(heap.access().len()?, 0);
    Ok(())
}

#[test]
fn appending_past_capacity_grows_the_slot_block() -> Result<()> {
    let heap = heap("grow");
    heap.access().set(Value::List(Vec::new()))?;
    for value in 0..40 {
        heap.access().append(value)?;
        check(&heap);
    }
    assert_eq!(heap.access().len()?, 40);
    for value in 0..40 {
        assert_eq!(heap.access().index(value).get()?, Value::I32(value));
    }
    Ok(())
}

#[test]
fn strings_round_trip_with_terminator() -> Result<()> {
    let heap = heap("strings");
    heap.access().set("hello, region")?;
    assert_eq!(heap.access().get()?, Value::Str("hello, region".to_owned()));
    // Length counts the NUL terminator, as stored.
    assert_eq!(heap.access().len()?, 14);
    assert_eq!(heap.access().type_tag()?, TypeTag::Char);

    heap.access().set("")?;
    assert_eq!(heap.access().get()?, Value::Str(String::new()));
    assert_eq!(heap.access().len()?, 1);
    Ok(())
}

#[test]
fn scalars_round_trip_at_exact_widths() -> Result<()> {
    let heap = heap("scalars");
    let cases: Vec<(Value, TypeTag)> = vec![
        (Value::Bool(true), TypeTag::Bool),
        (Value::U8(200), TypeTag::UChar),
        (Value::I16(-5), TypeTag::Short),
        (Value::U16(65535), TypeTag::UShort),
        (Value::I32(-100000), TypeTag::Int),
        (Value::U32(4000000000), TypeTag::UInt),
        (Value::I64(-1 << 40), TypeTag::Long),
        (Value::U64(1 << 60), TypeTag::ULong),
        (Value::F32(1.5), TypeTag::Float),
        (Value::F64(-2.25), TypeTag::Double),
    ];
    for (value, tag) in cases {
        heap.access().set(value.clone())?;
        assert_eq!(heap.access().get()?, value);
        assert_eq!(heap.access().type_tag()?, tag);
        check(&heap);
    }
    Ok(())
}

#[test]
fn find_and_contains_on_primitives() -> Result<()> {
    let heap = heap("find");
    heap.access().set(vec![5i32, 7, 9, 7])?;
    assert_eq!(heap.access().find(7i32)?, 1);
    assert_eq!(heap.access().find(8i32)?, -1);
    assert!(heap.access().contains(9i32)?);
    assert!(!heap.access().contains(6i32)?);
    let err = heap.access().find(7i64).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TypeMismatch { .. }));
    Ok(())
}

#[test]
fn primitive_and_list_iteration_indices() -> Result<()> {
    let heap = heap("indices");
    heap.access().set(vec![1i32, 2, 3])?;
    let mut seen = Vec::new();
    let mut cursor = heap.access().begin_idx()?;
    while let Some(key) = cursor {
        seen.push(key.clone());
        cursor = heap.access().next_idx(&key)?;
    }
    assert_eq!(seen, vec![Key::Int(0), Key::Int(1), Key::Int(2)]);

    heap.access().set(Value::List(Vec::new()))?;
    assert_eq!(heap.access().begin_idx()?, None);
    Ok(())
}

#[test]
fn render_dispatches_on_type() -> Result<()> {
    let heap = heap("renderall");
    heap.access().set(vec![10i32, 99, 30])?;
    assert_eq!(heap.access().render(4)?, "(P:int:3)[10, 99, 30]");
    assert_eq!(heap.access().render(2)?, "(P:int:3)[10, 99, ...]");

    heap.access().set("hello")?;
    assert_eq!(heap.access().render(16)?, "(P:char:6)\"hello\"");

    heap.access().set(Value::List(vec![Value::I32(1), Value::Str("x".to_owned())]))?;
    let rendered = heap.access().render(4)?;
    assert!(rendered.starts_with("[\n"));
    assert!(rendered.contains("(P:int:1)[1]"));
    assert!(rendered.contains("(P:char:2)\"x\""));
    assert!(rendered.ends_with(']'));
    Ok(())
}

#[test]
fn empty_region_reads_fail_cleanly() -> Result<()> {
    let heap = heap("empty");
    let err = heap.access().index("a").get().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::KeyNotFound { .. }));
    assert_eq!(heap.entrance_offset()?, None);

    // The root itself can be written on an empty region.
    heap.access().set(1i32)?;
    assert!(heap.entrance_offset()?.is_some());
    assert_eq!(heap.access().get()?, Value::I32(1));
    Ok(())
}
