//! The self-describing object layer.
//!
//! Every object's payload begins with a `type_id` word, and all per-kind
//! behavior is dispatched on that tag by free functions; there are no
//! vtables in shared memory. The functions here assume the caller already
//! holds the region write lock for anything that mutates.

use crate::error::{Error, ErrorKind};
use crate::heap::Heap;
use crate::tag::TypeTag;
use crate::value::Value;

pub(crate) mod dict;
pub(crate) mod list;
pub(crate) mod primitive;

/// Object header: `type_id: i32` then `length: i32`.
pub(crate) const OBJ_HEADER: usize = 8;

// Raw field access. Payload offsets are word-aligned, so any field of width
// up to a word placed at a multiple of its size is aligned.

pub(crate) unsafe fn read<T: Copy>(ptr: *const u8) -> T {
    // SAFETY: the caller points at a live, aligned field.
    unsafe { ptr.cast::<T>().read() }
}

pub(crate) unsafe fn write<T>(ptr: *mut u8, value: T) {
    // SAFETY: the caller points at a live, aligned field.
    unsafe { ptr.cast::<T>().write(value) }
}

/// Read the tag of the object at `offset`.
pub(crate) fn tag_at(heap: &Heap, offset: usize) -> Result<TypeTag, Error> {
    // SAFETY: offset addresses a live object payload.
    let raw = unsafe { read::<i32>(heap.obj_ptr(offset)) };
    TypeTag::from_raw(raw).ok_or_else(|| {
        Error::new(ErrorKind::Corrupt {
            detail: format!("object at {offset} has unknown type tag {raw}"),
        })
    })
}

/// Read the length word of the object at `offset`.
pub(crate) fn len_at(heap: &Heap, offset: usize) -> i32 {
    // SAFETY: offset addresses a live object payload.
    unsafe { read::<i32>(heap.obj_ptr(offset).add(4)) }
}

pub(crate) fn set_len_at(heap: &Heap, offset: usize, len: i32) {
    // SAFETY: offset addresses a live object payload.
    unsafe { write::<i32>(heap.obj_ptr(offset).add(4), len) }
}

/// Resolve a possibly-negative index against `len`.
pub(crate) fn resolve_index(index: i64, len: usize) -> Result<usize, Error> {
    let adjusted = if index < 0 { index + len as i64 } else { index };
    if adjusted < 0 || adjusted >= len as i64 {
        return Err(Error::new(ErrorKind::IndexOutOfBounds { index, len }));
    }
    Ok(adjusted as usize)
}

/// Build the object graph for `value` and return its offset.
pub(crate) fn construct(heap: &Heap, value: &Value) -> Result<usize, Error> {
    macro_rules! numeric {
        ($scalar:ident, $vec:ident, $ty:ty, $tag:ident) => {
            if let Value::$scalar(v) = value {
                return primitive::construct_slice::<$ty>(heap, TypeTag::$tag, &[*v]);
            }
            if let Value::$vec(v) = value {
                return primitive::construct_slice::<$ty>(heap, TypeTag::$tag, v);
            }
        };
    }
    crate::value::for_each_numeric!(numeric);

    match value {
        Value::Bool(v) => primitive::construct_bools(heap, &[*v]),
        Value::BoolVec(v) => primitive::construct_bools(heap, v),
        Value::Str(s) => primitive::construct_str(heap, s),
        Value::List(items) => list::construct_from(heap, items),
        Value::Map(map) => dict::construct_from(heap, map),
        _ => unreachable!("numeric shapes handled above"),
    }
}

/// Recursively free the object at `offset`.
pub(crate) fn deconstruct(heap: &Heap, offset: usize) -> Result<(), Error> {
    let tag = tag_at(heap, offset)?;
    if tag.is_primitive() {
        primitive::deconstruct(heap, offset);
        Ok(())
    } else {
        match tag {
            TypeTag::List => list::deconstruct(heap, offset),
            TypeTag::Dict => dict::deconstruct(heap, offset),
            _ => Err(Error::new(ErrorKind::Corrupt {
                detail: format!("cannot deconstruct a bare {} at {offset}", tag.name()),
            })),
        }
    }
}

/// Lift the object at `offset` into an owned [`Value`].
pub(crate) fn read_value(heap: &Heap, offset: usize) -> Result<Value, Error> {
    let tag = tag_at(heap, offset)?;
    if tag.is_primitive() {
        primitive::read_value(heap, offset)
    } else {
        match tag {
            TypeTag::List => list::read_value(heap, offset),
            TypeTag::Dict => dict::read_value(heap, offset),
            _ => Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a value object",
                found: tag.name(),
            })),
        }
    }
}

/// Length of the object at `offset`: element count, list length or map size.
pub(crate) fn length(heap: &Heap, offset: usize) -> Result<usize, Error> {
    let tag = tag_at(heap, offset)?;
    if tag.is_primitive() {
        Ok(len_at(heap, offset) as usize)
    } else {
        match tag {
            TypeTag::List => Ok(list::len(heap, offset)),
            TypeTag::Dict => Ok(dict::len(heap, offset)),
            _ => Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a sized object",
                found: tag.name(),
            })),
        }
    }
}

/// Render the object at `offset`, truncating primitive arrays past
/// `max_elements`.
pub(crate) fn render(
    heap: &Heap,
    offset: usize,
    indent: usize,
    max_elements: usize,
) -> Result<String, Error> {
    let tag = tag_at(heap, offset)?;
    if tag.is_primitive() {
        return Ok(primitive::render(heap, offset, max_elements));
    }
    match tag {
        TypeTag::List => list::render(heap, offset, indent, max_elements),
        TypeTag::Dict => dict::render(heap, offset, indent, max_elements),
        _ => Err(Error::new(ErrorKind::TypeMismatch {
            expected: "a value object",
            found: tag.name(),
        })),
    }
}

/// Walk the graph reachable from `offset` and verify that every stored
/// offset lands on an allocated block with a valid tag, and that every map
/// satisfies the red-black invariants.
pub(crate) fn verify_graph(heap: &Heap, offset: usize) -> Result<(), Error> {
    if !heap.offset_is_allocated(offset) {
        return Err(Error::new(ErrorKind::Corrupt {
            detail: format!("object offset {offset} is not an allocated block"),
        }));
    }
    let tag = tag_at(heap, offset)?;
    if tag.is_primitive() {
        return Ok(());
    }
    match tag {
        TypeTag::List => {
            for index in 0..list::len(heap, offset) {
                let child = list::child_offset(heap, offset, index)?;
                verify_graph(heap, child)?;
            }
            Ok(())
        }
        TypeTag::Dict => {
            dict::verify(heap, offset)?;
            for (_, child) in dict::entries(heap, offset)? {
                verify_graph(heap, child)?;
            }
            Ok(())
        }
        _ => Err(Error::new(ErrorKind::Corrupt {
            detail: format!("object at {offset} has container-internal tag {}", tag.name()),
        })),
    }
}
