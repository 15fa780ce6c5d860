//! Ordered lists of child objects.
//!
//! A list is two blocks: a small header object `{type_id, length,
//! space_off}` and a separately allocated slot block holding one signed
//! offset per child, each relative to the header object. The slot block's
//! payload size determines the capacity, so a grown slot block can hold more
//! children than were asked for. Keeping the slots out-of-line means growth
//! moves only the slot block; the offsets inside it stay valid because they
//! are anchored to the header.

use crate::error::{Error, ErrorKind};
use crate::heap::Heap;
use crate::obj::{self, OBJ_HEADER};
use crate::tag::TypeTag;
use crate::value::Value;

const SPACE_OFF_FIELD: usize = 8;
const NO_SPACE: i64 = 1;
const SLOT: usize = 8;

/// Create an empty list with room for `capacity` children.
pub(crate) fn construct_empty(heap: &Heap, capacity: usize) -> Result<usize, Error> {
    let offset = heap.alloc_raw(OBJ_HEADER + 8);
    if offset == 0 {
        return Err(Error::new(ErrorKind::OutOfMemory {
            requested: OBJ_HEADER + 8,
        }));
    }
    // SAFETY: a fresh header block.
    unsafe {
        obj::write::<i32>(heap.obj_ptr(offset), TypeTag::List as i32);
        obj::write::<i32>(heap.obj_ptr(offset).add(4), 0);
        obj::write::<i64>(heap.obj_ptr(offset).add(SPACE_OFF_FIELD), NO_SPACE);
    }
    if capacity > 0 {
        grow_space(heap, offset, capacity)?;
    }
    Ok(offset)
}

/// Build a list holding `values`, children constructed in order.
pub(crate) fn construct_from(heap: &Heap, values: &[Value]) -> Result<usize, Error> {
    let offset = construct_empty(heap, values.len())?;
    for value in values {
        let child = obj::construct(heap, value)?;
        append(heap, offset, child)?;
    }
    Ok(offset)
}

fn space_rel(heap: &Heap, offset: usize) -> i64 {
    // SAFETY: the header object holds the space offset at a fixed field.
    unsafe { obj::read::<i64>(heap.obj_ptr(offset).add(SPACE_OFF_FIELD)) }
}

fn space_offset(heap: &Heap, offset: usize) -> Option<usize> {
    let rel = space_rel(heap, offset);
    if rel == NO_SPACE {
        None
    } else {
        Some((offset as i64 + rel) as usize)
    }
}

fn set_space_offset(heap: &Heap, offset: usize, space: usize) {
    // SAFETY: as for space_rel.
    unsafe {
        obj::write::<i64>(
            heap.obj_ptr(offset).add(SPACE_OFF_FIELD),
            space as i64 - offset as i64,
        )
    }
}

pub(crate) fn len(heap: &Heap, offset: usize) -> usize {
    obj::len_at(heap, offset) as usize
}

/// How many children fit without growing: the slot block's payload size in
/// slot words.
pub(crate) fn capacity(heap: &Heap, offset: usize) -> usize {
    match space_offset(heap, offset) {
        None => 0,
        Some(space) => heap.payload_size(space) / SLOT,
    }
}

fn slot_ptr(heap: &Heap, offset: usize, index: usize) -> *mut i64 {
    let space = space_offset(heap, offset).unwrap_or(offset);
    // SAFETY: index stays below the derived capacity.
    unsafe { heap.obj_ptr(space).add(index * SLOT).cast() }
}

fn read_slot(heap: &Heap, offset: usize, index: usize) -> usize {
    // SAFETY: slot holds an offset relative to the header object.
    let rel = unsafe { *slot_ptr(heap, offset, index) };
    (offset as i64 + rel) as usize
}

fn write_slot(heap: &Heap, offset: usize, index: usize, child: usize) {
    // SAFETY: as for read_slot.
    unsafe { *slot_ptr(heap, offset, index) = child as i64 - offset as i64 }
}

/// Child offset at `index` without bounds adjustment; used by graph checks.
pub(crate) fn child_offset(heap: &Heap, offset: usize, index: usize) -> Result<usize, Error> {
    if index >= len(heap, offset) {
        return Err(Error::new(ErrorKind::IndexOutOfBounds {
            index: index as i64,
            len: len(heap, offset),
        }));
    }
    Ok(read_slot(heap, offset, index))
}

/// Child offset at `index`; negative indices count from the end.
pub(crate) fn get(heap: &Heap, offset: usize, index: i64) -> Result<usize, Error> {
    let index = obj::resolve_index(index, len(heap, offset))?;
    Ok(read_slot(heap, offset, index))
}

/// Replace the child at `index`, freeing the one it displaces.
pub(crate) fn set(heap: &Heap, offset: usize, index: i64, child: usize) -> Result<(), Error> {
    let index = obj::resolve_index(index, len(heap, offset))?;
    let old = read_slot(heap, offset, index);
    obj::deconstruct(heap, old)?;
    write_slot(heap, offset, index, child);
    Ok(())
}

fn grow_space(heap: &Heap, offset: usize, capacity: usize) -> Result<(), Error> {
    let old_capacity = self::capacity(heap, offset);
    let old_space = space_offset(heap, offset).unwrap_or(0);
    let new_space = heap.realloc_raw(old_space, capacity * SLOT);
    if new_space == 0 {
        return Err(Error::new(ErrorKind::OutOfMemory {
            requested: capacity * SLOT,
        }));
    }
    set_space_offset(heap, offset, new_space);
    // The realloc copied the live slots; the tail of the (possibly larger)
    // derived capacity starts out as garbage.
    let derived = heap.payload_size(new_space) / SLOT;
    for index in old_capacity..derived {
        // SAFETY: index < derived capacity of the fresh slot block.
        unsafe { *heap.obj_ptr(new_space).add(index * SLOT).cast::<i64>() = 0 }
    }
    Ok(())
}

/// Append a child, doubling the slot block when full.
pub(crate) fn append(heap: &Heap, offset: usize, child: usize) -> Result<(), Error> {
    let length = len(heap, offset);
    let cap = capacity(heap, offset);
    if length == cap {
        grow_space(heap, offset, std::cmp::max(4, 2 * cap))?;
    }
    write_slot(heap, offset, length, child);
    obj::set_len_at(heap, offset, (length + 1) as i32);
    Ok(())
}

/// Insert a child at `index`, shifting the tail right.
pub(crate) fn insert(heap: &Heap, offset: usize, index: i64, child: usize) -> Result<(), Error> {
    let length = len(heap, offset);
    let index = if index == length as i64 {
        length
    } else {
        obj::resolve_index(index, length + 1)?
    };
    let cap = capacity(heap, offset);
    if length == cap {
        grow_space(heap, offset, std::cmp::max(4, 2 * cap))?;
    }
    let mut cursor = length;
    while cursor > index {
        let moved = read_slot(heap, offset, cursor - 1);
        write_slot(heap, offset, cursor, moved);
        cursor -= 1;
    }
    write_slot(heap, offset, index, child);
    obj::set_len_at(heap, offset, (length + 1) as i32);
    Ok(())
}

/// Remove the child at `index`, freeing it and shifting the tail left.
pub(crate) fn remove(heap: &Heap, offset: usize, index: i64) -> Result<(), Error> {
    let length = len(heap, offset);
    let index = obj::resolve_index(index, length)?;
    let child = read_slot(heap, offset, index);
    obj::deconstruct(heap, child)?;
    for cursor in index..length - 1 {
        let moved = read_slot(heap, offset, cursor + 1);
        write_slot(heap, offset, cursor, moved);
    }
    obj::set_len_at(heap, offset, (length - 1) as i32);
    Ok(())
}

/// Read the child at `index` out as a value, then remove it.
pub(crate) fn pop(heap: &Heap, offset: usize, index: i64) -> Result<Value, Error> {
    let resolved = obj::resolve_index(index, len(heap, offset))?;
    let child = read_slot(heap, offset, resolved);
    let value = obj::read_value(heap, child)?;
    remove(heap, offset, resolved as i64)?;
    Ok(value)
}

/// Free every child and reset the length to zero.
pub(crate) fn clear(heap: &Heap, offset: usize) -> Result<(), Error> {
    for index in 0..len(heap, offset) {
        let child = read_slot(heap, offset, index);
        obj::deconstruct(heap, child)?;
    }
    obj::set_len_at(heap, offset, 0);
    Ok(())
}

/// Append each of `values` in order.
pub(crate) fn extend(heap: &Heap, offset: usize, values: &[Value]) -> Result<(), Error> {
    for value in values {
        let child = obj::construct(heap, value)?;
        append(heap, offset, child)?;
    }
    Ok(())
}

pub(crate) fn read_value(heap: &Heap, offset: usize) -> Result<Value, Error> {
    let mut out = Vec::with_capacity(len(heap, offset));
    for index in 0..len(heap, offset) {
        out.push(obj::read_value(heap, read_slot(heap, offset, index))?);
    }
    Ok(Value::List(out))
}

/// Free the children, the slot block and the header.
pub(crate) fn deconstruct(heap: &Heap, offset: usize) -> Result<(), Error> {
    for index in 0..len(heap, offset) {
        let child = read_slot(heap, offset, index);
        obj::deconstruct(heap, child)?;
    }
    if let Some(space) = space_offset(heap, offset) {
        heap.free_raw(space);
    }
    heap.free_raw(offset);
    Ok(())
}

pub(crate) fn render(
    heap: &Heap,
    offset: usize,
    indent: usize,
    max_elements: usize,
) -> Result<String, Error> {
    let pad = " ".repeat(indent);
    let mut out = String::from("[\n");
    for index in 0..len(heap, offset) {
        let child = read_slot(heap, offset, index);
        out.push_str(&pad);
        out.push(' ');
        out.push_str(&obj::render(heap, child, indent + 1, max_elements)?);
        out.push('\n');
    }
    out.push_str(&pad);
    out.push(']');
    Ok(out)
}
