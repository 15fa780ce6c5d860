//! Typed primitive arrays: `{type_id, length, elem[length]}` stored inline.
//!
//! Char arrays double as strings: the payload is NUL-terminated and the
//! length counts the terminator.

use log::warn;

use crate::error::{Error, ErrorKind};
use crate::heap::Heap;
use crate::obj::{self, OBJ_HEADER};
use crate::tag::TypeTag;
use crate::value::Value;

fn alloc_array(heap: &Heap, tag: TypeTag, count: usize) -> Result<usize, Error> {
    let payload = OBJ_HEADER + count * tag.elem_size();
    let offset = heap.alloc_raw(payload);
    if offset == 0 {
        return Err(Error::new(ErrorKind::OutOfMemory { requested: payload }));
    }
    // SAFETY: offset is a fresh allocation of at least `payload` bytes.
    unsafe {
        obj::write::<i32>(heap.obj_ptr(offset), tag as i32);
        obj::write::<i32>(heap.obj_ptr(offset).add(4), count as i32);
    }
    Ok(offset)
}

fn data_ptr(heap: &Heap, offset: usize) -> *mut u8 {
    // SAFETY: elements start right after the object header.
    unsafe { heap.obj_ptr(offset).add(OBJ_HEADER) }
}

/// Construct a typed array from a slice of elements.
pub(crate) fn construct_slice<T: Copy>(
    heap: &Heap,
    tag: TypeTag,
    elems: &[T],
) -> Result<usize, Error> {
    debug_assert_eq!(size_of::<T>(), tag.elem_size());
    let offset = alloc_array(heap, tag, elems.len())?;
    // SAFETY: the fresh block holds len * elem_size data bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(
            elems.as_ptr().cast::<u8>(),
            data_ptr(heap, offset),
            elems.len() * tag.elem_size(),
        );
    }
    Ok(offset)
}

/// Construct a bool array, normalizing storage to 0/1 bytes.
pub(crate) fn construct_bools(heap: &Heap, elems: &[bool]) -> Result<usize, Error> {
    let offset = alloc_array(heap, TypeTag::Bool, elems.len())?;
    let data = data_ptr(heap, offset);
    for (index, value) in elems.iter().enumerate() {
        // SAFETY: index < elems.len(), inside the fresh block.
        unsafe { *data.add(index) = *value as u8 }
    }
    Ok(offset)
}

/// Construct a char array holding `text` plus its NUL terminator.
pub(crate) fn construct_str(heap: &Heap, text: &str) -> Result<usize, Error> {
    let bytes = text.as_bytes();
    let offset = alloc_array(heap, TypeTag::Char, bytes.len() + 1)?;
    // SAFETY: the fresh block holds len + 1 data bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), data_ptr(heap, offset), bytes.len());
        *data_ptr(heap, offset).add(bytes.len()) = 0;
    }
    Ok(offset)
}

pub(crate) fn deconstruct(heap: &Heap, offset: usize) {
    heap.free_raw(offset);
}

fn read_slice<T: Copy>(heap: &Heap, offset: usize, len: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(len);
    // SAFETY: the array holds `len` elements of T starting at the data
    // pointer, and the destination has capacity for all of them.
    unsafe {
        std::ptr::copy_nonoverlapping(
            data_ptr(heap, offset).cast::<T>(),
            out.as_mut_ptr(),
            len,
        );
        out.set_len(len);
    }
    out
}

/// The string stored in a char array, terminator stripped.
pub(crate) fn read_str(heap: &Heap, offset: usize) -> String {
    let len = obj::len_at(heap, offset) as usize;
    let bytes = read_slice::<u8>(heap, offset, len);
    let text = match bytes.last() {
        Some(0) => &bytes[..len - 1],
        _ => &bytes[..],
    };
    String::from_utf8_lossy(text).into_owned()
}

/// Lift the array at `offset` into a [`Value`]; length-1 arrays come back as
/// scalars, char arrays as strings.
pub(crate) fn read_value(heap: &Heap, offset: usize) -> Result<Value, Error> {
    let tag = obj::tag_at(heap, offset)?;
    let len = obj::len_at(heap, offset) as usize;

    macro_rules! lift {
        ($ty:ty, $scalar:ident, $vec:ident) => {{
            let v = read_slice::<$ty>(heap, offset, len);
            if len == 1 {
                Value::$scalar(v[0])
            } else {
                Value::$vec(v)
            }
        }};
    }

    Ok(match tag {
        TypeTag::Char => Value::Str(read_str(heap, offset)),
        TypeTag::Bool => {
            let v: Vec<bool> = read_slice::<u8>(heap, offset, len)
                .into_iter()
                .map(|b| b != 0)
                .collect();
            if len == 1 { Value::Bool(v[0]) } else { Value::BoolVec(v) }
        }
        TypeTag::UChar => lift!(u8, U8, U8Vec),
        TypeTag::Short => lift!(i16, I16, I16Vec),
        TypeTag::UShort => lift!(u16, U16, U16Vec),
        TypeTag::Int => lift!(i32, I32, I32Vec),
        TypeTag::UInt => lift!(u32, U32, U32Vec),
        TypeTag::Long | TypeTag::LongLong => lift!(i64, I64, I64Vec),
        TypeTag::ULong | TypeTag::ULongLong => lift!(u64, U64, U64Vec),
        TypeTag::Float => lift!(f32, F32, F32Vec),
        TypeTag::Double => lift!(f64, F64, F64Vec),
        _ => {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a primitive array",
                found: tag.name(),
            }));
        }
    })
}

/// Read one element; negative indices count from the end.
pub(crate) fn get_element(heap: &Heap, offset: usize, index: i64) -> Result<Value, Error> {
    let tag = obj::tag_at(heap, offset)?;
    let len = obj::len_at(heap, offset) as usize;
    let index = obj::resolve_index(index, len)?;

    macro_rules! elem {
        ($ty:ty, $scalar:ident) => {{
            // SAFETY: index was bounds-checked against the element count.
            Value::$scalar(unsafe { obj::read::<$ty>(data_ptr(heap, offset).add(index * size_of::<$ty>())) })
        }};
    }

    Ok(match tag {
        TypeTag::Bool => {
            // SAFETY: index was bounds-checked.
            Value::Bool(unsafe { *data_ptr(heap, offset).add(index) } != 0)
        }
        TypeTag::Char => {
            // SAFETY: index was bounds-checked.
            let byte = unsafe { *data_ptr(heap, offset).add(index) };
            Value::Str((byte as char).to_string())
        }
        TypeTag::UChar => elem!(u8, U8),
        TypeTag::Short => elem!(i16, I16),
        TypeTag::UShort => elem!(u16, U16),
        TypeTag::Int => elem!(i32, I32),
        TypeTag::UInt => elem!(u32, U32),
        TypeTag::Long | TypeTag::LongLong => elem!(i64, I64),
        TypeTag::ULong | TypeTag::ULongLong => elem!(u64, U64),
        TypeTag::Float => elem!(f32, F32),
        TypeTag::Double => elem!(f64, F64),
        _ => {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a primitive array",
                found: tag.name(),
            }));
        }
    })
}

/// Overwrite one element; the value's width must match the stored tag.
pub(crate) fn set_element(
    heap: &Heap,
    offset: usize,
    index: i64,
    value: &Value,
) -> Result<(), Error> {
    let tag = obj::tag_at(heap, offset)?;
    let len = obj::len_at(heap, offset) as usize;
    let index = obj::resolve_index(index, len)?;

    macro_rules! put {
        ($ty:ty, $raw:expr) => {{
            // SAFETY: index was bounds-checked against the element count.
            unsafe {
                obj::write::<$ty>(
                    data_ptr(heap, offset).add(index * size_of::<$ty>()),
                    $raw,
                )
            }
        }};
    }

    match (tag, value) {
        (TypeTag::Bool, Value::Bool(v)) => put!(u8, *v as u8),
        (TypeTag::UChar, Value::U8(v)) => put!(u8, *v),
        (TypeTag::Short, Value::I16(v)) => put!(i16, *v),
        (TypeTag::UShort, Value::U16(v)) => put!(u16, *v),
        (TypeTag::Int, Value::I32(v)) => put!(i32, *v),
        (TypeTag::UInt, Value::U32(v)) => put!(u32, *v),
        (TypeTag::Long | TypeTag::LongLong, Value::I64(v)) => put!(i64, *v),
        (TypeTag::ULong | TypeTag::ULongLong, Value::U64(v)) => put!(u64, *v),
        (TypeTag::Float, Value::F32(v)) => put!(f32, *v),
        (TypeTag::Double, Value::F64(v)) => put!(f64, *v),
        _ => {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: tag.name(),
                found: value.kind_name(),
            }));
        }
    }
    Ok(())
}

/// First index holding `value`, or -1 when absent.
pub(crate) fn find(heap: &Heap, offset: usize, value: &Value) -> Result<i64, Error> {
    let tag = obj::tag_at(heap, offset)?;
    let len = obj::len_at(heap, offset) as usize;

    macro_rules! scan {
        ($ty:ty, $needle:expr) => {{
            let haystack = read_slice::<$ty>(heap, offset, len);
            haystack
                .iter()
                .position(|v| *v == $needle)
                .map_or(-1, |i| i as i64)
        }};
    }

    Ok(match (tag, value) {
        (TypeTag::Bool, Value::Bool(v)) => {
            let needle = *v as u8;
            scan!(u8, needle)
        }
        (TypeTag::UChar, Value::U8(v)) => scan!(u8, *v),
        (TypeTag::Short, Value::I16(v)) => scan!(i16, *v),
        (TypeTag::UShort, Value::U16(v)) => scan!(u16, *v),
        (TypeTag::Int, Value::I32(v)) => scan!(i32, *v),
        (TypeTag::UInt, Value::U32(v)) => scan!(u32, *v),
        (TypeTag::Long | TypeTag::LongLong, Value::I64(v)) => scan!(i64, *v),
        (TypeTag::ULong | TypeTag::ULongLong, Value::U64(v)) => scan!(u64, *v),
        (TypeTag::Float, Value::F32(v)) => scan!(f32, *v),
        (TypeTag::Double, Value::F64(v)) => scan!(f64, *v),
        _ => {
            warn!(
                "searching a {} array for a {} value",
                tag.name(),
                value.kind_name()
            );
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: tag.name(),
                found: value.kind_name(),
            }));
        }
    })
}

/// Render as `(P:<typename>:<len>)[e0, e1, …]`; char arrays render as the
/// quoted string.
pub(crate) fn render(heap: &Heap, offset: usize, max_elements: usize) -> String {
    let Ok(tag) = obj::tag_at(heap, offset) else {
        return "(P:?)".to_owned();
    };
    let len = obj::len_at(heap, offset) as usize;
    let mut out = format!("(P:{}:{len})", tag.name());

    if tag == TypeTag::Char {
        let text = read_str(heap, offset);
        if text.len() > max_elements {
            let cut: String = text.chars().take(max_elements).collect();
            out.push_str(&format!("\"{cut}...\""));
        } else {
            out.push_str(&format!("\"{text}\""));
        }
        return out;
    }

    macro_rules! join {
        ($ty:ty) => {
            read_slice::<$ty>(heap, offset, len.min(max_elements))
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
        };
    }

    let mut parts = match tag {
        TypeTag::Bool => read_slice::<u8>(heap, offset, len.min(max_elements))
            .iter()
            .map(|v| (*v != 0).to_string())
            .collect::<Vec<_>>(),
        TypeTag::UChar => join!(u8),
        TypeTag::Short => join!(i16),
        TypeTag::UShort => join!(u16),
        TypeTag::Int => join!(i32),
        TypeTag::UInt => join!(u32),
        TypeTag::Long | TypeTag::LongLong => join!(i64),
        TypeTag::ULong | TypeTag::ULongLong => join!(u64),
        TypeTag::Float => join!(f32),
        TypeTag::Double => join!(f64),
        _ => Vec::new(),
    };
    if len > max_elements {
        parts.push("...".to_owned());
    }
    out.push('[');
    out.push_str(&parts.join(", "));
    out.push(']');
    out
}
