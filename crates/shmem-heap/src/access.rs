//! Path-based access to the object graph.
//!
//! An accessor is a heap handle plus a path of keys and indices. It holds no
//! object state of its own: every operation re-resolves the path from the
//! entrance object, so accessors stay valid across mutations and region
//! remaps. Reads take no lock; every mutation runs under the region write
//! lock and bumps the change counter on success.

use crate::error::{Error, ErrorKind};
use crate::heap::Heap;
use crate::obj::{self, dict, list, primitive};
use crate::tag::TypeTag;
use crate::value::{Key, Value};

/// A cursor into the shared object graph.
///
/// Built with [`Heap::access`] and extended one path element at a time:
///
/// ```no_run
/// use shmem_heap::{Heap, HeapOptions, Value};
/// use std::collections::BTreeMap;
///
/// let heap = Heap::create("example_region", HeapOptions::default())?;
/// heap.access().set(Value::Map(BTreeMap::from([
///     ("a".into(), Value::I32Vec(vec![10, 20, 30])),
/// ])))?;
/// heap.access().index("a").index(1).set(99i32)?;
/// assert_eq!(heap.access().index("a").index(1).get()?, Value::I32(99));
/// # Ok::<_, shmem_heap::Error>(())
/// ```
#[derive(Clone)]
pub struct Accessor<'h> {
    heap: &'h Heap,
    path: Vec<Key>,
}

struct Resolved {
    prev: Option<usize>,
    current: Option<usize>,
    depth: usize,
}

impl Heap {
    /// An accessor rooted at the entrance object.
    pub fn access(&self) -> Accessor<'_> {
        Accessor {
            heap: self,
            path: Vec::new(),
        }
    }
}

impl<'h> Accessor<'h> {
    /// Extend the path by one key or index.
    #[must_use]
    pub fn index(mut self, key: impl Into<Key>) -> Self {
        self.path.push(key.into());
        self
    }

    /// The path this accessor resolves.
    pub fn path(&self) -> &[Key] {
        &self.path
    }

    /// Walk the path from the entrance. Resolution stops early at a
    /// primitive (the rest may be an element index) or at a missing dict key
    /// (the rest may be a key about to be inserted); a bad list index or a
    /// string key on a list is an error outright.
    fn resolve(&self) -> Result<Resolved, Error> {
        let mut prev = None;
        let mut current = self.heap.entrance_raw();
        let mut depth = 0;
        while depth < self.path.len() {
            let Some(offset) = current else { break };
            let tag = obj::tag_at(self.heap, offset)?;
            if tag.is_primitive() {
                break;
            }
            match tag {
                TypeTag::Dict => match dict::get(self.heap, offset, &self.path[depth]) {
                    Ok(child) => {
                        prev = Some(offset);
                        current = Some(child);
                    }
                    Err(err) if matches!(err.kind(), ErrorKind::KeyNotFound { .. }) => break,
                    Err(err) => return Err(err),
                },
                TypeTag::List => {
                    let Key::Int(index) = self.path[depth] else {
                        return Err(Error::new(ErrorKind::TypeMismatch {
                            expected: "an integer index",
                            found: "a string key",
                        }));
                    };
                    let child = list::get(self.heap, offset, index as i64)?;
                    prev = Some(offset);
                    current = Some(child);
                }
                _ => {
                    return Err(Error::new(ErrorKind::Corrupt {
                        detail: format!("object at {offset} has container-internal tag"),
                    }));
                }
            }
            depth += 1;
        }
        Ok(Resolved {
            prev,
            current,
            depth,
        })
    }

    fn unresolved_error(&self, resolved: &Resolved) -> Error {
        let Some(current) = resolved.current else {
            return Error::new(ErrorKind::KeyNotFound {
                key: self
                    .path
                    .get(resolved.depth)
                    .map_or_else(|| "<entrance>".to_owned(), Key::to_string),
            });
        };
        // Resolution only stops early on a dict miss or a primitive with
        // path left over.
        match obj::tag_at(self.heap, current) {
            Ok(TypeTag::Dict) => Error::new(ErrorKind::KeyNotFound {
                key: self.path[resolved.depth].to_string(),
            }),
            Ok(_) => Error::new(ErrorKind::IndexOutOfBounds {
                index: resolved.depth as i64,
                len: self.path.len(),
            }),
            Err(err) => err,
        }
    }

    /// The terminal object's offset, fully resolving the path.
    fn resolve_full(&self) -> Result<usize, Error> {
        let resolved = self.resolve()?;
        if resolved.depth != self.path.len() {
            return Err(self.unresolved_error(&resolved));
        }
        resolved.current.ok_or_else(|| self.unresolved_error(&resolved))
    }

    /// The type tag of the object the path resolves to.
    pub fn type_tag(&self) -> Result<TypeTag, Error> {
        self.heap.ensure()?;
        let offset = self.resolve_full()?;
        obj::tag_at(self.heap, offset)
    }

    /// Read the object (or primitive element) the path points at.
    pub fn get(&self) -> Result<Value, Error> {
        self.heap.ensure()?;
        let resolved = self.resolve()?;
        let Some(current) = resolved.current else {
            return Err(self.unresolved_error(&resolved));
        };
        if resolved.depth == self.path.len() {
            return obj::read_value(self.heap, current);
        }
        let tag = obj::tag_at(self.heap, current)?;
        let remaining = self.path.len() - resolved.depth;
        if tag.is_primitive() && remaining == 1 {
            match &self.path[resolved.depth] {
                Key::Int(index) => return primitive::get_element(self.heap, current, *index as i64),
                Key::Str(_) => {
                    return Err(Error::new(ErrorKind::TypeMismatch {
                        expected: "an integer index",
                        found: "a string key",
                    }));
                }
            }
        }
        if tag.is_primitive() {
            return Err(Error::new(ErrorKind::IndexOutOfBounds {
                index: resolved.depth as i64,
                len: self.path.len(),
            }));
        }
        Err(self.unresolved_error(&resolved))
    }

    /// Store a value at the path.
    ///
    /// Fully resolved paths replace the object there (the entrance itself
    /// for an empty path), freeing what they displace. A path one element
    /// short of resolution writes a primitive element in place or inserts a
    /// new dict key.
    pub fn set(&self, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();
        self.heap.ensure()?;
        let guard = self.heap.lock()?;
        let resolved = self.resolve()?;

        if resolved.depth == self.path.len() {
            match resolved.prev {
                None => {
                    // Clear the entrance before freeing the old graph so a
                    // failed construct cannot leave it dangling.
                    if let Some(old) = resolved.current {
                        self.heap.set_entrance_raw(None);
                        obj::deconstruct(self.heap, old)?;
                    }
                    let fresh = obj::construct(self.heap, &value)?;
                    self.heap.set_entrance_raw(Some(fresh));
                }
                Some(prev) => match obj::tag_at(self.heap, prev)? {
                    TypeTag::List => {
                        let Some(Key::Int(index)) = self.path.last() else {
                            return Err(Error::new(ErrorKind::TypeMismatch {
                                expected: "an integer index",
                                found: "a string key",
                            }));
                        };
                        let fresh = obj::construct(self.heap, &value)?;
                        list::set(self.heap, prev, *index as i64, fresh)?;
                    }
                    TypeTag::Dict => {
                        let fresh = obj::construct(self.heap, &value)?;
                        dict::insert(self.heap, prev, &self.path[self.path.len() - 1], fresh)?;
                    }
                    tag => {
                        return Err(Error::new(ErrorKind::TypeMismatch {
                            expected: "a container",
                            found: tag.name(),
                        }));
                    }
                },
            }
        } else {
            let Some(current) = resolved.current else {
                return Err(self.unresolved_error(&resolved));
            };
            if self.path.len() - resolved.depth != 1 {
                return Err(self.unresolved_error(&resolved));
            }
            let tag = obj::tag_at(self.heap, current)?;
            if tag.is_primitive() {
                match &self.path[resolved.depth] {
                    Key::Int(index) => {
                        primitive::set_element(self.heap, current, *index as i64, &value)?;
                    }
                    Key::Str(_) => {
                        return Err(Error::new(ErrorKind::TypeMismatch {
                            expected: "an integer index",
                            found: "a string key",
                        }));
                    }
                }
            } else if tag == TypeTag::Dict {
                let fresh = obj::construct(self.heap, &value)?;
                dict::insert(self.heap, current, &self.path[resolved.depth], fresh)?;
            } else {
                return Err(Error::new(ErrorKind::IndexOutOfBounds {
                    index: resolved.depth as i64,
                    len: self.path.len(),
                }));
            }
        }

        drop(guard);
        self.heap.bump_counter();
        Ok(())
    }

    /// Delete `key` from the container the path resolves to: a list index
    /// (freeing the child and closing the gap) or a dict key (removing the
    /// node with rebalance).
    pub fn del(&self, key: impl Into<Key>) -> Result<(), Error> {
        let key = key.into();
        self.heap.ensure()?;
        let guard = self.heap.lock()?;
        let offset = self.resolve_full()?;
        match obj::tag_at(self.heap, offset)? {
            TypeTag::Dict => dict::remove(self.heap, offset, &key)?,
            TypeTag::List => {
                let Key::Int(index) = key else {
                    return Err(Error::new(ErrorKind::TypeMismatch {
                        expected: "an integer index",
                        found: "a string key",
                    }));
                };
                list::remove(self.heap, offset, index as i64)?;
            }
            tag => {
                return Err(Error::new(ErrorKind::TypeMismatch {
                    expected: "a container",
                    found: tag.name(),
                }));
            }
        }
        drop(guard);
        self.heap.bump_counter();
        Ok(())
    }

    /// Element count of the object the path resolves to.
    pub fn len(&self) -> Result<usize, Error> {
        self.heap.ensure()?;
        let offset = self.resolve_full()?;
        obj::length(self.heap, offset)
    }

    /// Whether the terminal object is empty.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Key membership on a dict, or index validity on a list.
    pub fn contains_key(&self, key: impl Into<Key>) -> Result<bool, Error> {
        let key = key.into();
        self.heap.ensure()?;
        let offset = self.resolve_full()?;
        match obj::tag_at(self.heap, offset)? {
            TypeTag::Dict => dict::contains(self.heap, offset, &key),
            TypeTag::List => match key {
                Key::Int(index) => {
                    Ok(obj::resolve_index(index as i64, list::len(self.heap, offset)).is_ok())
                }
                Key::Str(_) => Err(Error::new(ErrorKind::TypeMismatch {
                    expected: "an integer index",
                    found: "a string key",
                })),
            },
            tag => Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a container",
                found: tag.name(),
            })),
        }
    }

    /// First index of `value` in the terminal primitive array, or -1.
    pub fn find(&self, value: impl Into<Value>) -> Result<i64, Error> {
        self.heap.ensure()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if !tag.is_primitive() {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a primitive array",
                found: tag.name(),
            }));
        }
        primitive::find(self.heap, offset, &value.into())
    }

    /// Whether the terminal primitive array holds `value`.
    pub fn contains(&self, value: impl Into<Value>) -> Result<bool, Error> {
        Ok(self.find(value)? >= 0)
    }

    /// Append a value to the terminal list.
    pub fn append(&self, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();
        self.heap.ensure()?;
        let guard = self.heap.lock()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if tag != TypeTag::List {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a list",
                found: tag.name(),
            }));
        }
        let fresh = obj::construct(self.heap, &value)?;
        list::append(self.heap, offset, fresh)?;
        drop(guard);
        self.heap.bump_counter();
        Ok(())
    }

    /// Insert a value at `index` of the terminal list, shifting the tail.
    pub fn insert(&self, index: i32, value: impl Into<Value>) -> Result<(), Error> {
        let value = value.into();
        self.heap.ensure()?;
        let guard = self.heap.lock()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if tag != TypeTag::List {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a list",
                found: tag.name(),
            }));
        }
        let fresh = obj::construct(self.heap, &value)?;
        list::insert(self.heap, offset, index as i64, fresh)?;
        drop(guard);
        self.heap.bump_counter();
        Ok(())
    }

    /// Append every value in order to the terminal list.
    pub fn extend(&self, values: impl IntoIterator<Item = Value>) -> Result<(), Error> {
        let values: Vec<Value> = values.into_iter().collect();
        self.heap.ensure()?;
        let guard = self.heap.lock()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if tag != TypeTag::List {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a list",
                found: tag.name(),
            }));
        }
        list::extend(self.heap, offset, &values)?;
        drop(guard);
        self.heap.bump_counter();
        Ok(())
    }

    /// Free every child of the terminal list, leaving it empty.
    pub fn clear(&self) -> Result<(), Error> {
        self.heap.ensure()?;
        let guard = self.heap.lock()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if tag != TypeTag::List {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a list",
                found: tag.name(),
            }));
        }
        list::clear(self.heap, offset)?;
        drop(guard);
        self.heap.bump_counter();
        Ok(())
    }

    /// Read the element at `index` of the terminal list out of the region,
    /// removing it.
    pub fn pop(&self, index: i32) -> Result<Value, Error> {
        self.heap.ensure()?;
        let guard = self.heap.lock()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if tag != TypeTag::List {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a list",
                found: tag.name(),
            }));
        }
        let value = list::pop(self.heap, offset, index as i64)?;
        drop(guard);
        self.heap.bump_counter();
        Ok(value)
    }

    /// First iteration index of the terminal object: 0 for primitives and
    /// lists, the smallest key for dicts. None when empty.
    pub fn begin_idx(&self) -> Result<Option<Key>, Error> {
        self.heap.ensure()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if tag == TypeTag::Dict {
            return dict::first_key(self.heap, offset);
        }
        if obj::length(self.heap, offset)? == 0 {
            Ok(None)
        } else {
            Ok(Some(Key::Int(0)))
        }
    }

    /// The iteration index after `index`, or None past the end. Dicts
    /// iterate keys in hash order.
    pub fn next_idx(&self, index: &Key) -> Result<Option<Key>, Error> {
        self.heap.ensure()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if tag == TypeTag::Dict {
            return dict::next_key(self.heap, offset, index);
        }
        let Key::Int(current) = index else {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "an integer index",
                found: "a string key",
            }));
        };
        let next = current + 1;
        if (next as usize) < obj::length(self.heap, offset)? {
            Ok(Some(Key::Int(next)))
        } else {
            Ok(None)
        }
    }

    /// All keys of the terminal dict, in iteration order.
    pub fn keys(&self) -> Result<Vec<Key>, Error> {
        self.heap.ensure()?;
        let offset = self.resolve_full()?;
        let tag = obj::tag_at(self.heap, offset)?;
        if tag != TypeTag::Dict {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected: "a dict",
                found: tag.name(),
            }));
        }
        dict::keys(self.heap, offset)
    }

    /// Render the terminal object, truncating primitive arrays past
    /// `max_elements`.
    pub fn render(&self, max_elements: usize) -> Result<String, Error> {
        self.heap.ensure()?;
        let offset = self.resolve_full()?;
        obj::render(self.heap, offset, 0, max_elements)
    }
}
