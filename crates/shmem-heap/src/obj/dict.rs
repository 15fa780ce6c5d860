//! The keyed map: a red-black tree whose nodes, keys and values are all
//! separately allocated heap objects, linked by signed offsets relative to
//! the node that stores them.
//!
//! Ordering is by hashed key: integer keys hash to themselves, string keys
//! through the process-stable standard hasher truncated to 32 bits. Two
//! distinct keys with the same hash are the same key as far as the tree is
//! concerned; callers must not construct such collisions deliberately.
//!
//! The tree uses one shared sentinel NIL node per map (black, children
//! pointing at itself) so rotations and the delete fix-up never touch a true
//! null. The sentinel is identified by its reserved key string.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::error::{Error, ErrorKind};
use crate::heap::Heap;
use crate::obj::{self, OBJ_HEADER};
use crate::tag::TypeTag;
use crate::value::{Key, Value};

/// Reserved key marking the sentinel NIL node.
pub(crate) const NIL_KEY: &str = "NILKey:js82nfd-";

const NPTR_REL: i64 = 1;

// Dict header fields, after {type_id, length}.
const ROOT_FIELD: usize = 8;
const NIL_FIELD: usize = 16;
const DICT_PAYLOAD: usize = OBJ_HEADER + 16;

// Node fields, after {type_id, size = -1}.
const LEFT_FIELD: usize = 8;
const RIGHT_FIELD: usize = 16;
const PARENT_FIELD: usize = 24;
const KEY_FIELD: usize = 32;
const DATA_FIELD: usize = 40;
const COLOR_FIELD: usize = 48;
const NODE_PAYLOAD: usize = COLOR_FIELD + 8;

const RED: u64 = 0;
const BLACK: u64 = 1;

/// Hash a key into the 32-bit ordering domain.
pub(crate) fn hash_key(key: &Key) -> i32 {
    match key {
        Key::Int(value) => *value,
        Key::Str(text) => {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            hasher.finish() as i32
        }
    }
}

/// One tree node, addressed by its object offset.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Node {
    off: usize,
}

impl Node {
    fn field(self, heap: &Heap, field: usize) -> i64 {
        // SAFETY: node objects always span NODE_PAYLOAD bytes.
        unsafe { obj::read::<i64>(heap.obj_ptr(self.off).add(field)) }
    }

    fn set_field(self, heap: &Heap, field: usize, value: i64) {
        // SAFETY: as for field.
        unsafe { obj::write::<i64>(heap.obj_ptr(self.off).add(field), value) }
    }

    fn link(self, heap: &Heap, field: usize) -> Option<Node> {
        let rel = self.field(heap, field);
        if rel == NPTR_REL {
            None
        } else {
            Some(Node {
                off: (self.off as i64 + rel) as usize,
            })
        }
    }

    fn set_link(self, heap: &Heap, field: usize, node: Option<Node>) {
        let rel = match node {
            None => NPTR_REL,
            Some(node) => node.off as i64 - self.off as i64,
        };
        self.set_field(heap, field, rel);
    }

    /// Left child; the sentinel at minimum, never null inside a live tree.
    fn left(self, heap: &Heap, nil: Node) -> Node {
        self.link(heap, LEFT_FIELD).unwrap_or(nil)
    }

    fn right(self, heap: &Heap, nil: Node) -> Node {
        self.link(heap, RIGHT_FIELD).unwrap_or(nil)
    }

    fn parent(self, heap: &Heap) -> Option<Node> {
        self.link(heap, PARENT_FIELD)
    }

    fn set_left(self, heap: &Heap, node: Node) {
        self.set_link(heap, LEFT_FIELD, Some(node));
    }

    fn set_right(self, heap: &Heap, node: Node) {
        self.set_link(heap, RIGHT_FIELD, Some(node));
    }

    fn set_parent(self, heap: &Heap, node: Option<Node>) {
        self.set_link(heap, PARENT_FIELD, node);
    }

    fn key_offset(self, heap: &Heap) -> usize {
        (self.off as i64 + self.field(heap, KEY_FIELD)) as usize
    }

    fn data(self, heap: &Heap) -> Option<usize> {
        let rel = self.field(heap, DATA_FIELD);
        if rel == NPTR_REL {
            None
        } else {
            Some((self.off as i64 + rel) as usize)
        }
    }

    fn set_data(self, heap: &Heap, data: Option<usize>) {
        let rel = match data {
            None => NPTR_REL,
            Some(data) => data as i64 - self.off as i64,
        };
        self.set_field(heap, DATA_FIELD, rel);
    }

    fn is_red(self, heap: &Heap) -> bool {
        self.field(heap, COLOR_FIELD) as u64 == RED
    }

    fn color(self, heap: &Heap) -> u64 {
        self.field(heap, COLOR_FIELD) as u64
    }

    fn set_color(self, heap: &Heap, color: u64) {
        self.set_field(heap, COLOR_FIELD, color as i64);
    }

    /// Decode the stored key object.
    fn key(self, heap: &Heap) -> Result<Key, Error> {
        let key_off = self.key_offset(heap);
        match obj::tag_at(heap, key_off)? {
            TypeTag::Char => Ok(Key::Str(super::primitive::read_str(heap, key_off))),
            TypeTag::Int => {
                // SAFETY: an int key object holds one i32 element.
                let value = unsafe { obj::read::<i32>(heap.obj_ptr(key_off).add(OBJ_HEADER)) };
                Ok(Key::Int(value))
            }
            tag => Err(Error::new(ErrorKind::Corrupt {
                detail: format!("dict node key has tag {}", tag.name()),
            })),
        }
    }

    fn hashed_key(self, heap: &Heap) -> Result<i32, Error> {
        Ok(hash_key(&self.key(heap)?))
    }
}

/// Allocate a node carrying `key`, colored red, links null.
fn node_construct(heap: &Heap, key: &Key) -> Result<Node, Error> {
    let off = heap.alloc_raw(NODE_PAYLOAD);
    if off == 0 {
        return Err(Error::new(ErrorKind::OutOfMemory {
            requested: NODE_PAYLOAD,
        }));
    }
    // SAFETY: a fresh node block.
    unsafe {
        obj::write::<i32>(heap.obj_ptr(off), TypeTag::DictNode as i32);
        obj::write::<i32>(heap.obj_ptr(off).add(4), -1);
    }
    let node = Node { off };
    node.set_color(heap, RED);
    node.set_link(heap, LEFT_FIELD, None);
    node.set_link(heap, RIGHT_FIELD, None);
    node.set_link(heap, PARENT_FIELD, None);
    node.set_data(heap, None);
    let key_off = match key {
        Key::Str(text) => super::primitive::construct_str(heap, text),
        Key::Int(value) => {
            super::primitive::construct_slice::<i32>(heap, TypeTag::Int, &[*value])
        }
    };
    let key_off = match key_off {
        Ok(key_off) => key_off,
        Err(err) => {
            heap.free_raw(off);
            return Err(err);
        }
    };
    node.set_field(heap, KEY_FIELD, key_off as i64 - off as i64);
    Ok(node)
}

fn root(heap: &Heap, dict: usize) -> Node {
    // SAFETY: the dict header holds the root offset at a fixed field.
    let rel = unsafe { obj::read::<i64>(heap.obj_ptr(dict).add(ROOT_FIELD)) };
    Node {
        off: (dict as i64 + rel) as usize,
    }
}

fn set_root(heap: &Heap, dict: usize, node: Node) {
    // SAFETY: as for root.
    unsafe { obj::write::<i64>(heap.obj_ptr(dict).add(ROOT_FIELD), node.off as i64 - dict as i64) }
}

fn nil(heap: &Heap, dict: usize) -> Node {
    // SAFETY: the dict header holds the sentinel offset at a fixed field.
    let rel = unsafe { obj::read::<i64>(heap.obj_ptr(dict).add(NIL_FIELD)) };
    Node {
        off: (dict as i64 + rel) as usize,
    }
}

pub(crate) fn len(heap: &Heap, dict: usize) -> usize {
    obj::len_at(heap, dict).max(0) as usize
}

/// Create an empty dict: header first, then the sentinel and its key.
pub(crate) fn construct(heap: &Heap) -> Result<usize, Error> {
    let dict = heap.alloc_raw(DICT_PAYLOAD);
    if dict == 0 {
        return Err(Error::new(ErrorKind::OutOfMemory {
            requested: DICT_PAYLOAD,
        }));
    }
    // SAFETY: a fresh dict header block.
    unsafe {
        obj::write::<i32>(heap.obj_ptr(dict), TypeTag::Dict as i32);
        obj::write::<i32>(heap.obj_ptr(dict).add(4), 0);
    }
    let sentinel = match node_construct(heap, &Key::Str(NIL_KEY.to_owned())) {
        Ok(sentinel) => sentinel,
        Err(err) => {
            heap.free_raw(dict);
            return Err(err);
        }
    };
    sentinel.set_color(heap, BLACK);
    sentinel.set_left(heap, sentinel);
    sentinel.set_right(heap, sentinel);
    // SAFETY: writing the fixed fields of the fresh dict header.
    unsafe {
        obj::write::<i64>(
            heap.obj_ptr(dict).add(NIL_FIELD),
            sentinel.off as i64 - dict as i64,
        );
    }
    set_root(heap, dict, sentinel);
    Ok(dict)
}

/// Build a dict holding `map`; values are constructed before their nodes.
pub(crate) fn construct_from(heap: &Heap, map: &BTreeMap<Key, Value>) -> Result<usize, Error> {
    let dict = construct(heap)?;
    for (key, value) in map {
        let data = obj::construct(heap, value)?;
        insert(heap, dict, key, data)?;
    }
    Ok(dict)
}

fn left_rotate(heap: &Heap, dict: usize, x: Node) {
    let sentinel = nil(heap, dict);
    let y = x.right(heap, sentinel);
    let y_left = y.left(heap, sentinel);
    x.set_right(heap, y_left);
    if y_left != sentinel {
        y_left.set_parent(heap, Some(x));
    }
    y.set_parent(heap, x.parent(heap));
    match x.parent(heap) {
        None => set_root(heap, dict, y),
        Some(parent) if parent.left(heap, sentinel) == x => parent.set_left(heap, y),
        Some(parent) => parent.set_right(heap, y),
    }
    y.set_left(heap, x);
    x.set_parent(heap, Some(y));
}

fn right_rotate(heap: &Heap, dict: usize, x: Node) {
    let sentinel = nil(heap, dict);
    let y = x.left(heap, sentinel);
    let y_right = y.right(heap, sentinel);
    x.set_left(heap, y_right);
    if y_right != sentinel {
        y_right.set_parent(heap, Some(x));
    }
    y.set_parent(heap, x.parent(heap));
    match x.parent(heap) {
        None => set_root(heap, dict, y),
        Some(parent) if parent.right(heap, sentinel) == x => parent.set_right(heap, y),
        Some(parent) => parent.set_left(heap, y),
    }
    y.set_right(heap, x);
    x.set_parent(heap, Some(y));
}

fn fix_insert(heap: &Heap, dict: usize, mut node: Node) -> Result<(), Error> {
    let sentinel = nil(heap, dict);
    while node != root(heap, dict) {
        let Some(parent) = node.parent(heap) else {
            break;
        };
        if !parent.is_red(heap) {
            break;
        }
        let Some(grand) = parent.parent(heap) else {
            break;
        };
        if parent == grand.left(heap, sentinel) {
            let uncle = grand.right(heap, sentinel);
            if uncle.is_red(heap) {
                parent.set_color(heap, BLACK);
                uncle.set_color(heap, BLACK);
                grand.set_color(heap, RED);
                node = grand;
            } else {
                if node == parent.right(heap, sentinel) {
                    node = parent;
                    left_rotate(heap, dict, node);
                }
                let parent = node.parent(heap).ok_or_else(structure_lost)?;
                let grand = parent.parent(heap).ok_or_else(structure_lost)?;
                parent.set_color(heap, BLACK);
                grand.set_color(heap, RED);
                right_rotate(heap, dict, grand);
            }
        } else {
            let uncle = grand.left(heap, sentinel);
            if uncle.is_red(heap) {
                parent.set_color(heap, BLACK);
                uncle.set_color(heap, BLACK);
                grand.set_color(heap, RED);
                node = grand;
            } else {
                if node == parent.left(heap, sentinel) {
                    node = parent;
                    right_rotate(heap, dict, node);
                }
                let parent = node.parent(heap).ok_or_else(structure_lost)?;
                let grand = parent.parent(heap).ok_or_else(structure_lost)?;
                parent.set_color(heap, BLACK);
                grand.set_color(heap, RED);
                left_rotate(heap, dict, grand);
            }
        }
    }
    root(heap, dict).set_color(heap, BLACK);
    Ok(())
}

fn structure_lost() -> Error {
    Error::new(ErrorKind::Corrupt {
        detail: "red-black fix-up lost the tree structure".to_owned(),
    })
}

/// Insert or overwrite. On a hash match the old value object is freed and
/// the stored offset replaced; otherwise a fresh red node is attached and
/// the tree rebalanced.
pub(crate) fn insert(heap: &Heap, dict: usize, key: &Key, data: usize) -> Result<(), Error> {
    let hashed = hash_key(key);
    let sentinel = nil(heap, dict);

    let mut parent: Option<Node> = None;
    let mut current = root(heap, dict);
    while current != sentinel {
        parent = Some(current);
        let current_hash = current.hashed_key(heap)?;
        if hashed < current_hash {
            current = current.left(heap, sentinel);
        } else if hashed > current_hash {
            current = current.right(heap, sentinel);
        } else {
            if let Some(old) = current.data(heap) {
                obj::deconstruct(heap, old)?;
            }
            current.set_data(heap, Some(data));
            return Ok(());
        }
    }

    let node = node_construct(heap, key)?;
    node.set_data(heap, Some(data));
    node.set_left(heap, sentinel);
    node.set_right(heap, sentinel);
    node.set_parent(heap, parent);
    match parent {
        None => set_root(heap, dict, node),
        Some(parent) => {
            if hashed < parent.hashed_key(heap)? {
                parent.set_left(heap, node);
            } else {
                parent.set_right(heap, node);
            }
        }
    }
    obj::set_len_at(heap, dict, (len(heap, dict) + 1) as i32);

    match parent {
        None => {
            node.set_color(heap, BLACK);
            Ok(())
        }
        Some(parent) if parent.parent(heap).is_none() => Ok(()),
        Some(_) => fix_insert(heap, dict, node),
    }
}

fn search_node(heap: &Heap, dict: usize, hashed: i32) -> Result<Option<Node>, Error> {
    let sentinel = nil(heap, dict);
    let mut current = root(heap, dict);
    loop {
        if current == sentinel {
            return Ok(None);
        }
        let current_hash = current.hashed_key(heap)?;
        if hashed == current_hash {
            return Ok(Some(current));
        }
        current = if hashed < current_hash {
            current.left(heap, sentinel)
        } else {
            current.right(heap, sentinel)
        };
    }
}

/// Value offset for `key`.
pub(crate) fn get(heap: &Heap, dict: usize, key: &Key) -> Result<usize, Error> {
    let node = search_node(heap, dict, hash_key(key))?.ok_or_else(|| {
        Error::new(ErrorKind::KeyNotFound {
            key: key.to_string(),
        })
    })?;
    node.data(heap).ok_or_else(|| {
        Error::new(ErrorKind::KeyNotFound {
            key: key.to_string(),
        })
    })
}

pub(crate) fn contains(heap: &Heap, dict: usize, key: &Key) -> Result<bool, Error> {
    Ok(search_node(heap, dict, hash_key(key))?.is_some())
}

fn transplant(heap: &Heap, dict: usize, old: Node, new: Node) {
    let sentinel = nil(heap, dict);
    match old.parent(heap) {
        None => set_root(heap, dict, new),
        Some(parent) if parent.left(heap, sentinel) == old => parent.set_left(heap, new),
        Some(parent) => parent.set_right(heap, new),
    }
    // The sentinel's parent is scratch space the delete fix-up relies on.
    new.set_parent(heap, old.parent(heap));
}

fn minimum(heap: &Heap, sentinel: Node, mut node: Node) -> Node {
    while node.left(heap, sentinel) != sentinel {
        node = node.left(heap, sentinel);
    }
    node
}

fn fix_delete(heap: &Heap, dict: usize, mut node: Node) {
    let sentinel = nil(heap, dict);
    while node != root(heap, dict) && !node.is_red(heap) {
        let Some(parent) = node.parent(heap) else {
            break;
        };
        if node == parent.left(heap, sentinel) {
            let mut sibling = parent.right(heap, sentinel);
            if sibling.is_red(heap) {
                sibling.set_color(heap, BLACK);
                parent.set_color(heap, RED);
                left_rotate(heap, dict, parent);
                sibling = parent.right(heap, sentinel);
            }
            if !sibling.left(heap, sentinel).is_red(heap)
                && !sibling.right(heap, sentinel).is_red(heap)
            {
                sibling.set_color(heap, RED);
                node = parent;
            } else {
                if !sibling.right(heap, sentinel).is_red(heap) {
                    sibling.left(heap, sentinel).set_color(heap, BLACK);
                    sibling.set_color(heap, RED);
                    right_rotate(heap, dict, sibling);
                    sibling = parent.right(heap, sentinel);
                }
                sibling.set_color(heap, parent.color(heap));
                parent.set_color(heap, BLACK);
                sibling.right(heap, sentinel).set_color(heap, BLACK);
                left_rotate(heap, dict, parent);
                node = root(heap, dict);
            }
        } else {
            let mut sibling = parent.left(heap, sentinel);
            if sibling.is_red(heap) {
                sibling.set_color(heap, BLACK);
                parent.set_color(heap, RED);
                right_rotate(heap, dict, parent);
                sibling = parent.left(heap, sentinel);
            }
            if !sibling.right(heap, sentinel).is_red(heap)
                && !sibling.left(heap, sentinel).is_red(heap)
            {
                sibling.set_color(heap, RED);
                node = parent;
            } else {
                if !sibling.left(heap, sentinel).is_red(heap) {
                    sibling.right(heap, sentinel).set_color(heap, BLACK);
                    sibling.set_color(heap, RED);
                    left_rotate(heap, dict, sibling);
                    sibling = parent.left(heap, sentinel);
                }
                sibling.set_color(heap, parent.color(heap));
                parent.set_color(heap, BLACK);
                sibling.left(heap, sentinel).set_color(heap, BLACK);
                right_rotate(heap, dict, parent);
                node = root(heap, dict);
            }
        }
    }
    node.set_color(heap, BLACK);
}

/// Remove `key`, freeing its node, key object and value object.
pub(crate) fn remove(heap: &Heap, dict: usize, key: &Key) -> Result<(), Error> {
    let target = search_node(heap, dict, hash_key(key))?.ok_or_else(|| {
        Error::new(ErrorKind::KeyNotFound {
            key: key.to_string(),
        })
    })?;
    let sentinel = nil(heap, dict);

    let fix_from;
    let mut removed_color = target.color(heap);
    if target.left(heap, sentinel) == sentinel {
        fix_from = target.right(heap, sentinel);
        transplant(heap, dict, target, fix_from);
    } else if target.right(heap, sentinel) == sentinel {
        fix_from = target.left(heap, sentinel);
        transplant(heap, dict, target, fix_from);
    } else {
        let successor = minimum(heap, sentinel, target.right(heap, sentinel));
        removed_color = successor.color(heap);
        fix_from = successor.right(heap, sentinel);
        if successor.parent(heap) == Some(target) {
            fix_from.set_parent(heap, Some(successor));
        } else {
            transplant(heap, dict, successor, fix_from);
            successor.set_right(heap, target.right(heap, sentinel));
            successor.right(heap, sentinel).set_parent(heap, Some(successor));
        }
        transplant(heap, dict, target, successor);
        successor.set_left(heap, target.left(heap, sentinel));
        successor.left(heap, sentinel).set_parent(heap, Some(successor));
        successor.set_color(heap, target.color(heap));
    }
    if removed_color == BLACK {
        fix_delete(heap, dict, fix_from);
    }

    obj::deconstruct(heap, target.key_offset(heap))?;
    if let Some(data) = target.data(heap) {
        obj::deconstruct(heap, data)?;
    }
    heap.free_raw(target.off);
    obj::set_len_at(heap, dict, (len(heap, dict) - 1) as i32);
    Ok(())
}

fn for_each_in_order(
    heap: &Heap,
    sentinel: Node,
    node: Node,
    out: &mut Vec<(Key, usize)>,
) -> Result<(), Error> {
    if node == sentinel {
        return Ok(());
    }
    for_each_in_order(heap, sentinel, node.left(heap, sentinel), out)?;
    let key = node.key(heap)?;
    let data = node.data(heap).ok_or_else(|| {
        Error::new(ErrorKind::Corrupt {
            detail: format!("dict node for {key} has no value"),
        })
    })?;
    out.push((key, data));
    for_each_in_order(heap, sentinel, node.right(heap, sentinel), out)?;
    Ok(())
}

/// In-order `(key, value offset)` pairs.
pub(crate) fn entries(heap: &Heap, dict: usize) -> Result<Vec<(Key, usize)>, Error> {
    let mut out = Vec::with_capacity(len(heap, dict));
    for_each_in_order(heap, nil(heap, dict), root(heap, dict), &mut out)?;
    Ok(out)
}

/// In-order keys; the iteration order of the map.
pub(crate) fn keys(heap: &Heap, dict: usize) -> Result<Vec<Key>, Error> {
    Ok(entries(heap, dict)?.into_iter().map(|(key, _)| key).collect())
}

/// The in-order key after `key`, or None at the end.
pub(crate) fn next_key(heap: &Heap, dict: usize, key: &Key) -> Result<Option<Key>, Error> {
    let sentinel = nil(heap, dict);
    let node = search_node(heap, dict, hash_key(key))?.ok_or_else(|| {
        Error::new(ErrorKind::KeyNotFound {
            key: key.to_string(),
        })
    })?;
    if node.right(heap, sentinel) != sentinel {
        return minimum(heap, sentinel, node.right(heap, sentinel))
            .key(heap)
            .map(Some);
    }
    let mut current = node;
    while let Some(parent) = current.parent(heap) {
        if current == parent.left(heap, sentinel) {
            return parent.key(heap).map(Some);
        }
        current = parent;
    }
    Ok(None)
}

/// The smallest key, or None when the map is empty.
pub(crate) fn first_key(heap: &Heap, dict: usize) -> Result<Option<Key>, Error> {
    let sentinel = nil(heap, dict);
    let r = root(heap, dict);
    if r == sentinel {
        return Ok(None);
    }
    minimum(heap, sentinel, r).key(heap).map(Some)
}

pub(crate) fn read_value(heap: &Heap, dict: usize) -> Result<Value, Error> {
    let mut out = BTreeMap::new();
    for (key, data) in entries(heap, dict)? {
        out.insert(key, obj::read_value(heap, data)?);
    }
    Ok(Value::Map(out))
}

fn deconstruct_subtree(heap: &Heap, sentinel: Node, node: Node, nil_hash: i32) -> Result<(), Error> {
    if node.hashed_key(heap)? == nil_hash {
        return Ok(());
    }
    deconstruct_subtree(heap, sentinel, node.left(heap, sentinel), nil_hash)?;
    deconstruct_subtree(heap, sentinel, node.right(heap, sentinel), nil_hash)?;
    obj::deconstruct(heap, node.key_offset(heap))?;
    if let Some(data) = node.data(heap) {
        obj::deconstruct(heap, data)?;
    }
    heap.free_raw(node.off);
    Ok(())
}

/// Post-order teardown: every node's key, value and block, then the
/// sentinel, then the header.
pub(crate) fn deconstruct(heap: &Heap, dict: usize) -> Result<(), Error> {
    let sentinel = nil(heap, dict);
    let nil_hash = hash_key(&Key::Str(NIL_KEY.to_owned()));
    deconstruct_subtree(heap, sentinel, root(heap, dict), nil_hash)?;
    obj::deconstruct(heap, sentinel.key_offset(heap))?;
    heap.free_raw(sentinel.off);
    heap.free_raw(dict);
    Ok(())
}

/// Render in-order; compact braces for short content, indented otherwise.
pub(crate) fn render(
    heap: &Heap,
    dict: usize,
    indent: usize,
    max_elements: usize,
) -> Result<String, Error> {
    let pad = " ".repeat(indent);
    let mut lines = Vec::new();
    for (key, data) in entries(heap, dict)? {
        lines.push(format!(
            "{pad} {key}: {}",
            obj::render(heap, data, indent + 1, max_elements)?
        ));
    }
    let body = lines.join("\n");
    if body.len() < 40 {
        Ok(format!("{{{}}}", body.trim()))
    } else {
        Ok(format!("{{\n{body}\n{pad}}}"))
    }
}

/// Red-black structural checks: root black, no red-red edge, equal black
/// heights, and ordering by hashed key.
pub(crate) fn verify(heap: &Heap, dict: usize) -> Result<(), Error> {
    let sentinel = nil(heap, dict);
    if !heap.offset_is_allocated(sentinel.off) {
        return Err(Error::new(ErrorKind::Corrupt {
            detail: "dict sentinel is not allocated".to_owned(),
        }));
    }
    let r = root(heap, dict);
    if r != sentinel && r.is_red(heap) {
        return Err(Error::new(ErrorKind::Corrupt {
            detail: "dict root is red".to_owned(),
        }));
    }
    fn walk(
        heap: &Heap,
        sentinel: Node,
        node: Node,
        low: Option<i32>,
        high: Option<i32>,
    ) -> Result<usize, Error> {
        if node == sentinel {
            return Ok(1);
        }
        if !heap.offset_is_allocated(node.off) {
            return Err(Error::new(ErrorKind::Corrupt {
                detail: "dict node is not allocated".to_owned(),
            }));
        }
        let hash = node.hashed_key(heap)?;
        if low.is_some_and(|low| hash <= low) || high.is_some_and(|high| hash >= high) {
            return Err(Error::new(ErrorKind::Corrupt {
                detail: "dict ordering violated".to_owned(),
            }));
        }
        if node.is_red(heap)
            && (node.left(heap, sentinel).is_red(heap) || node.right(heap, sentinel).is_red(heap))
        {
            return Err(Error::new(ErrorKind::Corrupt {
                detail: "red dict node has a red child".to_owned(),
            }));
        }
        let left = walk(heap, sentinel, node.left(heap, sentinel), low, Some(hash))?;
        let right = walk(heap, sentinel, node.right(heap, sentinel), Some(hash), high)?;
        if left != right {
            return Err(Error::new(ErrorKind::Corrupt {
                detail: "dict black heights diverge".to_owned(),
            }));
        }
        Ok(left + if node.is_red(heap) { 0 } else { 1 })
    }
    walk(heap, sentinel, r, None, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_keys_hash_to_themselves() {
        assert_eq!(hash_key(&Key::Int(0)), 0);
        assert_eq!(hash_key(&Key::Int(42)), 42);
        assert_eq!(hash_key(&Key::Int(-7)), -7);
    }

    #[test]
    fn string_hash_is_stable_within_a_process() {
        let a = hash_key(&Key::Str("alpha".to_owned()));
        let b = hash_key(&Key::Str("alpha".to_owned()));
        assert_eq!(a, b);
        // Not a guarantee, but the sentinel must not collide with short keys
        // used throughout the tests.
        assert_ne!(hash_key(&Key::Str(NIL_KEY.to_owned())), hash_key(&Key::Str("9".to_owned())));
    }
}
