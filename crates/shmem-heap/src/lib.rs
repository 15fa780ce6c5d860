//! A shared-memory heap with typed structured containers.
//!
//! The entire object graph (a best-fit block allocator, typed primitive
//! arrays, ordered lists and a red-black-tree map) lives inside one
//! OS-backed shared-memory region and is addressed purely by byte offsets,
//! so independent processes mapping the same name observe and mutate the
//! same live data.
//!
//! A single named write lock serializes mutation; a version semaphore lets
//! every handle detect that another process grew the region and remap before
//! touching it; a counter semaphore ticks once per completed write for
//! consumers that want a change signal.
//!
//! ```no_run
//! use shmem_heap::{Heap, HeapOptions, Value};
//! use std::collections::BTreeMap;
//!
//! let heap = Heap::create("my_region", HeapOptions::default())?;
//! heap.access().set(Value::Map(BTreeMap::from([
//!     ("answer".into(), Value::I32(42)),
//! ])))?;
//!
//! // Any process that connects to the name sees the same graph.
//! let peer = Heap::connect("my_region")?;
//! assert_eq!(peer.access().index("answer").get()?, Value::I32(42));
//! # Ok::<_, shmem_heap::Error>(())
//! ```
//!
//! Only Unix-like systems with POSIX named shared memory and named
//! semaphores are supported.

pub use self::access::Accessor;
mod access;

pub use self::error::{Error, ErrorKind};
mod error;

pub use self::heap::{Heap, HeapOptions, DEFAULT_HEAP_CAPACITY, DEFAULT_STATIC_CAPACITY};
mod heap;

mod obj;
mod os;
mod region;

pub use self::tag::TypeTag;
mod tag;

pub use self::value::{Key, Value};
mod value;
