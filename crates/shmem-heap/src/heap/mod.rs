//! The shared-memory heap: a best-fit free-list allocator over the region's
//! payload area, plus the region-growth protocol.
//!
//! The region is laid out as `[ static header | heap payload ]`. The static
//! header holds four words: static capacity, heap capacity, free-list head
//! and the entrance offset of the root user object. Every offset handed out
//! by the allocator is relative to the heap head, so the whole structure
//! survives remapping at a different base address.

use std::cell::Cell;
use std::cmp::max;

use log::{debug, error, info, warn};

use crate::error::{Error, ErrorKind};
use crate::os::page_size;
use crate::region::{Region, WriteGuard};

pub(crate) mod block;

use block::{Block, MIN_BLOCK, NPTR, WORD};

/// Default static-area size: the four header slots.
pub const DEFAULT_STATIC_CAPACITY: usize = 4 * WORD;

/// Default heap size: one page.
pub const DEFAULT_HEAP_CAPACITY: usize = 4096;

const MIN_STATIC_CAPACITY: usize = 4 * WORD;

const SLOT_STATIC_CAPACITY: usize = 0;
const SLOT_HEAP_CAPACITY: usize = 1;
const SLOT_FREE_HEAD: usize = 2;
const SLOT_ENTRANCE: usize = 3;

/// Sizing for [`Heap::create`].
#[derive(Debug, Clone, Copy)]
pub struct HeapOptions {
    /// Requested static-area size in bytes; padded up to a word multiple and
    /// clamped to at least four words.
    pub static_capacity: usize,
    /// Requested heap size in bytes; padded up to a page multiple.
    pub heap_capacity: usize,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            static_capacity: DEFAULT_STATIC_CAPACITY,
            heap_capacity: DEFAULT_HEAP_CAPACITY,
        }
    }
}

#[inline]
pub(crate) fn pad_to(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Total block size needed to hold `payload` bytes: one header word plus the
/// payload padded to a word multiple, with the payload clamped to three words
/// so any allocation can later become a free block.
pub(crate) fn required_block_size(payload: usize) -> usize {
    WORD + max(pad_to(payload, WORD), 3 * WORD)
}

/// A handle on one shared-memory heap.
///
/// Handles are cheap process-local state over the shared mapping; any number
/// of processes may hold handles on the same name. The handle that created
/// the region owns it and unlinks the OS objects when dropped.
pub struct Heap {
    region: Region,
    busy_timeout: Cell<i64>,
}

impl Heap {
    /// Create a new region, lay down the heap and return the owning handle.
    pub fn create(name: &str, options: HeapOptions) -> Result<Self, Error> {
        if options.heap_capacity == 0 {
            return Err(Error::new(ErrorKind::InvalidResize {
                requested: 0,
                current: 0,
            }));
        }
        let scap = pad_to(max(options.static_capacity, MIN_STATIC_CAPACITY), WORD);
        let hcap = pad_to(options.heap_capacity, page_size());
        let region = Region::create(name, scap + hcap)?;
        let heap = Heap {
            region,
            busy_timeout: Cell::new(-1),
        };
        heap.set_slot(SLOT_STATIC_CAPACITY, scap as u64);
        heap.set_slot(SLOT_HEAP_CAPACITY, hcap as u64);
        heap.set_slot(SLOT_ENTRANCE, NPTR);
        // One free block spans the whole heap. P is set: there is no block
        // before it to coalesce into.
        let first = heap.block_at(0);
        first.store(hcap as u64 | 0b010);
        first.write_footer();
        heap.set_slot(SLOT_FREE_HEAD, 0);
        info!("heap {name} created: static {scap}, heap {hcap}");
        Ok(heap)
    }

    /// Attach to an existing region and adopt the capacities recorded in its
    /// header.
    pub fn connect(name: &str) -> Result<Self, Error> {
        let region = Region::connect(name)?;
        let heap = Heap {
            region,
            busy_timeout: Cell::new(-1),
        };
        let scap = heap.slot(SLOT_STATIC_CAPACITY) as usize;
        let hcap = heap.slot(SLOT_HEAP_CAPACITY) as usize;
        if scap < MIN_STATIC_CAPACITY || scap + hcap != heap.region.capacity() {
            return Err(Error::new(ErrorKind::Corrupt {
                detail: format!(
                    "header capacities {scap}+{hcap} disagree with mapping size {}",
                    heap.region.capacity()
                ),
            }));
        }
        info!("heap {name} connected: static {scap}, heap {hcap}");
        Ok(heap)
    }

    /// The region name this heap is backed by.
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Whether this handle created (and will unlink) the region.
    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    /// The resize count this handle last mapped under.
    pub fn version(&self) -> i32 {
        self.region.version()
    }

    /// Static-area size in bytes.
    pub fn static_capacity(&self) -> Result<usize, Error> {
        self.ensure()?;
        Ok(self.slot(SLOT_STATIC_CAPACITY) as usize)
    }

    /// Heap size in bytes.
    pub fn heap_capacity(&self) -> Result<usize, Error> {
        self.ensure()?;
        Ok(self.slot(SLOT_HEAP_CAPACITY) as usize)
    }

    /// Offset of the root user object, if one has been stored.
    pub fn entrance_offset(&self) -> Result<Option<usize>, Error> {
        self.ensure()?;
        Ok(self.entrance_raw())
    }

    /// How long busy-bit waits poll before failing with
    /// [`ErrorKind::Busy`]: -1 forever, 0 non-blocking, otherwise
    /// milliseconds.
    pub fn set_busy_timeout(&self, timeout_ms: i64) {
        self.busy_timeout.set(timeout_ms);
    }

    /// Drop the mapping and semaphore handles. The named objects survive for
    /// other processes; every further operation on this handle fails with
    /// [`ErrorKind::NotConnected`]. Also runs on drop.
    pub fn close(&self) {
        self.region.close();
    }

    /// Remove the named OS objects backing this region. Only the owning
    /// handle does anything here; peers must leave teardown to the owner.
    /// Also runs on drop of the owner.
    pub fn unlink(&self) {
        self.region.unlink();
    }

    // Static header slots.

    fn slot(&self, index: usize) -> u64 {
        // SAFETY: the static area always holds at least four words.
        unsafe { *self.region.base().add(index * WORD).cast::<u64>() }
    }

    fn set_slot(&self, index: usize, value: u64) {
        // SAFETY: as for slot.
        unsafe { *self.region.base().add(index * WORD).cast::<u64>() = value }
    }

    pub(crate) fn entrance_raw(&self) -> Option<usize> {
        let raw = self.slot(SLOT_ENTRANCE);
        if raw == NPTR { None } else { Some(raw as usize) }
    }

    pub(crate) fn set_entrance_raw(&self, offset: Option<usize>) {
        self.set_slot(SLOT_ENTRANCE, offset.map_or(NPTR, |off| off as u64));
    }

    // Geometry.

    fn scap_raw(&self) -> usize {
        self.slot(SLOT_STATIC_CAPACITY) as usize
    }

    fn hcap_raw(&self) -> usize {
        self.slot(SLOT_HEAP_CAPACITY) as usize
    }

    fn heap_head(&self) -> *mut u8 {
        // SAFETY: the mapping spans static + heap.
        unsafe { self.region.base().add(self.scap_raw()) }
    }

    fn tail_addr(&self) -> usize {
        self.heap_head() as usize + self.hcap_raw()
    }

    fn block_at(&self, offset: usize) -> Block {
        // SAFETY: offsets are validated or produced by the allocator itself.
        unsafe { Block::at(self.heap_head().add(offset)) }
    }

    fn block_offset(&self, block: Block) -> usize {
        block.addr() - self.heap_head() as usize
    }

    /// Pointer to an object payload. Internal: offsets come from the
    /// allocator and stay valid until the holder frees them.
    pub(crate) fn obj_ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: as for block_at.
        unsafe { self.heap_head().add(offset) }
    }

    pub(crate) fn ensure(&self) -> Result<(), Error> {
        self.region.ensure_current()
    }

    pub(crate) fn lock(&self) -> Result<WriteGuard<'_>, Error> {
        self.region.lock()
    }

    pub(crate) fn bump_counter(&self) {
        self.region.bump_counter();
    }

    // Free list bookkeeping.

    fn free_head(&self) -> u64 {
        self.slot(SLOT_FREE_HEAD)
    }

    fn insert_free(&self, block: Block, prev: Option<Block>) -> Result<(), Error> {
        if self.free_head() == NPTR {
            // Any provided predecessor is stale once the list drained.
            self.set_slot(SLOT_FREE_HEAD, self.block_offset(block) as u64);
            block.link_self();
            return Ok(());
        }
        let prev = prev.unwrap_or_else(|| self.block_at(self.free_head() as usize));
        block.link_after(prev, self.busy_timeout.get())
    }

    fn remove_free(&self, block: Block) {
        if self.free_head() as usize == self.block_offset(block) {
            let next = block.bck();
            if next == block {
                self.set_slot(SLOT_FREE_HEAD, NPTR);
            } else {
                self.set_slot(SLOT_FREE_HEAD, self.block_offset(next) as u64);
            }
        }
        block.unlink();
    }

    // Allocation.

    /// Allocate a block able to hold `size` payload bytes.
    ///
    /// Returns the payload offset, or 0 when no fitting free block exists.
    /// The offset is the allocator's sentinel-style contract; the object
    /// layer translates 0 into a typed error.
    pub fn alloc(&self, size: usize) -> usize {
        match self.ensure().and_then(|()| self.lock()) {
            Ok(_guard) => self.alloc_raw(size),
            Err(err) => {
                error!("alloc({size}) failed to enter the region: {err}");
                0
            }
        }
    }

    /// Allocation body; the caller holds the write lock.
    pub(crate) fn alloc_raw(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        let mut required = required_block_size(size);

        let head_off = self.free_head();
        if head_off == NPTR {
            debug!("alloc({size}): free list is empty");
            return 0;
        }
        let head = self.block_at(head_off as usize);

        // Best fit: walk the circular list, stop early on an exact match.
        let mut best: Option<Block> = None;
        let mut best_size = usize::MAX;
        let mut current = head;
        loop {
            let block_size = current.size();
            if !current.allocated() && block_size >= required && block_size < best_size {
                best = Some(current);
                best_size = block_size;
                if block_size == required {
                    break;
                }
            }
            current = current.bck();
            if current == head {
                break;
            }
        }
        let Some(best) = best else {
            debug!("alloc({size}): no block of {required} bytes available");
            return 0;
        };

        if best.wait(self.busy_timeout.get()).is_err() {
            return 0;
        }
        best.set_busy();

        // A remainder smaller than a minimum block cannot stand alone.
        if best_size < required + MIN_BLOCK {
            required = best_size;
        }

        let old_fwd = best.fwd();
        self.remove_free(best);

        if best_size > required {
            // SAFETY: the split point is inside the candidate block.
            let remainder = unsafe { Block::at(self.heap_head().add(self.block_offset(best) + required)) };
            remainder.store((best_size - required) as u64 | 0b110);
            remainder.write_footer();
            if self.insert_free(remainder, Some(old_fwd)).is_err() {
                warn!("alloc({size}): timed out inserting the split remainder");
            }
            remainder.clear_busy();
            debug!(
                "alloc({size}): split block at {}: {}E -> {}A + {}E",
                self.block_offset(best),
                best_size,
                required,
                best_size - required
            );
        }

        // Final header: requested size, allocated, P preserved, busy cleared.
        best.store(required as u64 | (best.load() & 0b010) | 0b001);

        let next = best.next();
        if next.addr() < self.tail_addr() {
            next.set_prev_allocated(true);
        }

        let offset = self.block_offset(best) + WORD;
        debug!("alloc({size}) -> offset {offset}, block {required}");
        offset
    }

    /// Release an allocated payload back to the heap.
    ///
    /// Returns false (and changes nothing) when the offset is null,
    /// misaligned, out of range or not currently allocated.
    pub fn free(&self, offset: usize) -> bool {
        match self.ensure().and_then(|()| self.lock()) {
            Ok(_guard) => self.free_raw(offset),
            Err(err) => {
                error!("free({offset}) failed to enter the region: {err}");
                false
            }
        }
    }

    fn verify_payload_offset(&self, offset: usize) -> bool {
        offset >= WORD && offset % WORD == 0 && offset + 3 * WORD <= self.hcap_raw()
    }

    /// Free body; the caller holds the write lock.
    pub(crate) fn free_raw(&self, offset: usize) -> bool {
        if !self.verify_payload_offset(offset) {
            warn!("free({offset}): offset is not a payload");
            return false;
        }
        let block = self.block_at(offset - WORD);
        let timeout = self.busy_timeout.get();
        if block.wait(timeout).is_err() {
            return false;
        }
        block.set_busy();
        if !block.allocated() {
            block.clear_busy();
            warn!("free({offset}): block is not allocated");
            return false;
        }

        // Turn the block free: clear A, relink, stamp the footer, and tell
        // the next block its predecessor is free now.
        block.store(block.size() as u64 | (block.load() & 0b110));
        if self.insert_free(block, None).is_err() {
            // The block header already says free; leaving it unlinked would
            // leak it, so record the corruption loudly.
            error!("free({offset}): timed out inserting into the free list");
        }
        block.write_footer();
        let next = block.next();
        if next.addr() < self.tail_addr() {
            next.set_prev_allocated(false);
        }

        // Immediate coalescing. The merged extent always ends at this
        // block's original footer while we walk backward.
        let mut target = block;
        while !target.prev_allocated() {
            let prev = target.prev();
            if prev.allocated() {
                error!("free({offset}): previous block is allocated but P was clear");
                break;
            }
            if prev.wait(timeout).is_err() {
                break;
            }
            prev.set_busy();
            let merged = prev.size() + target.size();
            prev.store(merged as u64 | 0b100 | (prev.load() & 0b010));
            Block::merged_footer(block, merged);
            self.remove_free(target);
            debug!(
                "free({offset}): coalesced backward into block at {}",
                self.block_offset(prev)
            );
            target = prev;
        }
        loop {
            let next = target.next();
            if next.addr() >= self.tail_addr() || next.allocated() {
                break;
            }
            if next.wait(timeout).is_err() {
                break;
            }
            let merged = target.size() + next.size();
            Block::merged_footer(next, merged);
            self.remove_free(next);
            target.store(merged as u64 | (target.load() & 0b111));
            debug!(
                "free({offset}): coalesced forward over block at {}",
                self.block_offset(next)
            );
        }
        target.clear_busy();
        debug!("free({offset}) done");
        true
    }

    /// Resize an allocation, moving the payload when it has to grow.
    ///
    /// `size == 0` frees; `offset == 0` allocates. Returns the (possibly
    /// moved) payload offset, or 0 on failure.
    pub fn realloc(&self, offset: usize, size: usize) -> usize {
        match self.ensure().and_then(|()| self.lock()) {
            Ok(_guard) => self.realloc_raw(offset, size),
            Err(err) => {
                error!("realloc({offset}, {size}) failed to enter the region: {err}");
                0
            }
        }
    }

    /// Realloc body; the caller holds the write lock.
    pub(crate) fn realloc_raw(&self, offset: usize, size: usize) -> usize {
        if size == 0 {
            self.free_raw(offset);
            return 0;
        }
        if offset == 0 {
            return self.alloc_raw(size);
        }
        if !self.verify_payload_offset(offset) {
            warn!("realloc({offset}, {size}): offset is not a payload");
            return 0;
        }
        let block = self.block_at(offset - WORD);
        let timeout = self.busy_timeout.get();
        if block.wait(timeout).is_err() {
            return 0;
        }
        block.set_busy();
        if !block.allocated() {
            block.clear_busy();
            warn!("realloc({offset}, {size}): block is not allocated");
            return 0;
        }

        let required = required_block_size(size);
        let old_size = block.size();

        if old_size == required {
            block.clear_busy();
            return offset;
        }

        if old_size > required {
            if old_size < required + MIN_BLOCK {
                // The spare bytes cannot stand alone as a free block.
                // TODO: merge the spare bytes into the following block when
                // that block is free.
                warn!(
                    "realloc({offset}, {size}): shrink from {old_size} to {required} ignored, \
                     remainder below the minimum block size"
                );
            } else {
                // SAFETY: the split point is inside the shrinking block.
                let remainder = unsafe { Block::at(self.heap_head().add(offset - WORD + required)) };
                remainder.store((old_size - required) as u64 | 0b110);
                remainder.write_footer();
                if self.insert_free(remainder, None).is_err() {
                    warn!("realloc({offset}, {size}): timed out inserting the carved tail");
                }
                remainder.clear_busy();
                block.store(required as u64 | (block.load() & 0b010) | 0b001);
                let next = remainder.next();
                if next.addr() < self.tail_addr() {
                    next.set_prev_allocated(false);
                }
                debug!(
                    "realloc({offset}, {size}): shrank {old_size}A -> {required}A + {}E",
                    old_size - required
                );
            }
            block.clear_busy();
            return offset;
        }

        // Growing: snapshot, free, allocate fresh, copy back.
        let old_payload = old_size - WORD;
        let mut snapshot = vec![0u8; old_payload];
        // SAFETY: the payload spans old_payload bytes starting at offset.
        unsafe {
            std::ptr::copy_nonoverlapping(self.obj_ptr(offset), snapshot.as_mut_ptr(), old_payload);
        }
        block.clear_busy();
        self.free_raw(offset);
        let new_offset = self.alloc_raw(size);
        if new_offset == 0 {
            // Put the snapshot back where the allocator will find room; the
            // coalesced block we just freed always fits the old payload.
            error!("realloc({offset}, {size}): grow failed, restoring the old payload");
            let restored = self.alloc_raw(old_payload);
            if restored != 0 {
                // SAFETY: the fresh block holds at least old_payload bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        snapshot.as_ptr(),
                        self.obj_ptr(restored),
                        old_payload,
                    );
                }
            }
            return 0;
        }
        // SAFETY: the new block holds at least old_payload bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(snapshot.as_ptr(), self.obj_ptr(new_offset), old_payload);
        }
        debug!("realloc({offset}, {size}): moved payload to {new_offset}");
        new_offset
    }

    /// Grow the heap area, keeping the static area unchanged.
    pub fn resize_heap(&self, heap_capacity: usize) -> Result<(), Error> {
        self.resize(None, Some(heap_capacity))
    }

    /// Grow the static and/or heap areas. `None` keeps a dimension as-is.
    ///
    /// Other processes observe the version bump and remap on their next
    /// operation. All offsets remain valid: the heap bytes are copied
    /// verbatim to the (possibly shifted) heap head.
    pub fn resize(
        &self,
        static_capacity: Option<usize>,
        heap_capacity: Option<usize>,
    ) -> Result<(), Error> {
        self.ensure()?;
        let old_scap = self.scap_raw();
        let old_hcap = self.hcap_raw();
        let new_scap = match static_capacity {
            None => old_scap,
            Some(req) => {
                let padded = pad_to(max(req, MIN_STATIC_CAPACITY), WORD);
                if padded < old_scap {
                    return Err(Error::new(ErrorKind::InvalidResize {
                        requested: padded,
                        current: old_scap,
                    }));
                }
                padded
            }
        };
        let new_hcap = match heap_capacity {
            None => old_hcap,
            Some(req) => {
                let padded = pad_to(req, page_size());
                if padded < old_hcap {
                    return Err(Error::new(ErrorKind::InvalidResize {
                        requested: padded,
                        current: old_hcap,
                    }));
                }
                padded
            }
        };
        if new_scap == old_scap && new_hcap == old_hcap {
            return Ok(());
        }

        let _guard = self.lock()?;

        // Locate the last block before the mapping moves. Starting from a
        // free block shortens the walk when one exists.
        let mut last = if self.free_head() != NPTR {
            self.block_at(self.free_head() as usize)
        } else {
            self.block_at(0)
        };
        while last.next().addr() != self.tail_addr() {
            last = last.next();
        }
        let last_offset = self.block_offset(last);
        let last_allocated = last.allocated();

        // Snapshot both areas, then swap the mapping out underneath us.
        let mut static_copy = vec![0u8; old_scap];
        let mut heap_copy = vec![0u8; old_hcap];
        // SAFETY: both areas are inside the old mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.region.base(), static_copy.as_mut_ptr(), old_scap);
            std::ptr::copy_nonoverlapping(self.heap_head(), heap_copy.as_mut_ptr(), old_hcap);
        }

        self.region.bump_version()?;
        if let Err(err) = self.region.recreate(new_scap + new_hcap) {
            // Try to give the caller back the region it had.
            if self.region.recreate(old_scap + old_hcap).is_ok() {
                // SAFETY: the restored mapping has the old geometry.
                unsafe {
                    std::ptr::copy_nonoverlapping(static_copy.as_ptr(), self.region.base(), old_scap);
                    std::ptr::copy_nonoverlapping(heap_copy.as_ptr(), self.heap_head(), old_hcap);
                }
            }
            return Err(Error::new(ErrorKind::ResizeFailed {
                detail: err.to_string(),
            }));
        }

        // SAFETY: the new mapping holds at least old_scap + old_hcap bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(static_copy.as_ptr(), self.region.base(), old_scap);
        }
        self.set_slot(SLOT_STATIC_CAPACITY, new_scap as u64);
        self.set_slot(SLOT_HEAP_CAPACITY, new_hcap as u64);
        // SAFETY: the heap area of the new mapping spans new_hcap bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(heap_copy.as_ptr(), self.heap_head(), old_hcap);
        }

        let tail_space = new_hcap - old_hcap;
        if tail_space > 0 {
            let last = self.block_at(last_offset);
            if last_allocated && tail_space >= MIN_BLOCK {
                // The grown tail becomes a block of its own.
                let grown = self.block_at(old_hcap);
                grown.store(tail_space as u64 | 0b010);
                grown.write_footer();
                if self.insert_free(grown, None).is_err() {
                    warn!("resize: timed out inserting the tail block");
                }
                info!(
                    "heap {} resized {old_hcap} -> {new_hcap}: {tail_space} tail bytes became a free block",
                    self.name()
                );
            } else {
                // Fold the tail into the last block.
                let merged = last.size() + tail_space;
                last.store(merged as u64 | (last.load() & 0b111));
                if !last_allocated {
                    last.write_footer();
                }
                info!(
                    "heap {} resized {old_hcap} -> {new_hcap}: {tail_space} tail bytes merged into the last block",
                    self.name()
                );
            }
        } else {
            info!(
                "heap {} static area resized {old_scap} -> {new_scap}",
                self.name()
            );
        }
        Ok(())
    }

    // Introspection.

    /// Per-block `(payload_size, allocated)` pairs in address order. The
    /// payload figure is the block size minus the header word.
    pub fn layout(&self) -> Result<Vec<(usize, bool)>, Error> {
        self.ensure()?;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.hcap_raw() {
            let block = self.block_at(offset);
            let size = block.size();
            if size < MIN_BLOCK || offset + size > self.hcap_raw() {
                return Err(Error::new(ErrorKind::Corrupt {
                    detail: format!("block at {offset} has impossible size {size}"),
                }));
            }
            out.push((size - WORD, block.allocated()));
            offset += size;
        }
        Ok(out)
    }

    /// The layout rendered as `"256A, 3824E"`.
    pub fn layout_string(&self) -> Result<String, Error> {
        let parts: Vec<String> = self
            .layout()?
            .iter()
            .map(|(size, allocated)| format!("{size}{}", if *allocated { "A" } else { "E" }))
            .collect();
        Ok(parts.join(", "))
    }

    /// Log the full heap structure at info level.
    pub fn dump(&self) -> Result<(), Error> {
        self.ensure()?;
        info!("static capacity: {}", self.scap_raw());
        info!("heap capacity: {}", self.hcap_raw());
        let head = self.free_head();
        info!(
            "free list head: {}",
            if head == NPTR { "NPTR".to_owned() } else { head.to_string() }
        );
        info!(
            "entrance offset: {}",
            self.entrance_raw().map_or("null".to_owned(), |o| o.to_string())
        );
        let mut offset = 0;
        while offset < self.hcap_raw() {
            let block = self.block_at(offset);
            info!(
                "block {:#08x} alloc={} prev={} busy={} size={}",
                offset,
                block.allocated() as u8,
                block.prev_allocated() as u8,
                block.busy() as u8,
                block.size()
            );
            offset += block.size();
        }
        Ok(())
    }

    /// Verify the structural invariants of the block list, the free list and
    /// the reachable object graph. Intended for tests and debugging.
    pub fn self_check(&self) -> Result<(), Error> {
        self.ensure()?;
        let corrupt = |detail: String| Error::new(ErrorKind::Corrupt { detail });

        // Blocks tile the heap; P mirrors the previous A; free blocks carry
        // a matching footer; no two free blocks are adjacent.
        let mut free_offsets = Vec::new();
        let mut offset = 0;
        let mut prev_allocated: Option<bool> = None;
        while offset < self.hcap_raw() {
            let block = self.block_at(offset);
            let size = block.size();
            if size < MIN_BLOCK || size % WORD != 0 || offset + size > self.hcap_raw() {
                return Err(corrupt(format!("block at {offset} has impossible size {size}")));
            }
            if let Some(prev_allocated) = prev_allocated {
                if block.prev_allocated() != prev_allocated {
                    return Err(corrupt(format!("block at {offset} has a stale P bit")));
                }
                if !prev_allocated && !block.allocated() {
                    return Err(corrupt(format!("adjacent free blocks at {offset}")));
                }
            }
            if !block.allocated() {
                if block.footer_value() != size as u64 {
                    return Err(corrupt(format!(
                        "free block at {offset} has footer {} for size {size}",
                        block.footer_value()
                    )));
                }
                free_offsets.push(offset);
            }
            prev_allocated = Some(block.allocated());
            offset += size;
        }
        if offset != self.hcap_raw() {
            return Err(corrupt(format!("blocks tile {offset} of {} heap bytes", self.hcap_raw())));
        }

        // The free list visits every free block exactly once and nothing else.
        let head = self.free_head();
        if head == NPTR {
            if !free_offsets.is_empty() {
                return Err(corrupt("free blocks exist but the list is empty".to_owned()));
            }
        } else {
            let mut seen = Vec::new();
            let start = self.block_at(head as usize);
            let mut current = start;
            loop {
                if current.allocated() {
                    return Err(corrupt(format!(
                        "allocated block at {} is on the free list",
                        self.block_offset(current)
                    )));
                }
                seen.push(self.block_offset(current));
                if seen.len() > free_offsets.len() {
                    return Err(corrupt("free list is longer than the set of free blocks".to_owned()));
                }
                current = current.bck();
                if current == start {
                    break;
                }
            }
            seen.sort_unstable();
            if seen != free_offsets {
                return Err(corrupt(format!(
                    "free list {seen:?} disagrees with free blocks {free_offsets:?}"
                )));
            }
        }

        // The object graph hanging off the entrance.
        if let Some(entrance) = self.entrance_raw() {
            crate::obj::verify_graph(self, entrance)?;
        }
        Ok(())
    }

    /// Whether the block holding `offset` is currently allocated. Used by
    /// the object-graph checks.
    pub(crate) fn offset_is_allocated(&self, offset: usize) -> bool {
        self.verify_payload_offset(offset) && self.block_at(offset - WORD).allocated()
    }

    /// Payload size of the block holding `offset`.
    pub(crate) fn payload_size(&self, offset: usize) -> usize {
        self.block_at(offset - WORD).size() - WORD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_includes_header_and_minimum() {
        assert_eq!(required_block_size(1), 32);
        assert_eq!(required_block_size(23), 32);
        assert_eq!(required_block_size(24), 32);
        assert_eq!(required_block_size(25), 40);
        assert_eq!(required_block_size(0x100), 264);
        assert_eq!(required_block_size(0x1FA), 520);
    }

    #[test]
    fn padding_is_power_of_two_aligned() {
        assert_eq!(pad_to(0, 8), 0);
        assert_eq!(pad_to(1, 8), 8);
        assert_eq!(pad_to(8, 8), 8);
        assert_eq!(pad_to(1, 4096), 4096);
        assert_eq!(pad_to(4097, 4096), 8192);
    }
}
