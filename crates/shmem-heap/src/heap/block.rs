//! The allocator's view of one heap block.
//!
//! Every block starts with a single header word packing the size together
//! with three low bits: `size | B<<2 | P<<1 | A`. Free blocks additionally
//! carry a footer word equal to `size` at their last word, and two signed
//! link words right after the header splicing them into the circular free
//! list. When a free block is handed out, user data overwrites the links and
//! footer, which is why no block is ever smaller than four words.
//!
//! The header word is accessed atomically: the busy bit is read by
//! traversals racing the write-lock holder's sub-operations. The link and
//! footer words are plain memory, mutated only while holding the write lock
//! and flagged busy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{Error, ErrorKind};

/// Machine word size; every size and offset in the heap is a multiple of it.
pub(crate) const WORD: usize = 8;

/// Smallest legal block: header + fwd + bck + footer.
pub(crate) const MIN_BLOCK: usize = 4 * WORD;

/// Reserved "null offset". Impossible for a real block, which is word-aligned.
pub(crate) const NPTR: u64 = 1;

const A_BIT: u64 = 0b001;
const P_BIT: u64 = 0b010;
const B_BIT: u64 = 0b100;
const SIZE_MASK: u64 = !0b111;

/// A raw handle to a block header somewhere inside the mapped heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block {
    ptr: *mut u8,
}

impl Block {
    /// # Safety
    ///
    /// `ptr` must point at a block header word inside the live mapping.
    #[inline]
    pub(crate) unsafe fn at(ptr: *mut u8) -> Self {
        Self { ptr }
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.ptr as usize
    }

    #[inline]
    fn word(self) -> &'static AtomicU64 {
        // SAFETY: the pointer is word-aligned inside the mapping per `at`;
        // the 'static lifetime never escapes this module's short-lived uses.
        unsafe { AtomicU64::from_ptr(self.ptr.cast()) }
    }

    #[inline]
    pub(crate) fn load(self) -> u64 {
        self.word().load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store(self, value: u64) {
        self.word().store(value, Ordering::Release);
    }

    #[inline]
    pub(crate) fn size(self) -> usize {
        (self.load() & SIZE_MASK) as usize
    }

    #[inline]
    pub(crate) fn allocated(self) -> bool {
        self.load() & A_BIT != 0
    }

    #[inline]
    pub(crate) fn prev_allocated(self) -> bool {
        self.load() & P_BIT != 0
    }

    #[inline]
    pub(crate) fn busy(self) -> bool {
        self.load() & B_BIT != 0
    }

    #[inline]
    pub(crate) fn set_busy(self) {
        self.word().fetch_or(B_BIT, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_busy(self) {
        self.word().fetch_and(!B_BIT, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn set_prev_allocated(self, on: bool) {
        if on {
            self.word().fetch_or(P_BIT, Ordering::AcqRel);
        } else {
            self.word().fetch_and(!P_BIT, Ordering::AcqRel);
        }
    }

    /// Wait for the busy bit to clear.
    ///
    /// `timeout_ms`: -1 waits forever, 0 fails immediately when busy, a
    /// positive value polls that many milliseconds before reporting
    /// [`ErrorKind::Busy`].
    pub(crate) fn wait(self, mut timeout_ms: i64) -> Result<(), Error> {
        while self.busy() {
            if timeout_ms == 0 {
                return Err(Error::new(ErrorKind::Busy));
            }
            thread::sleep(Duration::from_millis(1));
            if timeout_ms > 0 {
                timeout_ms -= 1;
            }
        }
        Ok(())
    }

    // Boundary-tag navigation.

    /// The block physically after this one.
    #[inline]
    pub(crate) fn next(self) -> Block {
        // SAFETY: header plus size lands on the next header or the heap tail;
        // callers bounds-check against the tail before dereferencing.
        unsafe { Block::at(self.ptr.add(self.size())) }
    }

    /// The free block physically before this one, located via its footer.
    /// Only meaningful when `prev_allocated` is false.
    #[inline]
    pub(crate) fn prev(self) -> Block {
        // SAFETY: when P is clear the word below this header is the previous
        // free block's footer, which holds that block's size.
        unsafe {
            let prev_size = (*self.ptr.sub(WORD).cast::<u64>() & SIZE_MASK) as usize;
            Block::at(self.ptr.sub(prev_size))
        }
    }

    fn footer_ptr(self) -> *mut u64 {
        // SAFETY: the footer is the last word of this block.
        unsafe { self.ptr.add(self.size() - WORD).cast() }
    }

    /// Stamp the footer with the current size. Free blocks only.
    #[inline]
    pub(crate) fn write_footer(self) {
        // SAFETY: see footer_ptr; the block extent is inside the heap.
        unsafe { *self.footer_ptr() = self.size() as u64 }
    }

    pub(crate) fn footer_value(self) -> u64 {
        // SAFETY: see footer_ptr.
        unsafe { *self.footer_ptr() }
    }

    /// Rewrite the footer of a merged extent ending at `end_footer_of`.
    pub(crate) fn merged_footer(end_footer_of: Block, size: usize) {
        // SAFETY: end_footer_of still carries the pre-merge size, so its
        // footer word is the last word of the merged extent.
        unsafe { *end_footer_of.footer_ptr() = size as u64 }
    }

    // Free-list links. Plain words; write lock plus busy bits guard them.

    fn link_ptr(self, index: usize) -> *mut i64 {
        // SAFETY: free blocks are at least four words, so words 1 and 2 exist.
        unsafe { self.ptr.add(index * WORD).cast() }
    }

    #[inline]
    pub(crate) fn fwd(self) -> Block {
        // SAFETY: the stored offset is relative to this header and was
        // written by link_self/link_after against a live block.
        unsafe {
            let rel = *self.link_ptr(1);
            Block::at((self.addr() as i64 + rel) as usize as *mut u8)
        }
    }

    #[inline]
    pub(crate) fn bck(self) -> Block {
        // SAFETY: as for fwd.
        unsafe {
            let rel = *self.link_ptr(2);
            Block::at((self.addr() as i64 + rel) as usize as *mut u8)
        }
    }

    fn set_fwd(self, other: Block) {
        // SAFETY: link word 1 of a free block.
        unsafe { *self.link_ptr(1) = other.addr() as i64 - self.addr() as i64 }
    }

    fn set_bck(self, other: Block) {
        // SAFETY: link word 2 of a free block.
        unsafe { *self.link_ptr(2) = other.addr() as i64 - self.addr() as i64 }
    }

    /// Make this block the sole member of the free list.
    pub(crate) fn link_self(self) {
        self.set_fwd(self);
        self.set_bck(self);
    }

    /// Splice this block into the list after `prev`.
    pub(crate) fn link_after(self, prev: Block, timeout_ms: i64) -> Result<(), Error> {
        let fwd = prev;
        let bck = prev.bck();
        fwd.wait(timeout_ms)?;
        fwd.set_busy();
        if bck != fwd {
            if let Err(err) = bck.wait(timeout_ms) {
                fwd.clear_busy();
                return Err(err);
            }
            bck.set_busy();
        }
        self.set_fwd(fwd);
        self.set_bck(bck);
        fwd.set_bck(self);
        bck.set_fwd(self);
        fwd.clear_busy();
        if bck != fwd {
            bck.clear_busy();
        }
        Ok(())
    }

    /// Splice this block out of the list.
    ///
    /// No busy handshake here: unlinking happens inside coalescing, where
    /// the neighbors may already be flagged busy by the caller itself. The
    /// write lock is what makes the splice safe.
    pub(crate) fn unlink(self) {
        let fwd = self.fwd();
        let bck = self.bck();
        if fwd == self {
            // Sole member; the caller resets the list head.
            return;
        }
        fwd.set_bck(bck);
        bck.set_fwd(fwd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    #[test]
    fn header_bits_pack_and_unpack() {
        let mut buf = scratch(8);
        let block = unsafe { Block::at(buf.as_mut_ptr().cast()) };

        block.store(64 | 0b010);
        assert_eq!(block.size(), 64);
        assert!(!block.allocated());
        assert!(block.prev_allocated());
        assert!(!block.busy());

        block.set_busy();
        assert!(block.busy());
        assert_eq!(block.size(), 64);
        block.clear_busy();
        assert!(!block.busy());

        block.set_prev_allocated(false);
        assert!(!block.prev_allocated());
    }

    #[test]
    fn footer_tracks_size() {
        let mut buf = scratch(8);
        let block = unsafe { Block::at(buf.as_mut_ptr().cast()) };
        block.store(4 * WORD as u64);
        block.write_footer();
        assert_eq!(buf[3], 4 * WORD as u64);
    }

    #[test]
    fn circular_links_splice_in_and_out() {
        // Three free blocks of four words each, in one scratch heap.
        let mut buf = scratch(12);
        let base = buf.as_mut_ptr().cast::<u8>();
        let a = unsafe { Block::at(base) };
        let b = unsafe { Block::at(base.add(MIN_BLOCK)) };
        let c = unsafe { Block::at(base.add(2 * MIN_BLOCK)) };
        for block in [a, b, c] {
            block.store(MIN_BLOCK as u64);
        }

        a.link_self();
        assert_eq!(a.fwd(), a);
        assert_eq!(a.bck(), a);

        b.link_after(a, -1).unwrap();
        assert_eq!(a.bck(), b);
        assert_eq!(b.fwd(), a);
        assert_eq!(b.bck(), a);
        assert_eq!(a.fwd(), b);

        c.link_after(a, -1).unwrap();
        assert_eq!(a.bck(), c);
        assert_eq!(c.bck(), b);
        assert_eq!(b.bck(), a);

        c.unlink();
        assert_eq!(a.bck(), b);
        assert_eq!(b.fwd(), a);

        b.unlink();
        assert_eq!(a.bck(), a);
        assert_eq!(a.fwd(), a);
    }

    #[test]
    fn wait_times_out_on_busy_block() {
        let mut buf = scratch(8);
        let block = unsafe { Block::at(buf.as_mut_ptr().cast()) };
        block.store(MIN_BLOCK as u64);
        block.set_busy();
        assert!(matches!(
            block.wait(0).unwrap_err().kind(),
            ErrorKind::Busy
        ));
        assert!(matches!(
            block.wait(2).unwrap_err().kind(),
            ErrorKind::Busy
        ));
        block.clear_busy();
        assert!(block.wait(0).is_ok());
    }
}
