//! The doubly-linked block list threaded `HEAD ↔ block₁ ↔ … ↔ blockₙ ↔ TAIL`.
//!
//! Despite the name (carried over from the reference implementation this
//! crate is modeled on), the list threads *every* block in address order —
//! used and free alike — not a list of only-free blocks. Placement,
//! splitting, and coalescing all operate on this single structure.

use core::ptr;

use crate::block::{FENCE, HEADER_SIZE, Header, align4, block_end, full_size};
use crate::integrity::{lay_fences, refresh_checksum};

/// Place a new, used block of `size` payload bytes immediately before
/// `next`, in the gap between `next.prev` and `next`.
///
/// Returns null if `next.prev` is missing or the gap cannot hold the full
/// block (including both fences) without the new block's end crossing
/// `tail`'s address — `tail` occupies a fixed slot and nothing may share or
/// overrun its bytes.
///
/// # Safety
/// `next` must be a live block in the list rooted at `head`/`tail`.
pub unsafe fn insert_between(
    head: *mut Header,
    tail: *mut Header,
    size: usize,
    next: *mut Header,
) -> *mut Header {
    unsafe {
        let prev = (*next).prev;
        if prev.is_null() {
            return ptr::null_mut();
        }

        let addr = block_end(head, tail, prev);
        let needed = HEADER_SIZE + 2 * FENCE + align4(size);
        if (addr as usize).saturating_add(needed) > tail as usize {
            return ptr::null_mut();
        }

        let new_block = addr as *mut Header;
        (*new_block).prev = prev;
        (*new_block).next = next;
        (*new_block).payload_size = size;
        (*new_block).free = 0;

        (*prev).next = new_block;
        (*next).prev = new_block;

        lay_fences(new_block);
        refresh_checksum(new_block);
        refresh_checksum(prev);
        refresh_checksum(next);

        new_block
    }
}

/// Merge `block`'s successor (which must be free) into `block`.
///
/// The absorbed block's fences are discarded; `block`'s payload grows to
/// cover the freed header and fence bytes, re-aligned to [`ALIGN`].
///
/// # Safety
/// `block.next` must be free, must not be `tail`, and both must be live
/// blocks in the list rooted at `head`/`tail`.
pub unsafe fn coalesce_with_next(head: *mut Header, tail: *mut Header, block: *mut Header) {
    unsafe {
        let absorbed = (*block).next;
        debug_assert!(absorbed != tail, "cannot coalesce the TAIL sentinel");
        debug_assert!((*absorbed).is_free());

        let combined =
            full_size(head, tail, block) + full_size(head, tail, absorbed) - HEADER_SIZE - 2 * FENCE;
        (*block).payload_size = align4(combined);

        let after = (*absorbed).next;
        (*block).next = after;
        (*after).prev = block;

        refresh_checksum(block);
        refresh_checksum(after);
    }
}

/// After shrinking `block`, carve a free block from the gap to `block.next`
/// if that gap is large enough to hold at least an empty block's header and
/// fences.
///
/// # Safety
/// `block` must be a live, used block in the list rooted at `head`/`tail`.
pub unsafe fn split_if_room(head: *mut Header, tail: *mut Header, block: *mut Header) {
    unsafe {
        let next = (*block).next;
        let gap_start = block_end(head, tail, block);
        let gap_end = next as *mut u8;
        if (gap_end as usize) < (gap_start as usize) {
            return;
        }
        let gap = gap_end as usize - gap_start as usize;
        let empty_full = HEADER_SIZE + 2 * FENCE;
        if gap < empty_full {
            return;
        }

        let new_block = gap_start as *mut Header;
        (*new_block).prev = block;
        (*new_block).next = next;
        (*new_block).payload_size = gap - empty_full;
        (*new_block).free = 1;

        (*block).next = new_block;
        (*next).prev = new_block;

        lay_fences(new_block);
        refresh_checksum(new_block);
        refresh_checksum(block);
        refresh_checksum(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::refresh_checksum;

    /// A bare head/tail pair with a fixed gap between them, enough to host
    /// one small user block. Mirrors the layout `Heap::setup` would produce.
    struct Fixture {
        storage: alloc::vec::Vec<u8>,
        head: *mut Header,
        tail: *mut Header,
    }

    impl Fixture {
        fn new(gap: usize) -> Self {
            let len = 2 * HEADER_SIZE + gap;
            let mut storage = alloc::vec![0u8; len];
            let base = storage.as_mut_ptr();
            let head = base as *mut Header;
            let tail = unsafe { base.add(len - HEADER_SIZE) } as *mut Header;
            unsafe {
                (*head).prev = ptr::null_mut();
                (*head).next = ptr::null_mut();
                (*head).payload_size = 0;
                (*head).free = 0;
                refresh_checksum(head);
                (*tail).prev = ptr::null_mut();
                (*tail).next = ptr::null_mut();
                (*tail).payload_size = 0;
                (*tail).free = 0;
                refresh_checksum(tail);
            }
            Self { storage, head, tail }
        }
    }

    #[test]
    fn test_insert_between_places_block_right_after_prev() {
        let fixture = Fixture::new(128);
        unsafe {
            (*fixture.head).next = fixture.tail;
            (*fixture.tail).prev = fixture.head;
        }
        let block = unsafe { insert_between(fixture.head, fixture.tail, 16, fixture.tail) };
        assert!(!block.is_null());
        unsafe {
            assert_eq!((*block).prev, fixture.head);
            assert_eq!((*block).next, fixture.tail);
            assert_eq!((*block).payload_size, 16);
            assert_eq!((*fixture.head).next, block);
            assert_eq!((*fixture.tail).prev, block);
        }
    }

    #[test]
    fn test_insert_between_fails_when_gap_too_small() {
        let fixture = Fixture::new(4);
        unsafe {
            (*fixture.head).next = fixture.tail;
            (*fixture.tail).prev = fixture.head;
        }
        let block = unsafe { insert_between(fixture.head, fixture.tail, 64, fixture.tail) };
        assert!(block.is_null());
    }

    #[test]
    fn test_coalesce_with_next_merges_into_one_free_block() {
        let fixture = Fixture::new(256);
        let a = unsafe { insert_between(fixture.head, fixture.tail, 16, fixture.tail) };
        let b = unsafe { insert_between(fixture.head, fixture.tail, 16, fixture.tail) };
        assert!(!a.is_null() && !b.is_null());
        unsafe {
            (*a).free = 1;
            refresh_checksum(a);
            (*b).free = 1;
            refresh_checksum(b);
            let before = full_size(fixture.head, fixture.tail, a) + full_size(fixture.head, fixture.tail, b);
            coalesce_with_next(fixture.head, fixture.tail, a);
            assert_eq!((*a).next, fixture.tail);
            assert_eq!((*fixture.tail).prev, a);
            assert_eq!(full_size(fixture.head, fixture.tail, a), before - HEADER_SIZE);
        }
    }

    #[test]
    fn test_split_if_room_carves_a_free_residue() {
        let fixture = Fixture::new(256);
        unsafe {
            (*fixture.head).next = fixture.tail;
            (*fixture.tail).prev = fixture.head;
        }
        let block = unsafe { insert_between(fixture.head, fixture.tail, 200, fixture.tail) };
        assert!(!block.is_null());
        unsafe {
            (*block).payload_size = 8;
            refresh_checksum(block);
            split_if_room(fixture.head, fixture.tail, block);
            let residue = (*block).next;
            assert_ne!(residue, fixture.tail);
            assert!((*residue).is_free());
            assert_eq!((*residue).next, fixture.tail);
        }
    }

    #[test]
    fn test_split_if_room_does_nothing_when_gap_too_small() {
        let fixture = Fixture::new(64);
        unsafe {
            (*fixture.head).next = fixture.tail;
            (*fixture.tail).prev = fixture.head;
        }
        let block = unsafe { insert_between(fixture.head, fixture.tail, 48, fixture.tail) };
        assert!(!block.is_null());
        unsafe {
            let next_before = (*block).next;
            split_if_room(fixture.head, fixture.tail, block);
            assert_eq!((*block).next, next_before);
        }
    }
}
