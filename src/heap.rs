//! The public allocator API: `setup`, `clean`, `allocate`, `zero_allocate`,
//! `reallocate`, `free`, plus the diagnostics in [`crate::diagnostics`].

use core::ptr;

use log::{debug, warn};

use crate::block::{FENCE, HEADER_SIZE, Header, PAGE_SIZE, align4, block_end, full_size,
    header_from_payload, high_fence_ptr, low_fence_ptr, payload_ptr};
use crate::diagnostics::{HeapStatus, PointerClass};
use crate::free_list::{coalesce_with_next, insert_between, split_if_room};
use crate::integrity::{checksum_valid, fence_intact, lay_fences, refresh_checksum};
use crate::region::RegionProvider;

struct Region {
    base: usize,
    len: usize,
    head: *mut Header,
    tail: *mut Header,
}

/// A single-owner, single-threaded heap over a region obtained from `R`.
///
/// All mutating operations validate the heap first and refuse to proceed if
/// corruption is detected (§7 of the spec this crate implements): usage
/// errors are no-ops/NULL, never panics, and corruption is reported, never
/// repaired. `Heap` holds raw pointers into its region and is therefore
/// neither `Send` nor `Sync` — callers sharing one across threads must
/// serialize access themselves.
pub struct Heap<R: RegionProvider> {
    provider: R,
    region: Option<Region>,
}

impl<R: RegionProvider> Heap<R> {
    /// Capture the provider's current break as the region base, grow by one
    /// page, and install `HEAD`/`TAIL` sentinels with an empty block list.
    ///
    /// Returns `None` if the provider refuses the initial growth.
    pub fn setup(mut provider: R) -> Option<Self> {
        let base = provider.current_break();
        provider.adjust(PAGE_SIZE as isize).ok()?;

        let head = base as *mut Header;
        let tail = (base + PAGE_SIZE - HEADER_SIZE) as *mut Header;

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

        Some(Self {
            provider,
            region: Some(Region {
                base,
                len: PAGE_SIZE,
                head,
                tail,
            }),
        })
    }

    /// Return the entire region to the provider in one negative adjustment.
    /// No-op if the heap was never set up (or has already been cleaned).
    pub fn clean(&mut self) {
        if let Some(region) = self.region.take() {
            let _ = self.provider.adjust(-(region.len as isize));
        }
    }

    /// Request `pages = required_payload / PAGE_SIZE + 1` additional pages
    /// from the provider and relocate `TAIL` into the newly-grown space,
    /// preserving `TAIL.prev`'s link. Additive only: never moves existing
    /// user blocks.
    fn grow(&mut self, required_payload: usize) -> bool {
        let Some(region) = self.region.as_mut() else {
            return false;
        };
        let pages = required_payload / PAGE_SIZE + 1;
        let extra = pages * PAGE_SIZE;
        let old_tail = region.tail;

        if self.provider.adjust(extra as isize).is_err() {
            warn!("grow: provider refused {} extra bytes ({} pages)", extra, pages);
            return false;
        }
        debug!("grow: region extended by {} bytes ({} pages)", extra, pages);

        let region = self.region.as_mut().expect("region present: checked above");
        region.len += extra;
        let new_tail = (region.base + region.len - HEADER_SIZE) as *mut Header;

        unsafe {
            let old_tail_prev = (*old_tail).prev;
            (*new_tail).prev = old_tail_prev;
            (*new_tail).next = ptr::null_mut();
            (*new_tail).payload_size = 0;
            (*new_tail).free = 0;
            refresh_checksum(new_tail);

            // `old_tail_prev` is null exactly when no user block exists yet
            // (growth triggered by the very first allocation); there is
            // nothing to relink in that case.
            if !old_tail_prev.is_null() {
                (*old_tail_prev).next = new_tail;
                refresh_checksum(old_tail_prev);
            }
        }

        region.tail = new_tail;
        true
    }

    /// Allocate `size` bytes; `size == 0` always returns null.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 || !self.validate().is_ok() {
            return ptr::null_mut();
        }
        let Some(region) = self.region.as_ref() else {
            return ptr::null_mut();
        };
        let (head, tail) = (region.head, region.tail);
        let first = unsafe { (*head).next };

        if first.is_null() {
            return self.allocate_first(size);
        }

        let mut curr = first;
        while curr != tail {
            unsafe {
                let payload_size = (*curr).payload_size;
                if (*curr).is_free() && payload_size >= size {
                    (*curr).free = 0;
                    (*curr).payload_size = size;
                    refresh_checksum(curr);
                    lay_fences(curr);
                    split_if_room(head, tail, curr);
                    return payload_ptr(curr);
                }
                curr = (*curr).next;
            }
        }

        let placed = unsafe { insert_between(head, tail, size, tail) };
        if !placed.is_null() {
            return payload_ptr(placed);
        }

        if !self.grow(size) {
            return ptr::null_mut();
        }
        let region = self.region.as_ref().expect("region present: grow succeeded");
        let placed = unsafe { insert_between(region.head, region.tail, size, region.tail) };
        if placed.is_null() {
            return ptr::null_mut();
        }
        payload_ptr(placed)
    }

    /// Place the very first user block immediately after `HEAD`, growing the
    /// region first if it cannot hold `HEAD + block + TAIL`. If the region
    /// still cannot hold it after growth, the allocation fails and no block
    /// is created — mirroring the reference implementation's behavior of
    /// leaving the first block unset rather than retrying.
    fn allocate_first(&mut self, size: usize) -> *mut u8 {
        let needed_full = HEADER_SIZE + 2 * FENCE + align4(size);

        let fits = |len: usize| needed_full <= len.saturating_sub(2 * HEADER_SIZE);
        let region_len = self.region.as_ref().expect("checked by caller").len;

        if !fits(region_len) {
            if !self.grow(size) {
                return ptr::null_mut();
            }
            let region_len = self.region.as_ref().expect("region present: grow succeeded").len;
            if !fits(region_len) {
                return ptr::null_mut();
            }
        }

        let region = self.region.as_ref().expect("region present");
        let (head, tail) = (region.head, region.tail);
        let new_block = unsafe { (head as *mut u8).add(HEADER_SIZE) } as *mut Header;

        unsafe {
            (*new_block).prev = head;
            (*new_block).next = tail;
            (*new_block).payload_size = size;
            (*new_block).free = 0;

            (*head).next = new_block;
            (*tail).prev = new_block;

            lay_fences(new_block);
            refresh_checksum(new_block);
            refresh_checksum(head);
            refresh_checksum(tail);
        }

        payload_ptr(new_block)
    }

    /// `allocate(count * unit)`, zeroing the payload on success.
    pub fn zero_allocate(&mut self, count: usize, unit: usize) -> *mut u8 {
        if count == 0 || unit == 0 {
            return ptr::null_mut();
        }
        let Some(total) = count.checked_mul(unit) else {
            return ptr::null_mut();
        };
        let p = self.allocate(total);
        if !p.is_null() {
            unsafe {
                ptr::write_bytes(p, 0, total);
            }
        }
        p
    }

    /// Resize the allocation at `p`, following spec.md §4.4's decision tree
    /// (shrink in place, grow-by-coalesce, grow-at-end, or move).
    pub fn reallocate(&mut self, p: *mut u8, size: usize) -> *mut u8 {
        if p.is_null() {
            return self.allocate(size);
        }
        if self.classify(p) != PointerClass::Valid {
            return ptr::null_mut();
        }
        if size == 0 {
            self.free(p);
            return ptr::null_mut();
        }

        let block = header_from_payload(p);
        let region = self.region.as_ref().expect("classify(p) == Valid implies a region");
        let (head, tail) = (region.head, region.tail);
        let current = unsafe { (*block).payload_size };

        if size == current {
            return p;
        }

        if size < current {
            unsafe {
                (*block).payload_size = size;
                refresh_checksum(block);
                lay_fences(block);
                split_if_room(head, tail, block);
            }
            return p;
        }

        let next = unsafe { (*block).next };
        if next != tail && unsafe { (*next).is_free() } {
            let combined = unsafe {
                full_size(head, tail, block) + full_size(head, tail, next) - HEADER_SIZE - 2 * FENCE
            };
            if align4(combined) >= size {
                unsafe {
                    coalesce_with_next(head, tail, block);
                    (*block).payload_size = size;
                    refresh_checksum(block);
                    lay_fences(block);
                    split_if_room(head, tail, block);
                }
                return p;
            }
        }

        if next == tail {
            let deficit = size - current;
            if self.grow(deficit) {
                unsafe {
                    (*block).payload_size = size;
                    refresh_checksum(block);
                    lay_fences(block);
                }
                return p;
            }
        }

        let new_ptr = self.allocate(size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(p, new_ptr, current.min(size));
        }
        self.free(p);
        new_ptr
    }

    /// Free the allocation at `p`. No-op if `p` is null, not a valid
    /// payload pointer, or already free.
    pub fn free(&mut self, p: *mut u8) {
        if p.is_null() || self.classify(p) != PointerClass::Valid {
            return;
        }
        let block = header_from_payload(p);
        let region = self.region.as_ref().expect("classify(p) == Valid implies a region");
        let (head, tail) = (region.head, region.tail);

        unsafe {
            if (*block).is_free() {
                return;
            }
            (*block).free = 1;
            refresh_checksum(block);

            let mut current = block;

            let next = (*current).next;
            if next != tail && (*next).is_free() {
                coalesce_with_next(head, tail, current);
            }

            let prev = (*current).prev;
            if prev != head && (*prev).is_free() {
                coalesce_with_next(head, tail, prev);
                current = prev;
            }

            // Absorb any residual gap up to the successor into this block's
            // payload, so free blocks fully occupy the space up to their
            // successor (invariant 2, with equality). Ordering matters: this
            // must run after both coalesce attempts above.
            let gap_start = block_end(head, tail, current);
            let gap_end = (*current).next as *mut u8;
            if (gap_end as usize) > (gap_start as usize) {
                let gap = gap_end as usize - gap_start as usize;
                (*current).payload_size += gap;
                refresh_checksum(current);
            }
        }
    }

    /// Validate every structural and integrity invariant over the heap.
    ///
    /// Returns [`HeapStatus::Corrupted`] for any structural violation,
    /// [`HeapStatus::FenceBroken`] if structure is intact but a fence or
    /// payload bound is violated, [`HeapStatus::Uninitialized`] if the
    /// region was never set up, else [`HeapStatus::Ok`]. Structural
    /// violations take precedence: the whole list is scanned, and a later
    /// structural failure is reported even if an earlier block's fence was
    /// already found broken.
    pub fn validate(&self) -> HeapStatus {
        let Some(region) = self.region.as_ref() else {
            return HeapStatus::Uninitialized;
        };
        if region.len == 0 || region.head.is_null() || region.tail.is_null() {
            return HeapStatus::Uninitialized;
        }

        let heap_start = region.base;
        let heap_end = region.base + region.len;
        let head = region.head;
        let tail = region.tail;

        unsafe {
            let first = (*head).next;
            if first.is_null() {
                if !(*tail).prev.is_null() {
                    return HeapStatus::Corrupted;
                }
                return HeapStatus::Ok;
            }

            let mut fence_broken = false;
            let mut curr = first;
            while curr != tail {
                let addr = curr as usize;
                if addr < heap_start || addr + HEADER_SIZE > heap_end {
                    warn!("validate: block at {:#x} lies outside the region", addr);
                    return HeapStatus::Corrupted;
                }

                let next = (*curr).next;
                let prevp = (*curr).prev;
                if next.is_null() || prevp.is_null() {
                    warn!("validate: block at {:#x} has a null link", addr);
                    return HeapStatus::Corrupted;
                }
                if next != tail {
                    let naddr = next as usize;
                    if naddr < heap_start || naddr > heap_end {
                        return HeapStatus::Corrupted;
                    }
                }
                if prevp != head {
                    let paddr = prevp as usize;
                    if paddr < heap_start || paddr > heap_end {
                        return HeapStatus::Corrupted;
                    }
                }
                if (*next).prev != curr {
                    warn!("validate: broken next/prev symmetry at {:#x}", addr);
                    return HeapStatus::Corrupted;
                }
                if (*prevp).next != curr {
                    warn!("validate: broken prev/next symmetry at {:#x}", addr);
                    return HeapStatus::Corrupted;
                }
                if !(*curr).free_flag_valid() {
                    warn!("validate: block at {:#x} has an invalid free flag", addr);
                    return HeapStatus::Corrupted;
                }
                if (*curr).payload_size > heap_end - addr {
                    warn!("validate: block at {:#x} claims an oversized payload", addr);
                    return HeapStatus::Corrupted;
                }
                if !checksum_valid(curr) {
                    warn!("validate: checksum mismatch at {:#x}", addr);
                    return HeapStatus::Corrupted;
                }

                if !(*curr).is_free() {
                    let data_start = low_fence_ptr(curr) as usize;
                    let data_end = data_start + 2 * FENCE + (*curr).payload_size;
                    if data_end > heap_end {
                        warn!("validate: block at {:#x} payload runs past the region end", addr);
                        fence_broken = true;
                    } else if !fence_intact(low_fence_ptr(curr)) || !fence_intact(high_fence_ptr(curr)) {
                        warn!("validate: fence broken on block at {:#x}", addr);
                        fence_broken = true;
                    }
                }

                curr = next;
            }

            if fence_broken {
                HeapStatus::FenceBroken
            } else {
                HeapStatus::Ok
            }
        }
    }

    /// Largest `payload_size` among non-free user blocks, or `0` if the
    /// heap is corrupted or has no user blocks.
    pub fn largest_used_block_size(&self) -> usize {
        if !self.validate().is_ok() {
            return 0;
        }
        let Some(region) = self.region.as_ref() else {
            return 0;
        };
        let first = unsafe { (*region.head).next };
        if first.is_null() {
            return 0;
        }

        let mut largest = 0usize;
        let mut curr = first;
        unsafe {
            while curr != region.tail {
                if !(*curr).is_free() {
                    largest = largest.max((*curr).payload_size);
                }
                curr = (*curr).next;
            }
        }
        largest
    }

    /// Classify an arbitrary address relative to the heap's current layout.
    pub fn classify(&self, p: *mut u8) -> PointerClass {
        if p.is_null() {
            return PointerClass::Null;
        }
        let Some(region) = self.region.as_ref() else {
            return PointerClass::Unallocated;
        };

        let first = unsafe { (*region.head).next };
        if first.is_null() {
            return PointerClass::Unallocated;
        }
        if !self.validate().is_ok() {
            return PointerClass::HeapCorrupted;
        }

        let (head, tail) = (region.head, region.tail);
        let paddr = p as usize;
        let mut curr = first;

        unsafe {
            while curr != tail {
                let full = full_size(head, tail, curr);
                let control_block = curr as *mut u8 as usize;
                let last_byte = control_block + full;

                if (*curr).is_free() {
                    if paddr >= control_block && paddr < last_byte {
                        return PointerClass::Unallocated;
                    }
                } else {
                    let low_fence = low_fence_ptr(curr) as usize;
                    let data_start = payload_ptr(curr) as usize;
                    let high_fence = high_fence_ptr(curr) as usize;

                    if paddr >= control_block && paddr < low_fence {
                        return PointerClass::ControlBlock;
                    }
                    if paddr >= low_fence && paddr < data_start {
                        return PointerClass::InsideFences;
                    }
                    if paddr == data_start {
                        return PointerClass::Valid;
                    }
                    if paddr > data_start && paddr < high_fence {
                        return PointerClass::InsideDataBlock;
                    }
                    if paddr >= high_fence && paddr < last_byte {
                        return PointerClass::InsideFences;
                    }
                }

                curr = (*curr).next;
            }
        }

        PointerClass::Unallocated
    }
}
