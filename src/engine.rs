// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The allocator engine (component C4): the first-fit scan, the two-phase
//! commit that backs every mutating PAT update, and the resize decision
//! tree. Implemented as inherent methods on [`crate::Arena`].

use crate::align;
use crate::arena::Arena;
use crate::error::{AllocatorError, Result};
use crate::log::{self, StatusCode};
use crate::pat::{PageState, PageTable};
use crate::provider::PageProvider;
use core::ptr::NonNull;

fn pages_needed(size: usize, page_size: u32) -> usize {
    // `div_ceil` computes `quotient + (remainder > 0) as usize` rather than
    // `(size + page_size - 1) / page_size`, so it can't wrap around for
    // `size` near `usize::MAX` the way the naive formula does.
    size.div_ceil(page_size as usize)
}

impl<P: PageProvider> Arena<P> {
    /// Finds and marks a free run of pages large enough for `size` bytes.
    ///
    /// `alignment_bits` constrains where the run may start (0 means no
    /// constraint); `offset_to_alignment` shifts the point within the
    /// returned block that must satisfy it. When `zeroed` is set, any page
    /// reused from `FREE_DIRTY` is cleared before being handed back.
    pub fn alloc(
        &mut self,
        size: usize,
        alignment_bits: u32,
        offset_to_alignment: usize,
        zeroed: bool,
    ) -> Result<NonNull<u8>> {
        let sink = self.sink.as_deref();

        if size == 0 {
            log::emit(
                sink,
                StatusCode::AllocationError,
                "attempted to allocate 0 bytes",
            );
            return Err(AllocatorError::InvalidParameter);
        }

        let page_size = self.page_size;
        let allocated_pages = self.allocated_pages as usize;
        let needed = pages_needed(size, page_size);
        if needed > allocated_pages {
            log::emit(
                sink,
                StatusCode::AllocationError,
                "requested size exceeds the arena's capacity",
            );
            return Err(AllocatorError::OutOfMemory);
        }

        let base = self.base_address();
        let pat_ptr = self.pat;
        let pat_len = PageTable::byte_len(self.allocated_pages);

        let head = {
            // SAFETY: `pat_ptr` is valid for `pat_len` bytes for the life of
            // `self`; this borrow does not outlive the block.
            let pat = unsafe { core::slice::from_raw_parts(pat_ptr.as_ptr(), pat_len) };

            let mut run_start: Option<usize> = None;
            let mut run_length = 0usize;
            let mut found = None;
            for i in 0..allocated_pages {
                if PageTable::get(pat, i).is_free() {
                    match run_start {
                        None => {
                            if alignment_bits == 0
                                || align::satisfies(base, page_size, i, alignment_bits, offset_to_alignment)
                            {
                                run_start = Some(i);
                                run_length = 1;
                            } else {
                                continue;
                            }
                        }
                        Some(_) => run_length += 1,
                    }
                    if run_length >= needed {
                        found = run_start;
                        break;
                    }
                } else {
                    run_start = None;
                    run_length = 0;
                }
            }
            found
        };

        let head = match head {
            Some(head) => head,
            None => {
                log::emit(
                    sink,
                    StatusCode::AllocationError,
                    "no free run of sufficient length due to use or fragmentation",
                );
                return Err(AllocatorError::OutOfMemory);
            }
        };

        // Validate before mutating anything, so a partial commit never
        // happens: either every page in the run becomes allocated, or none
        // do.
        {
            // SAFETY: as above.
            let pat = unsafe { core::slice::from_raw_parts(pat_ptr.as_ptr(), pat_len) };
            for idx in head..head + needed {
                if PageTable::get(pat, idx).is_allocated() {
                    log::emit(
                        sink,
                        StatusCode::AllocationError,
                        "Page Allocation Table was externally corrupted",
                    );
                    return Err(AllocatorError::Unknown);
                }
            }
        }

        let data_ptr = self.data;
        {
            // SAFETY: as above, mutable this time; the immutable borrow
            // above has already ended.
            let pat = unsafe { core::slice::from_raw_parts_mut(pat_ptr.as_ptr(), pat_len) };
            for (offset, idx) in (head..head + needed).enumerate() {
                let state = PageTable::get(pat, idx);
                if zeroed && state == PageState::FreeDirty {
                    // SAFETY: `idx` is within the arena, and `page_size`
                    // bytes at this offset belong to the data region.
                    unsafe {
                        data_ptr
                            .as_ptr()
                            .add(idx * page_size as usize)
                            .write_bytes(0, page_size as usize);
                    }
                }
                let new_state = if offset == 0 {
                    PageState::AllocHead
                } else {
                    PageState::AllocTail
                };
                PageTable::set(pat, idx, new_state);
            }
        }

        log::emit(sink, StatusCode::AllocationSuccess, "allocated memory");
        // SAFETY: `head` is a valid page index within the data region, which
        // is non-null.
        Ok(unsafe { NonNull::new_unchecked(data_ptr.as_ptr().add(head * page_size as usize)) })
    }

    /// Returns the head page index and page count of the allocation
    /// starting at `ptr`, or `InvalidAddress` if `ptr` is not the start of
    /// a live allocation in this arena.
    fn allocation_run(&self, ptr: NonNull<u8>) -> Result<(usize, usize)> {
        let base = self.base_address();
        let addr = ptr.as_ptr() as usize;
        if addr < base {
            return Err(AllocatorError::InvalidAddress);
        }
        let diff = addr - base;
        let page_size = self.page_size as usize;
        if diff % page_size != 0 {
            return Err(AllocatorError::InvalidAddress);
        }
        let head = diff / page_size;
        let allocated_pages = self.allocated_pages as usize;
        if head >= allocated_pages {
            return Err(AllocatorError::InvalidAddress);
        }

        let pat_len = PageTable::byte_len(self.allocated_pages);
        // SAFETY: `self.pat` is valid for `pat_len` bytes for the life of
        // `self`.
        let pat = unsafe { core::slice::from_raw_parts(self.pat.as_ptr(), pat_len) };
        if PageTable::get(pat, head) != PageState::AllocHead {
            return Err(AllocatorError::InvalidAddress);
        }

        let mut pages = 1;
        for idx in (head + 1)..allocated_pages {
            if PageTable::get(pat, idx) == PageState::AllocTail {
                pages += 1;
            } else {
                break;
            }
        }
        Ok((head, pages))
    }

    /// Returns the size in bytes of the allocation starting at `ptr`.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Result<usize> {
        let sink = self.sink.as_deref();
        match self.allocation_run(ptr) {
            Ok((_, pages)) => {
                log::emit(sink, StatusCode::SizeSuccess, "reported allocation size");
                Ok(pages * self.page_size as usize)
            }
            Err(err) => {
                log::emit(
                    sink,
                    StatusCode::SizeError,
                    "pointer does not point at an allocation head",
                );
                Err(err)
            }
        }
    }

    /// Releases the allocation starting at `ptr`.
    ///
    /// `old_size`, when known, is cross-checked against the allocation's
    /// actual page-quantized length; a mismatch is treated as caller error
    /// rather than silently ignored.
    pub fn free(&mut self, ptr: NonNull<u8>, old_size: Option<usize>) -> Result<()> {
        let sink = self.sink.as_deref();
        let (head, pages) = self.allocation_run(ptr).map_err(|err| {
            log::emit(
                sink,
                StatusCode::DeallocationError,
                "pointer does not point at a live allocation in this arena",
            );
            err
        })?;

        if let Some(old_size) = old_size {
            if pages_needed(old_size, self.page_size) != pages {
                log::emit(
                    sink,
                    StatusCode::DeallocationError,
                    "old_size does not match the allocation's actual length",
                );
                return Err(AllocatorError::InvalidAddress);
            }
        }

        let pat_len = PageTable::byte_len(self.allocated_pages);
        // SAFETY: `self.pat` is valid for `pat_len` bytes for the life of
        // `self`.
        let pat = unsafe { core::slice::from_raw_parts_mut(self.pat.as_ptr(), pat_len) };
        for idx in head..head + pages {
            PageTable::set(pat, idx, PageState::FreeDirty);
        }

        log::emit(
            sink,
            StatusCode::DeallocationSuccess,
            "deallocated memory, pages marked dirty",
        );
        Ok(())
    }

    /// Resizes the allocation starting at `old_ptr` to `new_size` bytes.
    ///
    /// Tries, in order: a same-page-count no-op, shrinking in place, growing
    /// in place, then growing by copying to a new location. Growing by copy
    /// is only attempted when `allow_reloc` is set; otherwise an alignment
    /// or space failure that would require relocation is reported directly.
    #[allow(clippy::too_many_arguments)]
    pub fn resize(
        &mut self,
        old_ptr: NonNull<u8>,
        old_size: Option<usize>,
        new_size: usize,
        alignment_bits: u32,
        offset_to_alignment: usize,
        allow_reloc: bool,
        zero_new: bool,
    ) -> Result<NonNull<u8>> {
        let sink = self.sink.as_deref();

        if new_size == 0 {
            log::emit(
                sink,
                StatusCode::ReallocationError,
                "attempted to resize to 0 bytes",
            );
            return Err(AllocatorError::InvalidParameter);
        }

        let page_size = self.page_size;
        let new_pages = pages_needed(new_size, page_size);
        if new_pages > self.allocated_pages as usize {
            log::emit(
                sink,
                StatusCode::ReallocationError,
                "requested size exceeds the arena's capacity",
            );
            return Err(AllocatorError::OutOfMemory);
        }

        let (head, old_pages) = self.allocation_run(old_ptr).map_err(|err| {
            log::emit(
                sink,
                StatusCode::ReallocationError,
                "pointer does not point at a live allocation in this arena",
            );
            err
        })?;

        if let Some(old_size) = old_size {
            if pages_needed(old_size, page_size) != old_pages {
                log::emit(
                    sink,
                    StatusCode::ReallocationError,
                    "old_size does not match the allocation's actual length",
                );
                return Err(AllocatorError::InvalidAddress);
            }
        }

        let base = self.base_address();
        if alignment_bits != 0
            && !align::satisfies(base, page_size, head, alignment_bits, offset_to_alignment)
        {
            if allow_reloc {
                log::emit(
                    sink,
                    StatusCode::Note,
                    "resize falling back to the copy path due to an alignment mismatch",
                );
                return self.resize_copy(
                    old_ptr,
                    old_pages * page_size as usize,
                    new_size,
                    alignment_bits,
                    offset_to_alignment,
                    zero_new,
                );
            }
            log::emit(
                sink,
                StatusCode::ReallocationError,
                "current placement does not satisfy the requested alignment and relocation is not allowed",
            );
            return Err(AllocatorError::InvalidAddress);
        }

        if new_pages == old_pages {
            log::emit(
                sink,
                StatusCode::ReallocationSuccess,
                "resized to the same page count",
            );
            return Ok(old_ptr);
        }

        if new_pages < old_pages {
            let pat_len = PageTable::byte_len(self.allocated_pages);
            // SAFETY: `self.pat` is valid for `pat_len` bytes for the life
            // of `self`.
            let pat = unsafe { core::slice::from_raw_parts_mut(self.pat.as_ptr(), pat_len) };
            for idx in (head + new_pages)..(head + old_pages) {
                PageTable::set(pat, idx, PageState::FreeDirty);
            }
            log::emit(
                sink,
                StatusCode::ReallocationSuccess,
                "shrunk in place, freed tail pages marked dirty",
            );
            return Ok(old_ptr);
        }

        let allocated_pages = self.allocated_pages as usize;
        let pat_len = PageTable::byte_len(self.allocated_pages);
        let fits_in_place = {
            // SAFETY: as above.
            let pat = unsafe { core::slice::from_raw_parts(self.pat.as_ptr(), pat_len) };
            (head + old_pages..head + new_pages)
                .all(|idx| idx < allocated_pages && PageTable::get(pat, idx).is_free())
        };

        if fits_in_place {
            let data_ptr = self.data;
            // SAFETY: as above, mutable.
            let pat = unsafe { core::slice::from_raw_parts_mut(self.pat.as_ptr(), pat_len) };
            for idx in (head + old_pages)..(head + new_pages) {
                let state = PageTable::get(pat, idx);
                if zero_new && state == PageState::FreeDirty {
                    // SAFETY: `idx` is within the arena.
                    unsafe {
                        data_ptr
                            .as_ptr()
                            .add(idx * page_size as usize)
                            .write_bytes(0, page_size as usize);
                    }
                }
                PageTable::set(pat, idx, PageState::AllocTail);
            }
            log::emit(
                sink,
                StatusCode::ReallocationSuccess,
                "grew in place",
            );
            return Ok(old_ptr);
        }

        if !allow_reloc {
            log::emit(
                sink,
                StatusCode::ReallocationError,
                "insufficient contiguous space to grow in place and relocation is not allowed",
            );
            return Err(AllocatorError::OutOfMemory);
        }

        log::emit(
            sink,
            StatusCode::Note,
            "resize falling back to the copy path due to insufficient in-place space",
        );
        self.resize_copy(
            old_ptr,
            old_pages * page_size as usize,
            new_size,
            alignment_bits,
            offset_to_alignment,
            zero_new,
        )
    }

    fn resize_copy(
        &mut self,
        old_ptr: NonNull<u8>,
        old_size_bytes: usize,
        new_size: usize,
        alignment_bits: u32,
        offset_to_alignment: usize,
        zero_new: bool,
    ) -> Result<NonNull<u8>> {
        let new_ptr = self.alloc(new_size, alignment_bits, offset_to_alignment, zero_new)?;
        let copy_len = old_size_bytes.min(new_size);
        // SAFETY: `old_ptr` is valid for `old_size_bytes` bytes (the
        // allocation's actual length), `new_ptr` is freshly allocated for at
        // least `new_size` bytes, and the two regions cannot overlap since
        // `new_ptr` was just carved out of currently-free pages.
        unsafe {
            core::ptr::copy_nonoverlapping(old_ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        }
        self.free(old_ptr, Some(old_size_bytes))?;
        log::emit(
            self.sink.as_deref(),
            StatusCode::ReallocationSuccess,
            "reallocated by copying to a new location",
        );
        Ok(new_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn arena(page_size: u32, pages: u32) -> Arena {
        Arena::init(page_size, pages, None).unwrap()
    }

    #[test]
    fn alloc_rejects_zero_size() {
        let mut a = arena(64, 4);
        assert_eq!(
            a.alloc(0, 0, 0, false).unwrap_err(),
            AllocatorError::InvalidParameter
        );
    }

    #[test]
    fn alloc_rejects_oversized_request() {
        let mut a = arena(64, 4);
        assert_eq!(
            a.alloc(64 * 5, 0, 0, false).unwrap_err(),
            AllocatorError::OutOfMemory
        );
    }

    #[test]
    fn alloc_rejects_size_near_usize_max_without_overflowing() {
        let mut a = arena(64, 4);
        assert_eq!(
            a.alloc(usize::MAX - 10, 0, 0, false).unwrap_err(),
            AllocatorError::OutOfMemory
        );
    }

    #[test]
    fn alloc_marks_head_and_tail() {
        let mut a = arena(64, 4);
        let ptr = a.alloc(64 * 3, 0, 0, false).unwrap();
        assert_eq!(ptr.as_ptr(), a.data.as_ptr());
        assert_eq!(a.size_of(ptr).unwrap(), 64 * 3);
    }

    #[test]
    fn alloc_rounds_up_to_whole_pages() {
        let mut a = arena(64, 4);
        let ptr = a.alloc(1, 0, 0, false).unwrap();
        assert_eq!(a.size_of(ptr).unwrap(), 64);
    }

    #[test]
    fn second_alloc_skips_first() {
        let mut a = arena(64, 4);
        let first = a.alloc(64, 0, 0, false).unwrap();
        let second = a.alloc(64, 0, 0, false).unwrap();
        assert_ne!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn free_then_realloc_reuses_pages() {
        let mut a = arena(64, 4);
        let first = a.alloc(64 * 4, 0, 0, false).unwrap();
        a.free(first, None).unwrap();
        let second = a.alloc(64 * 4, 0, 0, false).unwrap();
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn free_rejects_mismatched_old_size() {
        let mut a = arena(64, 4);
        let ptr = a.alloc(64, 0, 0, false).unwrap();
        assert_eq!(
            a.free(ptr, Some(64 * 2)).unwrap_err(),
            AllocatorError::InvalidAddress
        );
    }

    #[test]
    fn free_rejects_interior_pointer() {
        let mut a = arena(64, 4);
        let ptr = a.alloc(64 * 2, 0, 0, false).unwrap();
        let interior = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(64)) };
        assert_eq!(
            a.free(interior, None).unwrap_err(),
            AllocatorError::InvalidAddress
        );
    }

    #[test]
    fn size_of_rejects_foreign_pointer() {
        let a = arena(64, 4);
        let mut other = [0u8; 64];
        let ptr = NonNull::new(other.as_mut_ptr()).unwrap();
        assert_eq!(a.size_of(ptr).unwrap_err(), AllocatorError::InvalidAddress);
    }

    #[test]
    fn resize_same_page_count_is_noop() {
        let mut a = arena(64, 4);
        let ptr = a.alloc(32, 0, 0, false).unwrap();
        let resized = a.resize(ptr, None, 40, 0, 0, true, false).unwrap();
        assert_eq!(ptr.as_ptr(), resized.as_ptr());
    }

    #[test]
    fn resize_shrink_frees_tail() {
        let mut a = arena(64, 4);
        let ptr = a.alloc(64 * 3, 0, 0, false).unwrap();
        let resized = a.resize(ptr, None, 64, 0, 0, true, false).unwrap();
        assert_eq!(ptr.as_ptr(), resized.as_ptr());
        assert_eq!(a.size_of(ptr).unwrap(), 64);
        // The freed pages are available for a new allocation.
        let other = a.alloc(64 * 2, 0, 0, false).unwrap();
        assert_eq!(other.as_ptr(), unsafe { ptr.as_ptr().add(64) });
    }

    #[test]
    fn resize_grows_in_place_when_tail_is_free() {
        let mut a = arena(64, 4);
        let ptr = a.alloc(64, 0, 0, false).unwrap();
        let resized = a.resize(ptr, None, 64 * 3, 0, 0, true, false).unwrap();
        assert_eq!(ptr.as_ptr(), resized.as_ptr());
        assert_eq!(a.size_of(ptr).unwrap(), 64 * 3);
    }

    #[test]
    fn resize_grows_by_copy_when_tail_is_taken() {
        let mut a = arena(64, 4);
        let first = a.alloc(64, 0, 0, false).unwrap();
        let blocker = a.alloc(64, 0, 0, false).unwrap();
        unsafe { first.as_ptr().write_bytes(0x42, 64) };

        let resized = a.resize(first, None, 64 * 3, 0, 0, true, false).unwrap();
        assert_ne!(resized.as_ptr(), first.as_ptr());
        assert_eq!(a.size_of(resized).unwrap(), 64 * 3);
        let bytes = unsafe { core::slice::from_raw_parts(resized.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0x42));
        // The blocker is untouched and still allocated.
        assert_eq!(a.size_of(blocker).unwrap(), 64);
    }

    #[test]
    fn resize_without_reloc_fails_when_relocation_would_be_needed() {
        let mut a = arena(64, 4);
        let first = a.alloc(64, 0, 0, false).unwrap();
        let _blocker = a.alloc(64, 0, 0, false).unwrap();
        assert_eq!(
            a.resize(first, None, 64 * 3, 0, 0, false, false).unwrap_err(),
            AllocatorError::OutOfMemory
        );
    }

    #[test]
    fn resize_rejects_oversized_request() {
        let mut a = arena(64, 4);
        let ptr = a.alloc(64, 0, 0, false).unwrap();
        assert_eq!(
            a.resize(ptr, None, 64 * 5, 0, 0, true, false).unwrap_err(),
            AllocatorError::OutOfMemory
        );
    }
}
