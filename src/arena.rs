// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The Arena (component C1): owns the data region and the Page Allocation
//! Table, and realizes the public surface (component C6) as inherent
//! methods.

use crate::error::{AllocatorError, Result};
use crate::log::{self, LogSink, StatusCode};
use crate::pat::PageTable;
use crate::provider::{layout_for, PageProvider, SystemPageProvider};
use core::alloc::Layout;
use core::ptr::NonNull;

/// The base alignment every Arena guarantees for its data region.
///
/// This is what makes the fast path in [`crate::align::satisfies`] sound:
/// `page_size` is always a multiple of 64, and the arena's base address is
/// always aligned to at least 64 bytes.
const BASE_ALIGN: usize = 64;

fn data_layout(page_size: u32, pages: u32) -> Result<Layout> {
    let total = (page_size as usize)
        .checked_mul(pages as usize)
        .ok_or(AllocatorError::InvalidParameter)?;
    layout_for(total, BASE_ALIGN)
}

fn pat_layout(pages: u32) -> Result<Layout> {
    layout_for(PageTable::byte_len(pages), BASE_ALIGN)
}

/// A page-based byte allocator: one contiguous data region plus the bit-packed
/// Page Allocation Table describing it.
///
/// `Arena` is single-owner (see the crate-level docs on concurrency): every
/// mutating operation takes `&mut self`, so the borrow checker is the thing
/// standing in for the external lock the original C API asked callers to
/// provide.
pub struct Arena<P: PageProvider = SystemPageProvider> {
    pub(crate) data: NonNull<u8>,
    pub(crate) pat: NonNull<u8>,
    pub(crate) page_size: u32,
    pub(crate) allocated_pages: u32,
    provider: P,
    pub(crate) sink: Option<Box<dyn LogSink>>,
    released: bool,
}

impl Arena<SystemPageProvider> {
    /// Creates an arena backed by the process's global allocator.
    ///
    /// `page_size` must be a positive multiple of 64; `initial_pages` must
    /// be a positive multiple of 4.
    pub fn init(
        page_size: u32,
        initial_pages: u32,
        sink: Option<Box<dyn LogSink>>,
    ) -> Result<Self> {
        Self::init_in(page_size, initial_pages, sink, SystemPageProvider)
    }
}

impl<P: PageProvider> Arena<P> {
    /// Creates an arena backed by a caller-chosen [`PageProvider`].
    pub fn init_in(
        page_size: u32,
        initial_pages: u32,
        sink: Option<Box<dyn LogSink>>,
        provider: P,
    ) -> Result<Self> {
        let sink_ref = sink.as_deref();

        if page_size == 0 || page_size % 64 != 0 {
            log::emit(
                sink_ref,
                StatusCode::InitializationError,
                "page size must be a positive multiple of 64 bytes",
            );
            return Err(AllocatorError::InvalidParameter);
        }
        if initial_pages == 0 || initial_pages % 4 != 0 {
            log::emit(
                sink_ref,
                StatusCode::InitializationError,
                "initial page count must be a positive multiple of 4",
            );
            return Err(AllocatorError::InvalidParameter);
        }

        let data_layout = data_layout(page_size, initial_pages)?;
        let pat_layout = pat_layout(initial_pages)?;

        let data = provider.acquire_zeroed(data_layout).map_err(|err| {
            log::emit(
                sink_ref,
                StatusCode::InitializationError,
                "ran out of system memory allocating the data region",
            );
            err
        })?;
        let pat = match provider.acquire_zeroed(pat_layout) {
            Ok(pat) => pat,
            Err(err) => {
                // SAFETY: `data` was just acquired from `provider` with
                // `data_layout` and hasn't been released yet.
                unsafe { provider.release(data, data_layout) };
                log::emit(
                    sink_ref,
                    StatusCode::InitializationError,
                    "ran out of system memory allocating the Page Allocation Table",
                );
                return Err(err);
            }
        };

        log::emit(
            sink_ref,
            StatusCode::InitializationSuccess,
            "initialized the allocator's memory pages",
        );

        Ok(Self {
            data,
            pat,
            page_size,
            allocated_pages: initial_pages,
            provider,
            sink,
            released: false,
        })
    }

    /// Grows the arena to `new_pages` pages, preserving the existing data
    /// and PAT contents. A no-op (and success) if `new_pages` does not
    /// exceed the current page count.
    pub fn expand(&mut self, new_pages: u32) -> Result<()> {
        let sink_ref = self.sink.as_deref();

        if new_pages % 4 != 0 {
            log::emit(
                sink_ref,
                StatusCode::ExpansionError,
                "new page count must be a multiple of 4",
            );
            return Err(AllocatorError::InvalidParameter);
        }
        if new_pages <= self.allocated_pages {
            log::emit(
                sink_ref,
                StatusCode::ExpansionSuccess,
                "requested page count does not exceed the current size",
            );
            return Ok(());
        }

        let old_data_layout = data_layout(self.page_size, self.allocated_pages)?;
        let old_pat_layout = pat_layout(self.allocated_pages)?;
        let new_data_layout = data_layout(self.page_size, new_pages)?;
        let new_pat_layout = pat_layout(new_pages)?;

        // SAFETY: `self.pat`/`old_pat_layout` match the provider call that
        // produced them, and the new layout only grows the size.
        let new_pat = unsafe {
            self.provider
                .grow_zeroed(self.pat, old_pat_layout, new_pat_layout)
        }
        .map_err(|err| {
            log::emit(
                sink_ref,
                StatusCode::ExpansionError,
                "ran out of system memory expanding the Page Allocation Table",
            );
            err
        })?;
        self.pat = new_pat;

        // SAFETY: `self.data`/`old_data_layout` match the provider call that
        // produced them, and the new layout only grows the size.
        let new_data = unsafe {
            self.provider
                .grow_zeroed(self.data, old_data_layout, new_data_layout)
        }
        .map_err(|err| {
            log::emit(
                sink_ref,
                StatusCode::ExpansionError,
                "ran out of system memory expanding the memory pages",
            );
            err
        })?;
        self.data = new_data;
        self.allocated_pages = new_pages;

        log::emit(
            sink_ref,
            StatusCode::ExpansionSuccess,
            "expanded the allocator's memory pages",
        );
        Ok(())
    }

    /// Releases the arena's regions. No allocations may be outstanding;
    /// using a pointer derived from this arena afterward is the caller's
    /// bug, not something this function can detect.
    pub fn deinit(mut self) -> Result<()> {
        self.release_regions();
        log::emit(
            self.sink.as_deref(),
            StatusCode::DeinitializationSuccess,
            "deinitialized the allocator's memory pages",
        );
        Ok(())
    }

    fn release_regions(&mut self) {
        if self.released {
            return;
        }
        // These layouts were valid at construction/last successful expand,
        // so reconstructing them here cannot fail.
        let data_layout = data_layout(self.page_size, self.allocated_pages)
            .expect("arena's data layout was valid at construction");
        let pat_layout = pat_layout(self.allocated_pages)
            .expect("arena's PAT layout was valid at construction");

        // SAFETY: `self.data`/`self.pat` were obtained from `self.provider`
        // with exactly these layouts and haven't been released before (the
        // `released` flag above).
        unsafe {
            self.provider.release(self.data, data_layout);
            self.provider.release(self.pat, pat_layout);
        }
        self.released = true;
    }

    pub(crate) fn base_address(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

/// Releases the arena's regions if [`Arena::deinit`] was never called, so
/// ordinary scope-based cleanup can never leak. This is an idiomatic Rust
/// addition on top of the original explicit-deinit contract, not a change
/// to it.
impl<P: PageProvider> Drop for Arena<P> {
    fn drop(&mut self) {
        self.release_regions();
    }
}
