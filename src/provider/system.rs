// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::PageProvider;
use crate::error::{AllocatorError, Result};
use core::alloc::Layout;
use core::ptr::NonNull;

/// The default [`PageProvider`]: backed by the process's global allocator,
/// the same `calloc`/`realloc`/`free` triple the allocator this engine is
/// modeled on uses directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPageProvider;

impl PageProvider for SystemPageProvider {
    #[cfg_attr(debug_assertions, track_caller)]
    fn acquire_zeroed(&self, layout: Layout) -> Result<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout has a nonzero size, checked above.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(raw).ok_or(AllocatorError::OutOfMemory)
    }

    #[cfg_attr(debug_assertions, track_caller)]
    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<u8>> {
        debug_assert_eq!(old_layout.align(), new_layout.align());
        debug_assert!(new_layout.size() >= old_layout.size());

        // SAFETY: caller upholds `ptr`/`old_layout` preconditions; `realloc`
        // does not guarantee the grown tail is zeroed, so that's done below.
        let raw = unsafe { std::alloc::realloc(ptr.as_ptr(), old_layout, new_layout.size()) };
        let grown = NonNull::new(raw).ok_or(AllocatorError::OutOfMemory)?;

        let tail_start = old_layout.size();
        let tail_len = new_layout.size() - tail_start;
        if tail_len > 0 {
            // SAFETY: `grown` is valid for `new_layout.size()` bytes, and
            // `tail_start..new_layout.size()` is within that range.
            unsafe {
                grown
                    .as_ptr()
                    .add(tail_start)
                    .write_bytes(0, tail_len);
            }
        }
        Ok(grown)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller upholds `ptr`/`layout` preconditions.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
