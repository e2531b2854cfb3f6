// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::PageProvider;
use crate::error::{AllocatorError, Result};
use core::alloc::Layout;
use core::ptr::NonNull;

/// A [`PageProvider`] backed directly by OS virtual memory (`mmap`/`munmap`
/// on Unix, `VirtualAlloc`/`VirtualFree` on Windows) rather than the
/// process's global allocator.
///
/// Intended for arenas that are expected to grow very large: unlike
/// [`crate::SystemPageProvider`], growth never competes with other
/// unrelated heap allocations for contiguous address space up front, at the
/// cost of always relocating on growth (there is no portable in-place
/// `mremap`), which in turn invalidates outstanding pointers into the arena
/// (see the pointer-stability rules in the crate documentation).
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualPageProvider;

impl PageProvider for VirtualPageProvider {
    fn acquire_zeroed(&self, layout: Layout) -> Result<NonNull<u8>> {
        os::map(layout.size())
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<u8>> {
        let grown = os::map(new_layout.size())?;
        // SAFETY: `old_layout.size()` bytes at `ptr` are valid per the
        // caller's contract, and `grown` is valid for `new_layout.size()`
        // bytes, which is >= `old_layout.size()`.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), grown.as_ptr(), old_layout.size());
        }
        // SAFETY: `ptr`/`old_layout` matched a prior `map` call per the
        // caller's contract.
        unsafe { os::unmap(ptr, old_layout.size()) };
        Ok(grown)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller upholds `ptr`/`layout` preconditions.
        unsafe { os::unmap(ptr, layout.size()) };
    }
}

#[cfg(unix)]
mod os {
    use super::*;

    pub(super) fn map(size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(AllocatorError::InvalidParameter);
        }

        let null = core::ptr::null_mut();
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        // SAFETY: these args create a new anonymous mapping, the kernel
        // zero-fills it, akin to `calloc`.
        let result = unsafe { libc::mmap(null, size, prot, flags, -1, 0) };
        if result == libc::MAP_FAILED {
            return Err(AllocatorError::OutOfMemory);
        }

        // SAFETY: a successful anonymous mmap without MAP_FIXED never
        // returns null.
        Ok(unsafe { NonNull::new_unchecked(result.cast()) })
    }

    /// # Safety
    /// `ptr` must be the base of a live mapping of exactly `size` bytes
    /// obtained from [`map`].
    pub(super) unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded from the caller's contract.
        let _ = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use windows_sys::Win32::System::Memory;

    pub(super) fn map(size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(AllocatorError::InvalidParameter);
        }

        let null = core::ptr::null_mut();
        let alloc_type = Memory::MEM_COMMIT | Memory::MEM_RESERVE;
        let protection = Memory::PAGE_READWRITE;
        // SAFETY: these args create a new, zero-initialized allocation.
        let result = unsafe { Memory::VirtualAlloc(null, size, alloc_type, protection) };
        NonNull::new(result.cast()).ok_or(AllocatorError::OutOfMemory)
    }

    /// # Safety
    /// `ptr` must be the base of a live `VirtualAlloc` region obtained from
    /// [`map`].
    pub(super) unsafe fn unmap(ptr: NonNull<u8>, _size: usize) {
        // SAFETY: forwarded from the caller's contract; MEM_RELEASE requires
        // the original base address and a size of 0.
        let _ = unsafe { Memory::VirtualFree(ptr.as_ptr().cast(), 0, Memory::MEM_RELEASE) };
    }
}
