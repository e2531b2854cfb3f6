// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The page provider (component C7): the abstract "obtain / grow / release a
//! contiguous byte region" collaborator the spec treats as external to the
//! engine proper.

mod system;
mod virtual_mem;

pub use system::SystemPageProvider;
pub use virtual_mem::VirtualPageProvider;

use crate::error::{AllocatorError, Result};
use core::alloc::Layout;
use core::ptr::NonNull;

/// Supplies the raw bytes an [`crate::Arena`] uses for its data region and
/// its Page Allocation Table.
///
/// Implementations must return zero-initialized memory from both
/// [`acquire_zeroed`](PageProvider::acquire_zeroed) and
/// [`grow_zeroed`](PageProvider::grow_zeroed) (at minimum, the newly added
/// tail in the latter case): the engine relies on this to satisfy the
/// `FREE_ZERO` contract on freshly obtained pages.
pub trait PageProvider {
    /// Obtains a new zeroed region of exactly `layout.size()` bytes, aligned
    /// to at least `layout.align()`.
    fn acquire_zeroed(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Grows a previously acquired region to `new_layout`, preserving the
    /// first `old_layout.size()` bytes and zeroing the rest.
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior call to
    /// [`acquire_zeroed`](PageProvider::acquire_zeroed) or
    /// [`grow_zeroed`](PageProvider::grow_zeroed) on `self` with `old_layout`,
    /// and not yet released. `new_layout.size() >= old_layout.size()` and
    /// `new_layout.align() == old_layout.align()`.
    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<u8>>;

    /// Releases a region previously obtained from this provider.
    ///
    /// # Safety
    /// `ptr` and `layout` must match a prior acquisition/growth exactly, and
    /// `ptr` must not be used again afterward.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

pub(crate) fn layout_for(total_bytes: usize, align: usize) -> Result<Layout> {
    Layout::from_size_align(total_bytes, align).map_err(|_| AllocatorError::InvalidParameter)
}
