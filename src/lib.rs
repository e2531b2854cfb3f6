// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A page-based byte allocator.
//!
//! [`Arena`] hands out runs of fixed-size pages from one contiguous region,
//! tracking which pages are free or allocated in a 2-bit-per-page Page
//! Allocation Table rather than through any per-allocation header or free
//! list. It is meant as the backend under a conventional malloc-style
//! facade, not as a drop-in [`GlobalAlloc`](std::alloc::GlobalAlloc) itself.
//!
//! # Concurrency
//!
//! An `Arena` has no internal locking: every mutating operation takes
//! `&mut self`, so sharing one across threads is the caller's problem, the
//! same way the engine this crate is modeled on left locking to its
//! callers.
//!
//! # Pointer stability
//!
//! Pointers returned by [`Arena::alloc`] remain valid until freed, resized
//! away, or the arena itself grows past its allocator's in-place limit.
//! [`SystemPageProvider`] may relocate the whole arena on
//! [`Arena::expand`]; [`VirtualPageProvider`] always does. Either way,
//! existing allocation pointers are only meaningful relative to the
//! arena's current base, so a caller that expands an arena holding live
//! pointers into it must translate those pointers itself.

mod align;
mod arena;
mod engine;
mod error;
mod log;
mod pat;
mod provider;

pub use arena::Arena;
pub use error::{AllocatorError, Result};
pub use log::{LogSink, StatusCode};
pub use provider::{PageProvider, SystemPageProvider, VirtualPageProvider};
