// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// The result taxonomy returned by every operation on [`crate::Arena`].
///
/// `SUCCESS` from the original C-style taxonomy is represented by `Ok(_)`
/// rather than by a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorError {
    /// The page provider failed, the request exceeds the arena's capacity,
    /// or no free run of the needed length exists.
    OutOfMemory,
    /// The pointer is outside the arena, does not point at an `ALLOC_HEAD`,
    /// or its length disagrees with a supplied `old_size`.
    InvalidAddress,
    /// Zero size, a misaligned `page_size`/page count, or another
    /// argument-validation failure.
    InvalidParameter,
    /// The Page Allocation Table was found in a state the engine never
    /// writes, or a page-provider primitive violated its contract.
    Unknown,
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidAddress => "invalid address",
            Self::InvalidParameter => "invalid parameter",
            Self::Unknown => "unknown allocator error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for AllocatorError {}

pub type Result<T> = core::result::Result<T, AllocatorError>;
