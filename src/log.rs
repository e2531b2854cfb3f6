// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The logging adapter (component C5).
//!
//! Every operation reports a [`StatusCode`] and a human-readable message
//! through an optional caller-supplied [`LogSink`], and unconditionally
//! through the ambient `log` facade so the crate plays well with whatever
//! logger the embedding process has installed.

use core::fmt;

/// Structured status codes reported to the log sink.
///
/// Mirrors the `alloc_code` enum of the allocator this crate's engine is
/// modeled on: one success/error pair per public operation, plus a generic
/// informational `Note` for events that aren't themselves a result (e.g. a
/// resize falling back to the copy path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StatusCode {
    InitializationSuccess,
    InitializationError,
    ExpansionSuccess,
    ExpansionError,
    DeinitializationSuccess,
    DeinitializationError,
    AllocationSuccess,
    AllocationError,
    ReallocationSuccess,
    ReallocationError,
    DeallocationSuccess,
    DeallocationError,
    SizeSuccess,
    SizeError,
    Note,
}

impl StatusCode {
    fn is_error(self) -> bool {
        matches!(
            self,
            Self::InitializationError
                | Self::ExpansionError
                | Self::DeinitializationError
                | Self::AllocationError
                | Self::ReallocationError
                | Self::DeallocationError
                | Self::SizeError
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A caller-supplied event sink.
///
/// Implementations must not call back into the [`crate::Arena`] that invoked
/// them; the engine does not guard against that re-entrancy.
pub trait LogSink {
    fn log(&self, code: StatusCode, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(StatusCode, &str),
{
    fn log(&self, code: StatusCode, message: &str) {
        self(code, message)
    }
}

/// Emits one event to the optional sink and to the `log` facade.
///
/// This is the sole place `StatusCode` is translated into a `log` crate
/// level, keeping that mapping in one spot instead of duplicated at every
/// call site.
pub(crate) fn emit(sink: Option<&dyn LogSink>, code: StatusCode, message: &str) {
    if code.is_error() {
        log::error!("{code}: {message}");
    } else if code == StatusCode::Note {
        log::trace!("{code}: {message}");
    } else {
        log::debug!("{code}: {message}");
    }

    if let Some(sink) = sink {
        sink.log(code, message);
    }
}
