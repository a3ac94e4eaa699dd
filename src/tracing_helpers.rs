//! Zero-cost tracing helpers.
//!
//! When the `tracing` feature is enabled these macros forward to the
//! `tracing` crate; otherwise they compile to nothing.
//!
//! ```bash
//! # Normal build - no tracing overhead
//! cargo build --release
//!
//! # Run a test with restart/structure events visible
//! RUST_LOG=artree=trace cargo test --features tracing concurrent
//! ```

#![allow(unused_macros, unused_imports)]

/// Trace-level logging (restart paths). No-op without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level logging (structural changes). No-op without the `tracing`
/// feature.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
