//! Logging macros
//!
//! Thin wrappers over `tracing` with the collector's target. Compiled out
//! when the `gc_logging` feature is disabled.

/// Debug-level collector event
macro_rules! gc_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", $($arg)*);
    };
}

/// Info-level collector event
macro_rules! gc_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "gc_logging")]
        tracing::info!(target: "otter::gc", $($arg)*);
    };
}

/// Warning-level collector event
macro_rules! gc_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "gc_logging")]
        tracing::warn!(target: "otter::gc", $($arg)*);
    };
}

pub(crate) use {gc_debug, gc_info, gc_warn};
