//! Collector errors
//!
//! Recoverable conditions are returned as [`GcError`]. Heap corruption is
//! never recovered: it goes through [`gc_fatal!`](crate::gc_fatal) and takes
//! the process down (release builds abort on panic).

use thiserror::Error;

/// Errors surfaced to the embedding runtime
#[derive(Debug, Error)]
pub enum GcError {
    /// The fast path could not satisfy an allocation without a collection
    #[error("collection required to allocate {size} bytes")]
    CollectionRequired {
        /// Requested size in bytes
        size: usize,
    },

    /// Allocation failed even after a full collection
    #[error("out of memory: cannot allocate {requested} bytes (heap holds {heap_size} bytes)")]
    OutOfMemory {
        /// Requested size in bytes
        requested: usize,
        /// Heap size at the time of failure
        heap_size: usize,
    },

    /// A type id that was never registered
    #[error("unknown type id {0}")]
    UnknownType(u32),

    /// Allocation of a type through the wrong entry point
    #[error("type `{name}` cannot be allocated this way: {reason}")]
    InvalidAllocation {
        /// Type name
        name: String,
        /// What went wrong
        reason: &'static str,
    },

    /// Invalid tuning parameters
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Malformed configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Key not understood
    #[error("unknown option `{key}`\n{usage}", usage = crate::config::USAGE)]
    UnknownKey {
        /// The key as written
        key: String,
    },

    /// Key understood, value rejected
    #[error("invalid value `{value}` for `{key}`: {reason}\n{usage}", usage = crate::config::USAGE)]
    InvalidValue {
        /// The key
        key: String,
        /// The value as written
        value: String,
        /// Why the value was rejected
        reason: &'static str,
    },

    /// An option that needs a value was given none
    #[error("option `{key}` requires a value\n{usage}", usage = crate::config::USAGE)]
    MissingValue {
        /// The key
        key: String,
    },
}

/// Result alias for collector operations
pub type GcResult<T> = Result<T, GcError>;

/// Report a fatal heap consistency violation
#[macro_export]
macro_rules! gc_fatal {
    ($($arg:tt)*) => {
        panic!("otter-vm-gc: fatal heap corruption: {}", format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GcError::OutOfMemory {
            requested: 64,
            heap_size: 1024,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: cannot allocate 64 bytes (heap holds 1024 bytes)"
        );

        let err: GcError = ConfigError::UnknownKey {
            key: "nursery".into(),
        }
        .into();
        assert!(err.to_string().starts_with("unknown option `nursery`"));
        assert!(err.to_string().contains("nursery-size"));
    }

    #[test]
    #[should_panic(expected = "fatal heap corruption: bad size 0")]
    fn test_fatal_panics() {
        gc_fatal!("bad size {}", 0);
    }
}
