//! # Otter VM Garbage Collector
//!
//! Generational collector with a copying nursery and a pluggable major heap.
//!
//! ## Design
//!
//! - **Nursery**: one section carved into per-thread TLABs; collected by
//!   copying survivors into the major heap. Objects referenced from
//!   conservatively scanned memory are pinned in place.
//! - **Major heap**: fixed-size sections managed by a copying or a
//!   mark-sweep strategy, chosen at startup.
//! - **Large objects**: anything over [`MAX_SMALL_OBJECT_SIZE`] lives in
//!   its own allocation and is never moved.
//! - **Remembered sets**: store buffers or card marks record old-to-young
//!   stores made through the write barriers on [`Mutator`].
//! - **Pauses**: stop-the-world, with a pool of collector threads draining
//!   a shared gray queue.
//!
//! ## Usage
//!
//! ```no_run
//! use otter_vm_gc::{Descriptor, GcConfig, GcHeap, Generation, StackBounds, TypeInfo};
//!
//! let heap = GcHeap::new(GcConfig::default())?;
//! let pair = heap.register_type(TypeInfo::fixed("Pair", 2, Descriptor::all_refs(2)))?;
//! let mut mutator = heap.attach(StackBounds::EMPTY);
//! let a = mutator.alloc(pair)?;
//! let b = mutator.alloc(pair)?;
//! unsafe { mutator.store_field(a, a.word(1), b) };
//! mutator.request_collection(Generation::Nursery, "example")?;
//! # Ok::<(), otter_vm_gc::GcError>(())
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

mod log;

pub mod address;
pub mod barrier;
pub mod config;
pub mod descriptor;
pub mod ephemeron;
pub mod error;
pub mod finalization;
pub mod gray;
pub mod heap;
pub mod los;
pub mod major;
mod minor;
pub mod mutator;
pub mod nursery;
pub mod object;
pub mod pin;
pub mod remset;
pub mod roots;
pub mod safepoint;
pub mod section;
pub mod stats;
pub mod trace;
pub mod types;
mod verify;
pub mod weak_ref;
pub mod workers;

pub use address::{Address, AddressRange};
pub use config::{BarrierKind, ClearPolicy, DebugOptions, GcConfig, MajorKind};
pub use descriptor::Descriptor;
pub use error::{ConfigError, GcError, GcResult};
pub use heap::{GcHeap, Generation, StackBounds};
pub use los::MAX_SMALL_OBJECT_SIZE;
pub use mutator::Mutator;
pub use object::{HeaderState, ObjectRef};
pub use roots::{RootDescriptor, RootId, RootKind};
pub use stats::GcStats;
pub use types::{ElementRefs, ObjectKind, TypeId, TypeInfo};
