//! Remembered sets
//!
//! Old-to-young stores are logged in a per-thread sequential store buffer.
//! A full buffer migrates into the global overflow list, which is a chain of
//! fixed-size segments. At the start of a minor collection every thread's
//! buffer has already been flushed (mutators flush when they park), so the
//! collector only replays the global list.

use crate::address::Address;
use crate::types::TypeId;
use parking_lot::Mutex;

/// Entries held by one store buffer or overflow segment
pub const DEFAULT_REMSET_SIZE: usize = 1024;

/// A location that may hold a pointer into the nursery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemsetEntry {
    /// A single slot
    Location(Address),
    /// `count` consecutive slots
    Range {
        /// First slot
        start: Address,
        /// Number of slots
        count: usize,
    },
    /// Every reference slot of an object
    Object(Address),
    /// `count` consecutive values of a value type
    ValueType {
        /// First value
        dest: Address,
        /// Number of values
        count: usize,
        /// Layout of one value
        ty: TypeId,
    },
}

/// Per-thread bounded log of barrier hits
#[derive(Debug)]
pub struct StoreBuffer {
    entries: Vec<RemsetEntry>,
    capacity: usize,
}

impl StoreBuffer {
    /// Create a buffer with room for `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry. Returns `true` when the buffer is now full.
    #[inline]
    pub fn push(&mut self, entry: RemsetEntry) -> bool {
        // consecutive stores to one slot only need one entry
        if self.entries.last() == Some(&entry) {
            return false;
        }
        self.entries.push(entry);
        self.entries.len() >= self.capacity
    }

    /// Number of buffered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing buffered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move the buffered entries into `global`
    pub fn flush_into(&mut self, global: &GlobalRemset) {
        if !self.entries.is_empty() {
            global.append(&mut self.entries);
        }
    }
}

/// A full segment of the overflow list
#[derive(Debug)]
pub struct RemsetSegment {
    entries: Vec<RemsetEntry>,
}

impl RemsetSegment {
    /// Entries of the segment
    pub fn entries(&self) -> &[RemsetEntry] {
        &self.entries
    }
}

/// Global overflow list
///
/// Mutators append under its own lock, which is a leaf: nothing else is
/// acquired while it is held.
#[derive(Debug)]
pub struct GlobalRemset {
    segments: Mutex<Vec<RemsetSegment>>,
    segment_size: usize,
}

impl GlobalRemset {
    /// Create an empty list with segments of `segment_size` entries
    pub fn new(segment_size: usize) -> Self {
        Self {
            segments: Mutex::new(Vec::new()),
            segment_size: segment_size.max(1),
        }
    }

    /// Append entries, draining `entries`
    pub fn append(&self, entries: &mut Vec<RemsetEntry>) {
        let mut segments = self.segments.lock();
        for entry in entries.drain(..) {
            push_entry(&mut segments, self.segment_size, entry);
        }
    }

    /// Append one entry
    pub fn push(&self, entry: RemsetEntry) {
        let mut segments = self.segments.lock();
        push_entry(&mut segments, self.segment_size, entry);
    }

    /// Take every segment, leaving the list empty
    pub fn take(&self) -> Vec<RemsetSegment> {
        std::mem::take(&mut *self.segments.lock())
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.segments.lock().clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.segments.lock().iter().map(|s| s.entries.len()).sum()
    }

    /// No entries
    pub fn is_empty(&self) -> bool {
        self.segments.lock().iter().all(|s| s.entries.is_empty())
    }

    /// Call `f` on every entry without consuming
    pub fn for_each(&self, f: &mut dyn FnMut(&RemsetEntry)) {
        for segment in self.segments.lock().iter() {
            segment.entries.iter().for_each(&mut *f);
        }
    }
}

fn push_entry(segments: &mut Vec<RemsetSegment>, segment_size: usize, entry: RemsetEntry) {
    match segments.last_mut() {
        Some(segment) if segment.entries.len() < segment_size => segment.entries.push(entry),
        _ => {
            let mut entries = Vec::with_capacity(segment_size);
            entries.push(entry);
            segments.push(RemsetSegment { entries });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(raw: usize) -> RemsetEntry {
        RemsetEntry::Location(Address::from_usize(raw))
    }

    #[test]
    fn test_store_buffer_fills() {
        let mut buffer = StoreBuffer::new(3);
        assert!(!buffer.push(loc(0x10)));
        assert!(!buffer.push(loc(0x10)));
        assert_eq!(buffer.len(), 1);
        assert!(!buffer.push(loc(0x18)));
        assert!(buffer.push(loc(0x20)));
    }

    #[test]
    fn test_flush_into_segments() {
        let global = GlobalRemset::new(2);
        let mut buffer = StoreBuffer::new(16);
        for i in 0..5 {
            buffer.push(loc(0x100 + i * 8));
        }
        buffer.flush_into(&global);
        assert!(buffer.is_empty());
        assert_eq!(global.len(), 5);
        let segments = global.take();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].entries(), &[loc(0x120)]);
        assert!(global.is_empty());
    }

    #[test]
    fn test_global_push_and_clear() {
        let global = GlobalRemset::new(DEFAULT_REMSET_SIZE);
        global.push(RemsetEntry::Range {
            start: Address::from_usize(0x40),
            count: 4,
        });
        let mut seen = 0;
        global.for_each(&mut |_| seen += 1);
        assert_eq!(seen, 1);
        global.clear();
        assert_eq!(global.len(), 0);
    }
}
