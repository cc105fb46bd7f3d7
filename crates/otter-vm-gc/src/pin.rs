//! Pinning
//!
//! Conservative roots produce candidate addresses that may or may not point
//! at objects. The pin queue collects them, sorts and deduplicates them, and
//! resolves each one to the object whose extent contains it using the
//! section's scan-start hints. Candidates landing in zeroed memory are
//! dropped.

use crate::address::{Address, AddressRange, WORD_SIZE};
use crate::object::ObjectRef;
use crate::section::{Section, WalkControl};
use crate::types::TypeTable;

/// Candidate addresses gathered from conservative roots
#[derive(Default, Debug)]
pub struct PinQueue {
    candidates: Vec<Address>,
    sorted: bool,
}

impl PinQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate if it falls into one of `ranges`
    #[inline]
    pub fn add(&mut self, candidate: Address, ranges: &[AddressRange]) {
        if ranges.iter().any(|r| r.contains(candidate)) {
            self.candidates.push(candidate.align_down());
            self.sorted = false;
        }
    }

    /// Treat every word of `[start, end)` as a candidate
    ///
    /// # Safety
    /// The range must be readable, word-aligned memory.
    pub unsafe fn add_range(&mut self, start: Address, end: Address, ranges: &[AddressRange]) {
        let mut slot = start;
        while slot.offset(WORD_SIZE) <= end {
            // SAFETY: caller guarantees the range is readable
            let word = unsafe { slot.load_address() };
            self.add(word, ranges);
            slot = slot.offset(WORD_SIZE);
        }
    }

    /// Sort and deduplicate
    pub fn optimize(&mut self) {
        self.candidates.sort_unstable();
        self.candidates.dedup();
        self.sorted = true;
    }

    /// Sorted, deduplicated candidates
    pub fn candidates(&mut self) -> &[Address] {
        if !self.sorted {
            self.optimize();
        }
        &self.candidates
    }

    /// Candidates inside `range`, which must already be optimized
    pub fn candidates_in(&self, range: AddressRange) -> &[Address] {
        debug_assert!(self.sorted);
        let from = self.candidates.partition_point(|a| *a < range.start);
        let to = self.candidates.partition_point(|a| *a < range.end);
        &self.candidates[from..to]
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// No candidates
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Drop every candidate
    pub fn clear(&mut self) {
        self.candidates.clear();
        self.sorted = true;
    }
}

/// Resolve sorted candidates inside `section` below `limit` to object
/// starts. Each object is reported once, in address order, with its size.
///
/// # Safety
/// The section must be walkable up to `limit` and no evacuation may have
/// started.
pub unsafe fn resolve_candidates(
    section: &Section,
    candidates: &[Address],
    limit: Address,
    types: &TypeTable,
) -> Vec<(Address, usize)> {
    let mut objects: Vec<(Address, usize)> = Vec::new();
    let mut last_end = section.start();
    for &addr in candidates {
        if addr >= limit || !section.contains(addr) {
            continue;
        }
        if let Some(&(obj, size)) = objects.last()
            && addr < obj.offset(size)
        {
            continue;
        }
        let search_start = section.scan_start_before(addr).max(last_end);
        let mut hit = None;
        // SAFETY: forwarded to the caller
        unsafe {
            section.walk(search_start, addr.offset(1), types, &mut |obj, size| {
                if addr < obj.offset(size) {
                    if addr >= obj {
                        hit = Some((obj, size));
                    }
                    return WalkControl::Stop;
                }
                WalkControl::Continue
            });
        }
        if let Some((obj, size)) = hit {
            last_end = obj.offset(size);
            objects.push((obj, size));
        }
    }
    objects
}

/// Resolve candidates and pin the objects found. Returns the newly pinned
/// objects with their sizes.
///
/// # Safety
/// Same as [`resolve_candidates`].
pub unsafe fn pin_candidates(
    section: &Section,
    candidates: &[Address],
    limit: Address,
    types: &TypeTable,
) -> Vec<(Address, usize)> {
    // SAFETY: forwarded to the caller
    let mut objects = unsafe { resolve_candidates(section, candidates, limit, types) };
    // SAFETY: resolved addresses are object starts
    objects.retain(|&(obj, _)| unsafe { ObjectRef::new(obj).pin() });
    objects
}
