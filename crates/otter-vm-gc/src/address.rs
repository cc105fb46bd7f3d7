//! Raw heap addresses
//!
//! All managed memory is addressed through [`Address`]. Loads and stores go
//! through the unsafe accessors here so every raw access in the collector is
//! easy to find.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a machine word in bytes
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Allocation granule; every object start and size is a multiple of this
pub const ALLOC_ALIGN: usize = 8;

/// Round `size` up to the allocation granule
#[inline]
pub const fn align_size(size: usize) -> usize {
    (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

/// An address in (or outside) the managed heap
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address
    pub const NULL: Address = Address(0);

    /// Wrap a raw address
    #[inline]
    pub const fn from_usize(raw: usize) -> Self {
        Address(raw)
    }

    /// Address of a pointer
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    /// Raw value
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// As a mutable pointer
    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Is this the null address
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further on
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Address(self.0 + bytes)
    }

    /// Address `words` words further on
    #[inline]
    pub const fn word(self, words: usize) -> Self {
        Address(self.0 + words * WORD_SIZE)
    }

    /// Byte distance from `base` to `self`
    #[inline]
    pub const fn diff(self, base: Address) -> usize {
        self.0 - base.0
    }

    /// Round down to the allocation granule
    #[inline]
    pub const fn align_down(self) -> Self {
        Address(self.0 & !(ALLOC_ALIGN - 1))
    }

    /// Round up to the allocation granule
    #[inline]
    pub const fn align_up(self) -> Self {
        Address(align_size(self.0))
    }

    /// Load the word stored at this address
    ///
    /// # Safety
    /// The address must be word aligned and point to readable memory.
    #[inline]
    pub unsafe fn load(self) -> usize {
        // SAFETY: caller guarantees the word is readable
        unsafe { std::ptr::read(self.0 as *const usize) }
    }

    /// Load the word at this address as an address
    ///
    /// # Safety
    /// Same as [`Address::load`].
    #[inline]
    pub unsafe fn load_address(self) -> Address {
        // SAFETY: forwarded to the caller
        Address(unsafe { self.load() })
    }

    /// Store a word at this address
    ///
    /// # Safety
    /// The address must be word aligned and point to writable memory no
    /// other thread is accessing.
    #[inline]
    pub unsafe fn store(self, value: usize) {
        // SAFETY: caller guarantees the word is writable
        unsafe { std::ptr::write(self.0 as *mut usize, value) }
    }

    /// Store an address at this address
    ///
    /// # Safety
    /// Same as [`Address::store`].
    #[inline]
    pub unsafe fn store_address(self, value: Address) {
        // SAFETY: forwarded to the caller
        unsafe { self.store(value.0) }
    }

    /// View the word at this address as an atomic
    ///
    /// # Safety
    /// The address must be word aligned and valid for the returned lifetime,
    /// and all concurrent accesses to the word must be atomic.
    #[inline]
    pub unsafe fn as_atomic<'a>(self) -> &'a AtomicUsize {
        // SAFETY: alignment and validity are guaranteed by the caller
        unsafe { AtomicUsize::from_ptr(self.0 as *mut usize) }
    }

    /// Atomically load the word at this address
    ///
    /// # Safety
    /// Same as [`Address::as_atomic`].
    #[inline]
    pub unsafe fn atomic_load(self, order: Ordering) -> usize {
        // SAFETY: forwarded to the caller
        unsafe { self.as_atomic() }.load(order)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Half-open address range `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AddressRange {
    /// First byte
    pub start: Address,
    /// One past the last byte
    pub end: Address,
}

impl AddressRange {
    /// Create a range
    pub const fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    /// Does the range contain `addr`
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.end.diff(self.start)
    }

    /// Is the range empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Zero `[start, end)`
///
/// # Safety
/// The range must be writable memory owned by the collector.
pub unsafe fn zero_range(start: Address, end: Address) {
    if end > start {
        // SAFETY: caller guarantees the range is writable
        unsafe { std::ptr::write_bytes(start.as_mut_ptr::<u8>(), 0, end.diff(start)) }
    }
}
