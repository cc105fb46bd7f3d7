//! Object headers
//!
//! Word 0 of every managed object is a tagged header:
//!
//! | tag  | state      | payload            |
//! |------|------------|--------------------|
//! | `00` | Normal     | type id            |
//! | `10` | Pinned     | type id            |
//! | `01` | Forwarded  | new address        |
//! | `11` | Copying    | type id            |
//!
//! A zero word is memory that was never allocated. The header is only read
//! and written through [`ObjectRef`], which enforces the state machine:
//! `Normal -> Copying -> Forwarded` for evacuation and
//! `Normal <-> Pinned` for pinning.

use crate::address::Address;
use crate::types::TypeId;
use crossbeam_utils::Backoff;
use std::sync::atomic::Ordering;

const TAG_MASK: usize = 0b11;
const TAG_NORMAL: usize = 0b00;
const TAG_FORWARDED: usize = 0b01;
const TAG_PINNED: usize = 0b10;
const TAG_COPYING: usize = 0b11;
const TYPE_SHIFT: usize = 2;

/// Decoded header state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderState {
    /// Never-allocated memory
    Empty,
    /// Ordinary object
    Normal(TypeId),
    /// Object that must not move this cycle
    Pinned(TypeId),
    /// Evacuated object; the payload is the new copy
    Forwarded(Address),
    /// A collector worker is copying the object right now
    Copying(TypeId),
}

impl HeaderState {
    #[inline]
    fn decode(word: usize) -> Self {
        if word == 0 {
            return HeaderState::Empty;
        }
        let ty = TypeId::from_raw((word >> TYPE_SHIFT) as u32);
        match word & TAG_MASK {
            TAG_NORMAL => HeaderState::Normal(ty),
            TAG_PINNED => HeaderState::Pinned(ty),
            TAG_FORWARDED => HeaderState::Forwarded(Address::from_usize(word & !TAG_MASK)),
            _ => HeaderState::Copying(ty),
        }
    }

    /// Type of the object, if the header still names one
    #[inline]
    pub fn type_id(self) -> Option<TypeId> {
        match self {
            HeaderState::Normal(ty) | HeaderState::Pinned(ty) | HeaderState::Copying(ty) => {
                Some(ty)
            }
            HeaderState::Empty | HeaderState::Forwarded(_) => None,
        }
    }
}

#[inline]
const fn encode(ty: TypeId, tag: usize) -> usize {
    ((ty.as_u32() as usize) << TYPE_SHIFT) | tag
}

/// Outcome of trying to claim an object for evacuation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    /// This worker owns the copy
    Won(TypeId),
    /// Already evacuated
    Forwarded(Address),
    /// Pinned in place
    Pinned,
}

/// Reference to the start of a managed object
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectRef(Address);

impl ObjectRef {
    /// Wrap an object start address
    #[inline]
    pub const fn new(addr: Address) -> Self {
        ObjectRef(addr)
    }

    /// Object start
    #[inline]
    pub const fn addr(self) -> Address {
        self.0
    }

    /// Write a fresh Normal header
    ///
    /// # Safety
    /// `self` must point to allocated, otherwise unused memory.
    #[inline]
    pub unsafe fn initialize(self, ty: TypeId) {
        // SAFETY: memory is owned by the caller
        unsafe { self.0.as_atomic() }.store(encode(ty, TAG_NORMAL), Ordering::Release);
    }

    /// Decode the header
    ///
    /// # Safety
    /// `self` must point to a header word.
    #[inline]
    pub unsafe fn header(self) -> HeaderState {
        // SAFETY: caller guarantees a header word
        HeaderState::decode(unsafe { self.0.atomic_load(Ordering::Acquire) })
    }

    /// Type of the object; reading through a forwarded header is corruption
    ///
    /// # Safety
    /// `self` must point to a header word.
    #[inline]
    pub unsafe fn type_id(self) -> TypeId {
        // SAFETY: forwarded to the caller
        match unsafe { self.header() }.type_id() {
            Some(ty) => ty,
            None => crate::gc_fatal!("object {} has no type (header {:?})", self.0, unsafe {
                self.header()
            }),
        }
    }

    /// Is the object pinned
    ///
    /// # Safety
    /// `self` must point to a header word.
    #[inline]
    pub unsafe fn is_pinned(self) -> bool {
        // SAFETY: forwarded to the caller
        matches!(unsafe { self.header() }, HeaderState::Pinned(_))
    }

    /// Forwarding address, if evacuated
    ///
    /// # Safety
    /// `self` must point to a header word.
    #[inline]
    pub unsafe fn forwarded(self) -> Option<Address> {
        // SAFETY: forwarded to the caller
        match unsafe { self.header() } {
            HeaderState::Forwarded(to) => Some(to),
            _ => None,
        }
    }

    /// Pin the object. Returns `true` if this call pinned it.
    ///
    /// # Safety
    /// `self` must point to a live object header and no evacuation may be
    /// running.
    pub unsafe fn pin(self) -> bool {
        // SAFETY: forwarded to the caller
        let header = unsafe { self.0.as_atomic() };
        let word = header.load(Ordering::Acquire);
        match HeaderState::decode(word) {
            HeaderState::Normal(ty) => header
                .compare_exchange(
                    word,
                    encode(ty, TAG_PINNED),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
            HeaderState::Pinned(_) => false,
            state => crate::gc_fatal!("cannot pin {} in state {state:?}", self.0),
        }
    }

    /// Clear the pin bit
    ///
    /// # Safety
    /// `self` must point to an object header.
    pub unsafe fn unpin(self) {
        // SAFETY: forwarded to the caller
        let header = unsafe { self.0.as_atomic() };
        let word = header.load(Ordering::Acquire);
        if let HeaderState::Pinned(ty) = HeaderState::decode(word) {
            header.store(encode(ty, TAG_NORMAL), Ordering::Release);
        }
    }

    /// Try to become the single worker that copies this object
    ///
    /// Spins while another worker holds the claim, then reports where the
    /// object went.
    ///
    /// # Safety
    /// `self` must point to an object header inside a condemned space.
    pub unsafe fn claim(self) -> Claim {
        // SAFETY: forwarded to the caller
        let header = unsafe { self.0.as_atomic() };
        let backoff = Backoff::new();
        loop {
            let word = header.load(Ordering::Acquire);
            match HeaderState::decode(word) {
                HeaderState::Normal(ty) => {
                    if header
                        .compare_exchange_weak(
                            word,
                            encode(ty, TAG_COPYING),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Claim::Won(ty);
                    }
                }
                HeaderState::Forwarded(to) => return Claim::Forwarded(to),
                HeaderState::Pinned(_) => return Claim::Pinned,
                HeaderState::Copying(_) => backoff.snooze(),
                HeaderState::Empty => {
                    crate::gc_fatal!("reference {} points to unallocated memory", self.0)
                }
            }
        }
    }

    /// Publish the new location after a won claim
    ///
    /// # Safety
    /// The caller must hold the claim and `to` must hold a complete copy.
    pub unsafe fn forward_to(self, to: Address) {
        debug_assert_eq!(to.as_usize() & TAG_MASK, 0);
        // SAFETY: forwarded to the caller
        unsafe { self.0.as_atomic() }.store(to.as_usize() | TAG_FORWARDED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(words: &mut [usize]) -> ObjectRef {
        ObjectRef::new(Address::from_ptr(words.as_mut_ptr()))
    }

    #[test]
    fn test_header_states() {
        let mut words = [0usize; 2];
        let obj = object(&mut words);
        let ty = TypeId::from_raw(7);
        unsafe {
            assert_eq!(obj.header(), HeaderState::Empty);
            obj.initialize(ty);
            assert_eq!(obj.header(), HeaderState::Normal(ty));
            assert_eq!(obj.type_id(), ty);
            assert!(obj.pin());
            assert!(!obj.pin());
            assert!(obj.is_pinned());
            assert_eq!(obj.type_id(), ty);
            obj.unpin();
            assert_eq!(obj.header(), HeaderState::Normal(ty));
        }
    }

    #[test]
    fn test_claim_and_forward() {
        let mut words = [0usize; 2];
        let mut target = [0usize; 2];
        let obj = object(&mut words);
        let to = Address::from_ptr(target.as_mut_ptr());
        let ty = TypeId::from_raw(3);
        unsafe {
            obj.initialize(ty);
            assert_eq!(obj.claim(), Claim::Won(ty));
            assert_eq!(obj.header(), HeaderState::Copying(ty));
            obj.forward_to(to);
            assert_eq!(obj.forwarded(), Some(to));
            assert_eq!(obj.claim(), Claim::Forwarded(to));
        }
    }

    #[test]
    fn test_pinned_object_is_not_claimed() {
        let mut words = [0usize; 2];
        let obj = object(&mut words);
        unsafe {
            obj.initialize(TypeId::from_raw(1));
            obj.pin();
            assert_eq!(obj.claim(), Claim::Pinned);
        }
    }

    #[test]
    #[should_panic(expected = "has no type")]
    fn test_type_of_forwarded_is_fatal() {
        let mut words = [0usize; 2];
        let obj = object(&mut words);
        unsafe {
            obj.initialize(TypeId::from_raw(1));
            obj.forward_to(Address::from_usize(0x1000));
            obj.type_id();
        }
    }
}
