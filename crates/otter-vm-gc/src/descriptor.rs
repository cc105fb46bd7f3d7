//! Reference layout descriptors
//!
//! A descriptor tells the collector which words of a range hold references.
//! Object types, value types and precise roots all use the same closed set of
//! encodings; scanning dispatches over the enum instead of per-kind macros.

use crate::address::Address;
use std::fmt;
use std::sync::Arc;

/// Callback that enumerates the reference slots of a range itself.
///
/// Receives the range base and reports the address of every slot that may
/// hold a reference.
pub type UserMarkFn = Arc<dyn Fn(Address, &mut dyn FnMut(Address)) + Send + Sync>;

/// Index of an interned out-of-line bitmap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComplexId(pub(crate) u32);

/// Which words of a range hold references
#[derive(Clone)]
pub enum Descriptor {
    /// `count` consecutive reference words starting at word `first`
    RunLength {
        /// First reference word
        first: u32,
        /// Number of reference words
        count: u32,
    },
    /// Bit `i` set: word `i` is a reference (first 64 words only)
    SmallBitmap(u64),
    /// Inline bitmap of arbitrary length
    LargeBitmap(Box<[u64]>),
    /// Interned bitmap shared by every type with the same layout
    Complex(ComplexId),
    /// Host callback enumerates the slots
    User(UserMarkFn),
}

impl Descriptor {
    /// Descriptor for a range without references
    pub const fn pointer_free() -> Self {
        Descriptor::RunLength { first: 0, count: 0 }
    }

    /// Descriptor covering the first `count` words
    pub const fn all_refs(count: u32) -> Self {
        Descriptor::RunLength { first: 0, count }
    }

    /// Does the descriptor describe no references at all
    pub fn is_pointer_free(&self) -> bool {
        match self {
            Descriptor::RunLength { count, .. } => *count == 0,
            Descriptor::SmallBitmap(bits) => *bits == 0,
            Descriptor::LargeBitmap(bits) => bits.iter().all(|w| *w == 0),
            Descriptor::Complex(_) | Descriptor::User(_) => false,
        }
    }

    /// Call `f` with the address of every reference slot of the range at
    /// `base`. Complex descriptors are resolved through `complex`.
    pub fn for_each_reference(
        &self,
        base: Address,
        complex: &ComplexTable,
        f: &mut dyn FnMut(Address),
    ) {
        match self {
            Descriptor::RunLength { first, count } => {
                for i in *first..*first + *count {
                    f(base.word(i as usize));
                }
            }
            Descriptor::SmallBitmap(bits) => visit_bitmap(base, &[*bits], f),
            Descriptor::LargeBitmap(bits) => visit_bitmap(base, bits, f),
            Descriptor::Complex(id) => match complex.get(*id) {
                Some(bits) => visit_bitmap(base, bits, f),
                None => crate::gc_fatal!("complex descriptor {} is not interned", id.0),
            },
            Descriptor::User(callback) => callback(base, f),
        }
    }
}

fn visit_bitmap(base: Address, bits: &[u64], f: &mut dyn FnMut(Address)) {
    for (index, word) in bits.iter().enumerate() {
        let mut remaining = *word;
        while remaining != 0 {
            let bit = remaining.trailing_zeros() as usize;
            f(base.word(index * 64 + bit));
            remaining &= remaining - 1;
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::RunLength { first, count } => f
                .debug_struct("RunLength")
                .field("first", first)
                .field("count", count)
                .finish(),
            Descriptor::SmallBitmap(bits) => write!(f, "SmallBitmap({bits:#b})"),
            Descriptor::LargeBitmap(bits) => f.debug_tuple("LargeBitmap").field(bits).finish(),
            Descriptor::Complex(id) => f.debug_tuple("Complex").field(&id.0).finish(),
            Descriptor::User(_) => f.write_str("User(..)"),
        }
    }
}

/// Interned out-of-line bitmaps
#[derive(Clone, Default, Debug)]
pub struct ComplexTable {
    bitmaps: Vec<Arc<[u64]>>,
}

impl ComplexTable {
    /// Intern `bits`, returning the id of an identical bitmap if one exists
    pub fn intern(&mut self, bits: &[u64]) -> ComplexId {
        let trimmed = trim_bitmap(bits);
        if let Some(pos) = self.bitmaps.iter().position(|b| **b == *trimmed) {
            return ComplexId(pos as u32);
        }
        self.bitmaps.push(Arc::from(trimmed));
        ComplexId((self.bitmaps.len() - 1) as u32)
    }

    /// Look up an interned bitmap
    pub fn get(&self, id: ComplexId) -> Option<&[u64]> {
        self.bitmaps.get(id.0 as usize).map(|b| &**b)
    }

    /// Number of interned bitmaps
    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    /// No bitmaps interned yet
    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }
}

fn trim_bitmap(bits: &[u64]) -> &[u64] {
    let used = bits.iter().rposition(|w| *w != 0).map_or(0, |i| i + 1);
    &bits[..used]
}

/// Pick the most compact descriptor for a reference bitmap
///
/// Bit `i` of the bitmap marks word `i` of the range. Layouts that fit no
/// inline encoding are interned in `complex`.
pub fn make_descriptor(bits: &[u64], complex: &mut ComplexTable) -> Descriptor {
    let bits = trim_bitmap(bits);
    if bits.is_empty() {
        return Descriptor::pointer_free();
    }
    let total: u32 = bits.iter().map(|w| w.count_ones()).sum();
    let first = first_set_bit(bits);
    let last = bits.len() * 64 - bits[bits.len() - 1].leading_zeros() as usize - 1;
    if last - first + 1 == total as usize {
        return Descriptor::RunLength {
            first: first as u32,
            count: total,
        };
    }
    if bits.len() == 1 {
        return Descriptor::SmallBitmap(bits[0]);
    }
    Descriptor::Complex(complex.intern(bits))
}

fn first_set_bit(bits: &[u64]) -> usize {
    for (index, word) in bits.iter().enumerate() {
        if *word != 0 {
            return index * 64 + word.trailing_zeros() as usize;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::WORD_SIZE;

    fn slots(desc: &Descriptor, complex: &ComplexTable) -> Vec<usize> {
        let mut out = Vec::new();
        desc.for_each_reference(Address::from_usize(0x1000), complex, &mut |slot| {
            out.push((slot.as_usize() - 0x1000) / WORD_SIZE)
        });
        out
    }

    #[test]
    fn test_run_length() {
        let complex = ComplexTable::default();
        let desc = Descriptor::RunLength { first: 2, count: 3 };
        assert_eq!(slots(&desc, &complex), vec![2, 3, 4]);
        assert!(Descriptor::pointer_free().is_pointer_free());
    }

    #[test]
    fn test_bitmaps() {
        let complex = ComplexTable::default();
        assert_eq!(slots(&Descriptor::SmallBitmap(0b1010_0001), &complex), vec![0, 5, 7]);
        let large = Descriptor::LargeBitmap(vec![1, 0, 1 << 3].into_boxed_slice());
        assert_eq!(slots(&large, &complex), vec![0, 131]);
    }

    #[test]
    fn test_make_descriptor_picks_encoding() {
        let mut complex = ComplexTable::default();
        assert!(make_descriptor(&[0, 0], &mut complex).is_pointer_free());
        assert!(matches!(
            make_descriptor(&[0b1110], &mut complex),
            Descriptor::RunLength { first: 1, count: 3 }
        ));
        assert!(matches!(
            make_descriptor(&[0b101], &mut complex),
            Descriptor::SmallBitmap(0b101)
        ));
        let a = make_descriptor(&[1, 1], &mut complex);
        let b = make_descriptor(&[1, 1, 0], &mut complex);
        match (a, b) {
            (Descriptor::Complex(x), Descriptor::Complex(y)) => assert_eq!(x, y),
            other => panic!("expected complex descriptors, got {other:?}"),
        }
        assert_eq!(complex.len(), 1);
        assert_eq!(slots(&Descriptor::Complex(ComplexId(0)), &complex), vec![0, 64]);
    }

    #[test]
    fn test_user_descriptor() {
        let complex = ComplexTable::default();
        let desc = Descriptor::User(Arc::new(|base: Address, f: &mut dyn FnMut(Address)| {
            f(base.word(9));
        }));
        assert_eq!(slots(&desc, &complex), vec![9]);
    }
}
