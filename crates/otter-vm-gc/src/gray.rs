//! Gray queue
//!
//! Objects found reachable but not yet scanned. The queue is a linked list
//! of fixed-size sections so push and pop never reallocate, and whole
//! sections can be handed between collector threads.

use crate::address::Address;

/// Objects per gray queue section
pub const GRAY_SECTION_SIZE: usize = 125;

/// One fixed-size block of the queue
pub struct GraySection {
    next: Option<Box<GraySection>>,
    len: usize,
    objects: [Address; GRAY_SECTION_SIZE],
}

impl GraySection {
    fn new() -> Box<Self> {
        Box::new(Self {
            next: None,
            len: 0,
            objects: [Address::NULL; GRAY_SECTION_SIZE],
        })
    }

    /// Number of queued objects
    pub fn len(&self) -> usize {
        self.len
    }

    /// Empty section
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A thread's private gray queue
#[derive(Default)]
pub struct GrayQueue {
    /// Head section; the only partially filled one
    first: Option<Box<GraySection>>,
    /// Sections in the chain
    sections: usize,
    /// Recycled empty sections
    free: Vec<Box<GraySection>>,
}

impl GrayQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an object
    #[inline]
    pub fn push(&mut self, obj: Address) {
        let full = self.first.as_ref().is_none_or(|s| s.len == GRAY_SECTION_SIZE);
        if full {
            let mut section = self.free.pop().unwrap_or_else(GraySection::new);
            section.next = self.first.take();
            self.first = Some(section);
            self.sections += 1;
        }
        if let Some(section) = self.first.as_mut() {
            section.objects[section.len] = obj;
            section.len += 1;
        }
    }

    /// Pop the most recently pushed object
    #[inline]
    pub fn pop(&mut self) -> Option<Address> {
        loop {
            let section = self.first.as_mut()?;
            if section.len > 0 {
                section.len -= 1;
                return Some(section.objects[section.len]);
            }
            let mut empty = self.first.take()?;
            self.first = empty.next.take();
            self.sections -= 1;
            self.free.push(empty);
        }
    }

    /// Is the queue empty
    pub fn is_empty(&self) -> bool {
        let mut cursor = self.first.as_deref();
        while let Some(section) = cursor {
            if section.len > 0 {
                return false;
            }
            cursor = section.next.as_deref();
        }
        true
    }

    /// Number of sections in the chain
    pub fn section_count(&self) -> usize {
        self.sections
    }

    /// Detach every full section behind the head, for sharing
    pub fn take_full_sections(&mut self) -> Vec<Box<GraySection>> {
        let mut out = Vec::new();
        if let Some(head) = self.first.as_mut() {
            let mut rest = head.next.take();
            while let Some(mut section) = rest {
                rest = section.next.take();
                if section.len > 0 {
                    out.push(section);
                } else {
                    self.free.push(section);
                }
                self.sections -= 1;
            }
        }
        out
    }

    /// Detach every non-empty section
    pub fn take_all_sections(&mut self) -> Vec<Box<GraySection>> {
        let mut out = self.take_full_sections();
        if let Some(head) = self.first.take() {
            self.sections -= 1;
            if head.len > 0 {
                out.push(head);
            } else {
                self.free.push(head);
            }
        }
        out
    }

    /// Splice a section taken from another queue in front of the chain
    pub fn add_section(&mut self, mut section: Box<GraySection>) {
        section.next = None;
        match self.first.take() {
            // keep the partially filled head in front
            Some(mut head) => {
                section.next = head.next.take();
                head.next = Some(section);
                self.first = Some(head);
            }
            None => self.first = Some(section),
        }
        self.sections += 1;
    }
}

impl Drop for GrayQueue {
    fn drop(&mut self) {
        // unlink iteratively so long chains do not recurse
        let mut cursor = self.first.take();
        while let Some(mut section) = cursor {
            cursor = section.next.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: usize) -> Address {
        Address::from_usize(0x1000 + i * 8)
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut queue = GrayQueue::new();
        assert!(queue.is_empty());
        for i in 0..300 {
            queue.push(addr(i));
        }
        assert_eq!(queue.section_count(), 3);
        for i in (0..300).rev() {
            assert_eq!(queue.pop(), Some(addr(i)));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
        assert_eq!(queue.section_count(), 0);
    }

    #[test]
    fn test_share_sections() {
        let mut queue = GrayQueue::new();
        for i in 0..(GRAY_SECTION_SIZE * 2 + 10) {
            queue.push(addr(i));
        }
        let shared = queue.take_full_sections();
        assert_eq!(shared.len(), 2);
        assert!(shared.iter().all(|s| s.len() == GRAY_SECTION_SIZE));
        // the partially filled head stays behind
        let mut remaining = 0;
        while queue.pop().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 10);

        let mut other = GrayQueue::new();
        other.push(addr(9999));
        for section in shared {
            other.add_section(section);
        }
        let mut total = 0;
        while other.pop().is_some() {
            total += 1;
        }
        assert_eq!(total, GRAY_SECTION_SIZE * 2 + 1);
    }

    #[test]
    fn test_take_all_sections() {
        let mut queue = GrayQueue::new();
        queue.push(addr(1));
        let sections = queue.take_all_sections();
        assert_eq!(sections.len(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.section_count(), 0);
    }
}
