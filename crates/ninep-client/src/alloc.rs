//! ID Allocators: bounded, O(1) acquire/release allocators
//! for tags and fids.
//!
//! A 9P server only ever receives tags/fids chosen by its peer, so neither
//! side of that exchange needs to allocate them; a client does. This
//! generalizes the simple monotonic counters seen in
//! `other_examples/...cfk-providers-src-ninep.rs.rs` (`fid_counter: AtomicU32`)
//! and `cohsh`'s `CohClient::allocate_fid` into a free-list allocator that
//! actually reuses released ids, which a long-lived session needs to avoid
//! exhausting its id space.

use crate::error::Error;

/// Allocates `u16` tags from `[1, 0xFFFE]`. `0` is reserved by convention for
/// the first well-known tag a caller may want to special-case, and `0xFFFF`
/// is `NOTAG`.
#[derive(Debug)]
pub struct TagAllocator {
    free: Vec<u16>,
    next: u32,
    limit: u32,
}

impl TagAllocator {
    pub fn new() -> Self {
        TagAllocator {
            free: Vec::new(),
            next: 1,
            limit: 0xFFFE,
        }
    }

    /// Acquire a tag, reusing a released one if available.
    pub fn acquire(&mut self) -> Result<u16, Error> {
        if let Some(tag) = self.free.pop() {
            return Ok(tag);
        }
        if self.next > self.limit {
            return Err(Error::TagsExhausted);
        }
        let tag = self.next as u16;
        self.next += 1;
        Ok(tag)
    }

    /// Return a tag to the free list for reuse.
    pub fn release(&mut self, tag: u16) {
        debug_assert!(tag != 0xFFFF, "NOTAG must never be released");
        self.free.push(tag);
    }

    /// Ids currently in use, for diagnostics/tests.
    pub fn in_use(&self) -> u32 {
        (self.next - 1) - self.free.len() as u32
    }
}

impl Default for TagAllocator {
    fn default() -> Self {
        TagAllocator::new()
    }
}

/// Allocates `u32` fids from `[1, 0xFFFF]`. `0xFFFFFFFF` is `NOFID` and is
/// never handed out.
#[derive(Debug)]
pub struct FidAllocator {
    free: Vec<u32>,
    next: u64,
    limit: u64,
}

impl FidAllocator {
    pub fn new() -> Self {
        FidAllocator {
            free: Vec::new(),
            next: 1,
            limit: 0xFFFF,
        }
    }

    pub fn acquire(&mut self) -> Result<u32, Error> {
        if let Some(fid) = self.free.pop() {
            return Ok(fid);
        }
        if self.next > self.limit {
            return Err(Error::FidsExhausted);
        }
        let fid = self.next as u32;
        self.next += 1;
        Ok(fid)
    }

    pub fn release(&mut self, fid: u32) {
        debug_assert!(fid != crate::fcall::NOFID, "NOFID must never be released");
        self.free.push(fid);
    }

    pub fn in_use(&self) -> u64 {
        (self.next - 1) - self.free.len() as u64
    }
}

impl Default for FidAllocator {
    fn default() -> Self {
        FidAllocator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_increasing_ids() {
        let mut a = TagAllocator::new();
        assert_eq!(a.acquire().unwrap(), 1);
        assert_eq!(a.acquire().unwrap(), 2);
        assert_eq!(a.acquire().unwrap(), 3);
    }

    #[test]
    fn released_ids_are_reused() {
        let mut a = TagAllocator::new();
        let t1 = a.acquire().unwrap();
        let _t2 = a.acquire().unwrap();
        a.release(t1);
        let t3 = a.acquire().unwrap();
        assert_eq!(t3, t1);
    }

    #[test]
    fn tag_space_exhausts_at_the_limit() {
        let mut a = TagAllocator {
            free: Vec::new(),
            next: 0xFFFE,
            limit: 0xFFFE,
        };
        assert_eq!(a.acquire().unwrap(), 0xFFFE);
        assert!(matches!(a.acquire(), Err(Error::TagsExhausted)));
    }

    #[test]
    fn fid_space_exhausts_at_the_limit() {
        let mut a = FidAllocator {
            free: Vec::new(),
            next: 0xFFFF,
            limit: 0xFFFF,
        };
        assert_eq!(a.acquire().unwrap(), 0xFFFF);
        assert!(matches!(a.acquire(), Err(Error::FidsExhausted)));
    }

    #[test]
    fn in_use_accounts_for_released_ids() {
        let mut a = FidAllocator::new();
        let f1 = a.acquire().unwrap();
        let _f2 = a.acquire().unwrap();
        assert_eq!(a.in_use(), 2);
        a.release(f1);
        assert_eq!(a.in_use(), 1);
    }
}
