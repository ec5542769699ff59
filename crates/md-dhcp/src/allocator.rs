//! Bitmap address allocator over an inclusive IPv4 range.

use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocError {
    #[error("start of IP range {start} must not be above its end {stop}")]
    InvalidRange { start: Ipv4Addr, stop: Ipv4Addr },
    #[error("no free address left in {start}-{stop}")]
    Exhausted { start: Ipv4Addr, stop: Ipv4Addr },
}

/// One bit per address in `[start, stop]`; a set bit means leased.
///
/// Allocation always returns the lowest free address.
#[derive(Debug, Clone)]
pub struct BitmapAllocator {
    start: u32,
    stop: u32,
    words: Vec<u64>,
    used: u32,
}

impl BitmapAllocator {
    pub fn new(start: Ipv4Addr, stop: Ipv4Addr) -> Result<Self, AllocError> {
        let (lo, hi) = (u32::from(start), u32::from(stop));
        if lo > hi {
            return Err(AllocError::InvalidRange { start, stop });
        }
        // hi - lo + 1 cannot overflow unless the range is all of IPv4
        let size = u64::from(hi - lo) + 1;
        let words = size.div_ceil(64) as usize;

        Ok(Self {
            start: lo,
            stop: hi,
            words: vec![0; words],
            used: 0,
        })
    }

    pub fn start(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    pub fn stop(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.stop)
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        u64::from(self.stop - self.start) + 1
    }

    pub fn free(&self) -> u64 {
        self.size() - u64::from(self.used)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= self.start && addr <= self.stop
    }

    fn slot(&self, ip: Ipv4Addr) -> Option<(usize, u64)> {
        if !self.contains(ip) {
            return None;
        }
        let offset = u32::from(ip) - self.start;
        Some(((offset / 64) as usize, 1u64 << (offset % 64)))
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.slot(ip)
            .is_some_and(|(word, mask)| self.words[word] & mask != 0)
    }

    /// Take the lowest free address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, AllocError> {
        let size = self.size();
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as u64;
            let offset = index as u64 * 64 + bit;
            if offset >= size {
                break;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Ok(Ipv4Addr::from(self.start + offset as u32));
        }

        Err(AllocError::Exhausted {
            start: self.start(),
            stop: self.stop(),
        })
    }

    /// Mark a specific address as leased. Returns false when it is outside
    /// the range; marking an already-set bit is a no-op.
    pub fn mark(&mut self, ip: Ipv4Addr) -> bool {
        let Some((word, mask)) = self.slot(ip) else {
            return false;
        };
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.used += 1;
        }
        true
    }

    /// Clear an address. Only used to undo an allocation whose lease could
    /// not be persisted.
    pub(crate) fn release(&mut self, ip: Ipv4Addr) {
        if let Some((word, mask)) = self.slot(ip) {
            if self.words[word] & mask != 0 {
                self.words[word] &= !mask;
                self.used -= 1;
            }
        }
    }
}
