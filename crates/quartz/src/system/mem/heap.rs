use std::collections::BTreeMap;
use util::{Address, align_up, checked_align_up};

const ALIGNMENT: u32 = 16;

/// First-fit allocator for a region of RAM.
///
/// The heap never touches memory itself, it only hands out addresses.
#[derive(Debug)]
pub struct Heap {
    /// Free regions, sorted by address and never adjacent to each other.
    free: Vec<(u32, u32)>,
    /// Live allocations, address to length.
    used: BTreeMap<u32, u32>,
}

impl Heap {
    pub fn new(start: Address, len: u32) -> Self {
        let base = align_up(start.value(), ALIGNMENT);
        let len = len - (base - start.value());

        Self {
            free: vec![(base, len & !(ALIGNMENT - 1))],
            used: BTreeMap::new(),
        }
    }

    /// Allocates `len` bytes, aligned to 16 bytes.
    pub fn alloc(&mut self, len: u32) -> Option<Address> {
        let size = checked_align_up(len.max(1), ALIGNMENT)?;
        let index = self.free.iter().position(|(_, free)| *free >= size)?;

        let (base, free) = self.free[index];
        if free == size {
            self.free.remove(index);
        } else {
            self.free[index] = (base + size, free - size);
        }

        self.used.insert(base, size);
        Some(Address(base))
    }

    /// Releases an allocation. Returns `false` if `addr` is not a live allocation.
    pub fn free(&mut self, addr: Address) -> bool {
        let Some(size) = self.used.remove(&addr.value()) else {
            return false;
        };

        let base = addr.value();
        let index = self.free.partition_point(|(start, _)| *start < base);
        self.free.insert(index, (base, size));

        // merge with the next region
        if index + 1 < self.free.len() {
            let (next_base, next_len) = self.free[index + 1];
            if base + size == next_base {
                self.free[index].1 += next_len;
                self.free.remove(index + 1);
            }
        }

        // merge with the previous region
        if index > 0 {
            let (prev_base, prev_len) = self.free[index - 1];
            if prev_base + prev_len == base {
                self.free[index - 1].1 += self.free[index].1;
                self.free.remove(index);
            }
        }

        true
    }

    /// Total bytes currently allocated, including alignment padding.
    pub fn used_bytes(&self) -> u32 {
        self.used.values().sum()
    }

    /// Total bytes currently free.
    pub fn free_bytes(&self) -> u32 {
        self.free.iter().map(|(_, len)| len).sum()
    }
}
