//! Main memory (RAM) of the console.
mod heap;

pub use heap::Heap;

use util::{Address, Span, boxed_array};

pub const RAM_LEN: usize = 4 * bytesize::MIB as usize;

/// Where the coprocessor writes its crash record.
pub const CRASH_ADDR: Address = Address(0x0000_0200);

/// Base of the command ring.
pub const RING_ADDR: Address = Address(0x0000_1000);
/// Largest command ring, in words.
pub const RING_MAX_WORDS: u32 = 0x4000;
/// Smallest command ring, in words. The largest command must fit whatever the cursor position.
pub const RING_MIN_WORDS: u32 = 64;

/// Start of the region handed out by the [`Heap`].
pub const HEAP_START: Address = Address(0x0002_0000);

pub struct Memory {
    ram: Box<[u8; RAM_LEN]>,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            ram: boxed_array(0),
        }
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory").field("len", &RAM_LEN).finish()
    }
}

impl Memory {
    #[inline(always)]
    fn offset(addr: Address, alignment: usize) -> usize {
        (addr.value() as usize & (RAM_LEN - 1)) & !(alignment - 1)
    }

    /// Whether `span` lies entirely in RAM.
    #[inline(always)]
    pub fn contains(span: Span) -> bool {
        span.within(0, RAM_LEN as u64)
    }

    /// Reads a big-endian word. The address is mirrored into RAM and the low bits are ignored,
    /// as the memory controller does.
    #[inline(always)]
    pub fn read_u32(&self, addr: Address) -> u32 {
        let offset = Self::offset(addr, 4);
        let bytes = &self.ram[offset..][..4];
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[inline(always)]
    pub fn write_u32(&mut self, addr: Address, value: u32) {
        let offset = Self::offset(addr, 4);
        self.ram[offset..][..4].copy_from_slice(&value.to_be_bytes());
    }

    #[inline(always)]
    pub fn read_u64(&self, addr: Address) -> u64 {
        let high = self.read_u32(Address(addr.value() & !7)) as u64;
        let low = self.read_u32(Address(addr.value() & !7) + 4) as u64;
        (high << 32) | low
    }

    #[inline(always)]
    pub fn write_u64(&mut self, addr: Address, value: u64) {
        let base = Address(addr.value() & !7);
        self.write_u32(base, (value >> 32) as u32);
        self.write_u32(base + 4, value as u32);
    }

    /// The bytes of `span`, if it lies in RAM.
    pub fn bytes(&self, span: Span) -> Option<&[u8]> {
        Self::contains(span)
            .then(|| &self.ram[span.start.value() as usize..][..span.len as usize])
    }

    /// The bytes of `span`, if it lies in RAM.
    pub fn bytes_mut(&mut self, span: Span) -> Option<&mut [u8]> {
        Self::contains(span)
            .then(|| &mut self.ram[span.start.value() as usize..][..span.len as usize])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn words_are_big_endian() {
        let mut mem = Memory::default();
        mem.write_u32(Address(0x100), 0x1122_3344);
        assert_eq!(
            mem.bytes(Address(0x100).span(4)).unwrap(),
            &[0x11, 0x22, 0x33, 0x44]
        );

        mem.write_u64(Address(0x108), 0xAABB_CCDD_0011_2233);
        assert_eq!(mem.read_u32(Address(0x108)), 0xAABB_CCDD);
        assert_eq!(mem.read_u64(Address(0x10C)), 0xAABB_CCDD_0011_2233);
    }

    #[test]
    fn addresses_mirror() {
        let mut mem = Memory::default();
        mem.write_u32(Address(RAM_LEN as u32 + 0x10), 7);
        assert_eq!(mem.read_u32(Address(0x10)), 7);
        assert_eq!(mem.read_u32(Address(0x13)), 7);
    }

    #[test]
    fn out_of_range_spans() {
        let mem = Memory::default();
        assert!(mem.bytes(Address(RAM_LEN as u32 - 4).span(8)).is_none());
        assert!(mem.bytes(Address(RAM_LEN as u32 - 4).span(4)).is_some());
    }
}
