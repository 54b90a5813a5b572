//! Cartridge on the peripheral bus.
use util::{Address, Span};

/// Bus address the cartridge is mapped at.
pub const CART_BASE: Address = Address(0x1000_0000);

/// Size of the cartridge window on the bus.
pub const CART_WINDOW: u32 = 0x0FC0_0000;

/// A writable cartridge image (ROM plus backup memory, modelled as one flat space).
#[derive(Default)]
pub struct Cartridge {
    data: Vec<u8>,
}

impl std::fmt::Debug for Cartridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cartridge")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Cartridge {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the bus span is backed by the cartridge.
    pub fn contains(&self, span: Span) -> bool {
        span.within(CART_BASE.value(), self.data.len() as u64)
    }

    /// The bytes backing a bus span.
    pub fn bytes(&self, span: Span) -> Option<&[u8]> {
        self.contains(span).then(|| {
            let offset = (span.start - CART_BASE) as usize;
            &self.data[offset..][..span.len as usize]
        })
    }

    /// The bytes backing a bus span.
    pub fn bytes_mut(&mut self, span: Span) -> Option<&mut [u8]> {
        self.contains(span).then(|| {
            let offset = (span.start - CART_BASE) as usize;
            &mut self.data[offset..][..span.len as usize]
        })
    }

    /// The whole image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
