//! Interrupt controller (MI).
use bitos::bitos;
use strum::{EnumIter, FromRepr, IntoEnumIterator};

/// An interrupt source.
/// Sources are dispatched in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumIter)]
#[repr(u8)]
pub enum Source {
    /// Command coprocessor.
    Sp = 0,
    /// Serial interface.
    Si = 1,
    /// Audio interface.
    Ai = 2,
    /// Video interface.
    Vi = 3,
    /// Peripheral bus DMA.
    Pi = 4,
    /// Display processor.
    Dp = 5,
    /// Countdown timer.
    Timer = 6,
    /// Cartridge.
    Cart = 7,
    /// Reset button (pre-NMI).
    Reset = 8,
}

impl Source {
    #[inline(always)]
    fn mask(self) -> u16 {
        1 << self as u16
    }
}

#[bitos(16)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sources {
    #[bits(0)]
    pub sp: bool,
    #[bits(1)]
    pub si: bool,
    #[bits(2)]
    pub ai: bool,
    #[bits(3)]
    pub vi: bool,
    #[bits(4)]
    pub pi: bool,
    #[bits(5)]
    pub dp: bool,
    #[bits(6)]
    pub timer: bool,
    #[bits(7)]
    pub cart: bool,
    #[bits(8)]
    pub reset: bool,
}

impl Sources {
    #[inline(always)]
    pub fn contains(self, source: Source) -> bool {
        self.to_bits() & source.mask() != 0
    }

    #[inline(always)]
    pub fn with(self, source: Source, value: bool) -> Self {
        let bits = if value {
            self.to_bits() | source.mask()
        } else {
            self.to_bits() & !source.mask()
        };

        Self::from_bits(bits)
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.to_bits() == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Source> {
        Source::iter().filter(move |s| self.contains(*s))
    }
}

#[derive(Debug, Default)]
pub struct Interface {
    pub pending: Sources,
    pub mask: Sources,
}

impl Interface {
    pub fn raise(&mut self, source: Source) {
        self.pending = self.pending.with(source, true);
    }

    pub fn set_mask(&mut self, source: Source, enabled: bool) {
        self.mask = self.mask.with(source, enabled);
    }

    /// Pending sources which are not masked out.
    pub fn allowed(&self) -> Sources {
        Sources::from_bits(self.pending.to_bits() & self.mask.to_bits())
    }

    /// Acknowledges and returns every pending source which is not masked out.
    pub fn take_allowed(&mut self) -> Sources {
        let allowed = self.allowed();
        self.pending = Sources::from_bits(self.pending.to_bits() & !allowed.to_bits());
        allowed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn masked_sources_stay_pending() {
        let mut mi = Interface::default();
        mi.set_mask(Source::Pi, true);
        mi.raise(Source::Pi);
        mi.raise(Source::Sp);

        let taken = mi.take_allowed();
        assert_eq!(taken.iter().collect::<Vec<_>>(), vec![Source::Pi]);
        assert!(mi.pending.sp());
        assert!(!mi.pending.pi());

        mi.set_mask(Source::Sp, true);
        assert!(mi.take_allowed().contains(Source::Sp));
        assert!(mi.pending.is_empty());
    }

    #[test]
    fn dispatch_order() {
        let order = Source::iter().map(|s| s as u8).collect::<Vec<_>>();
        assert_eq!(order, (0..9).collect::<Vec<_>>());

        let all = Source::iter().fold(Sources::default(), |acc, s| acc.with(s, true));
        assert_eq!(all.iter().count(), 9);
        assert_eq!(all.to_bits(), 0x1FF);
    }
}
