//! Peripheral interface (PI), the bus DMA controller.
use crate::system::{System, mi::Source};
use bitos::bitos;
use util::Address;

/// Cycles spent setting up a transfer.
pub const SETUP_CYCLES: u64 = 200;
/// Cycles spent per byte transferred.
pub const CYCLES_PER_BYTE: u64 = 2;

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bus to RAM.
    ToRam = 0,
    /// RAM to bus.
    ToBus = 1,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    #[bits(0)]
    pub dma_busy: bool,
    #[bits(1)]
    pub error: bool,
    #[bits(2)]
    pub interrupt: bool,
    #[bits(3)]
    pub direction: Direction,
}

#[derive(Debug, Default)]
pub struct Interface {
    pub status: Status,
    pub ram_addr: Address,
    pub bus_addr: Address,
    pub length: u32,
    /// How many transfers have completed.
    pub completed: u64,
}

impl Interface {
    /// Clears the interrupt and error flags.
    pub fn acknowledge(&mut self) {
        self.status.set_interrupt(false);
        self.status.set_error(false);
    }
}

/// How long a transfer of `len` bytes takes, in CPU cycles.
pub fn transfer_cycles(len: u32) -> u64 {
    SETUP_CYCLES + len as u64 * CYCLES_PER_BYTE
}

/// Starts a transfer of `len` bytes between the programmed RAM and bus addresses. Ignored if a
/// transfer is already in progress.
pub fn start(sys: &mut System, direction: Direction, len: u32) {
    if sys.pi.status.dma_busy() {
        tracing::warn!("ignoring PI DMA start while a transfer is in progress");
        return;
    }

    tracing::debug!(
        ?direction,
        ram = %sys.pi.ram_addr,
        bus = %sys.pi.bus_addr,
        len,
        "starting PI DMA"
    );

    sys.pi.length = len;
    sys.pi.status.set_direction(direction);
    sys.pi.status.set_dma_busy(true);
    sys.scheduler.schedule(transfer_cycles(len), complete_transfer);
}

fn complete_transfer(sys: &mut System) {
    let ram = sys.pi.ram_addr.span(sys.pi.length);
    let bus = sys.pi.bus_addr.span(sys.pi.length);

    let ok = match sys.pi.status.direction() {
        Direction::ToRam => match (sys.cart.bytes(bus), sys.mem.bytes_mut(ram)) {
            (Some(src), Some(dst)) => {
                dst.copy_from_slice(src);
                true
            }
            _ => false,
        },
        Direction::ToBus => match (sys.mem.bytes(ram), sys.cart.bytes_mut(bus)) {
            (Some(src), Some(dst)) => {
                dst.copy_from_slice(src);
                true
            }
            _ => false,
        },
    };

    if ok {
        tracing::debug!(ram = %ram.start, bus = %bus.start, len = ram.len, "completed PI DMA");
    } else {
        tracing::warn!(
            ram = %ram.start,
            bus = %bus.start,
            len = ram.len,
            "PI DMA outside of RAM or cartridge, nothing transferred"
        );
    }

    sys.pi.status.set_error(!ok);
    sys.pi.status.set_dma_busy(false);
    sys.pi.status.set_interrupt(true);
    sys.pi.completed += 1;
    sys.mi.raise(Source::Pi);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::system::cart::CART_BASE;

    #[test]
    fn transfer_completes_after_delay() {
        let mut sys = System::new((0..64u8).collect());
        sys.pi.ram_addr = Address(0x2000);
        sys.pi.bus_addr = CART_BASE + 8;
        start(&mut sys, Direction::ToRam, 16);

        assert!(sys.pi.status.dma_busy());
        sys.exec(transfer_cycles(16) - 1);
        assert!(sys.pi.status.dma_busy());

        sys.exec(1);
        assert!(!sys.pi.status.dma_busy());
        assert!(sys.pi.status.interrupt());
        assert!(sys.mi.pending.pi());
        assert_eq!(sys.mem.read_u32(Address(0x2000)), 0x0809_0A0B);
    }

    #[test]
    fn out_of_range_sets_error() {
        let mut sys = System::new(vec![0; 16]);
        sys.pi.ram_addr = Address(0x2000);
        sys.pi.bus_addr = CART_BASE + 8;
        start(&mut sys, Direction::ToRam, 16);
        sys.exec(transfer_cycles(16));

        assert!(sys.pi.status.error());
        assert!(!sys.pi.status.dma_busy());
    }
}
