//! Cycle-stepped model of the console hardware.
//!
//! The SDK only talks to this through memory and registers, the same way it would talk to the
//! real thing.

pub mod cart;
pub mod countdown;
pub mod mem;
pub mod mi;
pub mod pi;
pub mod scheduler;
pub mod sp;

use crate::system::{
    cart::Cartridge, countdown::Countdown, mem::Memory, scheduler::Scheduler, sp::Coprocessor,
};

/// CPU clock frequency, in Hz.
pub const CPU_FREQUENCY: u64 = 93_750_000;

/// CPU cycles per tick of the countdown timer.
pub const CYCLES_PER_TICK: u64 = 2;

/// Longest stretch the coprocessor runs before events are looked at again.
const SP_STEP: u64 = 64;

/// System state.
#[derive(Debug)]
pub struct System {
    /// Scheduler for hardware events.
    pub scheduler: Scheduler,
    /// Main memory.
    pub mem: Memory,
    /// Cartridge on the peripheral bus.
    pub cart: Cartridge,
    /// Interrupt controller.
    pub mi: mi::Interface,
    /// Peripheral bus DMA controller.
    pub pi: pi::Interface,
    /// Countdown timer.
    pub countdown: Countdown,
    /// The command coprocessor.
    pub sp: Coprocessor,
}

impl System {
    pub fn new(cartridge: Vec<u8>) -> Self {
        Self {
            scheduler: Scheduler::default(),
            mem: Memory::default(),
            cart: Cartridge::new(cartridge),
            mi: mi::Interface::default(),
            pi: pi::Interface::default(),
            countdown: Countdown::default(),
            sp: Coprocessor::default(),
        }
    }

    /// Runs every event that is due.
    pub fn process_events(&mut self) {
        while let Some(handler) = self.scheduler.pop() {
            handler(self);
        }
    }

    /// Advances the hardware by the given number of CPU cycles.
    pub fn exec(&mut self, cycles: u64) {
        let target = self.scheduler.elapsed() + cycles;
        while self.scheduler.elapsed() < target {
            self.process_events();

            let remaining = target - self.scheduler.elapsed();
            let until_next_event = self.scheduler.until_next().unwrap_or(u64::MAX);
            let step = remaining.min(until_next_event).min(SP_STEP).max(1);

            sp::exec(self, step);
            self.scheduler.advance(step);
        }

        self.process_events();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mark(sys: &mut System) {
        sys.mem.write_u32(util::Address(0x100), sys.scheduler.elapsed() as u32);
    }

    #[test]
    fn events_run_on_time() {
        let mut sys = System::new(Vec::new());
        sys.scheduler.schedule(300, mark);

        sys.exec(299);
        assert_eq!(sys.mem.read_u32(util::Address(0x100)), 0);

        sys.exec(1);
        assert_eq!(sys.mem.read_u32(util::Address(0x100)), 300);
        assert_eq!(sys.scheduler.elapsed(), 300);
    }
}
