//! Asynchronous transfers between the peripheral bus and RAM.
//!
//! Only one transfer can be in flight on the controller. Requests made while it is busy wait in
//! a FIFO and are started as soon as the previous one completes, either from the bus DMA
//! interrupt or whenever the status register is polled, so waiting also works with interrupts
//! disabled.
use crate::{
    Console,
    system::{
        cart::CART_BASE,
        mem::Memory,
        pi::{self, Direction},
    },
};
use easyerr::Error;
use std::collections::VecDeque;
use util::{Address, Span, checked_align_up};

/// Alignment required for RAM addresses.
pub const RAM_ALIGNMENT: u32 = 8;
/// Alignment required for bus addresses.
pub const BUS_ALIGNMENT: u32 = 2;

/// Identifies a submitted transfer. Tickets complete in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaTicket(u64);

impl DmaTicket {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("transfer has a length of zero")]
    ZeroLength,
    #[error("RAM address {f0} is not aligned to 8 bytes")]
    MisalignedRam(Address),
    #[error("bus address {f0} is not aligned to 2 bytes")]
    MisalignedBus(Address),
    #[error("RAM range {start}+{len:#x} is outside of RAM")]
    RamOutOfRange { start: Address, len: u32 },
    #[error("bus range {start}+{len:#x} is not backed by the cartridge")]
    BusOutOfRange { start: Address, len: u32 },
    #[error("transfer overlaps in-flight transfer #{f0}")]
    Overlapping(u64),
}

#[derive(Debug, Clone, Copy)]
struct Request {
    ticket: DmaTicket,
    direction: Direction,
    ram: Span,
    bus: Span,
}

impl Request {
    /// Whether running both requests in any order could give different results.
    fn conflicts(&self, other: &Request) -> bool {
        let ram = self.ram.overlaps(other.ram)
            && !(self.direction == Direction::ToBus && other.direction == Direction::ToBus);
        let bus = self.bus.overlaps(other.bus)
            && !(self.direction == Direction::ToRam && other.direction == Direction::ToRam);

        ram || bus
    }
}

/// State of the DMA engine.
#[derive(Debug, Default)]
pub struct DmaEngine {
    next_ticket: u64,
    active: Option<Request>,
    queued: VecDeque<Request>,
    /// Highest ticket known to be complete.
    completed: u64,
}

impl Console {
    /// Retires the active transfer if the controller is done and starts the next one.
    pub(crate) fn dma_update(&mut self) {
        if self.system.pi.status.dma_busy() {
            return;
        }

        if let Some(done) = self.dma.active.take() {
            if self.system.pi.status.error() {
                tracing::error!(ticket = done.ticket.0, "bus DMA transfer failed");
            }

            tracing::trace!(ticket = done.ticket.0, "bus DMA transfer complete");
            self.dma.completed = done.ticket.0;
        }

        let Some(next) = self.dma.queued.pop_front() else {
            return;
        };

        self.system.pi.ram_addr = next.ram.start;
        self.system.pi.bus_addr = next.bus.start;
        pi::start(&mut self.system, next.direction, next.ram.len);
        self.dma.active = Some(next);
    }

    fn dma_submit(
        &mut self,
        direction: Direction,
        ram: Address,
        bus: Address,
        len: u32,
        raw: bool,
    ) -> Result<DmaTicket, DmaError> {
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }

        let len = if raw {
            len
        } else {
            if !ram.is_aligned(RAM_ALIGNMENT) {
                return Err(DmaError::MisalignedRam(ram));
            }

            if !bus.is_aligned(BUS_ALIGNMENT) {
                return Err(DmaError::MisalignedBus(bus));
            }

            let Some(len) = checked_align_up(len, BUS_ALIGNMENT) else {
                return Err(DmaError::RamOutOfRange { start: ram, len });
            };

            len
        };

        if !Memory::contains(ram.span(len)) {
            return Err(DmaError::RamOutOfRange { start: ram, len });
        }

        if !bus.span(len).within(CART_BASE.value(), self.system.cart.len() as u64) {
            return Err(DmaError::BusOutOfRange { start: bus, len });
        }

        self.with_interrupts_disabled(|console| {
            console.dma.next_ticket += 1;
            let request = Request {
                ticket: DmaTicket(console.dma.next_ticket),
                direction,
                ram: ram.span(len),
                bus: bus.span(len),
            };

            let in_flight = console.dma.active.iter().chain(console.dma.queued.iter());
            if let Some(other) = in_flight.find(|o| o.conflicts(&request)) {
                let ticket = other.ticket.0;
                console.dma.next_ticket -= 1;
                return Err(DmaError::Overlapping(ticket));
            }

            tracing::debug!(
                ticket = request.ticket.0,
                ?direction,
                %ram,
                %bus,
                len,
                "queued bus DMA"
            );

            console.dma.queued.push_back(request);
            console.dma_update();
            Ok(request.ticket)
        })
    }

    /// Starts copying `len` bytes from the bus to RAM. `ram` must be 8 byte aligned and `bus` 2
    /// byte aligned; odd lengths are rounded up.
    pub fn dma_read_async(
        &mut self,
        ram: Address,
        bus: Address,
        len: u32,
    ) -> Result<DmaTicket, DmaError> {
        self.dma_submit(Direction::ToRam, ram, bus, len, false)
    }

    /// Starts copying `len` bytes from RAM to the bus. Same constraints as
    /// [`dma_read_async`](Self::dma_read_async).
    pub fn dma_write_async(
        &mut self,
        ram: Address,
        bus: Address,
        len: u32,
    ) -> Result<DmaTicket, DmaError> {
        self.dma_submit(Direction::ToBus, ram, bus, len, false)
    }

    /// Like [`dma_read_async`](Self::dma_read_async), without alignment checks or rounding.
    pub fn dma_read_raw_async(
        &mut self,
        ram: Address,
        bus: Address,
        len: u32,
    ) -> Result<DmaTicket, DmaError> {
        self.dma_submit(Direction::ToRam, ram, bus, len, true)
    }

    /// Like [`dma_write_async`](Self::dma_write_async), without alignment checks or rounding.
    pub fn dma_write_raw_async(
        &mut self,
        ram: Address,
        bus: Address,
        len: u32,
    ) -> Result<DmaTicket, DmaError> {
        self.dma_submit(Direction::ToBus, ram, bus, len, true)
    }

    /// Whether a transfer is in flight or queued. Does not advance time.
    pub fn dma_busy(&mut self) -> bool {
        self.dma_update();
        self.dma.active.is_some()
    }

    /// Whether the transfer of a ticket has completed.
    pub fn dma_done(&mut self, ticket: DmaTicket) -> bool {
        self.dma_update();
        self.dma.completed >= ticket.0
    }

    /// Polls until every transfer has completed.
    pub fn dma_wait(&mut self) {
        while self.dma_busy() {
            self.poll();
        }
    }

    /// Copies from the bus to RAM and waits for completion.
    pub fn dma_read(&mut self, ram: Address, bus: Address, len: u32) -> Result<(), DmaError> {
        self.dma_read_async(ram, bus, len)?;
        self.dma_wait();
        Ok(())
    }

    /// Copies from RAM to the bus and waits for completion.
    pub fn dma_write(&mut self, ram: Address, bus: Address, len: u32) -> Result<(), DmaError> {
        self.dma_write_async(ram, bus, len)?;
        self.dma_wait();
        Ok(())
    }

    pub fn dma_read_raw(&mut self, ram: Address, bus: Address, len: u32) -> Result<(), DmaError> {
        self.dma_read_raw_async(ram, bus, len)?;
        self.dma_wait();
        Ok(())
    }

    pub fn dma_write_raw(&mut self, ram: Address, bus: Address, len: u32) -> Result<(), DmaError> {
        self.dma_write_raw_async(ram, bus, len)?;
        self.dma_wait();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, system::pi::transfer_cycles};
    use std::sync::{Arc, Mutex};

    fn console(cartridge: Vec<u8>) -> Console {
        Console::new(
            Default::default(),
            Config {
                cartridge,
                poll_cycles: 16,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn busy_turns_false_exactly_once() {
        let mut console = console(vec![0; 0x1000]);
        let ram = console.alloc(0x400).unwrap();
        console.ram_mut(ram.span(0x400)).unwrap().fill(0xAB);

        console.dma_write_async(ram, CART_BASE, 0x400).unwrap();
        assert!(console.dma_busy());

        let mut transitions = 0;
        let mut was_busy = true;
        for _ in 0..200 {
            console.poll();
            let busy = console.dma_busy();
            if was_busy && !busy {
                transitions += 1;
            }

            assert!(!(busy && !was_busy));
            was_busy = busy;
        }

        assert_eq!(transitions, 1);
        assert!(console.system.cart.data()[..0x400].iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn read_lands_in_ram() {
        let data = pattern(0x800);
        let mut console = console(data.clone());
        let ram = console.alloc(0x800).unwrap();

        console.dma_read(ram, CART_BASE, 0x800).unwrap();
        assert_eq!(console.ram(ram.span(0x800)).unwrap(), &data[..]);
    }

    #[test]
    fn wait_is_not_early() {
        let mut console = console(pattern(0x1000));
        let ram = console.alloc(0x1000).unwrap();

        let start = console.elapsed();
        console.dma_read(ram, CART_BASE, 0x1000).unwrap();
        assert!(console.elapsed() - start >= transfer_cycles(0x1000));
        assert!(!console.dma_busy());
    }

    #[test]
    fn requests_queue_in_order() {
        let data = pattern(0x100);
        let mut console = console(data.clone());
        let ram = console.alloc(0x100).unwrap();

        let first = console.dma_read_async(ram, CART_BASE, 0x80).unwrap();
        let second = console
            .dma_read_async(ram + 0x80, CART_BASE + 0x80, 0x80)
            .unwrap();
        assert!(first < second);
        assert!(!console.dma_done(first));

        while !console.dma_done(first) {
            console.poll();
        }
        assert!(!console.dma_done(second));

        console.dma_wait();
        assert!(console.dma_done(second));
        assert_eq!(console.ram(ram.span(0x100)).unwrap(), &data[..]);
    }

    #[test]
    fn validation() {
        let mut console = console(vec![0; 0x100]);
        let ram = console.alloc(0x100).unwrap();

        assert!(matches!(
            console.dma_read_async(ram + 4, CART_BASE, 8),
            Err(DmaError::MisalignedRam(_))
        ));
        assert!(matches!(
            console.dma_read_async(ram, CART_BASE + 1, 8),
            Err(DmaError::MisalignedBus(_))
        ));
        assert!(matches!(
            console.dma_read_async(ram, CART_BASE + 0xF8, 0x10),
            Err(DmaError::BusOutOfRange { .. })
        ));
        assert!(matches!(
            console.dma_read_async(Address(0x003F_FFF8), CART_BASE, 0x10),
            Err(DmaError::RamOutOfRange { .. })
        ));
        assert!(matches!(
            console.dma_read_async(ram, CART_BASE, 0),
            Err(DmaError::ZeroLength)
        ));

        // lengths which overflow when rounded up
        assert!(matches!(
            console.dma_read_async(ram, CART_BASE, u32::MAX),
            Err(DmaError::RamOutOfRange { .. })
        ));
        assert!(matches!(
            console.dma_write_raw_async(ram, CART_BASE, u32::MAX),
            Err(DmaError::RamOutOfRange { .. })
        ));
        assert!(!console.dma_busy());

        // raw transfers skip alignment, but not range checks
        assert!(console.dma_read_raw_async(ram + 3, CART_BASE + 1, 5).is_ok());
        assert!(matches!(
            console.dma_read_raw_async(ram + 0x40, CART_BASE + 0xFF, 2),
            Err(DmaError::BusOutOfRange { .. })
        ));
    }

    #[test]
    fn odd_lengths_round_up() {
        let data = pattern(0x10);
        let mut console = console(data.clone());
        let ram = console.alloc(0x10).unwrap();

        console.dma_read(ram, CART_BASE, 3).unwrap();
        assert_eq!(console.ram(ram.span(4)).unwrap(), &[data[0], data[1], data[2], 0]);

        console.ram_mut(ram.span(0x10)).unwrap().fill(0);
        console.dma_read_raw(ram + 1, CART_BASE + 1, 3).unwrap();
        assert_eq!(
            console.ram(ram.span(5)).unwrap(),
            &[0, data[1], data[2], data[3], 0]
        );
    }

    #[test]
    fn overlapping_requests_are_rejected() {
        let mut console = console(vec![0; 0x1000]);
        let ram = console.alloc(0x1000).unwrap();

        let first = console.dma_read_async(ram, CART_BASE, 0x100).unwrap();
        assert!(matches!(
            console.dma_read_async(ram + 0x80, CART_BASE + 0x800, 0x100),
            Err(DmaError::Overlapping(t)) if t == first.value()
        ));
        assert!(matches!(
            console.dma_write_async(ram + 0x800, CART_BASE + 0x80, 0x100),
            Err(DmaError::Overlapping(_))
        ));

        // reading the same bus range into another buffer is fine
        assert!(console.dma_read_async(ram + 0x800, CART_BASE, 0x100).is_ok());

        console.dma_wait();
        assert!(console.dma_read_async(ram + 0x80, CART_BASE + 0x800, 0x100).is_ok());
    }

    #[test]
    fn timers_run_while_waiting() {
        let mut console = console(pattern(0x1000));
        let ram = console.alloc(0x1000).unwrap();
        console.dma_read_async(ram, CART_BASE, 0x1000).unwrap();

        let busy = Arc::new(Mutex::new(None));
        console.new_timer(1, 0, {
            let busy = busy.clone();
            move |console, _| *busy.lock().unwrap() = Some(console.dma_busy())
        });

        console.dma_wait();
        assert_eq!(*busy.lock().unwrap(), Some(true));
        assert!(!console.dma_busy());
    }

    #[test]
    fn wait_works_with_interrupts_disabled() {
        let mut console = console(pattern(0x200));
        let ram = console.alloc(0x200).unwrap();

        console.disable_interrupts();
        console.dma_read(ram, CART_BASE, 0x200).unwrap();
        assert!(!console.dma_busy());
        console.enable_interrupts();
    }
}
