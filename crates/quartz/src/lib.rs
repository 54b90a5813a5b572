//! Coprocessor command queue and bus DMA runtime.
//!
//! A [`Console`] owns a cycle-stepped model of the console hardware ([`system`]) and the SDK
//! components that drive it: the command [`queue`], the [`dma`] engine, [`timer`]s, [`interrupt`]
//! dispatch and the cartridge filesystem ([`fs`]). The SDK side only ever talks to the hardware
//! through memory and registers.

pub mod dma;
pub mod fs;
pub mod interrupt;
pub mod modules;
pub mod protocol;
pub mod queue;
pub mod system;
pub mod timer;
pub mod ucode;

mod shared;

use crate::{
    dma::DmaEngine,
    interrupt::{Interrupts, Source},
    modules::Modules,
    queue::{Queue, QueueError},
    system::{
        System,
        cart::CART_WINDOW,
        mem::{HEAP_START, Heap, RAM_LEN, RING_MAX_WORDS, RING_MIN_WORDS},
        sp,
    },
    timer::Timers,
};
use easyerr::Error;

pub use shared::Shared;
pub use util::{Address, Span};

/// Console configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cartridge image mapped on the peripheral bus.
    pub cartridge: Vec<u8>,
    /// Capacity of the command ring, in words.
    pub ring_words: u32,
    /// How many cycles the hardware advances per poll.
    pub poll_cycles: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cartridge: Vec::new(),
            ring_words: 1024,
            poll_cycles: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ring capacity of {f0} words is outside of 64..=16384")]
    RingCapacity(u32),
    #[error("cartridge of {f0} bytes does not fit in the bus window")]
    CartridgeTooLarge(usize),
    #[error("polling quantum must be at least one cycle")]
    PollQuantum,
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(RING_MIN_WORDS..=RING_MAX_WORDS).contains(&self.ring_words) {
            return Err(ConfigError::RingCapacity(self.ring_words));
        }

        if self.cartridge.len() > CART_WINDOW as usize {
            return Err(ConfigError::CartridgeTooLarge(self.cartridge.len()));
        }

        if self.poll_cycles == 0 {
            return Err(ConfigError::PollQuantum);
        }

        Ok(())
    }
}

/// The console: hardware model plus SDK state.
pub struct Console {
    /// Hardware state.
    pub system: System,
    modules: Modules,
    interrupts: Interrupts,
    timers: Timers<Console>,
    dma: DmaEngine,
    queue: Queue,
    heap: Heap,
    fs: Option<fs::Mount>,
    poll_cycles: u64,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("system", &self.system)
            .field("interrupts", &self.interrupts)
            .field("dma", &self.dma)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Console {
    pub fn new(modules: Modules, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let ring_words = config.ring_words;
        let mut console = Self {
            system: System::new(config.cartridge),
            modules,
            interrupts: Interrupts::default(),
            timers: Timers::default(),
            dma: DmaEngine::default(),
            queue: Queue::new(ring_words),
            heap: Heap::new(HEAP_START, RAM_LEN as u32 - HEAP_START.value()),
            fs: None,
            poll_cycles: config.poll_cycles,
        };

        for source in [Source::Sp, Source::Pi, Source::Timer, Source::Reset] {
            console.system.mi.set_mask(source, true);
        }

        sp::configure_ring(&mut console.system, ring_words);

        tracing::info!(
            ring_words,
            cartridge = console.system.cart.len(),
            poll_cycles = console.poll_cycles,
            "console ready"
        );

        Ok(console)
    }

    /// Advances the hardware by one polling quantum, then lets the SDK react to it: the DMA
    /// queue advances, blocks whose syncpoint was reached are freed and pending interrupts are
    /// dispatched.
    #[track_caller]
    pub fn poll(&mut self) {
        self.poll_for(self.poll_cycles);
    }

    #[track_caller]
    fn poll_for(&mut self, cycles: u64) {
        self.system.exec(cycles);
        self.dma_update();
        self.reclaim_blocks();
        self.dispatch_interrupts();
    }

    /// Keeps polling for the given number of cycles.
    #[track_caller]
    pub fn run_for(&mut self, cycles: u64) {
        let target = self.elapsed() + cycles;
        while self.elapsed() < target {
            let step = self.poll_cycles.min(target - self.elapsed());
            self.poll_for(step);
        }
    }

    /// Cycles elapsed since the console was created.
    pub fn elapsed(&self) -> u64 {
        self.system.scheduler.elapsed()
    }

    /// Allocates `len` bytes of RAM from the heap. The address is 16 byte aligned.
    pub fn alloc(&mut self, len: u32) -> Option<Address> {
        self.heap.alloc(len)
    }

    /// Frees an allocation made with [`alloc`](Self::alloc).
    pub fn free(&mut self, addr: Address) -> bool {
        self.heap.free(addr)
    }

    /// Bytes of RAM still available from the heap.
    pub fn free_bytes(&self) -> u32 {
        self.heap.free_bytes()
    }

    /// A view of RAM.
    pub fn ram(&self, span: Span) -> Option<&[u8]> {
        self.system.mem.bytes(span)
    }

    /// A mutable view of RAM.
    pub fn ram_mut(&mut self, span: Span) -> Option<&mut [u8]> {
        self.system.mem.bytes_mut(span)
    }

    /// Drains the command queue and the DMA engine.
    pub fn close(mut self) -> Result<(), QueueError> {
        let result = match self.crash() {
            Some(_) => Ok(()),
            None => self.sync(),
        };

        self.dma_wait();
        tracing::info!(elapsed = self.elapsed(), "console closed");

        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_validation() {
        let config = |ring_words, poll_cycles| Config {
            ring_words,
            poll_cycles,
            ..Default::default()
        };

        assert!(matches!(
            Console::new(Modules::default(), config(8, 16)),
            Err(ConfigError::RingCapacity(8))
        ));
        assert!(matches!(
            Console::new(Modules::default(), config(RING_MAX_WORDS + 1, 16)),
            Err(ConfigError::RingCapacity(_))
        ));
        assert!(matches!(
            Console::new(Modules::default(), config(64, 0)),
            Err(ConfigError::PollQuantum)
        ));
        assert!(Console::new(Modules::default(), config(RING_MIN_WORDS, 1)).is_ok());
    }

    #[test]
    fn run_for_is_exact() {
        let mut console = Console::new(
            Modules::default(),
            Config {
                poll_cycles: 100,
                ..Default::default()
            },
        )
        .unwrap();

        console.run_for(250);
        assert_eq!(console.elapsed(), 250);
    }

    #[test]
    fn heap_allocations() {
        let mut console = Console::new(Modules::default(), Config::default()).unwrap();
        let before = console.free_bytes();

        let a = console.alloc(100).unwrap();
        let b = console.alloc(100).unwrap();
        assert!(a.is_aligned(16) && b.is_aligned(16));
        assert!(a >= HEAP_START && !a.span(100).overlaps(b.span(100)));

        assert!(console.free(a));
        assert!(!console.free(a));
        assert!(console.free(b));
        assert_eq!(console.free_bytes(), before);

        assert!(console.alloc(u32::MAX).is_none());
        assert!(console.alloc(RAM_LEN as u32).is_none());
        assert_eq!(console.free_bytes(), before);
    }
}
