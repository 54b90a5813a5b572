//! The coprocessor command queue.
//!
//! Commands are appended to a ring in RAM. The CPU owns the write cursor and the coprocessor owns
//! the read cursor; one slot is always left free so that equal cursors mean an empty ring. A
//! command never straddles the end of the ring: when it does not fit in the linear space left,
//! a `JUMP` marker is written and the command goes at the start instead. Publishing the write
//! cursor rings the doorbell, which wakes the coprocessor if it went idle.
//!
//! Progress is tracked with syncpoints, monotonically increasing ids whose retire markers travel
//! through the ring with everything else.
//!
//! Waiting for ring space polls the hardware, which may dispatch interrupts whose handlers enqueue
//! commands of their own. Space is therefore reserved first and nothing is polled between writing
//! a command and publishing it, so every append lands whole and syncpoint ids are handed out in
//! ring order.
mod block;
mod crash;

pub use block::Block;
pub use crash::CrashReport;

use crate::{
    Console,
    protocol::{ARG_MASK, DMA_TO_RAM, Header, KERNEL_OVERLAY, Kernel, MAX_COMMAND_WORDS},
    system::{
        mem::{Memory, RING_ADDR},
        sp::{self, DMEM_LEN},
    },
    ucode::{Microcode, MicrocodeError},
};
use easyerr::{Error, ResultExt};
use std::{collections::VecDeque, sync::Arc};
use tinyvec::ArrayVec;
use util::Address;

/// A command: a header word followed by up to 15 operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    words: ArrayVec<[u32; MAX_COMMAND_WORDS]>,
}

impl Command {
    /// A command without operands. `arg` is truncated to 20 bits.
    pub fn new(overlay: u8, index: u8, arg: u32) -> Self {
        let mut words = ArrayVec::new();
        words.push(Header::new(overlay, index, 0, arg).to_bits());

        Self { words }
    }

    /// Builds a command from operands known to fit.
    pub(crate) fn from_parts(overlay: u8, index: u8, arg: u32, operands: &[u32]) -> Self {
        let operands = &operands[..operands.len().min(MAX_COMMAND_WORDS - 1)];
        let mut words = ArrayVec::new();
        words.push(Header::new(overlay, index, operands.len(), arg).to_bits());
        words.extend_from_slice(operands);

        Self { words }
    }

    fn kernel(op: Kernel, arg: u32, operands: &[u32]) -> Self {
        Self::from_parts(KERNEL_OVERLAY, op as u8, arg, operands)
    }

    /// Replaces the operands of this command.
    pub fn with_operands(self, operands: &[u32]) -> Result<Self, QueueError> {
        if operands.len() >= MAX_COMMAND_WORDS {
            return Err(QueueError::CommandTooLarge(operands.len() + 1));
        }

        let header = self.header();
        Ok(Self::from_parts(
            header.overlay().value(),
            header.index().value(),
            header.arg().value(),
            operands,
        ))
    }

    /// Decodes a command from raw words. The header's operand count must match.
    pub fn from_words(words: &[u32]) -> Result<Self, QueueError> {
        let Some((&first, operands)) = words.split_first() else {
            return Err(QueueError::CommandTooLarge(0));
        };

        if words.len() > MAX_COMMAND_WORDS {
            return Err(QueueError::CommandTooLarge(words.len()));
        }

        let header = Header::from_bits(first);
        if header.len() != words.len() {
            return Err(QueueError::CommandTooLarge(words.len()));
        }

        let mut command = Self {
            words: ArrayVec::new(),
        };
        command.words.push(first);
        command.words.extend_from_slice(operands);

        Ok(command)
    }

    pub fn header(&self) -> Header {
        Header::from_bits(self.words[0])
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Length in words, header included.
    pub fn len(&self) -> usize {
        self.words.len()
    }
}

/// Identifies a point in the command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Syncpoint(u64);

impl Syncpoint {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("a block is already being recorded")]
    AlreadyRecording,
    #[error("no block is being recorded")]
    NotRecording,
    #[error("syncpoints cannot be recorded into blocks")]
    SyncpointInBlock,
    #[error("operation not allowed while a block is being recorded")]
    RecordingActive,
    #[error("syncpoint {f0} has not been allocated yet")]
    NeverAllocated(u64),
    #[error("coprocessor is busy or has pending commands")]
    NotIdle,
    #[error("overlay 0 is reserved for kernel commands")]
    ReservedOverlay,
    #[error("command of {f0} words is invalid (1..=16 words, matching the header)")]
    CommandTooLarge(usize),
    #[error("out of RAM for a block of {f0} bytes")]
    OutOfMemory(u32),
    #[error("blocks nest deeper than the coprocessor call stack")]
    BlockTooDeep,
    #[error("data memory range {offset:#x}+{len:#x} is out of bounds")]
    DmemRange { offset: u32, len: u32 },
    #[error(transparent)]
    Microcode { source: MicrocodeError },
    #[error("{f0}")]
    Crashed(Box<CrashReport>),
}

#[derive(Debug)]
struct Recording {
    words: Vec<u32>,
    /// Deepest block called by the block being recorded.
    callee_depth: usize,
}

/// CPU side state of the command queue.
#[derive(Debug)]
pub struct Queue {
    capacity: u32,
    write_ptr: u32,
    next_syncpoint: u64,
    recording: Option<Recording>,
    /// Blocks to free once their syncpoint is reached.
    pending_frees: VecDeque<(Syncpoint, Address)>,
    crashed: Option<Box<CrashReport>>,
    /// How many times the ring wrapped around.
    wraps: u64,
}

impl Queue {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            capacity,
            write_ptr: 0,
            next_syncpoint: 1,
            recording: None,
            pending_frees: VecDeque::new(),
            crashed: None,
            wraps: 0,
        }
    }
}

impl Console {
    fn write_ring(&mut self, at: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.system
                .mem
                .write_u32(RING_ADDR + (at + i as u32) * 4, *word);
        }
    }

    fn publish(&mut self, write_ptr: u32) {
        self.queue.write_ptr = write_ptr;
        sp::write_write_ptr(&mut self.system, write_ptr);
    }

    /// Waits until `len` words fit in the ring and returns the index they go at. Writes the
    /// `JUMP` marker if the words go at the start. Nothing is published, so the caller must
    /// write and publish without polling in between.
    #[track_caller]
    fn reserve_ring(&mut self, len: u32) -> Result<u32, QueueError> {
        let capacity = self.queue.capacity;

        loop {
            self.check_crash()?;

            let read = self.system.sp.read_ptr;
            let write = self.queue.write_ptr;

            if read > write {
                if write + len < read {
                    return Ok(write);
                }
            } else if write + len < capacity {
                return Ok(write);
            } else if len < read {
                let jump = Command::kernel(Kernel::Jump, 0, &[]);
                self.write_ring(write, jump.words());
                self.queue.wraps += 1;

                tracing::trace!(write, read, len, "command ring wrapped");
                return Ok(0);
            }

            self.poll();
        }
    }

    /// Appends words to the ring, waiting for space if needed.
    #[track_caller]
    fn push_ring(&mut self, words: &[u32]) -> Result<(), QueueError> {
        let len = words.len() as u32;
        let at = self.reserve_ring(len)?;
        self.write_ring(at, words);
        self.publish(at + len);

        Ok(())
    }

    /// Appends a command. While a block is being recorded, the command goes into the block
    /// instead. Only waits if the ring is full.
    ///
    /// Overlay 0 belongs to the kernel and is rejected.
    #[track_caller]
    pub fn enqueue(&mut self, command: Command) -> Result<(), QueueError> {
        if command.header().overlay().value() == KERNEL_OVERLAY {
            return Err(QueueError::ReservedOverlay);
        }

        self.enqueue_kernel(command)
    }

    #[track_caller]
    fn enqueue_kernel(&mut self, command: Command) -> Result<(), QueueError> {
        self.check_crash()?;

        if let Some(recording) = &mut self.queue.recording {
            recording.words.extend_from_slice(command.words());
            return Ok(());
        }

        self.push_ring(command.words())
    }

    /// Enqueues a kernel command that does nothing.
    #[track_caller]
    pub fn noop(&mut self) -> Result<(), QueueError> {
        self.enqueue_kernel(Command::kernel(Kernel::Noop, 0, &[]))
    }

    /// Enqueues a command which sets and then clears coprocessor signal bits.
    #[track_caller]
    pub fn signal(&mut self, set: u8, clear: u8) -> Result<(), QueueError> {
        let arg = set as u32 | ((clear as u32) << 8);
        self.enqueue_kernel(Command::kernel(Kernel::Signal, arg, &[]))
    }

    fn dmem_transfer(
        &mut self,
        ram: Address,
        dmem: u32,
        len: u32,
        to_ram: bool,
    ) -> Result<(), QueueError> {
        if len == 0 || dmem as usize + len as usize > DMEM_LEN {
            return Err(QueueError::DmemRange { offset: dmem, len });
        }

        if !Memory::contains(ram.span(len)) {
            return Err(QueueError::DmemRange { offset: dmem, len });
        }

        let direction = if to_ram { DMA_TO_RAM } else { 0 };
        self.enqueue_kernel(Command::kernel(
            Kernel::Dma,
            len,
            &[ram.value(), dmem | direction],
        ))
    }

    /// Enqueues a copy of `len` bytes from RAM into coprocessor data memory.
    #[track_caller]
    pub fn dma_to_dmem(&mut self, ram: Address, dmem: u32, len: u32) -> Result<(), QueueError> {
        self.dmem_transfer(ram, dmem, len, false)
    }

    /// Enqueues a copy of `len` bytes from coprocessor data memory into RAM.
    #[track_caller]
    pub fn dma_from_dmem(&mut self, ram: Address, dmem: u32, len: u32) -> Result<(), QueueError> {
        self.dmem_transfer(ram, dmem, len, true)
    }

    /// Allocates a syncpoint and enqueues its retire marker.
    #[track_caller]
    pub fn new_syncpoint(&mut self) -> Result<Syncpoint, QueueError> {
        self.check_crash()?;
        if self.queue.recording.is_some() {
            return Err(QueueError::SyncpointInBlock);
        }

        // the id is taken only once space is reserved: handlers run while waiting may allocate
        // syncpoints of their own
        let at = self.reserve_ring(1)?;
        let id = Syncpoint(self.queue.next_syncpoint);
        self.queue.next_syncpoint += 1;

        let marker = Command::kernel(Kernel::Syncpoint, id.0 as u32 & ARG_MASK, &[]);
        self.write_ring(at, marker.words());
        self.publish(at + 1);

        Ok(id)
    }

    /// Whether the coprocessor has reached a syncpoint. Never waits.
    #[track_caller]
    pub fn check_syncpoint(&mut self, id: Syncpoint) -> Result<bool, QueueError> {
        self.check_crash()?;
        if id.0 >= self.queue.next_syncpoint {
            return Err(QueueError::NeverAllocated(id.0));
        }

        Ok(self.system.sp.reached >= id.0)
    }

    /// Polls until the coprocessor reaches a syncpoint. Works with interrupts disabled.
    #[track_caller]
    pub fn wait_syncpoint(&mut self, id: Syncpoint) -> Result<(), QueueError> {
        while !self.check_syncpoint(id)? {
            self.poll();
        }

        Ok(())
    }

    /// Waits until everything enqueued so far has been executed.
    #[track_caller]
    pub fn sync(&mut self) -> Result<(), QueueError> {
        let id = self.new_syncpoint()?;
        self.wait_syncpoint(id)
    }

    /// The last syncpoint allocated, if any.
    pub fn last_syncpoint(&self) -> Option<Syncpoint> {
        let last = self.queue.next_syncpoint - 1;
        (last > 0).then_some(Syncpoint(last))
    }

    /// Replaces the resident microcode. The coprocessor must be idle with an empty ring and no
    /// block may be being recorded.
    #[track_caller]
    pub fn switch_microcode(&mut self, microcode: Arc<Microcode>) -> Result<(), QueueError> {
        self.check_crash()?;
        microcode.validate().context(QueueCtx::Microcode)?;

        if self.queue.recording.is_some() {
            return Err(QueueError::RecordingActive);
        }

        if !self.is_idle() {
            return Err(QueueError::NotIdle);
        }

        tracing::info!(
            name = microcode.name(),
            overlay = microcode.overlay(),
            "switching microcode"
        );

        let reached = self.queue.next_syncpoint - 1;
        sp::load(&mut self.system, microcode, reached);

        Ok(())
    }

    /// Name of the resident microcode.
    pub fn microcode(&self) -> Option<&str> {
        self.system.sp.program.as_ref().map(|m| m.name())
    }

    /// Whether the ring is drained and the coprocessor has stopped.
    pub fn is_idle(&self) -> bool {
        self.system.sp.is_idle() && self.queue.write_ptr == self.system.sp.read_ptr
    }

    /// Capacity of the ring, in words.
    pub fn ring_words(&self) -> u32 {
        self.queue.capacity
    }

    /// How many times the ring wrapped around.
    pub fn ring_wraps(&self) -> u64 {
        self.queue.wraps
    }

    /// Called on the coprocessor interrupt, raised for retired syncpoints and crashes.
    #[track_caller]
    pub(crate) fn coprocessor_interrupt(&mut self) {
        if self.system.sp.status.broke() && self.queue.crashed.is_none() {
            self.latch_crash(std::panic::Location::caller());
        }

        self.reclaim_blocks();
    }
}
