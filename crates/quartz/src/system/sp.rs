//! Command coprocessor (SP).
//!
//! The coprocessor consumes the command ring written by the CPU. Kernel commands (overlay 0) are
//! handled here; everything else goes to the resident microcode's [`Program`].
//!
//! [`Program`]: crate::ucode::Program
use crate::{
    protocol::{
        ARG_MASK, CrashKind, CrashRecord, DMA_TO_RAM, Header, KERNEL_OVERLAY, Kernel,
        MAX_COMMAND_WORDS,
    },
    system::{
        System,
        mem::{CRASH_ADDR, Memory, RING_ADDR, RING_MAX_WORDS},
        mi::Source,
    },
    ucode::{Assert, Exec, Microcode},
};
use bitos::bitos;
use std::sync::Arc;
use tinyvec::ArrayVec;
use util::{Address, boxed_array};
use zerocopy::IntoBytes;

pub const IMEM_LEN: usize = 4 * bytesize::KIB as usize;
pub const DMEM_LEN: usize = 4 * bytesize::KIB as usize;

/// How deep blocks can nest.
pub const STACK_DEPTH: usize = 8;

/// Cycles spent fetching and decoding a command, on top of one cycle per word.
const COMMAND_CYCLES: u64 = 4;

/// Bytes moved per cycle by the kernel DMA command.
const DMA_BYTES_PER_CYCLE: u64 = 8;

#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    /// Not executing. Cleared by the doorbell unless `broke` is set.
    #[bits(0)]
    pub halted: bool,
    /// Crashed. Only cleared by loading a microcode.
    #[bits(1)]
    pub broke: bool,
    #[bits(8..16)]
    pub signals: u8,
}

/// Where commands are being read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Frame {
    #[default]
    Ring,
    Block(Address),
}

pub struct Coprocessor {
    pub status: Status,
    /// Read cursor in the ring, in words. Owned by the coprocessor.
    pub read_ptr: u32,
    /// Write cursor in the ring, in words. Written by the CPU.
    pub write_ptr: u32,
    /// Capacity of the ring, in words.
    pub ring_words: u32,
    /// How many syncpoints have been retired.
    pub reached: u64,
    pub imem: Box<[u8; IMEM_LEN]>,
    pub dmem: Box<[u8; DMEM_LEN]>,
    pub program: Option<Arc<Microcode>>,
    pub location: Frame,
    pub stack: ArrayVec<[Frame; STACK_DEPTH]>,
    /// Cycles the coprocessor may still run for. Negative while stalled.
    budget: i64,
    /// How many times the doorbell was rung.
    pub doorbells: u64,
    /// How many commands were executed.
    pub executed: u64,
}

impl Default for Coprocessor {
    fn default() -> Self {
        Self {
            status: Status::default().with_halted(true),
            read_ptr: 0,
            write_ptr: 0,
            ring_words: RING_MAX_WORDS,
            reached: 0,
            imem: boxed_array(0),
            dmem: boxed_array(0),
            program: None,
            location: Frame::Ring,
            stack: ArrayVec::new(),
            budget: 0,
            doorbells: 0,
            executed: 0,
        }
    }
}

impl std::fmt::Debug for Coprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coprocessor")
            .field("status", &self.status)
            .field("read_ptr", &self.read_ptr)
            .field("write_ptr", &self.write_ptr)
            .field("reached", &self.reached)
            .field("location", &self.location)
            .field("program", &self.program.as_ref().map(|p| p.name()))
            .finish_non_exhaustive()
    }
}

impl Coprocessor {
    /// Halted with nothing left to read.
    pub fn is_idle(&self) -> bool {
        self.status.halted()
            && !self.status.broke()
            && self.location == Frame::Ring
            && self.read_ptr == self.write_ptr
    }

    /// Reads a big-endian word from data memory.
    pub fn read_dmem_u32(&self, offset: usize) -> u32 {
        let bytes = &self.dmem[offset & (DMEM_LEN - 4)..][..4];
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Sets up an empty ring of `words` words.
pub fn configure_ring(sys: &mut System, words: u32) {
    sys.sp.ring_words = words;
    sys.sp.read_ptr = 0;
    sys.sp.write_ptr = 0;
    sys.sp.location = Frame::Ring;
    sys.sp.stack.clear();
}

/// Writes the write cursor register. This is the doorbell: it wakes up the coprocessor unless
/// it has crashed.
pub fn write_write_ptr(sys: &mut System, value: u32) {
    sys.sp.write_ptr = value;
    sys.sp.doorbells += 1;

    if !sys.sp.status.broke() {
        sys.sp.status.set_halted(false);
    }
}

/// Uploads a microcode. The coprocessor must be halted.
pub fn load(sys: &mut System, microcode: Arc<Microcode>, reached: u64) {
    debug_assert!(sys.sp.status.halted());

    let text = &microcode.text()[..microcode.text().len().min(IMEM_LEN)];
    sys.sp.imem.fill(0);
    sys.sp.imem[..text.len()].copy_from_slice(text);

    let data = &microcode.data()[..microcode.data().len().min(DMEM_LEN)];
    sys.sp.dmem.fill(0);
    sys.sp.dmem[..data.len()].copy_from_slice(data);

    tracing::debug!(
        name = microcode.name(),
        overlay = microcode.overlay(),
        text = microcode.text().len(),
        "loaded microcode"
    );

    sys.sp.program = Some(microcode);
    sys.sp.reached = reached;
    sys.sp.location = Frame::Ring;
    sys.sp.stack.clear();
    sys.sp.status = Status::default()
        .with_halted(true)
        .with_signals(0);
}

/// Runs the coprocessor for the given number of cycles.
pub fn exec(sys: &mut System, cycles: u64) {
    if sys.sp.status.halted() {
        return;
    }

    sys.sp.budget += cycles as i64;
    while sys.sp.budget > 0 && !sys.sp.status.halted() {
        step(sys);
    }
}

fn halt(sys: &mut System) {
    sys.sp.status.set_halted(true);
    sys.sp.budget = 0;
}

/// Writes the crash record, halts and raises the coprocessor interrupt.
pub fn crash(sys: &mut System, kind: CrashKind, code: u32, addr: Address, words: &[u32]) {
    tracing::debug!(%kind, code, %addr, "coprocessor crashed");

    let record = CrashRecord::new(kind, code, addr.value(), words);
    if let Some(dst) = sys.mem.bytes_mut(CRASH_ADDR.span(CrashRecord::LEN as u32)) {
        dst.copy_from_slice(record.as_bytes());
    }

    sys.sp.status.set_broke(true);
    halt(sys);
    sys.mi.raise(Source::Sp);
}

fn step(sys: &mut System) {
    let location = sys.sp.location;
    let addr = match location {
        Frame::Ring => {
            if sys.sp.read_ptr == sys.sp.write_ptr {
                halt(sys);
                return;
            }

            RING_ADDR + sys.sp.read_ptr * 4
        }
        Frame::Block(addr) => addr,
    };

    let header = Header::from_bits(sys.mem.read_u32(addr));
    let len = header.len();

    let mut words = ArrayVec::<[u32; MAX_COMMAND_WORDS]>::new();
    for i in 0..len as u32 {
        words.push(sys.mem.read_u32(addr + 4 * i));
    }

    match location {
        Frame::Ring => {
            let next = sys.sp.read_ptr + len as u32;
            if next > sys.sp.ring_words {
                crash(sys, CrashKind::InvalidCommand, 0, addr, &words);
                return;
            }

            sys.sp.read_ptr = next;
        }
        Frame::Block(addr) => sys.sp.location = Frame::Block(addr + 4 * len as u32),
    }

    sys.sp.budget -= (COMMAND_CYCLES + len as u64) as i64;
    sys.sp.executed += 1;

    let overlay = header.overlay().value();
    if overlay == KERNEL_OVERLAY {
        kernel(sys, addr, header, &words);
    } else {
        microcode(sys, addr, overlay, header.index().value(), &words);
    }

    if sys.sp.location == Frame::Ring && sys.sp.read_ptr == sys.sp.write_ptr {
        halt(sys);
    }
}

fn kernel(sys: &mut System, addr: Address, header: Header, words: &[u32]) {
    let arg = header.arg().value();
    let Some(op) = Kernel::from_repr(header.index().value()) else {
        crash(sys, CrashKind::InvalidCommand, 0, addr, words);
        return;
    };

    match op {
        Kernel::Noop => (),
        Kernel::Jump => match sys.sp.location {
            Frame::Ring => sys.sp.read_ptr = 0,
            Frame::Block(_) => crash(sys, CrashKind::InvalidCommand, 0, addr, words),
        },
        Kernel::Call => {
            let Some(&target) = words.get(1) else {
                crash(sys, CrashKind::InvalidCommand, 0, addr, words);
                return;
            };

            let target = Address(target);
            if !target.is_aligned(4) || !Memory::contains(target.span(4)) {
                crash(sys, CrashKind::BadAddress, target.value(), addr, words);
                return;
            }

            if sys.sp.stack.len() == STACK_DEPTH {
                crash(sys, CrashKind::StackOverflow, 0, addr, words);
                return;
            }

            let location = sys.sp.location;
            sys.sp.stack.push(location);
            sys.sp.location = Frame::Block(target);
        }
        Kernel::Ret => match sys.sp.stack.pop() {
            Some(frame) => sys.sp.location = frame,
            None => crash(sys, CrashKind::StrayReturn, 0, addr, words),
        },
        Kernel::Syncpoint => {
            let expected = (sys.sp.reached + 1) as u32 & ARG_MASK;
            if arg != expected {
                crash(sys, CrashKind::SyncpointOrder, expected, addr, words);
                return;
            }

            sys.sp.reached += 1;
            tracing::trace!(reached = sys.sp.reached, "syncpoint retired");
            sys.mi.raise(Source::Sp);
        }
        Kernel::Signal => {
            let set = arg as u8;
            let clear = (arg >> 8) as u8;
            let signals = (sys.sp.status.signals() | set) & !clear;
            sys.sp.status.set_signals(signals);
        }
        Kernel::Dma => {
            let (Some(&ram), Some(&dmem)) = (words.get(1), words.get(2)) else {
                crash(sys, CrashKind::InvalidCommand, 0, addr, words);
                return;
            };

            let len = arg as usize;
            let offset = (dmem & !DMA_TO_RAM) as usize;
            let ram = Address(ram).span(arg);
            if offset + len > DMEM_LEN || !Memory::contains(ram) {
                crash(sys, CrashKind::BadAddress, ram.start.value(), addr, words);
                return;
            }

            let dmem_bytes = &mut sys.sp.dmem[offset..][..len];
            if dmem & DMA_TO_RAM != 0 {
                if let Some(dst) = sys.mem.bytes_mut(ram) {
                    dst.copy_from_slice(dmem_bytes);
                }
            } else if let Some(src) = sys.mem.bytes(ram) {
                dmem_bytes.copy_from_slice(src);
            }

            sys.sp.budget -= (len as u64 / DMA_BYTES_PER_CYCLE) as i64;
        }
    }
}

fn microcode(sys: &mut System, addr: Address, overlay: u8, index: u8, words: &[u32]) {
    let Some(microcode) = sys
        .sp
        .program
        .clone()
        .filter(|m| m.overlay() == overlay)
    else {
        crash(sys, CrashKind::InvalidCommand, 0, addr, words);
        return;
    };

    let signals = sys.sp.status.signals();
    let mut exec = Exec::new(&mut sys.sp.dmem[..], &mut sys.mem, signals);
    let result = microcode.program().execute(&mut exec, index, words);
    let (stall, signals) = exec.finish();

    sys.sp.status.set_signals(signals);
    sys.sp.budget -= stall as i64;

    if let Err(Assert(code)) = result {
        crash(sys, CrashKind::Assert, code, addr, words);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::FromBytes;

    fn kernel_word(op: Kernel, extra: usize, arg: u32) -> u32 {
        Header::new(KERNEL_OVERLAY, op as u8, extra, arg).to_bits()
    }

    fn submit(sys: &mut System, words: &[u32]) {
        let mut ptr = sys.sp.write_ptr;
        for word in words {
            sys.mem.write_u32(RING_ADDR + ptr * 4, *word);
            ptr += 1;
        }

        write_write_ptr(sys, ptr);
    }

    fn crash_record(sys: &System) -> CrashRecord {
        let bytes = sys
            .mem
            .bytes(CRASH_ADDR.span(CrashRecord::LEN as u32))
            .unwrap();
        CrashRecord::read_from_bytes(bytes).unwrap()
    }

    #[test]
    fn signals_and_syncpoints() {
        let mut sys = System::new(Vec::new());
        sys.mi.set_mask(Source::Sp, true);
        submit(
            &mut sys,
            &[
                kernel_word(Kernel::Signal, 0, 0x0005),
                kernel_word(Kernel::Syncpoint, 0, 1),
                kernel_word(Kernel::Signal, 0, 0x0100),
            ],
        );

        sys.exec(100);
        assert!(sys.sp.is_idle());
        assert_eq!(sys.sp.reached, 1);
        assert_eq!(sys.sp.status.signals(), 0x04);
        assert!(sys.mi.pending.sp());
    }

    #[test]
    fn blocks_return_to_caller() {
        let mut sys = System::new(Vec::new());
        let block = Address(0x0003_0000);
        sys.mem
            .write_u32(block, kernel_word(Kernel::Signal, 0, 0x0001));
        sys.mem
            .write_u32(block + 4, kernel_word(Kernel::Ret, 0, 0));

        submit(
            &mut sys,
            &[
                kernel_word(Kernel::Call, 1, 0),
                block.value(),
                kernel_word(Kernel::Call, 1, 0),
                block.value(),
                kernel_word(Kernel::Syncpoint, 0, 1),
            ],
        );

        sys.exec(200);
        assert!(sys.sp.is_idle());
        assert_eq!(sys.sp.reached, 1);
        assert_eq!(sys.sp.status.signals(), 0x01);
        assert!(sys.sp.stack.is_empty());
    }

    #[test]
    fn jump_wraps_the_ring() {
        let mut sys = System::new(Vec::new());
        configure_ring(&mut sys, 32);
        sys.sp.read_ptr = 30;
        sys.sp.write_ptr = 30;

        sys.mem
            .write_u32(RING_ADDR + 30 * 4, kernel_word(Kernel::Jump, 0, 0));
        sys.mem
            .write_u32(RING_ADDR, kernel_word(Kernel::Syncpoint, 0, 1));
        write_write_ptr(&mut sys, 1);

        sys.exec(100);
        assert!(sys.sp.is_idle());
        assert_eq!(sys.sp.read_ptr, 1);
        assert_eq!(sys.sp.reached, 1);
    }

    #[test]
    fn stray_return_crashes() {
        let mut sys = System::new(Vec::new());
        submit(
            &mut sys,
            &[kernel_word(Kernel::Noop, 0, 0), kernel_word(Kernel::Ret, 0, 0)],
        );

        sys.exec(100);
        assert!(sys.sp.status.broke());
        assert!(sys.sp.status.halted());

        let record = crash_record(&sys);
        assert!(record.is_valid());
        assert_eq!(record.kind(), CrashKind::StrayReturn);
        assert_eq!(record.command_addr.get(), (RING_ADDR + 4).value());

        // the doorbell does not wake a crashed coprocessor
        write_write_ptr(&mut sys, 2);
        assert!(sys.sp.status.halted());
    }

    #[test]
    fn out_of_order_syncpoint_crashes() {
        let mut sys = System::new(Vec::new());
        submit(&mut sys, &[kernel_word(Kernel::Syncpoint, 0, 2)]);

        sys.exec(100);
        let record = crash_record(&sys);
        assert_eq!(record.kind(), CrashKind::SyncpointOrder);
        assert_eq!(record.code.get(), 1);
        assert_eq!(sys.sp.reached, 0);
    }

    #[test]
    fn kernel_dma_round_trip() {
        let mut sys = System::new(Vec::new());
        sys.mem.write_u32(Address(0x0004_0000), 0xCAFE_BABE);
        submit(
            &mut sys,
            &[
                kernel_word(Kernel::Dma, 2, 8),
                0x0004_0000,
                0x0000_0100,
                kernel_word(Kernel::Dma, 2, 8),
                0x0004_0010,
                0x0000_0100 | DMA_TO_RAM,
            ],
        );

        sys.exec(100);
        assert_eq!(sys.sp.read_dmem_u32(0x100), 0xCAFE_BABE);
        assert_eq!(sys.mem.read_u32(Address(0x0004_0010)), 0xCAFE_BABE);
    }

    #[test]
    fn unknown_overlay_crashes() {
        let mut sys = System::new(Vec::new());
        submit(&mut sys, &[Header::new(5, 0, 0, 0).to_bits()]);

        sys.exec(100);
        assert_eq!(crash_record(&sys).kind(), CrashKind::InvalidCommand);
    }
}
