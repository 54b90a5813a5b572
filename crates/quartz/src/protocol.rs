//! Wire format shared by the CPU-side queue and the coprocessor: command headers, kernel opcodes
//! and the crash record.
//!
//! Every command is a header word followed by up to 15 operand words, all big-endian. Commands
//! whose overlay is 0 are handled by the coprocessor kernel, every other overlay is dispatched to
//! the resident microcode.

use bitos::{
    bitos,
    integer::{u4, u20},
};
use strum::FromRepr;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, big_endian::U32};

/// Maximum length of a command, in words, header included.
pub const MAX_COMMAND_WORDS: usize = 16;

/// Mask of the inline argument of a command header.
pub const ARG_MASK: u32 = 0x000F_FFFF;

/// Overlay id of the coprocessor kernel.
pub const KERNEL_OVERLAY: u8 = 0;

/// Written to the start of the crash record when the coprocessor crashes.
pub const CRASH_SIGNATURE: u32 = 0xDEAD_C0DE;

/// The header word of a command.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    /// Inline argument.
    #[bits(0..20)]
    pub arg: u20,
    /// How many operand words follow the header.
    #[bits(20..24)]
    pub extra: u4,
    /// Command index within the overlay.
    #[bits(24..28)]
    pub index: u4,
    /// Overlay the command belongs to.
    #[bits(28..32)]
    pub overlay: u4,
}

impl Header {
    pub fn new(overlay: u8, index: u8, extra: usize, arg: u32) -> Self {
        Self::default()
            .with_overlay(u4::new(overlay & 0xF))
            .with_index(u4::new(index & 0xF))
            .with_extra(u4::new(extra as u8 & 0xF))
            .with_arg(u20::new(arg & ARG_MASK))
    }

    /// Length of the command in words, header included.
    #[inline(always)]
    pub fn len(&self) -> usize {
        1 + self.extra().value() as usize
    }
}

/// Commands handled by the coprocessor kernel (overlay 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Kernel {
    Noop = 0,
    /// Wrap marker: continue reading at the start of the ring.
    Jump = 1,
    /// Run the block whose address is the first operand.
    Call = 2,
    /// Return from the current block.
    Ret = 3,
    /// Retire a syncpoint. The argument is the low 20 bits of its id.
    Syncpoint = 4,
    /// Set (bits 0..8 of the argument) and clear (bits 8..16) signal bits.
    Signal = 5,
    /// Copy between RAM and data memory. Operands: RAM address, DMEM offset with bit 31 set
    /// for DMEM to RAM. The argument is the length in bytes.
    Dma = 6,
}

/// Direction bit of the DMEM operand of a kernel DMA command.
pub const DMA_TO_RAM: u32 = 1 << 31;

/// What made the coprocessor crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum CrashKind {
    /// The record could not be decoded.
    Unknown = 0,
    /// The microcode raised an assertion.
    Assert = 1,
    /// Unknown overlay or command index, or a command straddling the end of the ring.
    InvalidCommand = 2,
    /// Blocks nested deeper than the call stack.
    StackOverflow = 3,
    /// `RET` outside of a block.
    StrayReturn = 4,
    /// An operand addressed memory outside of RAM or DMEM.
    BadAddress = 5,
    /// A syncpoint was retired out of order.
    SyncpointOrder = 6,
}

impl std::fmt::Display for CrashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown crash",
            Self::Assert => "assertion failed",
            Self::InvalidCommand => "invalid command",
            Self::StackOverflow => "block call stack overflow",
            Self::StrayReturn => "return outside of a block",
            Self::BadAddress => "bad address",
            Self::SyncpointOrder => "syncpoint retired out of order",
        };

        f.write_str(name)
    }
}

/// Record written by the coprocessor to [`CRASH_ADDR`](crate::system::mem::CRASH_ADDR).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CrashRecord {
    pub signature: U32,
    pub kind: U32,
    pub code: U32,
    pub command_addr: U32,
    pub word_count: U32,
    pub words: [U32; MAX_COMMAND_WORDS],
    pub reserved: [u8; 44],
}

impl CrashRecord {
    pub const LEN: usize = size_of::<Self>();

    pub fn new(kind: CrashKind, code: u32, command_addr: u32, words: &[u32]) -> Self {
        let mut record = Self::new_zeroed();
        record.signature = U32::new(CRASH_SIGNATURE);
        record.kind = U32::new(kind as u32);
        record.code = U32::new(code);
        record.command_addr = U32::new(command_addr);

        let count = words.len().min(MAX_COMMAND_WORDS);
        record.word_count = U32::new(count as u32);
        for (slot, word) in record.words.iter_mut().zip(words) {
            *slot = U32::new(*word);
        }

        record
    }

    pub fn is_valid(&self) -> bool {
        self.signature.get() == CRASH_SIGNATURE
    }

    pub fn kind(&self) -> CrashKind {
        CrashKind::from_repr(self.kind.get()).unwrap_or(CrashKind::Unknown)
    }

    /// The words of the command that crashed.
    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        let count = (self.word_count.get() as usize).min(MAX_COMMAND_WORDS);
        self.words[..count].iter().map(|w| w.get())
    }
}
