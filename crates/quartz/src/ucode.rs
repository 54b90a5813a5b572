//! Microcode images for the coprocessor.
//!
//! A [`Microcode`] bundles what gets uploaded to the coprocessor (instruction and data memory
//! images) with the behaviour of its commands, expressed as a [`Program`]. The coprocessor model
//! calls into the program for every command whose overlay matches the resident image.

pub mod accum;

use crate::system::{
    mem::Memory,
    sp::{DMEM_LEN, IMEM_LEN},
};
use easyerr::Error;
use std::sync::Arc;

/// An assertion raised by a microcode, with its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assert(pub u32);

/// Turns an assertion code into a message. Receives the data memory at the time of the crash.
pub type AssertHandler = fn(code: u32, dmem: &[u8]) -> Option<String>;

/// Behaviour of the commands of a microcode.
pub trait Program: Send + Sync {
    /// Executes the command `index` of this microcode's overlay. `words` contains the header
    /// followed by the operands.
    fn execute(&self, exec: &mut Exec<'_>, index: u8, words: &[u32]) -> Result<(), Assert>;
}

/// What a [`Program`] can touch while executing a command.
pub struct Exec<'a> {
    dmem: &'a mut [u8],
    ram: &'a mut Memory,
    stall: u64,
    signals: u8,
}

impl<'a> Exec<'a> {
    pub(crate) fn new(dmem: &'a mut [u8], ram: &'a mut Memory, signals: u8) -> Self {
        Self {
            dmem,
            ram,
            stall: 0,
            signals,
        }
    }

    #[inline(always)]
    fn dmem_offset(offset: u32, alignment: u32) -> usize {
        (offset as usize & (DMEM_LEN - 1)) & !(alignment as usize - 1)
    }

    pub fn dmem(&self) -> &[u8] {
        &*self.dmem
    }

    pub fn dmem_mut(&mut self) -> &mut [u8] {
        &mut *self.dmem
    }

    /// Reads a big-endian word from data memory. Offsets wrap around.
    pub fn read_u32(&self, offset: u32) -> u32 {
        let bytes = &self.dmem[Self::dmem_offset(offset, 4)..][..4];
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) {
        self.dmem[Self::dmem_offset(offset, 4)..][..4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn read_u64(&self, offset: u32) -> u64 {
        let offset = offset & !7;
        ((self.read_u32(offset) as u64) << 32) | self.read_u32(offset + 4) as u64
    }

    pub fn write_u64(&mut self, offset: u32, value: u64) {
        let offset = offset & !7;
        self.write_u32(offset, (value >> 32) as u32);
        self.write_u32(offset + 4, value as u32);
    }

    pub fn ram(&mut self) -> &mut Memory {
        &mut *self.ram
    }

    /// Keeps the coprocessor busy for extra cycles.
    pub fn stall(&mut self, cycles: u64) {
        self.stall += cycles;
    }

    pub fn signals(&self) -> u8 {
        self.signals
    }

    pub fn set_signals(&mut self, set: u8, clear: u8) {
        self.signals = (self.signals | set) & !clear;
    }

    pub(crate) fn finish(self) -> (u64, u8) {
        (self.stall, self.signals)
    }
}

#[derive(Debug, Error)]
pub enum MicrocodeError {
    #[error("overlay {f0} is reserved or out of range (expected 1..=15)")]
    BadOverlay(u8),
    #[error("text is {f0} bytes, instruction memory holds 4096")]
    TextTooLarge(usize),
    #[error("data is {f0} bytes, data memory holds 4096")]
    DataTooLarge(usize),
}

/// A microcode image.
pub struct Microcode {
    name: String,
    overlay: u8,
    text: Vec<u8>,
    data: Vec<u8>,
    program: Box<dyn Program>,
    assert_handler: Option<AssertHandler>,
}

impl std::fmt::Debug for Microcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microcode")
            .field("name", &self.name)
            .field("overlay", &self.overlay)
            .field("text", &self.text.len())
            .field("data", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl Microcode {
    pub fn new(name: impl Into<String>, overlay: u8, program: impl Program + 'static) -> Self {
        Self {
            name: name.into(),
            overlay,
            text: Vec::new(),
            data: Vec::new(),
            program: Box::new(program),
            assert_handler: None,
        }
    }

    pub fn with_text(self, text: impl Into<Vec<u8>>) -> Self {
        Self {
            text: text.into(),
            ..self
        }
    }

    pub fn with_data(self, data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..self
        }
    }

    pub fn with_assert_handler(self, handler: AssertHandler) -> Self {
        Self {
            assert_handler: Some(handler),
            ..self
        }
    }

    /// Checks that the image can be uploaded.
    pub fn validate(&self) -> Result<(), MicrocodeError> {
        if !(1..=15).contains(&self.overlay) {
            return Err(MicrocodeError::BadOverlay(self.overlay));
        }

        if self.text.len() > IMEM_LEN {
            return Err(MicrocodeError::TextTooLarge(self.text.len()));
        }

        if self.data.len() > DMEM_LEN {
            return Err(MicrocodeError::DataTooLarge(self.data.len()));
        }

        Ok(())
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn overlay(&self) -> u8 {
        self.overlay
    }

    pub fn text(&self) -> &[u8] {
        &self.text
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn program(&self) -> &dyn Program {
        self.program.as_ref()
    }

    /// Message for an assertion raised by this microcode, if its handler knows the code.
    pub fn assert_message(&self, code: u32, dmem: &[u8]) -> Option<String> {
        self.assert_handler.and_then(|handler| handler(code, dmem))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Idle;

    impl Program for Idle {
        fn execute(&self, _: &mut Exec<'_>, _: u8, _: &[u32]) -> Result<(), Assert> {
            Ok(())
        }
    }

    #[test]
    fn validation() {
        assert!(Microcode::new("idle", 1, Idle).validate().is_ok());
        assert!(matches!(
            Microcode::new("idle", 0, Idle).validate(),
            Err(MicrocodeError::BadOverlay(0))
        ));
        assert!(matches!(
            Microcode::new("idle", 2, Idle)
                .with_text(vec![0; IMEM_LEN + 1])
                .validate(),
            Err(MicrocodeError::TextTooLarge(_))
        ));
        assert!(matches!(
            Microcode::new("idle", 2, Idle)
                .with_data(vec![0; DMEM_LEN + 1])
                .validate(),
            Err(MicrocodeError::DataTooLarge(_))
        ));
    }

    #[test]
    fn exec_signals() {
        let mut dmem = vec![0; DMEM_LEN];
        let mut ram = Memory::default();
        let mut exec = Exec::new(&mut dmem, &mut ram, 0b0000_0011);

        exec.set_signals(0b1000_0000, 0b0000_0001);
        exec.stall(10);
        exec.write_u64(0x10, 0x0102_0304_0506_0708);

        assert_eq!(exec.read_u32(0x14), 0x0506_0708);
        assert_eq!(exec.finish(), (10, 0b1000_0010));
        assert_eq!(dmem[0x10], 0x01);
    }
}
