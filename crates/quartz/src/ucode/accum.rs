//! Accumulator microcode. Keeps a running sum, a high-water mark and a log of values in data
//! memory, which makes the order and completeness of executed commands observable from the CPU.
//!
//! Data memory layout:
//!
//! | offset | contents |
//! |---|---|
//! | `0x00` | sum (`u64`) |
//! | `0x08` | high-water mark (`u64`) |
//! | `0x10` | log length (`u32`) |
//! | `0x40..` | log entries (`u32`) |
use crate::{
    Console,
    queue::{Command, QueueError},
    system::{mem::Memory, sp::DMEM_LEN},
    ucode::{Assert, Exec, Microcode, Program},
};
use std::sync::Arc;
use strum::FromRepr;
use util::Address;

const SUM: u32 = 0x00;
const HIGH: u32 = 0x08;
const LOG_LEN: u32 = 0x10;
const LOG: u32 = 0x40;

/// How many values fit in the log.
pub const LOG_CAPACITY: u32 = (DMEM_LEN as u32 - LOG) / 4;

pub const ASSERT_BAD_LENGTH: u32 = 0xF_0001;
pub const ASSERT_BAD_OUTPUT: u32 = 0xF_0002;
pub const ASSERT_LOG_FULL: u32 = 0xF_0003;
pub const ASSERT_TORN: u32 = 0xF_0004;

const TEXT: &[u8] = b"ACCUM\0\0\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Op {
    /// `sum += arg`
    Add = 0,
    /// `sum += w1`
    Add2 = 1,
    /// `sum += w1 + w2 + w3`
    Add4 = 2,
    /// Stall for `arg` cycles.
    Wait = 3,
    /// Write sum and high-water mark to the RAM address in `w1`.
    Output = 4,
    /// Clear sum and high-water mark.
    Reset = 5,
    /// `high = max(high, arg)`
    High = 6,
    /// Clear the log.
    ResetLog = 7,
    /// Append `arg` to the log.
    Log = 8,
    /// Append `arg` to the log, asserting that `w1..w4` all equal `arg`.
    Tagged = 9,
    /// Raise an assertion with code `arg`.
    Assert = 10,
    /// `sum += w1 + ... + wN`, for any number of operands.
    AddMany = 11,
}

struct Accumulator;

impl Accumulator {
    fn log(exec: &mut Exec<'_>, value: u32) -> Result<(), Assert> {
        let len = exec.read_u32(LOG_LEN);
        if len >= LOG_CAPACITY {
            return Err(Assert(ASSERT_LOG_FULL));
        }

        exec.write_u32(LOG + 4 * len, value);
        exec.write_u32(LOG_LEN, len + 1);
        Ok(())
    }

    fn add(exec: &mut Exec<'_>, values: &[u32]) {
        let sum = values
            .iter()
            .fold(exec.read_u64(SUM), |acc, v| acc.wrapping_add(*v as u64));
        exec.write_u64(SUM, sum);
    }
}

impl Program for Accumulator {
    fn execute(&self, exec: &mut Exec<'_>, index: u8, words: &[u32]) -> Result<(), Assert> {
        let Some(op) = Op::from_repr(index) else {
            return Err(Assert(ASSERT_BAD_LENGTH));
        };

        let arg = words[0] & crate::protocol::ARG_MASK;
        let operands = &words[1..];
        let expected = match op {
            Op::Add2 | Op::Output => Some(1),
            Op::Add4 => Some(3),
            Op::Tagged => Some(4),
            Op::AddMany => None,
            _ => Some(0),
        };

        if expected.is_some_and(|n| n != operands.len()) {
            return Err(Assert(ASSERT_BAD_LENGTH));
        }

        match op {
            Op::Add => Self::add(exec, &[arg]),
            Op::Add2 | Op::Add4 | Op::AddMany => Self::add(exec, operands),
            Op::Wait => exec.stall(arg as u64),
            Op::Output => {
                let target = Address(operands[0]);
                if !target.is_aligned(8) {
                    return Err(Assert(ASSERT_BAD_OUTPUT));
                }

                let sum = exec.read_u64(SUM);
                let high = exec.read_u64(HIGH);
                let ram = exec.ram();
                if !Memory::contains(target.span(16)) {
                    return Err(Assert(ASSERT_BAD_OUTPUT));
                }

                ram.write_u64(target, sum);
                ram.write_u64(target + 8, high);
            }
            Op::Reset => {
                exec.write_u64(SUM, 0);
                exec.write_u64(HIGH, 0);
            }
            Op::High => {
                let high = exec.read_u64(HIGH).max(arg as u64);
                exec.write_u64(HIGH, high);
            }
            Op::ResetLog => exec.write_u32(LOG_LEN, 0),
            Op::Log => Self::log(exec, arg)?,
            Op::Tagged => {
                if operands.iter().any(|w| *w != arg) {
                    return Err(Assert(ASSERT_TORN));
                }

                Self::log(exec, arg)?;
            }
            Op::Assert => return Err(Assert(arg)),
        }

        Ok(())
    }
}

fn read_u64(dmem: &[u8], offset: u32) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&dmem[offset as usize..][..8]);
    u64::from_be_bytes(bytes)
}

fn assert_message(code: u32, dmem: &[u8]) -> Option<String> {
    Some(match code {
        ASSERT_BAD_LENGTH => "unknown command or wrong number of operands".to_owned(),
        ASSERT_BAD_OUTPUT => "output address is not an aligned RAM address".to_owned(),
        ASSERT_LOG_FULL => format!("log is full ({LOG_CAPACITY} entries)"),
        ASSERT_TORN => "tagged command has operands which do not match its tag".to_owned(),
        _ => format!(
            "explicit assertion {code:#x} (sum was {})",
            read_u64(dmem, SUM)
        ),
    })
}

/// The accumulator microcode, bound to an overlay id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accum {
    overlay: u8,
}

impl Default for Accum {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Accum {
    pub const fn new(overlay: u8) -> Self {
        Self { overlay }
    }

    pub fn overlay(self) -> u8 {
        self.overlay
    }

    pub fn microcode(self) -> Arc<Microcode> {
        Microcode::new(format!("accum@{}", self.overlay), self.overlay, Accumulator)
            .with_text(TEXT)
            .with_assert_handler(assert_message)
            .into_shared()
    }

    fn command(self, op: Op, arg: u32) -> Command {
        Command::new(self.overlay, op as u8, arg)
    }

    fn command_with(self, op: Op, arg: u32, operands: &[u32]) -> Command {
        Command::from_parts(self.overlay, op as u8, arg, operands)
    }

    /// Adds a 20 bit value.
    pub fn add(self, value: u32) -> Command {
        self.command(Op::Add, value)
    }

    pub fn add2(self, value: u32) -> Command {
        self.command_with(Op::Add2, 0, &[value])
    }

    pub fn add4(self, values: [u32; 3]) -> Command {
        self.command_with(Op::Add4, 0, &values)
    }

    /// Adds up to 15 values.
    pub fn add_many(self, values: &[u32]) -> Result<Command, QueueError> {
        self.command(Op::AddMany, 0).with_operands(values)
    }

    /// Stalls the coprocessor.
    pub fn wait(self, cycles: u32) -> Command {
        self.command(Op::Wait, cycles)
    }

    /// Writes the sum and high-water mark to RAM.
    pub fn output(self, target: Address) -> Command {
        self.command_with(Op::Output, 0, &[target.value()])
    }

    pub fn reset(self) -> Command {
        self.command(Op::Reset, 0)
    }

    pub fn high(self, value: u32) -> Command {
        self.command(Op::High, value)
    }

    pub fn reset_log(self) -> Command {
        self.command(Op::ResetLog, 0)
    }

    pub fn log(self, value: u32) -> Command {
        self.command(Op::Log, value)
    }

    /// A 5 word command which logs `tag`. Asserts if the words reach the coprocessor torn.
    pub fn tagged(self, tag: u32) -> Command {
        let tag = tag & crate::protocol::ARG_MASK;
        self.command_with(Op::Tagged, tag, &[tag; 4])
    }

    /// Makes the coprocessor raise an assertion.
    pub fn assert(self, code: u32) -> Command {
        self.command(Op::Assert, code)
    }

    /// Reads the sum from data memory.
    pub fn sum(console: &Console) -> u64 {
        read_u64(&console.system.sp.dmem[..], SUM)
    }

    /// Reads the high-water mark from data memory.
    pub fn high_mark(console: &Console) -> u64 {
        read_u64(&console.system.sp.dmem[..], HIGH)
    }

    /// Reads the log from data memory.
    pub fn read_log(console: &Console) -> Vec<u32> {
        let sp = &console.system.sp;
        let len = sp.read_dmem_u32(LOG_LEN as usize).min(LOG_CAPACITY);
        (0..len)
            .map(|i| sp.read_dmem_u32((LOG + 4 * i) as usize))
            .collect()
    }

    /// Reads what an [`output`](Self::output) command wrote.
    pub fn read_output(console: &Console, target: Address) -> (u64, u64) {
        let ram = &console.system.mem;
        (ram.read_u64(target), ram.read_u64(target + 8))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run(words: &[u32]) -> (Result<(), Assert>, Vec<u8>) {
        let mut dmem = vec![0; DMEM_LEN];
        let mut ram = Memory::default();
        let header = crate::protocol::Header::from_bits(words[0]);

        let mut exec = Exec::new(&mut dmem, &mut ram, 0);
        let result = Accumulator.execute(&mut exec, header.index().value(), words);
        drop(exec);

        (result, dmem)
    }

    #[test]
    fn add_commands() {
        let accum = Accum::default();
        let mut dmem = vec![0; DMEM_LEN];
        let mut ram = Memory::default();
        let mut exec = Exec::new(&mut dmem, &mut ram, 0);

        for command in [
            accum.add(5),
            accum.add2(10),
            accum.add4([1, 2, 3]),
            accum.add_many(&[100; 15]).unwrap(),
        ] {
            let index = command.header().index().value();
            Accumulator
                .execute(&mut exec, index, command.words())
                .unwrap();
        }

        assert_eq!(exec.read_u64(SUM), 5 + 10 + 6 + 1500);
    }

    #[test]
    fn wrong_length_asserts() {
        let accum = Accum::default();
        let command = Command::from_parts(accum.overlay(), Op::Add2 as u8, 0, &[]);
        let (result, _) = run(command.words());
        assert_eq!(result, Err(Assert(ASSERT_BAD_LENGTH)));
    }

    #[test]
    fn torn_tagged_asserts() {
        let accum = Accum::default();
        let mut words = accum.tagged(7).words().to_vec();
        assert_eq!(run(&words).0, Ok(()));

        words[3] = 8;
        assert_eq!(run(&words).0, Err(Assert(ASSERT_TORN)));
    }

    #[test]
    fn messages() {
        let mut dmem = vec![0; DMEM_LEN];
        dmem[7] = 42;

        assert_eq!(
            assert_message(0x123, &dmem).as_deref(),
            Some("explicit assertion 0x123 (sum was 42)")
        );
        assert!(
            assert_message(ASSERT_LOG_FULL, &dmem)
                .unwrap()
                .contains("log is full")
        );
    }
}
