//! Crash detection.
//!
//! A crashed coprocessor writes a [`CrashRecord`] and raises its interrupt. The CPU side notices
//! either in the interrupt or at the start of any queue operation, whichever comes first. From
//! then on the queue is halted and every operation fails with the same report.
use super::QueueError;
use crate::{
    Console,
    protocol::{CrashKind, CrashRecord},
    system::mem::CRASH_ADDR,
};
use std::panic::Location;
use util::Address;
use zerocopy::FromBytes;

/// Everything known about a coprocessor crash.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub kind: CrashKind,
    /// Assertion code, or extra information depending on the kind.
    pub code: u32,
    /// Address of the offending command.
    pub command_addr: Address,
    /// The offending command, header included.
    pub words: Vec<u32>,
    /// Name of the resident microcode.
    pub microcode: Option<String>,
    /// What the microcode's assert handler made of the code.
    pub message: Option<String>,
    /// CPU call site which detected the crash.
    pub location: &'static Location<'static>,
    /// Cycle at which the crash was detected.
    pub elapsed: u64,
}

impl std::fmt::Display for CrashReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "coprocessor crashed: {} (code {:#07x})", self.kind, self.code)?;

        if let Some(microcode) = &self.microcode {
            write!(f, " in {microcode}")?;
        }

        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }

        write!(f, "; command at {}:", self.command_addr)?;
        for word in &self.words {
            write!(f, " {word:08X}")?;
        }

        write!(
            f,
            "; detected at {} after {} cycles",
            self.location, self.elapsed
        )
    }
}

impl Console {
    fn read_crash_report(&self, location: &'static Location<'static>) -> CrashReport {
        let record = self
            .system
            .mem
            .bytes(CRASH_ADDR.span(CrashRecord::LEN as u32))
            .and_then(|bytes| CrashRecord::read_from_bytes(bytes).ok())
            .filter(CrashRecord::is_valid);

        let program = self.system.sp.program.as_ref();
        let (kind, code, command_addr, words) = match &record {
            Some(record) => (
                record.kind(),
                record.code.get(),
                Address(record.command_addr.get()),
                record.words().collect(),
            ),
            None => (CrashKind::Unknown, 0, Address(0), Vec::new()),
        };

        let message = match kind {
            CrashKind::Assert => program.and_then(|p| {
                p.assert_message(code, &self.system.sp.dmem[..])
            }),
            _ => None,
        };

        CrashReport {
            kind,
            code,
            command_addr,
            words,
            microcode: program.map(|p| p.name().to_owned()),
            message,
            location,
            elapsed: self.elapsed(),
        }
    }

    pub(super) fn latch_crash(&mut self, location: &'static Location<'static>) {
        let report = self.read_crash_report(location);
        tracing::error!(
            kind = %report.kind,
            code = report.code,
            addr = %report.command_addr,
            microcode = report.microcode.as_deref(),
            %location,
            "coprocessor crashed"
        );

        self.modules.debug.crashed(&report);
        self.queue.crashed = Some(Box::new(report));
    }

    /// Fails if the coprocessor has crashed, latching the crash on first detection.
    #[track_caller]
    pub(super) fn check_crash(&mut self) -> Result<(), QueueError> {
        if self.queue.crashed.is_none() && self.system.sp.status.broke() {
            self.latch_crash(Location::caller());
        }

        match &self.queue.crashed {
            Some(report) => Err(QueueError::Crashed(report.clone())),
            None => Ok(()),
        }
    }

    /// The crash the queue halted on, if any.
    pub fn crash(&self) -> Option<&CrashReport> {
        self.queue.crashed.as_deref()
    }
}
