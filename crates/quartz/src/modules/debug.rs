use crate::queue::CrashReport;

/// Trait for debug modules, which are told about coprocessor crashes.
pub trait DebugModule: Send {
    /// Called once, when a crash is first detected.
    fn crashed(&mut self, report: &CrashReport);
}

/// An implementation of [`DebugModule`] which does nothing.
#[derive(Debug, Clone, Copy)]
pub struct NopDebugModule;

impl DebugModule for NopDebugModule {
    fn crashed(&mut self, _: &CrashReport) {}
}

/// An implementation of [`DebugModule`] which dumps the whole report through `tracing`, one
/// event per line.
#[derive(Debug, Clone, Copy)]
pub struct TracingDebugModule;

impl DebugModule for TracingDebugModule {
    fn crashed(&mut self, report: &CrashReport) {
        tracing::error!("coprocessor crash: {}", report.kind);
        tracing::error!("  code: {:#07x}", report.code);

        if let Some(microcode) = &report.microcode {
            tracing::error!("  microcode: {microcode}");
        }

        if let Some(message) = &report.message {
            tracing::error!("  message: {message}");
        }

        tracing::error!("  command at {}", report.command_addr);
        for (i, word) in report.words.iter().enumerate() {
            tracing::error!("    [{i:2}] {word:08X}");
        }

        tracing::error!(
            "  detected at {} after {} cycles",
            report.location,
            report.elapsed
        );
    }
}
