//! Console modules.
//!
//! Modules receive information from the SDK core, such as crash reports, but do not take part in
//! driving the hardware themselves.

pub mod debug;

pub use debug::{DebugModule, NopDebugModule, TracingDebugModule};

/// The modules a console is created with.
pub struct Modules {
    pub debug: Box<dyn DebugModule>,
}

impl Default for Modules {
    fn default() -> Self {
        Self {
            debug: Box::new(NopDebugModule),
        }
    }
}
