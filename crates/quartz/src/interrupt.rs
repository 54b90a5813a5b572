//! Interrupt dispatch.
//!
//! Interrupts are delivered at polling points: whenever the console polls the hardware and
//! interrupts are enabled, pending unmasked sources are acknowledged and dispatched in the order
//! of [`Source`]. The SDK's own handling of a source (queue, DMA and timers) always runs
//! before user handlers.
//!
//! Disabling interrupts nests: they are only enabled again once every
//! [`disable_interrupts`](Console::disable_interrupts) has been matched by an
//! [`enable_interrupts`](Console::enable_interrupts). Dispatch itself runs with interrupts
//! disabled.
use crate::Console;
use easyerr::Error;

pub use crate::system::mi::Source;

/// How many reset handlers can be registered.
pub const MAX_RESET_HANDLERS: usize = 4;

pub type Handler = Box<dyn FnMut(&mut Console) + Send>;
pub type ResetHandler = Box<dyn FnOnce(&mut Console) + Send>;

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u32);

#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("at most 4 reset handlers can be registered")]
    TooManyResetHandlers,
}

struct Registered {
    id: HandlerId,
    source: Source,
    /// Taken out while the handler runs.
    handler: Option<Handler>,
}

#[derive(Default)]
pub struct Interrupts {
    depth: u32,
    next_id: u32,
    handlers: Vec<Registered>,
    reset_handlers: Vec<ResetHandler>,
    reset_seen: bool,
    dispatched: u64,
}

impl std::fmt::Debug for Interrupts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupts")
            .field("depth", &self.depth)
            .field("handlers", &self.handlers.len())
            .field("reset_handlers", &self.reset_handlers.len())
            .field("dispatched", &self.dispatched)
            .finish()
    }
}

impl Console {
    /// Disables interrupt delivery. Nests.
    pub fn disable_interrupts(&mut self) {
        self.interrupts.depth += 1;
    }

    /// Undoes one [`disable_interrupts`](Self::disable_interrupts).
    pub fn enable_interrupts(&mut self) {
        if self.interrupts.depth == 0 {
            tracing::warn!("unbalanced enable_interrupts, ignoring");
            return;
        }

        self.interrupts.depth -= 1;
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.depth == 0
    }

    /// How many times interrupts are currently disabled.
    pub fn interrupt_depth(&self) -> u32 {
        self.interrupts.depth
    }

    /// Runs `f` with interrupts disabled.
    pub fn with_interrupts_disabled<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.disable_interrupts();
        let result = f(self);
        self.enable_interrupts();
        result
    }

    /// Masks a source in or out at the interrupt controller.
    pub fn set_interrupt(&mut self, source: Source, enabled: bool) {
        self.system.mi.set_mask(source, enabled);
    }

    /// Registers a handler for a source. Several handlers can be registered for the same
    /// source; they run in registration order.
    pub fn register_handler(
        &mut self,
        source: Source,
        handler: impl FnMut(&mut Console) + Send + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.interrupts.next_id);
        self.interrupts.next_id = self.interrupts.next_id.wrapping_add(1);
        self.interrupts.handlers.push(Registered {
            id,
            source,
            handler: Some(Box::new(handler)),
        });

        id
    }

    /// Unregisters a handler. Can be called from inside the handler itself.
    pub fn unregister_handler(&mut self, id: HandlerId) -> bool {
        let Some(index) = self.interrupts.handlers.iter().position(|r| r.id == id) else {
            return false;
        };

        self.interrupts.handlers.remove(index);
        true
    }

    /// Registers a handler to run once when the reset button is pressed.
    pub fn register_reset_handler(
        &mut self,
        handler: impl FnOnce(&mut Console) + Send + 'static,
    ) -> Result<(), InterruptError> {
        if self.interrupts.reset_handlers.len() >= MAX_RESET_HANDLERS {
            return Err(InterruptError::TooManyResetHandlers);
        }

        self.interrupts.reset_handlers.push(Box::new(handler));
        Ok(())
    }

    /// How many interrupts have been dispatched.
    pub fn dispatched_interrupts(&self) -> u64 {
        self.interrupts.dispatched
    }

    /// Delivers pending interrupts, if enabled.
    #[track_caller]
    pub(crate) fn dispatch_interrupts(&mut self) {
        if !self.interrupts_enabled() {
            return;
        }

        let pending = self.system.mi.take_allowed();
        if pending.is_empty() {
            return;
        }

        self.disable_interrupts();
        for source in pending.iter() {
            tracing::trace!(?source, "dispatching interrupt");
            self.interrupts.dispatched += 1;

            self.handle_internally(source);
            self.run_handlers(source);
        }
        self.enable_interrupts();
    }

    #[track_caller]
    fn handle_internally(&mut self, source: Source) {
        match source {
            Source::Sp => self.coprocessor_interrupt(),
            Source::Pi => {
                self.system.pi.acknowledge();
                self.dma_update();
            }
            Source::Timer => self.fire_timers(),
            Source::Reset => {
                if self.interrupts.reset_seen {
                    return;
                }

                self.interrupts.reset_seen = true;
                tracing::info!("reset requested");
                for handler in std::mem::take(&mut self.interrupts.reset_handlers) {
                    handler(self);
                }
            }
            _ => (),
        }
    }

    fn run_handlers(&mut self, source: Source) {
        let ids = self
            .interrupts
            .handlers
            .iter()
            .filter(|r| r.source == source)
            .map(|r| r.id)
            .collect::<Vec<_>>();

        for id in ids {
            let Some(mut handler) = self
                .interrupts
                .handlers
                .iter_mut()
                .find(|r| r.id == id)
                .and_then(|r| r.handler.take())
            else {
                continue;
            };

            handler(self);

            // put it back, unless it was unregistered meanwhile
            if let Some(registered) = self.interrupts.handlers.iter_mut().find(|r| r.id == id) {
                registered.handler = Some(handler);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{Config, Console, interrupt::Source};
    use std::sync::{Arc, Mutex};

    fn console() -> Console {
        Console::new(Default::default(), Config::default()).unwrap()
    }

    #[test]
    fn nesting() {
        let mut console = console();
        console.disable_interrupts();
        console.disable_interrupts();
        console.enable_interrupts();
        assert!(!console.interrupts_enabled());

        console.enable_interrupts();
        assert!(console.interrupts_enabled());

        // unbalanced
        console.enable_interrupts();
        assert!(console.interrupts_enabled());
        console.disable_interrupts();
        assert!(!console.interrupts_enabled());
    }

    #[test]
    fn delivery_waits_for_enable() {
        let mut console = console();
        let hits = Arc::new(Mutex::new(0));
        console.set_interrupt(Source::Vi, true);
        console.register_handler(Source::Vi, {
            let hits = hits.clone();
            move |console| {
                assert!(!console.interrupts_enabled());
                *hits.lock().unwrap() += 1;
            }
        });

        console.with_interrupts_disabled(|console| {
            console.system.mi.raise(Source::Vi);
            console.poll();
        });
        assert_eq!(*hits.lock().unwrap(), 0);

        console.poll();
        assert_eq!(*hits.lock().unwrap(), 1);

        console.poll();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn masked_sources_are_not_delivered() {
        let mut console = console();
        let hits = Arc::new(Mutex::new(0));
        console.register_handler(Source::Si, {
            let hits = hits.clone();
            move |_| *hits.lock().unwrap() += 1
        });

        console.system.mi.raise(Source::Si);
        console.poll();
        assert_eq!(*hits.lock().unwrap(), 0);

        console.set_interrupt(Source::Si, true);
        console.poll();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unregister_from_inside_handler() {
        let mut console = console();
        let hits = Arc::new(Mutex::new(Vec::new()));
        console.set_interrupt(Source::Cart, true);

        let ids = Arc::new(Mutex::new(Vec::new()));
        for n in 0..2 {
            let hits = hits.clone();
            let ids_ = ids.clone();
            let id = console.register_handler(Source::Cart, move |console| {
                hits.lock().unwrap().push(n);
                if n == 0 {
                    let own = ids_.lock().unwrap()[0];
                    assert!(console.unregister_handler(own));
                }
            });
            ids.lock().unwrap().push(id);
        }

        for _ in 0..3 {
            console.system.mi.raise(Source::Cart);
            console.poll();
        }

        assert_eq!(*hits.lock().unwrap(), vec![0, 1, 1, 1]);
        assert!(!console.unregister_handler(ids.lock().unwrap()[0]));
        assert!(console.unregister_handler(ids.lock().unwrap()[1]));
    }

    #[test]
    fn reset_handlers_run_once() {
        let mut console = console();
        let hits = Arc::new(Mutex::new(0));
        for _ in 0..4 {
            let hits = hits.clone();
            console
                .register_reset_handler(move |_| *hits.lock().unwrap() += 1)
                .unwrap();
        }
        assert!(console.register_reset_handler(|_| ()).is_err());

        console.system.mi.raise(Source::Reset);
        console.poll();
        console.system.mi.raise(Source::Reset);
        console.poll();

        assert_eq!(*hits.lock().unwrap(), 4);
    }
}
