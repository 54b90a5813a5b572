use crate::{
    Console,
    queue::{Command, QueueError, Syncpoint},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A console shared between threads.
///
/// Every operation takes the lock for its whole duration, so each enqueued command lands in the
/// ring contiguously. Waiting releases the lock between polls so other producers can keep going.
#[derive(Clone)]
pub struct Shared(Arc<Mutex<Console>>);

impl Shared {
    pub fn new(console: Console) -> Self {
        Self(Arc::new(Mutex::new(console)))
    }

    /// Locks the console. A producer which panicked while holding the lock does not poison it
    /// for the others.
    pub fn lock(&self) -> MutexGuard<'_, Console> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[track_caller]
    pub fn enqueue(&self, command: Command) -> Result<(), QueueError> {
        self.lock().enqueue(command)
    }

    #[track_caller]
    pub fn new_syncpoint(&self) -> Result<Syncpoint, QueueError> {
        self.lock().new_syncpoint()
    }

    #[track_caller]
    pub fn wait_syncpoint(&self, id: Syncpoint) -> Result<(), QueueError> {
        loop {
            {
                let mut console = self.lock();
                if console.check_syncpoint(id)? {
                    return Ok(());
                }

                console.poll();
            }

            std::thread::yield_now();
        }
    }

    #[track_caller]
    pub fn sync(&self) -> Result<(), QueueError> {
        let id = self.new_syncpoint()?;
        self.wait_syncpoint(id)
    }

    /// Takes the console back, if this is the last handle to it.
    pub fn into_inner(self) -> Option<Console> {
        Arc::into_inner(self.0).map(|console| {
            console
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
        })
    }
}
