use crate::system::System;
use std::collections::VecDeque;

/// A hardware event which will happen at a given cycle.
pub struct ScheduledEvent {
    pub cycle: u64,
    pub handler: fn(&mut System),
}

/// Keeps track of elapsed CPU cycles and of pending hardware events, sorted by the cycle they
/// happen at.
pub struct Scheduler {
    elapsed: u64,
    scheduled: VecDeque<ScheduledEvent>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("elapsed", &self.elapsed)
            .field("scheduled", &self.scheduled.len())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            elapsed: 0,
            scheduled: VecDeque::with_capacity(16),
        }
    }
}

impl Scheduler {
    /// Schedules `handler` to run `after` cycles from now. Events scheduled for the same cycle run
    /// in the order they were scheduled.
    #[inline(always)]
    pub fn schedule(&mut self, after: u64, handler: fn(&mut System)) {
        self.schedule_at(self.elapsed + after, handler);
    }

    /// Schedules `handler` to run at an absolute cycle. Cycles in the past run on the next
    /// [`pop`](Self::pop).
    #[inline(always)]
    pub fn schedule_at(&mut self, cycle: u64, handler: fn(&mut System)) {
        let index = self.scheduled.partition_point(|e| e.cycle <= cycle);
        self.scheduled
            .insert(index, ScheduledEvent { cycle, handler });
    }

    /// Removes every pending event with the given handler.
    #[inline(always)]
    pub fn cancel(&mut self, handler: fn(&mut System)) {
        self.scheduled
            .retain(|x| !std::ptr::fn_addr_eq(x.handler, handler));
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn advance(&mut self, count: u64) {
        self.elapsed += count;
    }

    /// Cycles until the next event, if any.
    #[inline(always)]
    pub fn until_next(&self) -> Option<u64> {
        self.scheduled
            .front()
            .map(|e| e.cycle.saturating_sub(self.elapsed))
    }

    /// Pops the next event if it is due.
    #[inline(always)]
    pub fn pop(&mut self) -> Option<fn(&mut System)> {
        if self
            .scheduled
            .front()
            .is_some_and(|e| e.cycle <= self.elapsed)
        {
            self.scheduled.pop_front().map(|e| e.handler)
        } else {
            None
        }
    }

    /// How many CPU cycles have elapsed.
    #[inline(always)]
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// How many timer ticks have elapsed.
    #[inline(always)]
    pub fn elapsed_ticks(&self) -> u64 {
        self.elapsed / super::CYCLES_PER_TICK
    }
}
