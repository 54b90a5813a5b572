//! Software timers multiplexed on the countdown timer.
//!
//! [`Timers`] keeps nodes sorted by deadline. It is generic over the context its callbacks run
//! in so that it can be driven without a [`Console`]; on the console it is advanced by the timer
//! interrupt, and the countdown compare register always holds the earliest deadline.
//!
//! A callback may freely create, stop, restart or delete timers, including its own: the node that
//! is firing is taken out of the list while its callback runs and only put back afterwards.
use crate::{Console, system::countdown};

/// Identifies a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

/// Passed to a callback when its timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub id: TimerId,
    /// The tick the timer was due at. Lags the current tick when firing late.
    pub deadline: u64,
}

pub type Callback<C> = Box<dyn FnMut(&mut C, Tick) + Send>;

/// Contexts which own a timer list.
pub trait HasTimers: Sized {
    fn timers(&mut self) -> &mut Timers<Self>;
}

struct Node<C> {
    id: TimerId,
    deadline: u64,
    delay: u64,
    period: u64,
    callback: Callback<C>,
}

/// Requested from inside the callback of the node that is firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Delete,
    Stop,
    Restart(u64),
}

struct Firing {
    id: TimerId,
    pending: Option<Pending>,
}

/// A list of one-shot and periodic timers.
pub struct Timers<C> {
    next_id: u32,
    /// Sorted by deadline. Nodes with equal deadlines keep insertion order.
    active: Vec<Node<C>>,
    stopped: Vec<Node<C>>,
    firing: Option<Firing>,
}

impl<C> Default for Timers<C> {
    fn default() -> Self {
        Self {
            next_id: 0,
            active: Vec::new(),
            stopped: Vec::new(),
            firing: None,
        }
    }
}

impl<C> std::fmt::Debug for Timers<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timers")
            .field("active", &self.active.len())
            .field("stopped", &self.stopped.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

impl<C: HasTimers> Timers<C> {
    fn insert_node(&mut self, node: Node<C>) {
        let index = self.active.partition_point(|n| n.deadline <= node.deadline);
        self.active.insert(index, node);
    }

    fn take(&mut self, id: TimerId) -> Option<Node<C>> {
        if let Some(index) = self.active.iter().position(|n| n.id == id) {
            return Some(self.active.remove(index));
        }

        let index = self.stopped.iter().position(|n| n.id == id)?;
        Some(self.stopped.remove(index))
    }

    fn firing_mut(&mut self, id: TimerId) -> Option<&mut Firing> {
        self.firing.as_mut().filter(|f| f.id == id)
    }

    /// Adds a timer which first fires `delay` ticks after `now`, then every `period` ticks.
    /// A period of zero makes a one-shot timer.
    pub fn insert(&mut self, now: u64, delay: u64, period: u64, callback: Callback<C>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        self.insert_node(Node {
            id,
            deadline: now + delay,
            delay,
            period,
            callback,
        });

        id
    }

    /// Removes a timer. Returns `false` if it does not exist (anymore).
    pub fn delete(&mut self, id: TimerId) -> bool {
        if let Some(firing) = self.firing_mut(id) {
            return if firing.pending == Some(Pending::Delete) {
                false
            } else {
                firing.pending = Some(Pending::Delete);
                true
            };
        }

        self.take(id).is_some()
    }

    /// Stops a timer without removing it. Returns `false` if it does not exist.
    pub fn stop(&mut self, id: TimerId) -> bool {
        if let Some(firing) = self.firing_mut(id) {
            if firing.pending == Some(Pending::Delete) {
                return false;
            }

            firing.pending = Some(Pending::Stop);
            return true;
        }

        if self.stopped.iter().any(|n| n.id == id) {
            return true;
        }

        match self.active.iter().position(|n| n.id == id) {
            Some(index) => {
                let node = self.active.remove(index);
                self.stopped.push(node);
                true
            }
            None => false,
        }
    }

    /// Schedules a timer to fire again `delay` ticks after `now`, using the delay it was created
    /// with. Works on running and stopped timers. Returns `false` if it does not exist.
    pub fn restart(&mut self, id: TimerId, now: u64) -> bool {
        if let Some(firing) = self.firing_mut(id) {
            if firing.pending == Some(Pending::Delete) {
                return false;
            }

            firing.pending = Some(Pending::Restart(now));
            return true;
        }

        match self.take(id) {
            Some(mut node) => {
                node.deadline = now + node.delay;
                self.insert_node(node);
                true
            }
            None => false,
        }
    }

    /// Earliest deadline of the running timers.
    pub fn next_deadline(&self) -> Option<u64> {
        self.active.first().map(|n| n.deadline)
    }

    /// Whether the timer exists, running or stopped.
    pub fn contains(&self, id: TimerId) -> bool {
        self.firing
            .as_ref()
            .is_some_and(|f| f.id == id && f.pending != Some(Pending::Delete))
            || self.active.iter().any(|n| n.id == id)
            || self.stopped.iter().any(|n| n.id == id)
    }

    /// Whether the timer exists and is not stopped.
    pub fn is_running(&self, id: TimerId) -> bool {
        self.active.iter().any(|n| n.id == id)
    }

    /// How many timers exist, running or stopped.
    pub fn len(&self) -> usize {
        self.active.len() + self.stopped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires every running timer whose deadline is at or before `now`, in ascending deadline
    /// order. Periodic timers are rescheduled relative to their previous deadline and fire once
    /// per elapsed period.
    pub fn advance(ctx: &mut C, now: u64) {
        loop {
            let timers = ctx.timers();
            if timers.next_deadline().is_none_or(|deadline| deadline > now) {
                break;
            }

            let mut node = timers.active.remove(0);
            timers.firing = Some(Firing {
                id: node.id,
                pending: None,
            });

            let tick = Tick {
                id: node.id,
                deadline: node.deadline,
            };
            (node.callback)(ctx, tick);

            let timers = ctx.timers();
            let pending = timers.firing.take().and_then(|f| f.pending);
            match pending {
                Some(Pending::Delete) => (),
                Some(Pending::Stop) => timers.stopped.push(node),
                Some(Pending::Restart(at)) => {
                    node.deadline = at + node.delay;
                    timers.insert_node(node);
                }
                None if node.period == 0 => (),
                None => {
                    node.deadline += node.period;
                    timers.insert_node(node);
                }
            }
        }
    }
}

impl HasTimers for Console {
    fn timers(&mut self) -> &mut Timers<Self> {
        &mut self.timers
    }
}

impl Console {
    /// Ticks elapsed since the console was created.
    pub fn timer_ticks(&self) -> u64 {
        self.system.scheduler.elapsed_ticks()
    }

    /// Points the countdown at the earliest deadline.
    pub(crate) fn reprogram_countdown(&mut self) {
        let deadline = self.timers.next_deadline();
        if self.system.countdown.compare != deadline {
            countdown::set_compare(&mut self.system, deadline);
        }
    }

    pub(crate) fn fire_timers(&mut self) {
        let now = self.timer_ticks();
        Timers::advance(self, now);
        self.reprogram_countdown();
    }

    /// Creates a timer which fires `delay` ticks from now and then every `period` ticks, or only
    /// once if `period` is zero. Callbacks run from the timer interrupt.
    pub fn new_timer(
        &mut self,
        delay: u64,
        period: u64,
        callback: impl FnMut(&mut Console, Tick) + Send + 'static,
    ) -> TimerId {
        let now = self.timer_ticks();
        let id = self.timers.insert(now, delay, period, Box::new(callback));
        tracing::trace!(?id, delay, period, "created timer");

        self.reprogram_countdown();
        id
    }

    /// Deletes a timer. Safe to call from the timer's own callback and on timers that no longer
    /// exist, in which case it returns `false`.
    pub fn delete_timer(&mut self, id: TimerId) -> bool {
        let deleted = self.timers.delete(id);
        self.reprogram_countdown();
        deleted
    }

    /// Stops a timer without deleting it.
    pub fn stop_timer(&mut self, id: TimerId) -> bool {
        let stopped = self.timers.stop(id);
        self.reprogram_countdown();
        stopped
    }

    /// Restarts a timer with its initial delay, counting from now.
    pub fn restart_timer(&mut self, id: TimerId) -> bool {
        let now = self.timer_ticks();
        let restarted = self.timers.restart(id, now);
        self.reprogram_countdown();
        restarted
    }

    /// Whether the timer exists, running or stopped.
    pub fn timer_exists(&self, id: TimerId) -> bool {
        self.timers.contains(id)
    }
}
