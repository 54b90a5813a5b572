//! Countdown timer. Raises the timer interrupt when the tick counter reaches the compare value.
use crate::system::{CYCLES_PER_TICK, System, mi::Source};

#[derive(Debug, Default)]
pub struct Countdown {
    /// Tick at which the interrupt fires, if armed.
    pub compare: Option<u64>,
    /// How many times the compare value was hit.
    pub expirations: u64,
}

/// Arms the countdown for the given tick, or disarms it. Ticks in the past fire immediately.
pub fn set_compare(sys: &mut System, tick: Option<u64>) {
    sys.scheduler.cancel(expire);
    sys.countdown.compare = tick;

    if let Some(tick) = tick {
        let cycle = tick.saturating_mul(CYCLES_PER_TICK);
        sys.scheduler
            .schedule_at(cycle.max(sys.scheduler.elapsed()), expire);
    }
}

fn expire(sys: &mut System) {
    tracing::trace!(tick = sys.scheduler.elapsed_ticks(), "countdown expired");
    sys.countdown.compare = None;
    sys.countdown.expirations += 1;
    sys.mi.raise(Source::Timer);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rearming_replaces_compare() {
        let mut sys = System::new(Vec::new());
        set_compare(&mut sys, Some(10));
        set_compare(&mut sys, Some(20));

        sys.exec(10 * CYCLES_PER_TICK);
        assert!(!sys.mi.pending.timer());

        sys.exec(10 * CYCLES_PER_TICK);
        assert!(sys.mi.pending.timer());
        assert_eq!(sys.countdown.expirations, 1);
        assert_eq!(sys.countdown.compare, None);
    }
}
