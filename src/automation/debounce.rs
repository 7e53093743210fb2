use std::time::{Duration, Instant};

/// One debounce timer: how long a condition has held without interruption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebounceTimer {
    #[default]
    Idle,
    Timing(Instant),
}

impl DebounceTimer {
    /// Feed one observation of the condition.
    ///
    /// Starts timing when the condition first holds, keeps the original start
    /// while it keeps holding, and resets to `Idle` as soon as it stops.
    /// Returns `true` once the condition has held for at least `delay`.
    pub fn observe(&mut self, holds: bool, now: Instant, delay: Duration) -> bool {
        if !holds {
            *self = DebounceTimer::Idle;
            return false;
        }
        let started = match *self {
            DebounceTimer::Idle => {
                *self = DebounceTimer::Timing(now);
                now
            }
            DebounceTimer::Timing(started) => started,
        };
        now.saturating_duration_since(started) >= delay
    }

    pub fn started_at(&self) -> Option<Instant> {
        match self {
            DebounceTimer::Idle => None,
            DebounceTimer::Timing(started) => Some(*started),
        }
    }
}

/// The two independent timers kept per automated device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebounceState {
    pub enable: DebounceTimer,
    pub disable: DebounceTimer,
}
