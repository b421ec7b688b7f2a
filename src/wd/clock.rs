use std::cell::Cell;
use std::time::Instant;

/// Monotonic seconds source for every timing decision (heartbeat thresholds,
/// start delays, uptime gates). Wall-clock time is used only for display
/// timestamps and the daily-reboot check. The manual variant lets tests and
/// self-tests step time without sleeping.
#[derive(Debug)]
pub enum Clock {
    Steady { epoch: Instant },
    Manual(Cell<i64>),
}

impl Clock {
    pub fn steady() -> Self {
        Clock::Steady { epoch: Instant::now() }
    }

    pub fn manual(start: i64) -> Self {
        Clock::Manual(Cell::new(start))
    }

    pub fn mono_secs(&self) -> i64 {
        match self {
            Clock::Steady { epoch } => epoch.elapsed().as_secs() as i64,
            Clock::Manual(t) => t.get(),
        }
    }

    /// No-op on the steady clock.
    pub fn advance(&self, secs: i64) {
        if let Clock::Manual(t) = self {
            t.set(t.get() + secs);
        }
    }
}
