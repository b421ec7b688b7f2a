use crate::wd::app::AppTable;
use crate::wd::log::event;

impl AppTable {
    /// Stamp "heard from now"; called on spawn, restart and every valid heartbeat.
    pub fn heartbeat_update(&mut self, i: usize) {
        let now = self.clock.mono_secs();
        self.apps[i].last_heartbeat = now;
    }

    /// Seconds since the last stamp. Can be negative if the clock misbehaved;
    /// callers treat that as an anomaly, not a sample.
    pub fn heartbeat_elapsed(&self, i: usize) -> i64 {
        self.clock.mono_secs() - self.apps[i].last_heartbeat
    }

    /// Timeout decision for one tick. The first heartbeat after a spawn gets
    /// max(interval, delay) seconds; established heartbeats get the interval.
    pub fn heartbeat_timed_out(&mut self, i: usize) -> bool {
        let now = self.clock.mono_secs();
        let app = &mut self.apps[i];
        if !app.started {
            return false;
        }
        if app.heartbeat_interval == 0 {
            return false;
        }
        let elapsed = now - app.last_heartbeat;
        if elapsed < 0 {
            event("hb", Some(&app.name), "monotonic time anomaly, resetting baseline");
            app.last_heartbeat = now;
            return false;
        }
        let threshold = if app.first_heartbeat {
            app.heartbeat_interval as i64
        } else {
            app.heartbeat_interval.max(app.heartbeat_delay) as i64
        };
        elapsed >= threshold
    }
}

#[cfg(test)]
mod tests {
    use crate::wd::app::{App, AppTable};
    use crate::wd::clock::Clock;
    use crate::wd::config::AppConfig;

    fn table(delay: u32, interval: u32) -> AppTable {
        let cfg = AppConfig {
            name: "Hb".into(),
            cmd: "/bin/true".into(),
            start_delay: 0,
            heartbeat_delay: delay,
            heartbeat_interval: interval,
        };
        let mut t = AppTable::new(vec![App::from_config(&cfg)], Clock::manual(1000));
        t.app_mut(0).started = true;
        t.app_mut(0).pid = 42;
        t.heartbeat_update(0);
        t
    }

    #[test]
    fn first_heartbeat_threshold_is_max_of_interval_and_delay() {
        let mut t = table(10, 3);
        // Below max(3, 10) = 10 seconds: no timeout even though interval passed.
        t.clock.advance(9);
        assert!(!t.heartbeat_timed_out(0));
        t.clock.advance(1);
        assert!(t.heartbeat_timed_out(0));
    }

    #[test]
    fn established_heartbeat_uses_interval() {
        let mut t = table(10, 3);
        t.app_mut(0).first_heartbeat = true;
        t.clock.advance(2);
        assert!(!t.heartbeat_timed_out(0));
        t.clock.advance(1);
        assert!(t.heartbeat_timed_out(0));
    }

    #[test]
    fn interval_zero_never_times_out() {
        let mut t = table(5, 0);
        t.clock.advance(100_000);
        assert!(!t.heartbeat_timed_out(0));
    }

    #[test]
    fn not_started_never_times_out() {
        let mut t = table(0, 1);
        t.app_mut(0).started = false;
        t.clock.advance(100);
        assert!(!t.heartbeat_timed_out(0));
    }

    #[test]
    fn backwards_clock_resets_baseline_without_timeout() {
        let mut t = table(0, 3);
        t.app_mut(0).first_heartbeat = true;
        t.clock.advance(-50);
        assert!(!t.heartbeat_timed_out(0));
        // Baseline was reset to "now": a full interval must elapse again.
        t.clock.advance(2);
        assert!(!t.heartbeat_timed_out(0));
        t.clock.advance(1);
        assert!(t.heartbeat_timed_out(0));
    }

    #[test]
    fn elapsed_tracks_the_manual_clock() {
        let mut t = table(0, 5);
        t.clock.advance(7);
        assert_eq!(t.heartbeat_elapsed(0), 7);
        t.heartbeat_update(0);
        assert_eq!(t.heartbeat_elapsed(0), 0);
    }
}
