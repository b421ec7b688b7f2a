use crate::wd::clock::Clock;
use crate::wd::config::AppConfig;

/// One managed application. The table below is fixed for the supervisor's
/// lifetime; there is no live reload.
#[derive(Debug)]
pub struct App {
    pub name: String,
    pub cmd: String,
    /// Seconds from supervisor start before the first spawn.
    pub start_delay: u32,
    /// Grace after spawn before the first heartbeat is required.
    pub heartbeat_delay: u32,
    /// Max gap between heartbeats; 0 disables monitoring for this app.
    pub heartbeat_interval: u32,
    /// 0 = not running.
    pub pid: i32,
    pub started: bool,
    pub first_heartbeat: bool,
    /// Monotonic seconds; stamped on spawn and on every valid heartbeat.
    pub last_heartbeat: i64,
}

impl App {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            cmd: cfg.cmd.clone(),
            start_delay: cfg.start_delay,
            heartbeat_delay: cfg.heartbeat_delay,
            heartbeat_interval: cfg.heartbeat_interval,
            pid: 0,
            started: false,
            first_heartbeat: false,
            last_heartbeat: 0,
        }
    }
}

/// Owns the app table and the shared clock; the process driver and heartbeat
/// tracker are implemented as methods on this type so all state lives in one
/// value the loop can pass around.
#[derive(Debug)]
pub struct AppTable {
    pub clock: Clock,
    pub(crate) apps: Vec<App>,
}

impl AppTable {
    pub fn new(apps: Vec<App>, clock: Clock) -> Self {
        Self { clock, apps }
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn app(&self, i: usize) -> &App {
        &self.apps[i]
    }

    pub fn app_mut(&mut self, i: usize) -> &mut App {
        &mut self.apps[i]
    }

    /// Index of the app currently holding this pid, if any.
    pub fn find_pid(&self, pid: i32) -> Option<usize> {
        if pid <= 0 {
            return None;
        }
        self.apps.iter().position(|a| a.pid == pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> AppTable {
        let cfgs = [
            AppConfig {
                name: "Alpha".into(),
                cmd: "/bin/true".into(),
                start_delay: 0,
                heartbeat_delay: 5,
                heartbeat_interval: 2,
            },
            AppConfig {
                name: "Beta".into(),
                cmd: "/bin/true".into(),
                start_delay: 3,
                heartbeat_delay: 0,
                heartbeat_interval: 0,
            },
        ];
        let apps = cfgs.iter().map(App::from_config).collect();
        AppTable::new(apps, Clock::manual(0))
    }

    #[test]
    fn find_pid_matches_only_live_pids() {
        let mut t = table();
        assert_eq!(t.find_pid(1234), None);
        t.app_mut(1).pid = 1234;
        assert_eq!(t.find_pid(1234), Some(1));
        assert_eq!(t.find_pid(0), None);
        assert_eq!(t.find_pid(-1), None);
    }

    #[test]
    fn declaration_order_is_preserved() {
        let t = table();
        assert_eq!(t.app(0).name, "Alpha");
        assert_eq!(t.app(1).name, "Beta");
    }
}
