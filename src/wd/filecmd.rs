use crate::wd::log::event;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const WDT_STOP: &str = "wdtstop";
pub const WDT_RESTART: &str = "wdtrestart";
pub const WDT_REBOOT: &str = "wdtreboot";

/// Presence-based operator interface: empty files in the working directory.
/// Names are lower-cased `<verb><app>`, which also makes the app-name match
/// case-insensitive. Contents are ignored; create/remove are best-effort.
pub struct FileCmd {
    dir: PathBuf,
}

impl FileCmd {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn app_path(&self, verb: &str, app: &str) -> PathBuf {
        self.dir.join(format!("{verb}{app}").to_lowercase())
    }

    pub fn start_present(&self, app: &str) -> bool {
        self.app_path("start", app).exists()
    }

    /// The stop file is a latch: it is never removed by the supervisor and
    /// suppresses auto-start until the operator deletes it.
    pub fn stop_present(&self, app: &str) -> bool {
        self.app_path("stop", app).exists()
    }

    pub fn restart_present(&self, app: &str) -> bool {
        self.app_path("restart", app).exists()
    }

    pub fn remove_start(&self, app: &str) {
        remove(&self.app_path("start", app));
    }

    pub fn remove_restart(&self, app: &str) {
        remove(&self.app_path("restart", app));
    }

    /// Check-and-consume for the global wdt* files.
    pub fn take_global(&self, name: &str) -> bool {
        let p = self.dir.join(name);
        if p.exists() {
            remove(&p);
            true
        } else {
            false
        }
    }
}

fn remove(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            event("filecmd", None, format!("cannot remove {}: {e}", path.display()));
        }
    }
}
