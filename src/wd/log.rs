use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

/// Best-effort: logging works without a file (stderr only) if the open fails.
pub fn init_log_file(path: &Path) {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => {
            let _ = LOG_FILE.set(Mutex::new(f));
        }
        Err(e) => eprintln!("cannot open log file {}: {e}", path.display()),
    }
}

pub fn event(component: &str, app: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match app {
        Some(a) => format!("{ts} [{component}] app={a} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(f) = LOG_FILE.get() {
        let mut g = f.lock().unwrap_or_else(|p| p.into_inner());
        let _ = writeln!(g, "{line}");
    }
}
