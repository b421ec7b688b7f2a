use crate::wd::app::AppTable;
use crate::wd::log::event;
use crate::wd::{MAX_WAIT_START_S, MAX_WAIT_TERMINATION_S};
use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt as _;
use std::process::Command;
use std::time::Duration;

/// Split a configured command line into argv on ASCII spaces.
pub fn tokenize_cmd(cmd: &str) -> Vec<String> {
    cmd.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

impl AppTable {
    /// Spawn one app. The child resets the supervisor's five handled signals
    /// to their default disposition and detaches into its own session before
    /// exec; our sockets are CLOEXEC so nothing of the supervisor leaks in.
    /// Exec failures are reported back to the parent as a spawn error.
    pub fn spawn(&mut self, i: usize) -> anyhow::Result<()> {
        let now = self.clock.mono_secs();
        let app = &mut self.apps[i];
        app.pid = 0;

        let argv = tokenize_cmd(&app.cmd);
        anyhow::ensure!(!argv.is_empty(), "empty cmd for {}", app.name);

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        unsafe {
            command.pre_exec(|| {
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                libc::signal(libc::SIGTERM, libc::SIG_DFL);
                libc::signal(libc::SIGQUIT, libc::SIG_DFL);
                libc::signal(libc::SIGUSR1, libc::SIG_DFL);
                libc::signal(libc::SIGUSR2, libc::SIG_DFL);
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to start {} with cmd {:?}", app.name, app.cmd))?;

        app.pid = child.id() as i32;
        app.started = true;
        app.first_heartbeat = false;
        app.last_heartbeat = now;
        event(
            "proc",
            Some(&app.name),
            format!("started pid={} cmd={:?}", app.pid, app.cmd),
        );
        // The Child handle is dropped on purpose: SIGCHLD is ignored, so the
        // kernel reaps for us and the zero-signal probe stays accurate.
        Ok(())
    }

    /// Zero-signal probe. "No such process" means gone; "permission denied"
    /// means it is running under another uid, which still counts as running.
    pub fn is_running(&self, i: usize) -> bool {
        let app = &self.apps[i];
        if app.pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(app.pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => {
                event(
                    "proc",
                    Some(&app.name),
                    format!("no permission to probe pid={}", app.pid),
                );
                true
            }
            Err(Errno::ESRCH) => false,
            Err(e) => {
                event(
                    "proc",
                    Some(&app.name),
                    format!("probe pid={} failed: {e}, assuming running", app.pid),
                );
                true
            }
        }
    }

    /// SIGTERM, then a bounded non-blocking reap window, then SIGKILL. On
    /// confirmed termination the record is cleared; on unconfirmed the record
    /// stays started so the next tick retries.
    pub async fn terminate(&mut self, i: usize) {
        if self.apps[i].pid <= 0 {
            return;
        }
        let pid = Pid::from_raw(self.apps[i].pid);
        let name = self.apps[i].name.clone();

        if let Err(e) = kill(pid, Signal::SIGTERM) {
            if e != Errno::ESRCH {
                event("proc", Some(&name), format!("SIGTERM pid={pid} failed: {e}"));
            }
        }

        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let mut remaining = MAX_WAIT_TERMINATION_S;
        while remaining > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match waitpid(pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(_, code)) => {
                    event("proc", Some(&name), format!("exited status={code}"));
                    break;
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    event("proc", Some(&name), format!("killed by signal {sig}"));
                    break;
                }
                Ok(WaitStatus::Stopped(_, sig)) => {
                    event("proc", Some(&name), format!("stopped by signal {sig}"));
                    break;
                }
                Ok(_) => {}
                // SIGCHLD is ignored, so the kernel usually reaps before us.
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    event("proc", Some(&name), format!("waitpid pid={pid} failed: {e}"));
                }
            }
            remaining -= 1;
        }

        if self.is_running(i) {
            event("proc", Some(&name), "still running, sending SIGKILL");
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    event("proc", Some(&name), format!("SIGKILL pid={pid} failed: {e}"));
                }
            }
            if self.is_running(i) {
                event("proc", Some(&name), "failed to terminate, will retry");
                return;
            }
        }

        let app = &mut self.apps[i];
        app.started = false;
        app.first_heartbeat = false;
        app.pid = 0;
        event("proc", Some(&name), "terminated");
    }

    /// Terminate if needed, spawn, then wait a short bounded window for the
    /// new process to show up. Success re-arms the first-heartbeat grace.
    pub async fn restart(&mut self, i: usize) {
        let name = self.apps[i].name.clone();
        if self.is_running(i) {
            self.terminate(i).await;
        }
        if let Err(e) = self.spawn(i) {
            event("proc", Some(&name), format!("spawn failed: {e:#}"));
            return;
        }

        let mut waited = 0;
        while waited < MAX_WAIT_START_S {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.is_running(i) {
                break;
            }
            waited += 1;
        }

        if self.is_running(i) {
            self.heartbeat_update(i);
            event("proc", Some(&name), "restarted");
        } else {
            event("proc", Some(&name), "failed to start after restart");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wd::app::{App, AppTable};
    use crate::wd::clock::Clock;
    use crate::wd::config::AppConfig;

    #[test]
    fn tokenize_splits_on_spaces_and_drops_empties() {
        assert_eq!(
            tokenize_cmd("/usr/bin/python  test_child.py 1"),
            vec!["/usr/bin/python", "test_child.py", "1"]
        );
        assert!(tokenize_cmd("   ").is_empty());
    }

    #[test]
    fn zero_pid_is_never_running() {
        let cfg = AppConfig {
            name: "X".into(),
            cmd: "/bin/true".into(),
            start_delay: 0,
            heartbeat_delay: 0,
            heartbeat_interval: 0,
        };
        let t = AppTable::new(vec![App::from_config(&cfg)], Clock::manual(0));
        assert!(!t.is_running(0));
    }

    #[tokio::test]
    async fn terminate_is_a_noop_without_a_pid() {
        let cfg = AppConfig {
            name: "X".into(),
            cmd: "/bin/true".into(),
            start_delay: 0,
            heartbeat_delay: 0,
            heartbeat_interval: 0,
        };
        let mut t = AppTable::new(vec![App::from_config(&cfg)], Clock::manual(0));
        t.terminate(0).await;
        assert!(!t.app(0).started);
        assert_eq!(t.app(0).pid, 0);
    }
}
