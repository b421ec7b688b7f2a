use crate::wd::app::{App, AppTable};
use crate::wd::clock::Clock;
use crate::wd::cmd::{self, Action, NetCommand};
use crate::wd::config::Config;
use crate::wd::filecmd::{FileCmd, WDT_REBOOT, WDT_RESTART, WDT_STOP};
use crate::wd::log::event;
use crate::wd::resource::ResourceSampler;
use crate::wd::server::UdpEndpoint;
use crate::wd::stats::StatsStore;
use crate::wd::{
    EXIT_NORMALLY, EXIT_REBOOT, EXIT_RESTART, MAX_APP_CMD_LENGTH, REBOOT_CHECK_PERIOD_S,
    RESOURCE_SAMPLE_PERIOD_S, SOCKET_TIMEOUT_MS, STATS_PERSIST_PERIOD_S, STUCK_USR1_LIMIT,
};
use anyhow::Context as _;
use chrono::{Local, Timelike as _};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::signal::unix::{signal as unix_signal, SignalKind};

/// What one pass through the tick gate produced.
enum Gate {
    Quiet,
    Datagram(usize),
    Exit(Action, &'static str),
    Fatal(anyhow::Error),
}

/// An operator hammering USR1 means the loop is stuck (usually inside a
/// termination wait). The handler counts deliveries and force-exits the
/// process on the limit, without cleanup. Handlers must stay signal-safe:
/// count, compare, exit.
fn install_stuck_exit_guard() {
    static USR1_COUNT: AtomicUsize = AtomicUsize::new(0);
    let r = unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGUSR1, || {
            if USR1_COUNT.fetch_add(1, Ordering::Relaxed) + 1 >= STUCK_USR1_LIMIT {
                signal_hook::low_level::exit(EXIT_NORMALLY);
            }
        })
    };
    if let Err(e) = r {
        event("sig", None, format!("cannot install USR1 guard: {e}"));
    }
}

pub async fn run_daemon_async(cfg: Config) -> anyhow::Result<i32> {
    install_stuck_exit_guard();

    let names: Vec<String> = cfg.apps.iter().map(|a| a.name.clone()).collect();
    let apps: Vec<App> = cfg.apps.iter().map(App::from_config).collect();
    let mut table = AppTable::new(apps, Clock::steady());
    let files = FileCmd::new(".");
    let mut stats = StatsStore::load(Path::new("."), &names);
    let mut sampler = ResourceSampler::new(names.len());

    let endpoint = match UdpEndpoint::bind(cfg.udp_port) {
        Ok(ep) => ep,
        Err(e) => {
            event("udp", None, format!("UDP start failed: {e:#}"));
            return Ok(EXIT_RESTART);
        }
    };

    let mut sig_int = unix_signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut sig_term = unix_signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut sig_quit = unix_signal(SignalKind::quit()).context("SIGQUIT handler")?;
    let mut sig_usr1 = unix_signal(SignalKind::user_defined1()).context("SIGUSR1 handler")?;
    let mut sig_usr2 = unix_signal(SignalKind::user_defined2()).context("SIGUSR2 handler")?;

    let mut exit_code = EXIT_NORMALLY;
    let start_mark = table.clock.mono_secs();
    let mut prev_uptime: i64 = -1;
    let mut buf = [0u8; MAX_APP_CMD_LENGTH - 1];

    loop {
        let gate = tokio::select! {
            r = endpoint.poll(SOCKET_TIMEOUT_MS, &mut buf) => match r {
                Ok(Some((len, _peer))) => Gate::Datagram(len),
                Ok(None) => Gate::Quiet,
                Err(e) => Gate::Fatal(e),
            },
            _ = sig_int.recv() => Gate::Exit(Action::Restart, "INT detected, restarting"),
            _ = sig_term.recv() => Gate::Exit(Action::Restart, "TERM detected, restarting"),
            _ = sig_quit.recv() => Gate::Exit(Action::Reboot, "QUIT detected, rebooting"),
            _ = sig_usr1.recv() => Gate::Exit(Action::ExitNormal, "USR1 detected, terminating"),
            _ = sig_usr2.recv() => {
                event("sig", None, "USR2 detected");
                Gate::Quiet
            }
        };

        match gate {
            Gate::Quiet => {}
            Gate::Datagram(len) => {
                if let Some(action) = decode_datagram(&buf[..len]) {
                    apply_action(action, &mut table, &mut stats, &files).await;
                }
            }
            Gate::Exit(action, msg) => {
                event("sig", None, msg);
                if let Some(code) = apply_action(action, &mut table, &mut stats, &files).await {
                    exit_code = code;
                }
                break;
            }
            Gate::Fatal(e) => {
                event("udp", None, format!("UDP poll failed: {e:#}"));
                exit_code = EXIT_RESTART;
                break;
            }
        }

        let uptime = table.clock.mono_secs() - start_mark;
        // Ticks are sub-second; run the scheduled work once per second at most.
        let fresh_second = uptime != prev_uptime;
        prev_uptime = uptime;
        let resource_tick = fresh_second && uptime % RESOURCE_SAMPLE_PERIOD_S == 0;
        let persist_tick = fresh_second && uptime > 0 && uptime % STATS_PERSIST_PERIOD_S == 0;
        let reboot_tick = fresh_second && uptime % REBOOT_CHECK_PERIOD_S == 0;

        for i in 0..table.len() {
            let name = table.app(i).name.clone();
            if table.app(i).started {
                if resource_tick && table.is_running(i) {
                    let pid = table.app(i).pid;
                    let now = table.clock.mono_secs();
                    if let Some(s) = sampler.sample(i, pid, now) {
                        stats.record_resource_sample(i, s);
                    }
                }
                if persist_tick {
                    stats.persist(i);
                }
                if !table.is_running(i) {
                    event("proc", Some(&name), "crashed, restarting");
                    stats.on_crashed(i);
                    restart_with_stats(&mut table, &mut stats, i).await;
                } else if table.heartbeat_timed_out(i) {
                    event("proc", Some(&name), "no heartbeat in time, restarting");
                    stats.on_heartbeat_reset(i);
                    restart_with_stats(&mut table, &mut stats, i).await;
                } else if files.stop_present(&name) {
                    event("proc", Some(&name), "stopped by file command");
                    apply_action(Action::StopApp(i), &mut table, &mut stats, &files).await;
                } else if files.restart_present(&name) {
                    event("proc", Some(&name), "restarted by file command");
                    apply_action(Action::RestartApp(i), &mut table, &mut stats, &files).await;
                }
            } else {
                let delay_elapsed = uptime >= table.app(i).start_delay as i64;
                if !files.stop_present(&name) && (files.start_present(&name) || delay_elapsed) {
                    apply_action(Action::StartApp(i), &mut table, &mut stats, &files).await;
                }
            }
        }

        let mut pending: Option<Action> = None;
        if files.take_global(WDT_STOP) {
            event("filecmd", None, "stopped by file command");
            pending = Some(Action::ExitNormal);
        } else if files.take_global(WDT_RESTART) {
            event("filecmd", None, "restarted by file command");
            pending = Some(Action::Restart);
        } else if files.take_global(WDT_REBOOT) {
            event("filecmd", None, "system reboot by file command");
            pending = Some(Action::Reboot);
        }

        if pending.is_none() && reboot_tick {
            let now = Local::now();
            if cfg.periodic_reboot.due(uptime, (now.hour(), now.minute())) {
                event("reboot", None, "periodic reboot triggered");
                pending = Some(Action::Reboot);
            }
        }

        if let Some(action) = pending {
            if let Some(code) = apply_action(action, &mut table, &mut stats, &files).await {
                exit_code = code;
                break;
            }
        }
    }

    endpoint.stop();

    for i in 0..table.len() {
        // Persist before killing so the final counters land on disk even if
        // the termination path misbehaves.
        stats.persist(i);
        table.terminate(i).await;
        if !table.is_running(i) {
            event("proc", Some(&table.app(i).name), "ended");
        }
    }

    event("main", None, format!("ended with return code {exit_code}"));
    Ok(exit_code)
}

fn decode_datagram(data: &[u8]) -> Option<Action> {
    match cmd::parse(data) {
        NetCommand::Heartbeat { pid } => Some(Action::Heartbeat { pid }),
        // Reserved wire vocabulary: decoded, acknowledged, not acted on.
        NetCommand::Start(name) => {
            event("cmd", None, format!("start command for {name:?} ignored (disabled)"));
            None
        }
        NetCommand::Stop(name) => {
            event("cmd", None, format!("stop command for {name:?} ignored (disabled)"));
            None
        }
        NetCommand::Restart(name) => {
            event("cmd", None, format!("restart command for {name:?} ignored (disabled)"));
            None
        }
        NetCommand::Unknown => None,
    }
}

async fn restart_with_stats(table: &mut AppTable, stats: &mut StatsStore, i: usize) {
    table.restart(i).await;
    if table.app(i).started {
        stats.on_respawned(i);
    }
}

/// The single applier for every command source. Exit-class actions return
/// the process exit code; app-class actions return None.
async fn apply_action(
    action: Action,
    table: &mut AppTable,
    stats: &mut StatsStore,
    files: &FileCmd,
) -> Option<i32> {
    match action {
        Action::Heartbeat { pid } => {
            if let Some(i) = table.find_pid(pid) {
                let elapsed = table.heartbeat_elapsed(i);
                if table.app(i).first_heartbeat {
                    if elapsed >= 0 {
                        stats.record_heartbeat(i, elapsed);
                    }
                } else {
                    let name = table.app(i).name.clone();
                    event("hb", Some(&name), format!("first heartbeat after {elapsed} seconds"));
                    stats.record_first_heartbeat(i, elapsed);
                    table.app_mut(i).first_heartbeat = true;
                }
                table.heartbeat_update(i);
            }
            None
        }
        Action::StartApp(i) => {
            if !table.app(i).started {
                let name = table.app(i).name.clone();
                match table.spawn(i) {
                    Ok(()) => {
                        stats.on_started(i);
                        files.remove_start(&name);
                        files.remove_restart(&name);
                    }
                    Err(e) => event("proc", Some(&name), format!("spawn failed: {e:#}")),
                }
            }
            None
        }
        Action::StopApp(i) => {
            if table.app(i).started {
                table.terminate(i).await;
            }
            None
        }
        Action::RestartApp(i) => {
            let name = table.app(i).name.clone();
            restart_with_stats(table, stats, i).await;
            files.remove_restart(&name);
            None
        }
        Action::ExitNormal => Some(EXIT_NORMALLY),
        Action::Restart => Some(EXIT_RESTART),
        Action::Reboot => Some(EXIT_REBOOT),
    }
}
