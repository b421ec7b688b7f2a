//! Runtime self-tests behind `-t <name>`. These run in a deployed binary,
//! so fixtures go to the system temp directory, not a test harness.

use crate::wd::app::{App, AppTable};
use crate::wd::clock::Clock;
use crate::wd::cmd::{self, NetCommand};
use crate::wd::config::{load_config, AppConfig};
use crate::wd::reboot::{parse_periodic_reboot, RebootPolicy};
use crate::wd::stats::{StatRecord, StatsStore, RAW_LEN, STATS_MAGIC};
use crate::wd::{EXIT_CONFIG, EXIT_NORMALLY};
use std::fs;
use std::path::PathBuf;

const TESTS: &[(&str, fn() -> anyhow::Result<()>)] = &[
    ("config", test_config),
    ("cmd", test_cmd),
    ("heartbeat", test_heartbeat),
    ("reboot", test_reboot),
    ("stats", test_stats),
];

pub fn run(name: &str) -> i32 {
    if name == "list" {
        for (n, _) in TESTS {
            println!("{n}");
        }
        return EXIT_NORMALLY;
    }

    let selected: Vec<_> = if name == "all" {
        TESTS.to_vec()
    } else {
        TESTS.iter().copied().filter(|(n, _)| *n == name).collect()
    };
    if selected.is_empty() {
        eprintln!("unknown test {name:?}; use -t list");
        return EXIT_CONFIG;
    }

    let mut failed = false;
    for (n, f) in selected {
        match f() {
            Ok(()) => println!("{n}: PASS"),
            Err(e) => {
                println!("{n}: FAIL - {e:#}");
                failed = true;
            }
        }
    }
    if failed { EXIT_CONFIG } else { EXIT_NORMALLY }
}

fn scratch_dir(tag: &str) -> anyhow::Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("procwatch-selftest-{tag}-{}", std::process::id()));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn test_config() -> anyhow::Result<()> {
    let dir = scratch_dir("config")?;
    let path = dir.join("config.ini");
    fs::write(
        &path,
        "[processWatchdog]\n\
         udp_port = 12345\n\
         periodic_reboot = 04:00\n\
         \n\
         [app:Communicator]\n\
         start_delay = 10\n\
         heartbeat_delay = 60\n\
         heartbeat_interval = 20\n\
         cmd = /usr/bin/python test_child.py 1\n",
    )?;
    let cfg = load_config(&path);
    fs::remove_dir_all(&dir).ok();

    let cfg = cfg?;
    anyhow::ensure!(cfg.udp_port == 12345, "udp_port mismatch");
    anyhow::ensure!(
        cfg.periodic_reboot == RebootPolicy::Daily { hour: 4, min: 0 },
        "reboot policy mismatch"
    );
    anyhow::ensure!(cfg.apps.len() == 1, "expected one app");
    anyhow::ensure!(cfg.apps[0].name == "Communicator", "app name mismatch");
    anyhow::ensure!(cfg.apps[0].heartbeat_interval == 20, "interval mismatch");
    Ok(())
}

fn test_cmd() -> anyhow::Result<()> {
    anyhow::ensure!(
        cmd::parse(b"p1234") == NetCommand::Heartbeat { pid: 1234 },
        "p1234 should be a heartbeat"
    );
    anyhow::ensure!(cmd::parse(b"p0") == NetCommand::Unknown, "p0 must be invalid");
    anyhow::ensure!(cmd::parse(b"p-1") == NetCommand::Unknown, "p-1 must be invalid");
    anyhow::ensure!(cmd::parse(b"x") == NetCommand::Unknown, "x must be unknown");
    anyhow::ensure!(
        cmd::parse(b"aBot") == NetCommand::Start("Bot".into()),
        "aBot should decode as a start"
    );
    Ok(())
}

fn test_heartbeat() -> anyhow::Result<()> {
    let cfg = AppConfig {
        name: "T".into(),
        cmd: "/bin/true".into(),
        start_delay: 0,
        heartbeat_delay: 10,
        heartbeat_interval: 3,
    };
    let mut t = AppTable::new(vec![App::from_config(&cfg)], Clock::manual(0));
    t.app_mut(0).started = true;
    t.heartbeat_update(0);

    t.clock.advance(9);
    anyhow::ensure!(!t.heartbeat_timed_out(0), "first threshold is max(interval, delay)");
    t.clock.advance(1);
    anyhow::ensure!(t.heartbeat_timed_out(0), "first threshold must fire at the delay");

    t.heartbeat_update(0);
    t.app_mut(0).first_heartbeat = true;
    t.clock.advance(3);
    anyhow::ensure!(t.heartbeat_timed_out(0), "established threshold is the interval");

    t.app_mut(0).heartbeat_interval = 0;
    anyhow::ensure!(!t.heartbeat_timed_out(0), "interval 0 disables monitoring");
    Ok(())
}

fn test_reboot() -> anyhow::Result<()> {
    anyhow::ensure!(
        parse_periodic_reboot("12h") == RebootPolicy::Interval { minutes: 720 },
        "12h should be 720 minutes"
    );
    anyhow::ensure!(
        parse_periodic_reboot("junk") == RebootPolicy::Disabled,
        "junk must disable the feature"
    );
    let p = RebootPolicy::Interval { minutes: 2 };
    anyhow::ensure!(!p.due(60, (0, 0)), "one minute is not two");
    anyhow::ensure!(p.due(120, (0, 0)), "two minutes must fire");
    anyhow::ensure!(
        RebootPolicy::Daily { hour: 4, min: 0 }.due(60, (4, 0)),
        "daily must fire on the local-time match"
    );
    Ok(())
}

fn test_stats() -> anyhow::Result<()> {
    let dir = scratch_dir("stats")?;
    let names = vec!["SelfTest".to_string()];

    let result = (|| -> anyhow::Result<()> {
        let mut s = StatsStore::load(&dir, &names);
        s.on_started(0);
        s.record_heartbeat(0, 2);
        s.record_heartbeat(0, 4);
        s.persist_all();

        let s2 = StatsStore::load(&dir, &names);
        anyhow::ensure!(s2.record(0) == s.record(0), "record must round-trip");
        anyhow::ensure!(s2.record(0).avg_heartbeat_time == 3, "average mismatch");

        let mut bytes = s2.record(0).encode();
        anyhow::ensure!(bytes.len() == RAW_LEN, "raw length mismatch");
        bytes[RAW_LEN - 1] ^= 0xFF;
        fs::write(dir.join("stats_SelfTest.raw"), &bytes)?;
        let s3 = StatsStore::load(&dir, &names);
        anyhow::ensure!(s3.record(0).start_count == 0, "bad magic must zero the record");
        anyhow::ensure!(s3.record(0).magic == STATS_MAGIC, "magic must be restamped");

        anyhow::ensure!(StatRecord::decode(&bytes[..10]).is_none(), "truncation must be rejected");
        Ok(())
    })();

    fs::remove_dir_all(&dir).ok();
    result
}
