//! Durable per-app statistics.
//!
//! Two files per app in the working directory: `stats_<name>.log` (human
//! text, rewritten in full) and `stats_<name>.raw` (binary snapshot).
//!
//! Raw layout, little-endian, 196 bytes total:
//!
//! | offset | type | field                    |
//! |--------|------|--------------------------|
//! | 0      | i64  | started_at (unix secs)   |
//! | 8      | i64  | crashed_at               |
//! | 16     | i64  | heartbeat_reset_at       |
//! | 24     | i64  | avg_first_heartbeat_time |
//! | 32     | i64  | max_first_heartbeat_time |
//! | 40     | i64  | min_first_heartbeat_time |
//! | 48     | i64  | avg_heartbeat_time       |
//! | 56     | i64  | max_heartbeat_time       |
//! | 64     | i64  | min_heartbeat_time       |
//! | 72     | u64  | start_count              |
//! | 80     | u64  | crash_count              |
//! | 88     | u64  | heartbeat_reset_count    |
//! | 96     | u64  | heartbeat_count          |
//! | 104    | u64  | heartbeat_count_old      |
//! | 112    | u64  | avg_heartbeat_count_old  |
//! | 120    | f64  | cpu_current (percent)    |
//! | 128    | f64  | cpu_min                  |
//! | 136    | f64  | cpu_max                  |
//! | 144    | f64  | cpu_avg (EMA, alpha 0.1) |
//! | 152    | u64  | rss_current (KB)         |
//! | 160    | u64  | rss_min                  |
//! | 168    | u64  | rss_max                  |
//! | 176    | u64  | rss_avg (cumulative)     |
//! | 184    | u64  | resource_sample_count    |
//! | 192    | u32  | magic                    |
//!
//! The magic is last so a truncated write can never pass validation; any
//! size or magic mismatch zeroes that record only and restamps the magic.
//! Bump the magic on any layout change; there is no in-place migration.

use crate::wd::log::event;
use crate::wd::resource::ResourceSample;
use chrono::{Local, TimeZone as _};
use std::fs;
use std::path::{Path, PathBuf};

pub const STATS_MAGIC: u32 = 0xA50F_AA57;
pub const RAW_LEN: usize = 196;

const CPU_EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatRecord {
    pub started_at: i64,
    pub crashed_at: i64,
    pub heartbeat_reset_at: i64,
    pub avg_first_heartbeat_time: i64,
    pub max_first_heartbeat_time: i64,
    pub min_first_heartbeat_time: i64,
    pub avg_heartbeat_time: i64,
    pub max_heartbeat_time: i64,
    pub min_heartbeat_time: i64,
    pub start_count: u64,
    pub crash_count: u64,
    pub heartbeat_reset_count: u64,
    pub heartbeat_count: u64,
    pub heartbeat_count_old: u64,
    pub avg_heartbeat_count_old: u64,
    pub cpu_current: f64,
    pub cpu_min: f64,
    pub cpu_max: f64,
    pub cpu_avg: f64,
    pub rss_current: u64,
    pub rss_min: u64,
    pub rss_max: u64,
    pub rss_avg: u64,
    pub resource_sample_count: u64,
    pub magic: u32,
}

impl StatRecord {
    pub fn new() -> Self {
        Self {
            magic: STATS_MAGIC,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RAW_LEN);
        for v in [
            self.started_at,
            self.crashed_at,
            self.heartbeat_reset_at,
            self.avg_first_heartbeat_time,
            self.max_first_heartbeat_time,
            self.min_first_heartbeat_time,
            self.avg_heartbeat_time,
            self.max_heartbeat_time,
            self.min_heartbeat_time,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [
            self.start_count,
            self.crash_count,
            self.heartbeat_reset_count,
            self.heartbeat_count,
            self.heartbeat_count_old,
            self.avg_heartbeat_count_old,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [self.cpu_current, self.cpu_min, self.cpu_max, self.cpu_avg] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [
            self.rss_current,
            self.rss_min,
            self.rss_max,
            self.rss_avg,
            self.resource_sample_count,
        ] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf
    }

    /// None on wrong size or wrong trailing magic.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != RAW_LEN {
            return None;
        }
        let mut off = 0usize;
        let mut next8 = || {
            let chunk: [u8; 8] = data[off..off + 8].try_into().unwrap();
            off += 8;
            chunk
        };
        let r = Self {
            started_at: i64::from_le_bytes(next8()),
            crashed_at: i64::from_le_bytes(next8()),
            heartbeat_reset_at: i64::from_le_bytes(next8()),
            avg_first_heartbeat_time: i64::from_le_bytes(next8()),
            max_first_heartbeat_time: i64::from_le_bytes(next8()),
            min_first_heartbeat_time: i64::from_le_bytes(next8()),
            avg_heartbeat_time: i64::from_le_bytes(next8()),
            max_heartbeat_time: i64::from_le_bytes(next8()),
            min_heartbeat_time: i64::from_le_bytes(next8()),
            start_count: u64::from_le_bytes(next8()),
            crash_count: u64::from_le_bytes(next8()),
            heartbeat_reset_count: u64::from_le_bytes(next8()),
            heartbeat_count: u64::from_le_bytes(next8()),
            heartbeat_count_old: u64::from_le_bytes(next8()),
            avg_heartbeat_count_old: u64::from_le_bytes(next8()),
            cpu_current: f64::from_le_bytes(next8()),
            cpu_min: f64::from_le_bytes(next8()),
            cpu_max: f64::from_le_bytes(next8()),
            cpu_avg: f64::from_le_bytes(next8()),
            rss_current: u64::from_le_bytes(next8()),
            rss_min: u64::from_le_bytes(next8()),
            rss_max: u64::from_le_bytes(next8()),
            rss_avg: u64::from_le_bytes(next8()),
            resource_sample_count: u64::from_le_bytes(next8()),
            magic: u32::from_le_bytes(data[RAW_LEN - 4..].try_into().unwrap()),
        };
        if r.magic != STATS_MAGIC {
            return None;
        }
        Some(r)
    }

    fn snapshot_heartbeat_count(&mut self) {
        self.heartbeat_count_old = self.heartbeat_count;
        self.heartbeat_count = 0;
    }

    fn fold_heartbeat_count_old(&mut self) {
        let n = self.crash_count + self.heartbeat_reset_count;
        if n == 0 {
            return;
        }
        self.avg_heartbeat_count_old =
            (self.avg_heartbeat_count_old * (n - 1) + self.heartbeat_count_old) / n;
    }
}

fn fmt_date(t: i64) -> String {
    if t <= 0 {
        return "Never".to_string();
    }
    match Local.timestamp_opt(t, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "Never".to_string(),
    }
}

/// Owns the persisted records, one per app, parallel to the app table.
pub struct StatsStore {
    dir: PathBuf,
    names: Vec<String>,
    records: Vec<StatRecord>,
}

impl StatsStore {
    /// Reads one `.raw` per app; missing files are created, corrupt or
    /// truncated ones are zeroed and restamped. Never fails: a broken
    /// statistics file must not keep the supervisor down.
    pub fn load(dir: &Path, names: &[String]) -> Self {
        let mut store = Self {
            dir: dir.to_path_buf(),
            names: names.to_vec(),
            records: Vec::with_capacity(names.len()),
        };
        for i in 0..names.len() {
            let path = store.raw_path(i);
            let (record, rewrite) = match fs::read(&path) {
                Ok(data) => match StatRecord::decode(&data) {
                    Some(r) => (r, false),
                    None => {
                        event(
                            "stats",
                            Some(&names[i]),
                            format!("statistics file {} has been reset", path.display()),
                        );
                        (StatRecord::new(), true)
                    }
                },
                Err(_) => (StatRecord::new(), true),
            };
            store.records.push(record);
            if rewrite {
                store.persist(i);
            }
        }
        store
    }

    pub fn record(&self, i: usize) -> &StatRecord {
        &self.records[i]
    }

    fn raw_path(&self, i: usize) -> PathBuf {
        self.dir.join(format!("stats_{}.raw", self.names[i]))
    }

    fn log_path(&self, i: usize) -> PathBuf {
        self.dir.join(format!("stats_{}.log", self.names[i]))
    }

    /// Fresh start (initial spawn or operator start after a stop latch).
    pub fn on_started(&mut self, i: usize) {
        let r = &mut self.records[i];
        r.started_at = Local::now().timestamp();
        r.start_count += 1;
        r.snapshot_heartbeat_count();
    }

    /// Spawn that is part of a crash/heartbeat restart: the lifecycle event
    /// already snapshotted, so only the start bookkeeping moves.
    pub fn on_respawned(&mut self, i: usize) {
        let r = &mut self.records[i];
        r.started_at = Local::now().timestamp();
        r.start_count += 1;
    }

    pub fn on_crashed(&mut self, i: usize) {
        let r = &mut self.records[i];
        r.crashed_at = Local::now().timestamp();
        r.crash_count += 1;
        r.snapshot_heartbeat_count();
        r.fold_heartbeat_count_old();
    }

    pub fn on_heartbeat_reset(&mut self, i: usize) {
        let r = &mut self.records[i];
        r.heartbeat_reset_at = Local::now().timestamp();
        r.heartbeat_reset_count += 1;
        r.snapshot_heartbeat_count();
        r.fold_heartbeat_count_old();
    }

    /// Inter-heartbeat interval sample, integer running average.
    pub fn record_heartbeat(&mut self, i: usize, secs: i64) {
        let r = &mut self.records[i];
        r.heartbeat_count += 1;
        let n = r.heartbeat_count as i64;
        r.avg_heartbeat_time = (r.avg_heartbeat_time * (n - 1) + secs) / n;
        if secs > r.max_heartbeat_time {
            r.max_heartbeat_time = secs;
        }
        if secs < r.min_heartbeat_time || r.heartbeat_count == 1 {
            r.min_heartbeat_time = secs;
        }
    }

    /// First-heartbeat-after-spawn latency. The divisor counts every
    /// lifecycle slot (starts, crashes, heartbeat resets), matching the
    /// persisted arithmetic other tooling expects.
    pub fn record_first_heartbeat(&mut self, i: usize, secs: i64) {
        let r = &mut self.records[i];
        let n = (r.start_count + r.crash_count + r.heartbeat_reset_count).max(1) as i64;
        r.avg_first_heartbeat_time = (r.avg_first_heartbeat_time * (n - 1) + secs) / n;
        if secs > r.max_first_heartbeat_time {
            r.max_first_heartbeat_time = secs;
        }
        if secs < r.min_first_heartbeat_time || r.start_count == 1 {
            r.min_first_heartbeat_time = secs;
        }
    }

    pub fn record_resource_sample(&mut self, i: usize, s: ResourceSample) {
        let r = &mut self.records[i];
        r.resource_sample_count += 1;
        let n = r.resource_sample_count;

        r.cpu_current = s.cpu_percent;
        if n == 1 {
            r.cpu_min = s.cpu_percent;
            r.cpu_max = s.cpu_percent;
            r.cpu_avg = s.cpu_percent;
        } else {
            if s.cpu_percent < r.cpu_min {
                r.cpu_min = s.cpu_percent;
            }
            if s.cpu_percent > r.cpu_max {
                r.cpu_max = s.cpu_percent;
            }
            r.cpu_avg = r.cpu_avg * (1.0 - CPU_EMA_ALPHA) + s.cpu_percent * CPU_EMA_ALPHA;
        }

        r.rss_current = s.rss_kb;
        if n == 1 {
            r.rss_min = s.rss_kb;
            r.rss_max = s.rss_kb;
            r.rss_avg = s.rss_kb;
        } else {
            if s.rss_kb < r.rss_min {
                r.rss_min = s.rss_kb;
            }
            if s.rss_kb > r.rss_max {
                r.rss_max = s.rss_kb;
            }
            r.rss_avg = (r.rss_avg * (n - 1) + s.rss_kb) / n;
        }
    }

    /// Writes both files for one app. Failures are logged and the in-memory
    /// record stays authoritative; the next cadence retries.
    pub fn persist(&self, i: usize) {
        let raw = self.records[i].encode();
        if let Err(e) = write_atomic(&self.raw_path(i), &raw) {
            event(
                "stats",
                Some(&self.names[i]),
                format!("cannot write {}: {e}", self.raw_path(i).display()),
            );
        }
        let text = self.render_text(i);
        if let Err(e) = write_atomic(&self.log_path(i), text.as_bytes()) {
            event(
                "stats",
                Some(&self.names[i]),
                format!("cannot write {}: {e}", self.log_path(i).display()),
            );
        }
    }

    pub fn persist_all(&self) {
        for i in 0..self.records.len() {
            self.persist(i);
        }
    }

    fn render_text(&self, i: usize) -> String {
        let r = &self.records[i];
        let mut out = String::new();
        out.push_str(&format!("Statistics for App {i} {}:\n", self.names[i]));
        out.push_str(&format!("Started at: {}\n", fmt_date(r.started_at)));
        out.push_str(&format!("Crashed at: {}\n", fmt_date(r.crashed_at)));
        out.push_str(&format!("Heartbeat reset at: {}\n", fmt_date(r.heartbeat_reset_at)));
        out.push_str(&format!("Start count: {}\n", r.start_count));
        out.push_str(&format!("Crash count: {}\n", r.crash_count));
        out.push_str(&format!("Heartbeat reset count: {}\n", r.heartbeat_reset_count));
        out.push_str(&format!("Heartbeat count: {}\n", r.heartbeat_count));
        out.push_str(&format!("Heartbeat count old: {}\n", r.heartbeat_count_old));
        out.push_str(&format!(
            "Average heartbeat count old: {}\n",
            r.avg_heartbeat_count_old
        ));
        out.push_str(&format!(
            "Average first heartbeat time: {} seconds\n",
            r.avg_first_heartbeat_time
        ));
        out.push_str(&format!(
            "Maximum first heartbeat time: {} seconds\n",
            r.max_first_heartbeat_time
        ));
        out.push_str(&format!(
            "Minimum first heartbeat time: {} seconds\n",
            r.min_first_heartbeat_time
        ));
        out.push_str(&format!("Average heartbeat time: {} seconds\n", r.avg_heartbeat_time));
        out.push_str(&format!("Maximum heartbeat time: {} seconds\n", r.max_heartbeat_time));
        out.push_str(&format!("Minimum heartbeat time: {} seconds\n", r.min_heartbeat_time));
        out.push_str(&format!(
            "CPU usage: {:.1}% (min {:.1}%, max {:.1}%, avg {:.1}%)\n",
            r.cpu_current, r.cpu_min, r.cpu_max, r.cpu_avg
        ));
        out.push_str(&format!(
            "Memory RSS: {} KB (min {} KB, max {} KB, avg {} KB)\n",
            r.rss_current, r.rss_min, r.rss_max, r.rss_avg
        ));
        out.push_str(&format!("Resource samples: {}\n", r.resource_sample_count));
        out.push_str(&format!("Magic: {:X}\n", r.magic));
        out
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "stats".to_string());
    let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    fs::write(&tmp, data)?;
    // Atomic replace on POSIX.
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> StatsStore {
        StatsStore::load(dir, &["Alpha".to_string(), "Beta".to_string()])
    }

    #[test]
    fn raw_encoding_round_trips() {
        let mut r = StatRecord::new();
        r.started_at = 1_700_000_000;
        r.start_count = 7;
        r.crash_count = 2;
        r.heartbeat_count = 55;
        r.avg_heartbeat_time = 3;
        r.min_heartbeat_time = 1;
        r.max_heartbeat_time = 9;
        r.cpu_avg = 12.5;
        r.rss_avg = 2048;
        r.resource_sample_count = 4;
        let bytes = r.encode();
        assert_eq!(bytes.len(), RAW_LEN);
        assert_eq!(StatRecord::decode(&bytes), Some(r));
    }

    #[test]
    fn decode_rejects_truncation_and_bad_magic() {
        let r = StatRecord::new();
        let bytes = r.encode();
        assert_eq!(StatRecord::decode(&bytes[..RAW_LEN - 1]), None);

        let mut bad = bytes.clone();
        bad[RAW_LEN - 1] ^= 0xFF;
        assert_eq!(StatRecord::decode(&bad), None);
    }

    #[test]
    fn load_creates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(dir.path().join("stats_Alpha.raw").exists());
        assert!(dir.path().join("stats_Beta.log").exists());
        assert_eq!(s.record(0).magic, STATS_MAGIC);
        assert_eq!(s.record(0).start_count, 0);
    }

    #[test]
    fn counters_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = store(dir.path());
            s.on_started(0);
            s.on_crashed(0);
            s.on_respawned(0);
            s.record_heartbeat(0, 2);
            s.persist_all();
        }
        let s = store(dir.path());
        assert_eq!(s.record(0).start_count, 2);
        assert_eq!(s.record(0).crash_count, 1);
        assert_eq!(s.record(0).heartbeat_count, 1);
        // The untouched record is untouched.
        assert_eq!(s.record(1).start_count, 0);
    }

    #[test]
    fn corrupt_record_is_zeroed_without_touching_others() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = store(dir.path());
            s.on_started(0);
            s.on_started(1);
            s.persist_all();
        }
        fs::write(dir.path().join("stats_Alpha.raw"), b"garbage").unwrap();
        let s = store(dir.path());
        assert_eq!(s.record(0).start_count, 0);
        assert_eq!(s.record(0).magic, STATS_MAGIC);
        assert_eq!(s.record(1).start_count, 1);
    }

    #[test]
    fn start_snapshots_heartbeat_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.on_started(0);
        s.record_heartbeat(0, 1);
        s.record_heartbeat(0, 1);
        s.on_started(0);
        assert_eq!(s.record(0).heartbeat_count, 0);
        assert_eq!(s.record(0).heartbeat_count_old, 2);
    }

    #[test]
    fn respawn_after_reset_keeps_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.on_started(0);
        for _ in 0..5 {
            s.record_heartbeat(0, 2);
        }
        s.on_heartbeat_reset(0);
        assert_eq!(s.record(0).heartbeat_count_old, 5);
        s.on_respawned(0);
        // The respawn does not snapshot again.
        assert_eq!(s.record(0).heartbeat_count_old, 5);
        assert_eq!(s.record(0).start_count, 2);
        assert_eq!(s.record(0).heartbeat_reset_count, 1);
    }

    #[test]
    fn crash_folds_the_snapshot_into_the_running_average() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.on_started(0);
        for _ in 0..10 {
            s.record_heartbeat(0, 1);
        }
        s.on_crashed(0);
        assert_eq!(s.record(0).avg_heartbeat_count_old, 10);
        s.on_respawned(0);
        for _ in 0..4 {
            s.record_heartbeat(0, 1);
        }
        s.on_crashed(0);
        // (10*1 + 4) / 2
        assert_eq!(s.record(0).avg_heartbeat_count_old, 7);
    }

    #[test]
    fn heartbeat_samples_keep_min_max_and_mean() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.on_started(0);
        for secs in [3, 1, 5] {
            s.record_heartbeat(0, secs);
        }
        let r = s.record(0);
        assert_eq!(r.min_heartbeat_time, 1);
        assert_eq!(r.max_heartbeat_time, 5);
        assert_eq!(r.avg_heartbeat_time, 3);
        assert!(r.min_heartbeat_time <= r.avg_heartbeat_time);
        assert!(r.avg_heartbeat_time <= r.max_heartbeat_time);
    }

    #[test]
    fn first_heartbeat_uses_the_lifecycle_divisor() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.on_started(0);
        s.record_first_heartbeat(0, 8);
        assert_eq!(s.record(0).avg_first_heartbeat_time, 8);
        assert_eq!(s.record(0).min_first_heartbeat_time, 8);
        s.on_heartbeat_reset(0);
        s.on_respawned(0);
        // Divisor is start(2) + crash(0) + reset(1) = 3.
        s.record_first_heartbeat(0, 2);
        assert_eq!(s.record(0).avg_first_heartbeat_time, (8 * 2 + 2) / 3);
        assert_eq!(s.record(0).max_first_heartbeat_time, 8);
    }

    #[test]
    fn resource_samples_use_ema_for_cpu_and_cumulative_mean_for_rss() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.record_resource_sample(0, ResourceSample { cpu_percent: 10.0, rss_kb: 100 });
        s.record_resource_sample(0, ResourceSample { cpu_percent: 20.0, rss_kb: 300 });
        let r = s.record(0);
        assert_eq!(r.resource_sample_count, 2);
        assert!((r.cpu_avg - 11.0).abs() < 1e-9); // 10*0.9 + 20*0.1
        assert_eq!(r.cpu_min, 10.0);
        assert_eq!(r.cpu_max, 20.0);
        assert_eq!(r.rss_avg, 200);
        assert_eq!(r.rss_min, 100);
        assert_eq!(r.rss_max, 300);
        assert_eq!(r.rss_current, 300);
    }

    #[test]
    fn text_rendering_lists_the_core_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.on_started(0);
        let text = s.render_text(0);
        assert!(text.contains("Statistics for App 0 Alpha:"));
        assert!(text.contains("Start count: 1"));
        assert!(text.contains("Crashed at: Never"));
        assert!(text.contains(&format!("Magic: {:X}", STATS_MAGIC)));
    }
}
