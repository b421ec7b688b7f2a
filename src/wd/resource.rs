use std::fs;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub rss_kb: u64,
}

#[derive(Debug, Clone, Copy)]
struct CpuSnapshot {
    pid: i32,
    ticks: u64,
    at_mono: i64,
}

/// Per-app CPU accounting baselines. CPU% is the utime+stime delta over the
/// gap between two samples of the same pid; the first sample of a pid (or of
/// a replacement pid after a restart) reads as 0%.
pub struct ResourceSampler {
    hz: f64,
    prev: Vec<Option<CpuSnapshot>>,
}

impl ResourceSampler {
    pub fn new(app_count: usize) -> Self {
        Self {
            hz: clock_ticks_per_second().unwrap_or(100.0),
            prev: vec![None; app_count],
        }
    }

    /// None when /proc no longer has the pid (raced with an exit).
    pub fn sample(&mut self, i: usize, pid: i32, now_mono: i64) -> Option<ResourceSample> {
        let ticks = read_cpu_ticks(pid)?;
        let rss_kb = read_rss_kb(pid)?;

        let cpu_percent = match self.prev[i] {
            Some(p) if p.pid == pid && now_mono > p.at_mono => {
                let dt = (now_mono - p.at_mono) as f64;
                let dticks = ticks.saturating_sub(p.ticks) as f64;
                (dticks / self.hz) / dt * 100.0
            }
            _ => 0.0,
        };
        self.prev[i] = Some(CpuSnapshot { pid, ticks, at_mono: now_mono });

        Some(ResourceSample { cpu_percent, rss_kb })
    }
}

fn clock_ticks_per_second() -> Option<f64> {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 { None } else { Some(v as f64) }
}

fn read_cpu_ticks(pid: i32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_ticks(&stat)
}

fn read_rss_kb(pid: i32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vmrss_kb(&status)
}

/// utime+stime from /proc/<pid>/stat. The comm field may contain spaces and
/// parens, so fields are counted from the last ')'.
fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    let fields: Vec<&str> = after.split_whitespace().collect();
    // fields[0] is original field 3 (state); utime/stime are fields 14/15.
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some(utime + stime)
}

fn parse_vmrss_kb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (some proc) S 1 1234 1234 0 -1 4194560 500 0 0 0 \
                        350 150 0 0 20 0 1 0 9000 10000000 250 18446744073709551615 \
                        1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";

    #[test]
    fn stat_ticks_are_utime_plus_stime() {
        assert_eq!(parse_stat_ticks(STAT), Some(500));
    }

    #[test]
    fn stat_with_spaces_and_parens_in_comm() {
        let tricky = STAT.replace("(some proc)", "(a) b (c))");
        assert_eq!(parse_stat_ticks(&tricky), Some(500));
    }

    #[test]
    fn vmrss_is_taken_from_status() {
        let status = "Name:\tworker\nVmPeak:\t  2000 kB\nVmRSS:\t  1234 kB\nThreads:\t1\n";
        assert_eq!(parse_vmrss_kb(status), Some(1234));
        assert_eq!(parse_vmrss_kb("Name:\tworker\n"), None);
    }

    #[test]
    fn own_pid_samples_and_computes_a_delta() {
        let pid = std::process::id() as i32;
        let mut sampler = ResourceSampler::new(1);
        let first = sampler.sample(0, pid, 100).expect("own /proc entry");
        assert_eq!(first.cpu_percent, 0.0);
        assert!(first.rss_kb > 0);
        let second = sampler.sample(0, pid, 160).expect("own /proc entry");
        assert!(second.cpu_percent >= 0.0);
    }

    #[test]
    fn dead_pid_yields_no_sample() {
        let mut sampler = ResourceSampler::new(1);
        // Kernel threads aside, this pid cannot exist.
        assert_eq!(sampler.sample(0, i32::MAX - 1, 100), None);
    }

    #[test]
    fn pid_change_resets_the_cpu_baseline() {
        let pid = std::process::id() as i32;
        let mut sampler = ResourceSampler::new(1);
        sampler.sample(0, pid, 100).unwrap();
        // Same pid, but pretend the previous snapshot belonged to another one.
        sampler.prev[0] = Some(CpuSnapshot { pid: pid + 1, ticks: 0, at_mono: 100 });
        let s = sampler.sample(0, pid, 200).unwrap();
        assert_eq!(s.cpu_percent, 0.0);
    }
}
