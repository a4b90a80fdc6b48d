use tokio::time::Instant;

#[cfg(target_os = "linux")]
use std::sync::OnceLock;

/// One OS reading for a pid: cumulative CPU ticks (Linux) or an instantaneous percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RawUsage {
    pub(crate) cpu_ticks: Option<u64>,
    pub(crate) cpu_percent: Option<f64>,
    pub(crate) rss_bytes: u64,
}

/// Turns successive [`RawUsage`] readings into a CPU percentage.
#[derive(Debug, Default)]
pub(crate) struct CpuTracker {
    last: Option<(u64, Instant)>,
}

impl CpuTracker {
    pub(crate) fn percent(&mut self, raw: &RawUsage, now: Instant) -> f64 {
        if let Some(p) = raw.cpu_percent {
            return p.max(0.0);
        }
        let Some(ticks) = raw.cpu_ticks else {
            return 0.0;
        };
        let out = self
            .last
            .map(|(prev_ticks, prev_at)| cpu_percent(prev_ticks, prev_at, ticks, now))
            .unwrap_or(0.0);
        self.last = Some((ticks, now));
        out
    }
}

fn cpu_percent(prev_ticks: u64, prev_at: Instant, ticks: u64, now: Instant) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    if cpu.is_finite() { cpu.max(0.0) } else { 0.0 }
}

pub(crate) fn bytes_to_mb(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

/// utime + stime from `/proc/<pid>/stat`; the comm field may contain spaces, so parse after `)`.
#[cfg(any(target_os = "linux", test))]
pub(crate) fn parse_proc_stat_ticks(s: &str) -> Option<u64> {
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(target_os = "linux")]
pub(crate) async fn read_usage(pid: u32) -> Option<RawUsage> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    let ticks = parse_proc_stat_ticks(&stat)?;

    let statm = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .unwrap_or_default();
    let resident_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    Some(RawUsage {
        cpu_ticks: Some(ticks),
        cpu_percent: None,
        rss_bytes: resident_pages.saturating_mul(page_size()),
    })
}

/// `ps -o %cpu= -o rss= -p <pid>` prints e.g. `  12.5 204800` (rss in KiB).
#[cfg(any(all(unix, not(target_os = "linux")), test))]
pub(crate) fn parse_ps_line(s: &str) -> Option<(f64, u64)> {
    let mut it = s.split_whitespace();
    let cpu: f64 = it.next()?.replace(',', ".").parse().ok()?;
    let rss_kib: u64 = it.next()?.parse().ok()?;
    Some((cpu, rss_kib.saturating_mul(1024)))
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) async fn read_usage(pid: u32) -> Option<RawUsage> {
    let out = tokio::process::Command::new("ps")
        .args(["-o", "%cpu=", "-o", "rss=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let (cpu, rss_bytes) = parse_ps_line(&String::from_utf8_lossy(&out.stdout))?;
    Some(RawUsage {
        cpu_ticks: None,
        cpu_percent: Some(cpu),
        rss_bytes,
    })
}

/// Memory column of a `tasklist /FO CSV /NH` row, e.g. `"1,024,000 K"`.
#[cfg(any(windows, test))]
pub(crate) fn parse_tasklist_mem(stdout: &str, pid: u32) -> Option<u64> {
    let pid = pid.to_string();
    stdout.lines().find_map(|line| {
        let fields: Vec<&str> = line.trim().trim_matches('"').split("\",\"").collect();
        if fields.get(1) != Some(&pid.as_str()) {
            return None;
        }
        let digits: String = fields.last()?.chars().filter(|c| c.is_ascii_digit()).collect();
        digits.parse::<u64>().ok().map(|kib| kib.saturating_mul(1024))
    })
}

#[cfg(windows)]
pub(crate) async fn read_usage(pid: u32) -> Option<RawUsage> {
    let out = tokio::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let rss_bytes = parse_tasklist_mem(&String::from_utf8_lossy(&out.stdout), pid)?;
    // tasklist has no CPU column.
    Some(RawUsage {
        cpu_ticks: None,
        cpu_percent: Some(0.0),
        rss_bytes,
    })
}
