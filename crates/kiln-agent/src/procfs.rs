//! Readers for `/proc` and filesystem usage. Everything returns `None` on
//! hosts without procfs so callers can degrade to zeros.

use std::{path::Path, sync::OnceLock};

#[cfg(target_os = "linux")]
pub(crate) fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn ticks_per_sec() -> u64 {
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

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

/// utime + stime from the contents of `/proc/<pid>/stat`.
pub(crate) fn parse_pid_cpu_ticks(stat: &str) -> Option<u64> {
    // comm may contain spaces and parens; fields restart after the last ')'.
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

/// Resident pages from the contents of `/proc/<pid>/statm`.
pub(crate) fn parse_statm_resident_pages(statm: &str) -> Option<u64> {
    let mut it = statm.split_whitespace();
    let _size_pages = it.next()?;
    it.next()?.parse().ok()
}

#[cfg(target_os = "linux")]
pub(crate) async fn read_pid_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    parse_pid_cpu_ticks(&s)
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn read_pid_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
pub(crate) async fn read_pid_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm")).await.ok()?;
    Some(parse_statm_resident_pages(&s)?.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn read_pid_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct CpuTimes {
    pub(crate) busy: u64,
    pub(crate) total: u64,
}

pub(crate) fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3].saturating_add(fields.get(4).copied().unwrap_or(0));
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

impl CpuTimes {
    pub(crate) fn percent_since(&self, prev: CpuTimes) -> f64 {
        let total = self.total.saturating_sub(prev.total);
        if total == 0 {
            return 0.0;
        }
        let busy = self.busy.saturating_sub(prev.busy);
        (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// `(used, total)` bytes from `/proc/meminfo`; used excludes reclaimable memory.
pub(crate) fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut it = line.split_whitespace();
        let key = it.next();
        let kib = it.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            Some("MemTotal:") => total = kib,
            Some("MemAvailable:") => available = kib,
            _ => {}
        }
    }
    let total = total?.saturating_mul(1024);
    let available = available.unwrap_or(0).saturating_mul(1024);
    Some((total.saturating_sub(available), total))
}

pub(crate) fn parse_uptime_secs(uptime: &str) -> Option<u64> {
    let first = uptime.split_whitespace().next()?;
    let secs: f64 = first.parse().ok()?;
    Some(secs.max(0.0) as u64)
}

pub(crate) fn parse_loadavg(loadavg: &str) -> Option<[f64; 3]> {
    let mut it = loadavg.split_whitespace().map(|v| v.parse::<f64>().ok());
    Some([it.next()??, it.next()??, it.next()??])
}

async fn read_proc_file(name: &str) -> Option<String> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    tokio::fs::read_to_string(format!("/proc/{name}")).await.ok()
}

pub(crate) async fn read_cpu_times() -> Option<CpuTimes> {
    parse_cpu_times(&read_proc_file("stat").await?)
}

pub(crate) async fn read_memory() -> Option<(u64, u64)> {
    parse_meminfo(&read_proc_file("meminfo").await?)
}

pub(crate) async fn read_uptime_secs() -> Option<u64> {
    parse_uptime_secs(&read_proc_file("uptime").await?)
}

pub(crate) async fn read_loadavg() -> Option<[f64; 3]> {
    parse_loadavg(&read_proc_file("loadavg").await?)
}

/// `(used, total)` bytes of the filesystem holding `p`.
#[cfg(unix)]
pub(crate) fn disk_usage(p: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).ok()?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return None;
    }
    let frsize = s.f_frsize as u64;
    let total = (s.f_blocks as u64).saturating_mul(frsize);
    let free = (s.f_bfree as u64).saturating_mul(frsize);
    Some((total.saturating_sub(free), total))
}

#[cfg(not(unix))]
pub(crate) fn disk_usage(_p: &Path) -> Option<(u64, u64)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_stat_handles_spaces_in_comm() {
        let stat = "4242 (java (server) x) S 1 4242 4242 0 -1 4194560 100 0 0 0 150 25 0 0 20 0 30 0 1000 0 0";
        assert_eq!(parse_pid_cpu_ticks(stat), Some(175));
        assert_eq!(parse_pid_cpu_ticks("garbage"), None);
    }

    #[test]
    fn statm_reads_resident_pages() {
        assert_eq!(parse_statm_resident_pages("52000 1200 300 1 0 4000 0\n"), Some(1200));
        assert_eq!(parse_statm_resident_pages(""), None);
    }

    #[test]
    fn cpu_times_and_percent() {
        let a = parse_cpu_times("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        assert_eq!(a, CpuTimes { busy: 200, total: 1000 });

        let b = parse_cpu_times("cpu  200 0 200 900 100 0 0 0 0 0\n").unwrap();
        assert_eq!(b.percent_since(a), 50.0);
        assert_eq!(a.percent_since(a), 0.0);
        assert_eq!(parse_cpu_times("intr 1 2 3"), None);
    }

    #[test]
    fn meminfo_used_excludes_available() {
        let raw = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    6000000 kB\n";
        assert_eq!(
            parse_meminfo(raw),
            Some((10_000_000 * 1024, 16_000_000 * 1024))
        );
        assert_eq!(parse_meminfo("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn uptime_and_loadavg() {
        assert_eq!(parse_uptime_secs("12345.67 54321.00\n"), Some(12345));
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/467 12345\n"),
            Some([0.52, 0.58, 0.59])
        );
        assert_eq!(parse_loadavg("0.52"), None);
    }

    #[cfg(unix)]
    #[test]
    fn disk_usage_of_temp_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let (used, total) = disk_usage(tmp.path()).unwrap();
        assert!(total > 0);
        assert!(used <= total);
        assert_eq!(disk_usage(Path::new("/definitely/not/here")), None);
    }
}
