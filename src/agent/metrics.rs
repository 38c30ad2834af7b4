//! Host facts reported at registration and on every heartbeat.
//!
//! CPU usage is the busy share of all cores between two consecutive samples
//! of `/proc/stat`; memory comes from `/proc/meminfo`. On hosts without
//! procfs CPU usage reads as zero and memory falls back to the configured
//! figure, if any.

const MIB_IN_KIB: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HostSnapshot {
    pub cpu_usage_percent: f64,
    pub ram_free_mb: u64,
    pub ram_total_mb: u64,
    /// False when the memory figures are the configured fallback or zero.
    pub memory_measured: bool,
}

/// Keeps the previous CPU sample so usage can be computed as a delta.
#[derive(Debug, Default)]
pub struct HostMetrics {
    previous: Option<CpuTimes>,
    configured_ram_mb: Option<u64>,
}

impl HostMetrics {
    /// `configured_ram_mb` stands in for total and free memory when the
    /// host cannot report them.
    pub fn new(configured_ram_mb: Option<u64>) -> Self {
        Self {
            previous: read_cpu_times(),
            configured_ram_mb,
        }
    }

    pub fn sample(&mut self) -> HostSnapshot {
        let current = read_cpu_times();
        let cpu_usage_percent = match (self.previous, current) {
            (Some(prev), Some(cur)) => usage_between(prev, cur),
            _ => 0.0,
        };
        if current.is_some() {
            self.previous = current;
        }
        let measured = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_meminfo(&text));
        let (ram_total_mb, ram_free_mb) =
            memory_or_configured(measured, self.configured_ram_mb);
        HostSnapshot {
            cpu_usage_percent,
            ram_free_mb,
            ram_total_mb,
            memory_measured: measured.is_some(),
        }
    }
}

pub fn cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn os() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Without a live reading the configured size counts as entirely free;
/// reservations still bound what gets placed.
fn memory_or_configured(measured: Option<(u64, u64)>, configured_mb: Option<u64>) -> (u64, u64) {
    match (measured, configured_mb) {
        (Some(memory), _) => memory,
        (None, Some(mb)) => (mb, mb),
        (None, None) => (0, 0),
    }
}

fn read_cpu_times() -> Option<CpuTimes> {
    std::fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|text| parse_proc_stat(&text))
}

/// Aggregate `cpu` line: user nice system idle iowait irq softirq steal ...
fn parse_proc_stat(text: &str) -> Option<CpuTimes> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // guest time is already included in user/nice
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn usage_between(prev: CpuTimes, cur: CpuTimes) -> f64 {
    let total = cur.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = cur.busy.saturating_sub(prev.busy);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Returns `(total_mb, available_mb)`.
fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        text.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((total / MIB_IN_KIB, available / MIB_IN_KIB))
}
