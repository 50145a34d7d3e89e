//! Host resource sampling for per-client system status messages.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuSample {
    pub idle: u64,
    pub total: u64,
}

/// One cumulative CPU tick sample from procfs. Usage is derived from the
/// delta of two samples taken some interval apart.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn cpu_sample() -> Option<CpuSample> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(&contents)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn cpu_sample() -> Option<CpuSample> {
    None
}

#[allow(dead_code)]
fn parse_cpu_line(contents: &str) -> Option<CpuSample> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let mut idle = 0u64;
    let mut total = 0u64;
    for (i, field) in line.split_whitespace().skip(1).enumerate() {
        let value: u64 = field.parse().ok()?;
        total += value;
        // idle is the 4th value on the cpu line
        if i == 3 {
            idle = value;
        }
    }
    Some(CpuSample { idle, total })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MemSample {
    /// Resident set size in KiB.
    pub resident_kib: u64,
    /// Virtual size in KiB.
    pub virtual_kib: u64,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn mem_sample() -> Option<MemSample> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_mem_status(&contents)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn mem_sample() -> Option<MemSample> {
    None
}

#[allow(dead_code)]
fn parse_mem_status(contents: &str) -> Option<MemSample> {
    let mut sample = MemSample::default();
    for line in contents.lines() {
        let mut kib_of = |prefix: &str| {
            line.strip_prefix(prefix)
                .and_then(|rest| rest.trim().split_whitespace().next())
                .and_then(|v| v.parse::<u64>().ok())
        };
        if let Some(kib) = kib_of("VmRSS:") {
            sample.resident_kib = kib;
        } else if let Some(kib) = kib_of("VmSize:") {
            sample.virtual_kib = kib;
        }
    }
    Some(sample)
}

/// CPU usage fraction between two cumulative samples, if well-defined.
pub fn cpu_usage(first: CpuSample, second: CpuSample) -> Option<f64> {
    let idle = second.idle.saturating_sub(first.idle) as f64;
    let total = second.total.saturating_sub(first.total) as f64;
    let usage = (total - idle) / total;
    usage.is_finite().then_some(usage)
}
