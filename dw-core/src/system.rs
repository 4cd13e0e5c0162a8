//! System information gathering
//!
//! Whole-system memory counters for the generic memory source, plus the
//! privilege check that decides whether port I/O is attempted at all.
//! - Linux: /proc/meminfo
//! - BSD: sysctl

use std::fs;
use std::path::Path;
use std::process::Command;

use serde::Serialize;

use crate::constants::paths;

/// Kilobytes per megabyte for memory conversion
const KB_PER_MB: u64 = 1024;
/// Bytes per megabyte
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Snapshot of whole-system memory usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryStatus {
    pub total_mb: u64,
    pub available_mb: u64,
}

impl MemoryStatus {
    pub fn used_mb(&self) -> u64 {
        self.total_mb.saturating_sub(self.available_mb)
    }

    /// Used memory as a percentage of total
    pub fn load_percent(&self) -> f32 {
        if self.total_mb == 0 {
            return 0.0;
        }
        (self.used_mb() as f64 / self.total_mb as f64 * 100.0) as f32
    }
}

/// Whether the process runs with root privileges (needed for port I/O)
pub fn is_root() -> bool {
    // SAFETY: geteuid is always safe - it just returns the effective user ID of the process.
    unsafe { libc::geteuid() == 0 }
}

/// Current memory status; `None` when no source is readable
pub fn read_memory_status() -> Option<MemoryStatus> {
    read_memory_status_from(Path::new(paths::PROC_MEMINFO)).or_else(read_memory_status_sysctl)
}

/// Read a meminfo-formatted file
pub fn read_memory_status_from(path: &Path) -> Option<MemoryStatus> {
    let meminfo = fs::read_to_string(path).ok()?;
    parse_meminfo(&meminfo)
}

/// Parse /proc/meminfo contents
pub fn parse_meminfo(meminfo: &str) -> Option<MemoryStatus> {
    let mut total_kb = None;
    let mut available_kb = None;
    let mut free_kb = 0;
    for line in meminfo.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = Some(parse_meminfo_value(line));
        } else if line.starts_with("MemAvailable:") {
            available_kb = Some(parse_meminfo_value(line));
        } else if line.starts_with("MemFree:") {
            free_kb = parse_meminfo_value(line);
        }
    }
    let total_kb = total_kb.filter(|kb| *kb > 0)?;
    // Kernels before 3.14 have no MemAvailable
    let available_kb = available_kb.unwrap_or(free_kb);
    Some(MemoryStatus {
        total_mb: total_kb / KB_PER_MB,
        available_mb: available_kb / KB_PER_MB,
    })
}

/// Parse a meminfo line like "MemTotal:       16384000 kB"
fn parse_meminfo_value(line: &str) -> u64 {
    line.split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
}

/// BSD fallback
fn read_memory_status_sysctl() -> Option<MemoryStatus> {
    let total = sysctl_u64("hw.physmem").or_else(|| sysctl_u64("hw.memsize"))?;
    let available = match (sysctl_u64("vm.stats.vm.v_free_count"), sysctl_u64("hw.pagesize")) {
        (Some(free_pages), Some(page_size)) => free_pages * page_size,
        _ => total / 2,
    };
    Some(MemoryStatus {
        total_mb: total / BYTES_PER_MB,
        available_mb: available / BYTES_PER_MB,
    })
}

/// Get a sysctl value as u64
fn sysctl_u64(key: &str) -> Option<u64> {
    Command::new("sysctl").args(["-n", key]).output().ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<u64>().ok())
}
