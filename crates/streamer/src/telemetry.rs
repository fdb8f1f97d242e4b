//! Telemetry sinks and the system stats sampler.
//!
//! Client-reported FPS/latency and WebRTC statistic blobs land in
//! [`Metrics`]; external collectors (GPU probes and the like) call the same
//! sink. The system sampler backs the periodic `system_stats` message and
//! the ping timer.

use std::sync::atomic::{AtomicU32, Ordering};

use glint_protocol::channel::StatsKind;
use tracing::debug;

/// In-process gauges for client-side telemetry.
#[derive(Default)]
pub struct Metrics {
    client_fps: AtomicU32,
    client_latency_ms: AtomicU32,
}

impl Metrics {
    pub fn set_fps(&self, fps: u32) {
        self.client_fps.store(fps, Ordering::Relaxed);
        debug!(fps, "Client FPS reported");
    }

    pub fn fps(&self) -> u32 {
        self.client_fps.load(Ordering::Relaxed)
    }

    pub fn set_latency(&self, latency_ms: u32) {
        self.client_latency_ms.store(latency_ms, Ordering::Relaxed);
        debug!(latency_ms, "Client latency reported");
    }

    pub fn latency_ms(&self) -> u32 {
        self.client_latency_ms.load(Ordering::Relaxed)
    }

    pub fn record_webrtc_stats(&self, kind: StatsKind, body: &str) {
        debug!(?kind, len = body.len(), "Client WebRTC statistics received");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub mem_total: u64,
    pub mem_used: u64,
}

/// CPU usage needs two `/proc/stat` observations; the sampler keeps the
/// previous one.
#[derive(Default)]
pub struct SystemSampler {
    prev_busy: u64,
    prev_total: u64,
}

/// Parse the aggregate `cpu` line of `/proc/stat` into (busy, total)
/// jiffy counters.
pub fn parse_proc_stat_cpu(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some((total - idle, total))
}

/// Parse MemTotal/MemAvailable out of `/proc/meminfo`, in bytes.
pub fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<u64>().ok()),
            Some("MemAvailable:") => {
                available = parts.next().and_then(|v| v.parse::<u64>().ok())
            }
            _ => {}
        }
    }
    let total = total? * 1024;
    let available = available? * 1024;
    Some((total, total.saturating_sub(available)))
}

impl SystemSampler {
    /// Sample CPU and memory. The first call reports 0% CPU (no baseline).
    pub fn sample(&mut self) -> SystemStats {
        let mut stats = SystemStats::default();

        if let Ok(content) = std::fs::read_to_string("/proc/stat") {
            if let Some((busy, total)) = parse_proc_stat_cpu(&content) {
                let busy_delta = busy.saturating_sub(self.prev_busy);
                let total_delta = total.saturating_sub(self.prev_total);
                if self.prev_total > 0 && total_delta > 0 {
                    stats.cpu_percent = busy_delta as f64 / total_delta as f64 * 100.0;
                }
                self.prev_busy = busy;
                self.prev_total = total;
            }
        }

        if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
            if let Some((total, used)) = parse_meminfo(&content) {
                stats.mem_total = total;
                stats.mem_used = used;
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_SAMPLE: &str = "\
cpu  100 0 50 800 50 0 0 0 0 0
cpu0 50 0 25 400 25 0 0 0 0 0
intr 12345
";

    #[test]
    fn proc_stat_busy_and_total() {
        let (busy, total) = parse_proc_stat_cpu(STAT_SAMPLE).unwrap();
        assert_eq!(total, 1000);
        // idle (800) + iowait (50) counted as not-busy
        assert_eq!(busy, 150);
    }

    #[test]
    fn proc_stat_rejects_garbage() {
        assert!(parse_proc_stat_cpu("nonsense\n").is_none());
        assert!(parse_proc_stat_cpu("cpu 1 2\n").is_none());
    }

    #[test]
    fn meminfo_reports_bytes_and_used() {
        let meminfo = "MemTotal:       16384 kB\nMemFree:        4096 kB\nMemAvailable:    8192 kB\n";
        let (total, used) = parse_meminfo(meminfo).unwrap();
        assert_eq!(total, 16384 * 1024);
        assert_eq!(used, (16384 - 8192) * 1024);
    }

    #[test]
    fn metrics_gauges_roundtrip() {
        let metrics = Metrics::default();
        metrics.set_fps(58);
        metrics.set_latency(23);
        assert_eq!(metrics.fps(), 58);
        assert_eq!(metrics.latency_ms(), 23);
    }
}
