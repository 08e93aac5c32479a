//! Edge-side system telemetry reporter
//!
//! Samples CPU, temperature, memory, uptime and load from `/proc` and sends
//! them as a `data` packet to the operator station that last queried this
//! node. Works on Linux systems; missing sources are left out of the packet.

use anyhow::{Context, Result};
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{format_packet, TelemetryValue};

/// One sample of host metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSnapshot {
    /// CPU usage percentage (0-100), None on the first sample
    pub cpu_usage: Option<f32>,
    /// CPU temperature in Celsius
    pub cpu_temp: Option<f32>,
    /// Memory usage percentage (0-100)
    pub memory_usage: Option<f32>,
    pub uptime_secs: Option<u64>,
    /// 1-minute load average
    pub load_1m: Option<f32>,
}

impl SystemSnapshot {
    /// Render as a telemetry packet
    pub fn to_packet(&self) -> String {
        let mut fields: Vec<(&str, TelemetryValue)> = Vec::new();
        if let Some(v) = self.cpu_usage {
            fields.push(("cpu_usage", TelemetryValue::Float(round1(v))));
        }
        if let Some(v) = self.cpu_temp {
            fields.push(("cpu_temp", TelemetryValue::Float(round1(v))));
        }
        if let Some(v) = self.memory_usage {
            fields.push(("memory_usage", TelemetryValue::Float(round1(v))));
        }
        if let Some(v) = self.uptime_secs {
            fields.push(("uptime_secs", TelemetryValue::Int(v as i64)));
        }
        if let Some(v) = self.load_1m {
            fields.push(("load_1m", TelemetryValue::Float((v as f64 * 100.0).round() / 100.0)));
        }
        format_packet(fields)
    }
}

fn round1(v: f32) -> f64 {
    (v as f64 * 10.0).round() / 10.0
}

/// Send a system snapshot every `interval` to the current operator address.
///
/// Nothing is sent until the discovery responder has learned an operator
/// address. Send failures are logged and the loop continues.
pub async fn run_reporter(
    socket: Arc<UdpSocket>,
    mut operator: watch::Receiver<Option<SocketAddr>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut prev_cpu: Option<CpuStats> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let prev = prev_cpu.take();
        let (snapshot, prev) = match tokio::task::spawn_blocking(move || {
            let mut prev = prev;
            let snapshot = collect(&mut prev);
            (snapshot, prev)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("spawn_blocking for telemetry failed: {}", e);
                continue;
            }
        };
        prev_cpu = prev;

        let target = *operator.borrow_and_update();
        let Some(target) = target else {
            continue;
        };

        let packet = snapshot.to_packet();
        match socket.send_to(packet.as_bytes(), target).await {
            Ok(_) => debug!(%target, "Sent telemetry"),
            Err(e) => warn!(%target, "Failed to send telemetry: {}", e),
        }
    }
}

/// Raw CPU stats from /proc/stat
#[derive(Debug, Clone)]
struct CpuStats {
    busy: u64,
    idle: u64,
}

fn collect(prev_cpu: &mut Option<CpuStats>) -> SystemSnapshot {
    let mut snapshot = SystemSnapshot::default();

    if let Ok(stats) = read_cpu_stats() {
        if let Some(prev) = prev_cpu.take() {
            let busy = stats.busy.saturating_sub(prev.busy);
            let idle = stats.idle.saturating_sub(prev.idle);
            if busy + idle > 0 {
                snapshot.cpu_usage = Some(busy as f32 / (busy + idle) as f32 * 100.0);
            }
        }
        *prev_cpu = Some(stats);
    }

    snapshot.cpu_temp = read_cpu_temp().ok();

    if let Ok((used, total)) = read_memory_info() {
        if total > 0 {
            snapshot.memory_usage = Some(used as f32 / total as f32 * 100.0);
        }
    }

    snapshot.uptime_secs = read_uptime().ok();
    snapshot.load_1m = read_load_1m().ok();
    snapshot
}

fn read_cpu_stats() -> Result<CpuStats> {
    let content = fs::read_to_string("/proc/stat").context("Failed to read /proc/stat")?;
    parse_cpu_line(&content)
}

fn parse_cpu_line(content: &str) -> Result<CpuStats> {
    let cpu_line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .context("No cpu line in /proc/stat")?;

    let parts: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .take(7)
        .filter_map(|s| s.parse().ok())
        .collect();

    if parts.len() < 7 {
        anyhow::bail!("Invalid /proc/stat format");
    }

    // user nice system idle iowait irq softirq
    let idle = parts[3] + parts[4];
    let busy = parts[0] + parts[1] + parts[2] + parts[5] + parts[6];
    Ok(CpuStats { busy, idle })
}

fn read_cpu_temp() -> Result<f32> {
    let paths = [
        "/sys/class/thermal/thermal_zone0/temp",
        "/sys/class/hwmon/hwmon0/temp1_input",
    ];

    for path in paths {
        if let Ok(content) = fs::read_to_string(path) {
            if let Ok(millidegrees) = content.trim().parse::<i64>() {
                return Ok(millidegrees as f32 / 1000.0);
            }
        }
    }

    anyhow::bail!("No temperature sensor found")
}

fn read_memory_info() -> Result<(u64, u64)> {
    let content = fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
    parse_meminfo(&content)
}

fn parse_meminfo(content: &str) -> Result<(u64, u64)> {
    let mut total: u64 = 0;
    let mut available: u64 = 0;

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            total = parse_meminfo_value(line)?;
        } else if line.starts_with("MemAvailable:") {
            available = parse_meminfo_value(line)?;
        }
    }

    Ok((total.saturating_sub(available), total))
}

fn parse_meminfo_value(line: &str) -> Result<u64> {
    line.split_whitespace()
        .nth(1)
        .context("Missing meminfo value")?
        .parse()
        .context("Invalid meminfo value")
}

fn read_uptime() -> Result<u64> {
    let content = fs::read_to_string("/proc/uptime").context("Failed to read /proc/uptime")?;
    let uptime: f64 = content
        .split_whitespace()
        .next()
        .context("Empty /proc/uptime")?
        .parse()
        .context("Invalid uptime value")?;
    Ok(uptime as u64)
}

fn read_load_1m() -> Result<f32> {
    let content = fs::read_to_string("/proc/loadavg").context("Failed to read /proc/loadavg")?;
    content
        .split_whitespace()
        .next()
        .context("Empty /proc/loadavg")?
        .parse()
        .context("Invalid loadavg format")
}
