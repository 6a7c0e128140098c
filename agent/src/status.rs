//! Host identity and status collection
//!
//! Builds the registration record and the periodic status report from
//! lightweight /proc reads. Platforms without /proc degrade to zeroed
//! metrics; the reporting contract allows it, and the server treats the
//! report as a liveness signal either way.

use shared::config::AgentConfig;
use shared::protocol::{CpuStatus, HostInfo, HostStatus, MemoryStatus};
use shared::utils::current_timestamp;

/// The identity this host registers under.
pub fn collect_host_info(config: &AgentConfig) -> HostInfo {
    HostInfo {
        id: config.host_id.clone(),
        hostname: read_hostname(),
        ip: detect_local_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
        os: std::env::consts::OS.to_string(),
        tags: config.tags.clone(),
        last_seen: current_timestamp(),
    }
}

/// A point-in-time status snapshot for the periodic report.
pub fn collect_host_status(config: &AgentConfig) -> HostStatus {
    let (load_1m, load_5m, load_15m) = read_load_avg().unwrap_or((0.0, 0.0, 0.0));
    let core_count = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    // The one minute load over the core count is a serviceable utilisation
    // proxy without a stateful /proc/stat delta.
    let cpu_usage = (load_1m / core_count as f64 * 100.0).clamp(0.0, 100.0);

    let (total_kb, available_kb) = read_meminfo().unwrap_or((0, 0));
    let used_kb = total_kb.saturating_sub(available_kb);
    let memory_percent = if total_kb > 0 {
        used_kb as f64 / total_kb as f64 * 100.0
    } else {
        0.0
    };

    HostStatus {
        host_id: config.host_id.clone(),
        timestamp: current_timestamp(),
        uptime_seconds: read_uptime_seconds().unwrap_or(0),
        ip: detect_local_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
        cpu: CpuStatus {
            usage_percent: cpu_usage,
            core_count,
            load_avg_1m: load_1m,
            load_avg_5m: load_5m,
            load_avg_15m: load_15m,
        },
        memory: MemoryStatus {
            used_bytes: used_kb * 1024,
            total_bytes: total_kb * 1024,
            usage_percent: memory_percent,
        },
        disks: Vec::new(),
        custom_tags: config.tags.clone(),
    }
}

fn read_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Local address the default route would use. No packet is sent; the
/// connect only asks the kernel to pick a source address.
fn detect_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

fn read_uptime_seconds() -> Option<u64> {
    parse_uptime(&std::fs::read_to_string("/proc/uptime").ok()?)
}

fn read_load_avg() -> Option<(f64, f64, f64)> {
    parse_load_avg(&std::fs::read_to_string("/proc/loadavg").ok()?)
}

fn read_meminfo() -> Option<(u64, u64)> {
    parse_meminfo(&std::fs::read_to_string("/proc/meminfo").ok()?)
}

fn parse_uptime(content: &str) -> Option<u64> {
    content
        .split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|seconds| seconds as u64)
}

fn parse_load_avg(content: &str) -> Option<(f64, f64, f64)> {
    let mut fields = content.split_whitespace();
    let one = fields.next()?.parse().ok()?;
    let five = fields.next()?.parse().ok()?;
    let fifteen = fields.next()?.parse().ok()?;
    Some((one, five, fifteen))
}

/// Returns (MemTotal, MemAvailable) in kilobytes.
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let field = |key: &str| -> Option<u64> {
        content
            .lines()
            .find(|line| line.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    Some((field("MemTotal:")?, field("MemAvailable:").unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> AgentConfig {
        AgentConfig::from_toml(
            r#"
host_id = "web-01"
server_url = "http://127.0.0.1:8081"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("12345.67 54321.00\n"), Some(12345));
        assert_eq!(parse_uptime("garbage"), None);
    }

    #[test]
    fn test_parse_load_avg() {
        let parsed = parse_load_avg("0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert!((parsed.0 - 0.52).abs() < f64::EPSILON);
        assert!((parsed.2 - 0.59).abs() < f64::EPSILON);
        assert_eq!(parse_load_avg(""), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16000000 kB\nMemFree:         2000000 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_meminfo(content), Some((16_000_000, 8_000_000)));
        assert_eq!(parse_meminfo("nothing useful"), None);
    }

    #[test]
    fn test_host_info_carries_identity_and_tags() {
        let mut config = test_config();
        config.tags = HashMap::from([("rack".to_string(), "r7".to_string())]);
        let info = collect_host_info(&config);
        assert_eq!(info.id, "web-01");
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(info.tags.get("rack").map(String::as_str), Some("r7"));
        assert!(info.last_seen > 0);
    }

    #[test]
    fn test_host_status_is_well_formed() {
        let status = collect_host_status(&test_config());
        assert_eq!(status.host_id, "web-01");
        assert!(status.cpu.core_count >= 1);
        assert!((0.0..=100.0).contains(&status.cpu.usage_percent));
        assert!((0.0..=100.0).contains(&status.memory.usage_percent));
    }
}
