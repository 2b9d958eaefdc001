use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::time::Duration;
use tokio::process::Command;

use crate::tools::{required_str, Tool, ToolArgs};

/// Runs a shell command with a time limit.
pub struct SystemCommandTool {
    timeout: Duration,
}

impl SystemCommandTool {
    pub fn new(timeout_secs: u64) -> Self {
        SystemCommandTool {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// stdout, or stderr when stdout is empty.
    pub async fn run(&self, command: &str) -> Result<String> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| anyhow!("command timed out after {} seconds", self.timeout.as_secs()))?
            .with_context(|| format!("failed to run command: {}", command))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !stdout.is_empty() {
            return Ok(stdout);
        }
        Ok(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

#[async_trait]
impl Tool for SystemCommandTool {
    fn name(&self) -> &str {
        "system_command"
    }

    fn description(&self) -> &str {
        "Execute system commands"
    }

    fn inputs(&self) -> Value {
        json!({
            "command": {
                "type": "string",
                "description": "Command to execute"
            }
        })
    }

    async fn forward(&self, args: &ToolArgs) -> Result<String> {
        let command = required_str(args, "command")?;
        tracing::debug!(command, "running system command");
        self.run(command).await
    }
}

#[derive(Debug, Serialize)]
struct CpuInfo {
    cpu_percent: f64,
    cpu_count: usize,
    cpu_freq: Option<CpuFreq>,
}

#[derive(Debug, Serialize)]
struct CpuFreq {
    current: f64,
}

#[derive(Debug, PartialEq, Serialize)]
struct MemoryInfo {
    total: u64,
    available: u64,
    percent: f64,
}

#[derive(Debug, Serialize)]
struct DiskInfo {
    total: u64,
    used: u64,
    free: u64,
    percent: f64,
}

/// Aggregate jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuTimes {
    fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() < 4 {
            return None;
        }
        // idle + iowait
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        Some(CpuTimes {
            idle,
            total: values.iter().sum(),
        })
    }

    fn busy_percent_since(&self, earlier: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_sub(earlier.idle);
        round1(100.0 * (total - idle.min(total)) as f64 / total as f64)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn parse_cpu_mhz(cpuinfo: &str) -> Option<f64> {
    cpuinfo
        .lines()
        .find(|l| l.starts_with("cpu MHz"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse().ok())
}

fn parse_meminfo(meminfo: &str) -> Option<MemoryInfo> {
    let field = |name: &str| -> Option<u64> {
        let line = meminfo.lines().find(|l| l.starts_with(name))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    let percent = if total == 0 {
        0.0
    } else {
        round1(100.0 * total.saturating_sub(available) as f64 / total as f64)
    };
    Some(MemoryInfo {
        total,
        available,
        percent,
    })
}

/// CPU, memory and disk usage for the host.
pub struct SystemInfoTool {
    sample_interval: Duration,
}

impl Default for SystemInfoTool {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemInfoTool {
    pub fn new() -> Self {
        SystemInfoTool {
            sample_interval: Duration::from_secs(1),
        }
    }

    /// Window over which CPU usage is measured.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    async fn cpu(&self) -> Result<CpuInfo> {
        let read_times = || -> Result<CpuTimes> {
            let stat = fs::read_to_string("/proc/stat").context("failed to read /proc/stat")?;
            CpuTimes::parse(&stat).context("unexpected /proc/stat format")
        };

        let before = read_times()?;
        tokio::time::sleep(self.sample_interval).await;
        let after = read_times()?;

        let cpu_freq = fs::read_to_string("/proc/cpuinfo")
            .ok()
            .and_then(|info| parse_cpu_mhz(&info))
            .map(|current| CpuFreq { current });

        Ok(CpuInfo {
            cpu_percent: after.busy_percent_since(&before),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            cpu_freq,
        })
    }

    fn memory(&self) -> Result<MemoryInfo> {
        let meminfo =
            fs::read_to_string("/proc/meminfo").context("failed to read /proc/meminfo")?;
        parse_meminfo(&meminfo).context("unexpected /proc/meminfo format")
    }

    fn disk(&self) -> Result<DiskInfo> {
        let stat = nix::sys::statvfs::statvfs("/").context("failed to stat filesystem")?;
        let fragment = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * fragment;
        let free = stat.blocks_available() as u64 * fragment;
        let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * fragment;
        let percent = if used + free == 0 {
            0.0
        } else {
            round1(100.0 * used as f64 / (used + free) as f64)
        };
        Ok(DiskInfo {
            total,
            used,
            free,
            percent,
        })
    }
}

#[async_trait]
impl Tool for SystemInfoTool {
    fn name(&self) -> &str {
        "system_info"
    }

    fn description(&self) -> &str {
        "Get system information"
    }

    fn inputs(&self) -> Value {
        json!({
            "metric": {
                "type": "string",
                "description": "Metric to retrieve (cpu/memory/disk)",
                "enum": ["cpu", "memory", "disk"]
            }
        })
    }

    async fn forward(&self, args: &ToolArgs) -> Result<String> {
        let metric = required_str(args, "metric")?;
        let value = match metric {
            "cpu" => serde_json::to_value(self.cpu().await?)?,
            "memory" => serde_json::to_value(self.memory()?)?,
            "disk" => serde_json::to_value(self.disk()?)?,
            other => return Err(anyhow!("unsupported metric: {}", other)),
        };
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> ToolArgs {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn command_returns_stdout() {
        let tool = SystemCommandTool::new(30);
        let out = tool
            .forward(&args(json!({"command": "echo hello"})))
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn command_falls_back_to_stderr() {
        let tool = SystemCommandTool::new(30);
        let out = tool.run("echo oops 1>&2").await.unwrap();
        assert_eq!(out, "oops\n");
    }

    #[tokio::test]
    async fn command_times_out() {
        let tool = SystemCommandTool::new(1);
        let err = tool.run("sleep 5").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn cpu_times_from_proc_stat() {
        let first = CpuTimes::parse("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        let second = CpuTimes::parse("cpu  150 0 150 800 100 0 0 0 0 0\n").unwrap();
        assert_eq!(first, CpuTimes { idle: 800, total: 1000 });
        assert_eq!(second.busy_percent_since(&first), 50.0);
        assert_eq!(first.busy_percent_since(&first), 0.0);
    }

    #[test]
    fn meminfo_fields_in_bytes() {
        let info = parse_meminfo(
            "MemTotal:        1000 kB\nMemFree:          100 kB\nMemAvailable:     250 kB\n",
        )
        .unwrap();
        assert_eq!(
            info,
            MemoryInfo {
                total: 1_024_000,
                available: 256_000,
                percent: 75.0
            }
        );
    }

    #[test]
    fn cpu_mhz_from_cpuinfo() {
        let info = "processor\t: 0\ncpu MHz\t\t: 2400.123\n";
        assert_eq!(parse_cpu_mhz(info), Some(2400.123));
        assert_eq!(parse_cpu_mhz("processor\t: 0\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reports_each_metric_as_json() {
        let tool = SystemInfoTool::new().with_sample_interval(Duration::from_millis(20));
        for (metric, key) in [("cpu", "cpu_count"), ("memory", "total"), ("disk", "free")] {
            let out = tool.forward(&args(json!({ "metric": metric }))).await.unwrap();
            let parsed: Value = serde_json::from_str(&out).unwrap();
            assert!(parsed.get(key).is_some(), "{} missing {}", metric, key);
        }
        assert!(tool
            .forward(&args(json!({"metric": "gpu"})))
            .await
            .is_err());
    }
}
