//! Accelerator and host memory telemetry, and the CPU-offload policy.

use std::process::Command;

use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

pub const DEFAULT_CPU_OFFLOAD_THRESHOLD_GIB: f64 = 32.0;

const MIB_PER_GIB: f64 = 1024.0;
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Where a pipeline's weights live while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Whole pipeline resident on the accelerator.
    Accelerator,
    /// Submodules moved to the accelerator only while they execute.
    CpuOffload,
    /// No accelerator present.
    Cpu,
}

impl Placement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Placement::Accelerator => "accelerator",
            Placement::CpuOffload => "cpu_offload",
            Placement::Cpu => "cpu",
        }
    }
}

/// Offload when the accelerator has less than `threshold_gib` in total.
pub fn placement_for_total(total_gib: Option<f64>, threshold_gib: f64) -> Placement {
    match total_gib {
        None => Placement::Cpu,
        Some(total) if total < threshold_gib => Placement::CpuOffload,
        Some(_) => Placement::Accelerator,
    }
}

pub fn detect_placement(threshold_gib: f64) -> Placement {
    placement_for_total(gpu_memory().map(|g| g.total_gib), threshold_gib)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuMemory {
    pub total_gib: f64,
    /// Memory in use on the device. The driver does not split allocated
    /// from reserved, so both report the same figure.
    pub allocated_gib: f64,
    pub reserved_gib: f64,
    pub available_gib: f64,
}

/// Device 0 memory via `nvidia-smi`; `None` without an NVIDIA accelerator.
pub fn gpu_memory() -> Option<GpuMemory> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,memory.used,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the first `total, used, free` line (MiB).
pub fn parse_nvidia_smi(output: &str) -> Option<GpuMemory> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split(',').map(|f| f.trim().parse::<f64>());
    let total = fields.next()?.ok()?;
    let used = fields.next()?.ok()?;
    let free = fields.next()?.ok()?;
    Some(GpuMemory {
        total_gib: total / MIB_PER_GIB,
        allocated_gib: used / MIB_PER_GIB,
        reserved_gib: used / MIB_PER_GIB,
        available_gib: free / MIB_PER_GIB,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostMemory {
    pub process_rss_gib: f64,
    pub system_total_gib: f64,
    pub system_available_gib: f64,
}

pub fn host_memory() -> HostMemory {
    let mut sys = System::new();
    sys.refresh_memory();

    let process_rss = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid).map(|p| p.memory())
        })
        .unwrap_or(0);

    HostMemory {
        process_rss_gib: process_rss as f64 / BYTES_PER_GIB,
        system_total_gib: sys.total_memory() as f64 / BYTES_PER_GIB,
        system_available_gib: sys.available_memory() as f64 / BYTES_PER_GIB,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub gpu: Option<GpuMemory>,
    pub host: HostMemory,
}

impl MemorySnapshot {
    pub fn capture() -> Self {
        Self {
            gpu: gpu_memory(),
            host: host_memory(),
        }
    }

    pub fn summary(&self) -> String {
        let gpu = match &self.gpu {
            Some(g) => format!(
                "gpu {:.2}/{:.2} GiB used, {:.2} GiB free",
                g.allocated_gib, g.total_gib, g.available_gib
            ),
            None => "gpu n/a".to_string(),
        };
        format!(
            "{gpu}; rss {:.2} GiB; host {:.2}/{:.2} GiB available",
            self.host.process_rss_gib, self.host.system_available_gib, self.host.system_total_gib
        )
    }

    /// Memory released between `self` and a later snapshot.
    pub fn released_since(&self, later: &MemorySnapshot) -> String {
        let gpu = match (&self.gpu, &later.gpu) {
            (Some(before), Some(after)) => {
                format!("gpu {:+.2} GiB", before.allocated_gib - after.allocated_gib)
            }
            _ => "gpu n/a".to_string(),
        };
        format!(
            "{gpu}, rss {:+.2} GiB",
            self.host.process_rss_gib - later.host.process_rss_gib
        )
    }
}

/// Hand freed heap pages back to the OS.
pub fn reclaim_host_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only walks allocator state; no pointers are passed.
        unsafe {
            libc::malloc_trim(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_accelerators_offload() {
        assert_eq!(placement_for_total(Some(24.0), 32.0), Placement::CpuOffload);
        assert_eq!(placement_for_total(Some(80.0), 32.0), Placement::Accelerator);
        assert_eq!(placement_for_total(Some(32.0), 32.0), Placement::Accelerator);
        assert_eq!(placement_for_total(None, 32.0), Placement::Cpu);
    }

    #[test]
    fn parses_first_gpu_line() {
        let gpu = parse_nvidia_smi("24576, 2048, 22528\n81920, 0, 81920\n").unwrap();
        assert_eq!(gpu.total_gib, 24.0);
        assert_eq!(gpu.allocated_gib, 2.0);
        assert_eq!(gpu.available_gib, 22.0);
    }

    #[test]
    fn garbage_output_is_no_gpu() {
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("NVIDIA-SMI has failed").is_none());
        assert!(parse_nvidia_smi("24576, 2048").is_none());
    }

    #[test]
    fn host_memory_reports_something() {
        let host = host_memory();
        assert!(host.system_total_gib > 0.0);
        assert!(host.process_rss_gib >= 0.0);
        assert!(MemorySnapshot::capture().summary().contains("rss"));
    }
}
