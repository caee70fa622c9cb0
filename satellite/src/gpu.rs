//! NVIDIA GPU sampling through NVML.

use chrono::Utc;
use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::{Device, Nvml};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::procs::{ProcessLabel, ProcessTable};
use crate::types::{GpuInfo, GpuProcessInfo, GpuStatSample};

// Runtime toggle (read once)
fn gpu_enabled() -> bool {
    static ON: OnceCell<bool> = OnceCell::new();
    *ON.get_or_init(|| {
        std::env::var("SATELLITE_GPU")
            .map(|v| v != "0")
            .unwrap_or(true)
    })
}

const MIB: u64 = 1024 * 1024;

fn mib(bytes: u64) -> i64 {
    (bytes / MIB) as i64
}

/// One GPU-holding process before its pid is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawProcess {
    pub pid: u32,
    pub used_bytes: Option<u64>,
}

pub fn label_processes(
    raw: &[RawProcess],
    labels: &std::collections::HashMap<u32, ProcessLabel>,
) -> Vec<GpuProcessInfo> {
    raw.iter()
        .map(|p| {
            let label = labels.get(&p.pid);
            GpuProcessInfo {
                pid: p.pid,
                name: label.map(|l| l.name.clone()).unwrap_or_default(),
                used_memory: p.used_bytes.map(mib).unwrap_or(0),
                owner: label.map(|l| l.owner.clone()).unwrap_or_default(),
            }
        })
        .collect()
}

pub struct GpuSampler {
    nvml: Option<Nvml>,
    procs: ProcessTable,
}

impl Default for GpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuSampler {
    /// A sampler with no NVML (disabled, or no driver) reports nothing.
    pub fn new() -> Self {
        let nvml = if gpu_enabled() {
            match Nvml::init() {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(error = %e, "NVML unavailable; GPU telemetry disabled");
                    None
                }
            }
        } else {
            debug!("GPU sampling disabled via SATELLITE_GPU=0");
            None
        };
        Self {
            nvml,
            procs: ProcessTable::new(),
        }
    }

    /// Context and a fresh sample for every GPU NVML can open.
    pub fn collect(&mut self) -> (Vec<GpuInfo>, Vec<GpuStatSample>) {
        let Some(nvml) = self.nvml.as_ref() else {
            return (Vec::new(), Vec::new());
        };
        let driver = nvml.sys_driver_version().unwrap_or_default();
        let count = match nvml.device_count() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "NVML device count failed");
                return (Vec::new(), Vec::new());
            }
        };

        let mut infos = Vec::new();
        let mut samples = Vec::new();
        for i in 0..count {
            let device = match nvml.device_by_index(i) {
                Ok(d) => d,
                Err(e) => {
                    warn!(index = i, error = %e, "failed to open GPU");
                    continue;
                }
            };
            let uuid = match device.uuid() {
                Ok(u) => u,
                Err(e) => {
                    warn!(index = i, error = %e, "GPU has no uuid; skipping");
                    continue;
                }
            };
            let raw = running_processes(&device);
            let pids: Vec<u32> = raw.iter().map(|p| p.pid).collect();
            let labels = self.procs.resolve(&pids);
            infos.push(read_info(&device, uuid.clone(), &driver));
            samples.push(read_sample(&device, uuid, label_processes(&raw, &labels)));
        }
        (infos, samples)
    }
}

fn read_info(device: &Device<'_>, uuid: String, driver: &str) -> GpuInfo {
    GpuInfo {
        uuid,
        gpu_name: device.name().unwrap_or_default(),
        gpu_brand: device.brand().map(|b| format!("{b:?}")).unwrap_or_default(),
        driver_ver: driver.to_string(),
        memory_total: device.memory_info().map(|m| mib(m.total)).unwrap_or(0),
    }
}

// Readings a board does not support come back as zero.
fn read_sample(device: &Device<'_>, uuid: String, processes: Vec<GpuProcessInfo>) -> GpuStatSample {
    let util = device.utilization_rates().ok();
    let clock = |c| device.clock_info(c).map(i64::from).unwrap_or(0);
    let max_clock = |c| device.max_clock_info(c).map(i64::from).unwrap_or(0);
    GpuStatSample {
        uuid,
        memory_util: util.as_ref().map(|u| f64::from(u.memory)).unwrap_or(0.0),
        gpu_util: util.as_ref().map(|u| f64::from(u.gpu)).unwrap_or(0.0),
        memory_used: device.memory_info().map(|m| mib(m.used)).unwrap_or(0),
        fan_speed: device.fan_speed(0).map(f64::from).unwrap_or(0.0),
        gpu_temp: device
            .temperature(TemperatureSensor::Gpu)
            .map(f64::from)
            .unwrap_or(0.0),
        memory_temp: 0.0,
        graphics_voltage: 0.0,
        // NVML reports milliwatts
        power_draw: device
            .power_usage()
            .map(|mw| f64::from(mw) / 1000.0)
            .unwrap_or(0.0),
        graphics_clock: clock(Clock::Graphics),
        max_graphics_clock: max_clock(Clock::Graphics),
        memory_clock: clock(Clock::Memory),
        max_memory_clock: max_clock(Clock::Memory),
        time: Utc::now(),
        processes,
    }
}

fn running_processes(device: &Device<'_>) -> Vec<RawProcess> {
    let mut out: Vec<RawProcess> = Vec::new();
    let compute = device.running_compute_processes().unwrap_or_default();
    let graphics = device.running_graphics_processes().unwrap_or_default();
    for p in compute.into_iter().chain(graphics) {
        if out.iter().any(|seen| seen.pid == p.pid) {
            continue;
        }
        out.push(RawProcess {
            pid: p.pid,
            used_bytes: match p.used_gpu_memory {
                UsedGpuMemory::Used(b) => Some(b),
                UsedGpuMemory::Unavailable => None,
            },
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn processes_are_labelled_in_mib() {
        let raw = [
            RawProcess {
                pid: 10,
                used_bytes: Some(300 * MIB + 5),
            },
            RawProcess {
                pid: 11,
                used_bytes: None,
            },
        ];
        let labels = HashMap::from([(
            10,
            ProcessLabel {
                name: "python".into(),
                owner: "alice".into(),
            },
        )]);
        let out = label_processes(&raw, &labels);
        assert_eq!(
            out[0],
            GpuProcessInfo {
                pid: 10,
                name: "python".into(),
                used_memory: 300,
                owner: "alice".into(),
            }
        );
        // exited before we could look it up
        assert_eq!(out[1].name, "");
        assert_eq!(out[1].owner, "");
        assert_eq!(out[1].used_memory, 0);
    }
}
