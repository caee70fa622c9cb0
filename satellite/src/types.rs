//! Wire payloads sent to the groundstation. Field names are part of the
//! protocol and must match what the groundstation decodes.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub uuid: String,
    pub gpu_name: String,
    pub gpu_brand: String,
    pub driver_ver: String,
    pub memory_total: i64, // MiB
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuProcessInfo {
    pub pid: u32,
    pub name: String,
    pub used_memory: i64, // MiB
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuStatSample {
    pub uuid: String,
    pub memory_util: f64,
    pub gpu_util: f64,
    pub memory_used: i64,
    pub fan_speed: f64,
    pub gpu_temp: f64,
    pub memory_temp: f64,
    pub graphics_voltage: f64,
    pub power_draw: f64,
    pub graphics_clock: i64,
    pub max_graphics_clock: i64,
    pub memory_clock: i64,
    pub max_memory_clock: i64,
    pub time: DateTime<Utc>,
    pub processes: Vec<GpuProcessInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    pub hostname: String,
    pub information: Vec<GpuInfo>,
    pub stats: Vec<GpuStatSample>,
}
