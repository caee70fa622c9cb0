//! Data types exchanged with satellites and admin clients.
//! The ingestion payloads define the satellite wire format; satellites are
//! released independently, so field names here must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Group a machine is shown under until an admin assigns one.
pub const DEFAULT_GROUP: &str = "Shared";

/// Identity and capacity of one GPU ("context"). Does not change between samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub uuid: String,
    #[serde(default)]
    pub gpu_name: String,
    #[serde(default)]
    pub gpu_brand: String,
    #[serde(default)]
    pub driver_ver: String,
    // MiB
    #[serde(default)]
    pub memory_total: i64,
}

/// A process holding GPU memory, as resolved by the satellite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProcessInfo {
    pub pid: u32,
    #[serde(default)]
    pub name: String,
    // MiB
    #[serde(default)]
    pub used_memory: i64,
    #[serde(default)]
    pub owner: String,
}

/// One point-in-time telemetry reading for a GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatSample {
    pub uuid: String,
    #[serde(default)]
    pub memory_util: f64,
    #[serde(default)]
    pub gpu_util: f64,
    #[serde(default)]
    pub memory_used: i64,
    #[serde(default)]
    pub fan_speed: f64,
    #[serde(default)]
    pub gpu_temp: f64,
    #[serde(default)]
    pub memory_temp: f64,
    #[serde(default)]
    pub graphics_voltage: f64,
    #[serde(default)]
    pub power_draw: f64,
    #[serde(default)]
    pub graphics_clock: i64,
    #[serde(default)]
    pub max_graphics_clock: i64,
    #[serde(default)]
    pub memory_clock: i64,
    #[serde(default)]
    pub max_memory_clock: i64,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub processes: Vec<GpuProcessInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub hostname: String,
    #[serde(default)]
    pub information: Vec<GpuInfo>,
    #[serde(default)]
    pub stats: Vec<GpuStatSample>,
}

/// `(in_use, user)` for a process list: in use iff any process holds the GPU,
/// user is the owner of the first listed process.
pub fn summarise_processes(processes: &[GpuProcessInfo]) -> (bool, String) {
    match processes.first() {
        Some(p) => (true, p.owner.clone()),
        None => (false, String::new()),
    }
}

fn mean_f64(samples: &[GpuStatSample], field: impl Fn(&GpuStatSample) -> f64) -> f64 {
    samples.iter().map(field).sum::<f64>() / samples.len() as f64
}

fn mean_i64(samples: &[GpuStatSample], field: impl Fn(&GpuStatSample) -> i64) -> i64 {
    let total: i128 = samples.iter().map(|s| i128::from(field(s))).sum();
    // the mean of i64 values always fits back into i64
    (total / samples.len() as i128) as i64
}

/// Collapse `samples` into one: every numeric field is the unweighted mean,
/// `time` is the earliest timestamp and the process lists are concatenated
/// in input order. Returns `None` for an empty slice.
pub fn average_samples(samples: &[GpuStatSample]) -> Option<GpuStatSample> {
    let first = samples.first()?;
    let time = samples.iter().map(|s| s.time).min()?;
    Some(GpuStatSample {
        uuid: first.uuid.clone(),
        memory_util: mean_f64(samples, |s| s.memory_util),
        gpu_util: mean_f64(samples, |s| s.gpu_util),
        memory_used: mean_i64(samples, |s| s.memory_used),
        fan_speed: mean_f64(samples, |s| s.fan_speed),
        gpu_temp: mean_f64(samples, |s| s.gpu_temp),
        memory_temp: mean_f64(samples, |s| s.memory_temp),
        graphics_voltage: mean_f64(samples, |s| s.graphics_voltage),
        power_draw: mean_f64(samples, |s| s.power_draw),
        graphics_clock: mean_i64(samples, |s| s.graphics_clock),
        max_graphics_clock: mean_i64(samples, |s| s.max_graphics_clock),
        memory_clock: mean_i64(samples, |s| s.memory_clock),
        max_memory_clock: mean_i64(samples, |s| s.max_memory_clock),
        time,
        processes: samples
            .iter()
            .flat_map(|s| s.processes.iter().cloned())
            .collect(),
    })
}

// ---------- Read model ----------

/// A GPU's context merged with its most recent sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuView {
    pub uuid: String,
    pub gpu_name: String,
    pub gpu_brand: String,
    pub driver_ver: String,
    pub memory_total: i64,
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
    pub in_use: bool,
    pub user: String,
}

impl GpuView {
    pub fn new(info: &GpuInfo, sample: &GpuStatSample) -> Self {
        let (in_use, user) = summarise_processes(&sample.processes);
        Self {
            uuid: info.uuid.clone(),
            gpu_name: info.gpu_name.clone(),
            gpu_brand: info.gpu_brand.clone(),
            driver_ver: info.driver_ver.clone(),
            memory_total: info.memory_total,
            memory_util: sample.memory_util,
            gpu_util: sample.gpu_util,
            memory_used: sample.memory_used,
            fan_speed: sample.fan_speed,
            gpu_temp: sample.gpu_temp,
            memory_temp: sample.memory_temp,
            graphics_voltage: sample.graphics_voltage,
            power_draw: sample.power_draw,
            graphics_clock: sample.graphics_clock,
            max_graphics_clock: sample.max_graphics_clock,
            memory_clock: sample.memory_clock,
            max_memory_clock: sample.max_memory_clock,
            time: sample.time,
            processes: sample.processes.clone(),
            in_use,
            user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workstation {
    pub name: String,
    pub cpu: Option<String>,
    pub motherboard: Option<String>,
    pub notes: Option<String>,
    pub owner: Option<String>,
    /// Seconds since the last heartbeat; `None` if the machine never reported.
    pub last_seen: Option<i64>,
    pub gpus: Vec<GpuView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkstationGroup {
    pub name: String,
    pub workstations: Vec<Workstation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineLastSeen {
    pub hostname: String,
    pub last_seen: DateTime<Utc>,
}

// ---------- Admin requests ----------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMachineRequest {
    pub hostname: String,
    #[serde(default)]
    pub group: Option<String>,
}

/// Partial update: `None` leaves a field untouched, `Some("")` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyMachineRequest {
    pub hostname: String,
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub motherboard: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveMachineRequest {
    pub hostname: String,
}

/// A named blob attached to a machine. The payload travels base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedFile {
    pub hostname: String,
    pub filename: String,
    pub mime: String,
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
}

pub type AttachFileRequest = AttachedFile;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveFileRequest {
    pub hostname: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub mime: String,
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
