//! Database engine: the storage contract every backend implements.
//!
//! Two backends ship: [`MemoryDatabase`] (reference, one lock around all
//! state) and [`SqliteDatabase`] (durable, one transaction per call). Both
//! are checked by the same conformance suite in `tests.rs`.
//!
//! The engine never logs; callers decide what an error means to them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    AttachFileRequest, AttachedFile, FileEntry, GpuInfo, GpuStatSample, GpuView,
    MachineLastSeen, ModifyMachineRequest, NewMachineRequest, RemoveFileRequest,
    RemoveMachineRequest, Workstation, WorkstationGroup,
};

pub mod memory;
pub mod sqlite;


pub use memory::MemoryDatabase;
pub use sqlite::SqliteDatabase;

#[async_trait]
pub trait Database: Send + Sync {
    /// Record a heartbeat, creating the machine in the default group if needed.
    async fn update_last_seen(&self, hostname: &str, timestamp: DateTime<Utc>) -> Result<()>;

    /// Register or overwrite a GPU's context. The machine must exist.
    async fn update_gpu_context(&self, hostname: &str, info: &GpuInfo) -> Result<()>;

    /// Store one sample. Fails with `GpuNotPresent` until the GPU's context is
    /// registered, and with `NoSuchMachine` if its machine never sent a heartbeat.
    async fn append_data_point(&self, sample: &GpuStatSample) -> Result<()>;

    /// Grouped snapshot with each GPU's most recent sample.
    async fn latest_data(&self) -> Result<Vec<WorkstationGroup>>;

    /// Last heartbeat of every machine that has sent one, at one-second resolution.
    async fn last_seen(&self) -> Result<Vec<MachineLastSeen>>;

    /// Create a machine ahead of its first heartbeat. On an existing machine
    /// only the group is applied (when given).
    async fn new_machine(&self, req: &NewMachineRequest) -> Result<()>;

    /// Apply the fields present in `req`. Unknown hosts are a no-op.
    async fn update_machine(&self, req: &ModifyMachineRequest) -> Result<()>;

    /// Delete a machine with its GPUs, samples and files. Unknown hosts are a no-op.
    async fn remove_machine(&self, req: &RemoveMachineRequest) -> Result<()>;

    /// Attach (or replace) a named file on an existing machine.
    async fn attach_file(&self, file: &AttachFileRequest) -> Result<()>;

    async fn get_file(&self, hostname: &str, filename: &str) -> Result<AttachedFile>;

    async fn list_files(&self, hostname: &str) -> Result<Vec<FileEntry>>;

    async fn remove_file(&self, req: &RemoveFileRequest) -> Result<()>;

    /// Per GPU, merge every sample older than `cutoff` into one averaged sample.
    /// GPUs with fewer than two such samples are left alone.
    async fn downsample(&self, cutoff: DateTime<Utc>) -> Result<()>;

    /// Delete every sample older than `cutoff`; returns how many went.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Irreversibly remove all state and release the backing store.
    async fn destroy(&self) -> Result<()>;
}

/// Machine attributes as both backends keep them.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MachineRecord {
    pub group: String,
    pub cpu: Option<String>,
    pub motherboard: Option<String>,
    pub notes: Option<String>,
    pub owner: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl MachineRecord {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            cpu: None,
            motherboard: None,
            notes: None,
            owner: None,
            last_seen: None,
        }
    }

    pub fn apply(&mut self, req: &ModifyMachineRequest) {
        if let Some(cpu) = &req.cpu {
            self.cpu = Some(cpu.clone());
        }
        if let Some(motherboard) = &req.motherboard {
            self.motherboard = Some(motherboard.clone());
        }
        if let Some(notes) = &req.notes {
            self.notes = Some(notes.clone());
        }
        if let Some(group) = &req.group {
            self.group = group.clone();
        }
        if let Some(owner) = &req.owner {
            self.owner = Some(owner.clone());
        }
    }
}

/// Drop sub-second precision so last-seen comparisons are stable across backends.
pub(crate) fn truncate_to_secs(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

/// Sample times are kept to the microsecond, the resolution of the durable store.
pub(crate) fn truncate_to_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

/// Build the grouped read model. Groups, hosts and GPUs come out sorted.
pub(crate) fn group_workstations(
    machines: impl IntoIterator<Item = (String, MachineRecord, Vec<GpuView>)>,
    now: DateTime<Utc>,
) -> Vec<WorkstationGroup> {
    let mut groups: BTreeMap<String, Vec<Workstation>> = BTreeMap::new();
    for (name, record, mut gpus) in machines {
        gpus.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        let MachineRecord {
            group,
            cpu,
            motherboard,
            notes,
            owner,
            last_seen,
        } = record;
        groups.entry(group).or_default().push(Workstation {
            name,
            cpu,
            motherboard,
            notes,
            owner,
            last_seen: last_seen.map(|t| (now - t).num_seconds()),
            gpus,
        });
    }
    groups
        .into_iter()
        .map(|(name, mut workstations)| {
            workstations.sort_by(|a, b| a.name.cmp(&b.name));
            WorkstationGroup { name, workstations }
        })
        .collect()
}
