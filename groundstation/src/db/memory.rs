//! In-memory backend. A single mutex guards all state, so every call is
//! atomic with respect to other callers (but two calls are not atomic together).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{group_workstations, truncate_to_micros, truncate_to_secs, Database, MachineRecord};
use crate::error::{DbError, Result};
use crate::types::{
    average_samples, AttachFileRequest, AttachedFile, FileEntry, GpuInfo, GpuStatSample, GpuView,
    MachineLastSeen, ModifyMachineRequest, NewMachineRequest, RemoveFileRequest,
    RemoveMachineRequest, WorkstationGroup, DEFAULT_GROUP,
};

#[derive(Debug, Clone)]
struct GpuRecord {
    hostname: String,
    info: GpuInfo,
}

#[derive(Debug, Clone)]
struct StoredFile {
    mime: String,
    payload: Vec<u8>,
}

// Relations are keyed lookups: GPUs point back at their host by name,
// samples and files are keyed by GPU uuid and hostname.
#[derive(Default)]
struct State {
    machines: BTreeMap<String, MachineRecord>,
    gpus: HashMap<String, GpuRecord>,
    samples: HashMap<String, Vec<GpuStatSample>>,
    files: HashMap<String, BTreeMap<String, StoredFile>>,
}

#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn update_last_seen(&self, hostname: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let mut st = self.state.lock().await;
        st.machines
            .entry(hostname.to_string())
            .or_insert_with(|| MachineRecord::new(DEFAULT_GROUP))
            .last_seen = Some(timestamp);
        Ok(())
    }

    async fn update_gpu_context(&self, hostname: &str, info: &GpuInfo) -> Result<()> {
        let mut st = self.state.lock().await;
        if !st.machines.contains_key(hostname) {
            return Err(DbError::no_such_machine(hostname));
        }
        st.gpus.insert(
            info.uuid.clone(),
            GpuRecord {
                hostname: hostname.to_string(),
                info: info.clone(),
            },
        );
        Ok(())
    }

    async fn append_data_point(&self, sample: &GpuStatSample) -> Result<()> {
        let mut st = self.state.lock().await;
        let hostname = match st.gpus.get(&sample.uuid) {
            Some(gpu) => gpu.hostname.clone(),
            None => return Err(DbError::gpu_not_present(&sample.uuid)),
        };
        match st.machines.get(&hostname) {
            Some(m) if m.last_seen.is_some() => {}
            _ => return Err(DbError::no_such_machine(hostname)),
        }
        let mut sample = sample.clone();
        sample.time = truncate_to_micros(sample.time);
        st.samples
            .entry(sample.uuid.clone())
            .or_default()
            .push(sample);
        Ok(())
    }

    async fn latest_data(&self) -> Result<Vec<WorkstationGroup>> {
        let st = self.state.lock().await;
        let mut views: HashMap<&str, Vec<GpuView>> = HashMap::new();
        for (uuid, gpu) in &st.gpus {
            // max_by_key keeps the last of equal timestamps, i.e. the latest append
            let latest = st
                .samples
                .get(uuid)
                .and_then(|samples| samples.iter().max_by_key(|s| s.time));
            if let Some(sample) = latest {
                views
                    .entry(gpu.hostname.as_str())
                    .or_default()
                    .push(GpuView::new(&gpu.info, sample));
            }
        }
        let machines = st.machines.iter().map(|(host, record)| {
            let gpus = views.remove(host.as_str()).unwrap_or_default();
            (host.clone(), record.clone(), gpus)
        });
        Ok(group_workstations(machines.collect::<Vec<_>>(), Utc::now()))
    }

    async fn last_seen(&self) -> Result<Vec<MachineLastSeen>> {
        let st = self.state.lock().await;
        Ok(st
            .machines
            .iter()
            .filter_map(|(host, m)| {
                m.last_seen.map(|t| MachineLastSeen {
                    hostname: host.clone(),
                    last_seen: truncate_to_secs(t),
                })
            })
            .collect())
    }

    async fn new_machine(&self, req: &NewMachineRequest) -> Result<()> {
        let mut st = self.state.lock().await;
        match st.machines.get_mut(&req.hostname) {
            Some(existing) => {
                if let Some(group) = &req.group {
                    existing.group = group.clone();
                }
            }
            None => {
                let group = req.group.as_deref().unwrap_or(DEFAULT_GROUP);
                st.machines
                    .insert(req.hostname.clone(), MachineRecord::new(group));
            }
        }
        Ok(())
    }

    async fn update_machine(&self, req: &ModifyMachineRequest) -> Result<()> {
        let mut st = self.state.lock().await;
        if let Some(m) = st.machines.get_mut(&req.hostname) {
            m.apply(req);
        }
        Ok(())
    }

    async fn remove_machine(&self, req: &RemoveMachineRequest) -> Result<()> {
        let mut st = self.state.lock().await;
        let st = &mut *st;
        st.machines.remove(&req.hostname);
        let owned: Vec<String> = st
            .gpus
            .iter()
            .filter(|(_, g)| g.hostname == req.hostname)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in owned {
            st.gpus.remove(&uuid);
            st.samples.remove(&uuid);
        }
        st.files.remove(&req.hostname);
        Ok(())
    }

    async fn attach_file(&self, file: &AttachFileRequest) -> Result<()> {
        let mut st = self.state.lock().await;
        if !st.machines.contains_key(&file.hostname) {
            return Err(DbError::no_such_machine(&file.hostname));
        }
        st.files.entry(file.hostname.clone()).or_default().insert(
            file.filename.clone(),
            StoredFile {
                mime: file.mime.clone(),
                payload: file.payload.clone(),
            },
        );
        Ok(())
    }

    async fn get_file(&self, hostname: &str, filename: &str) -> Result<AttachedFile> {
        let st = self.state.lock().await;
        st.files
            .get(hostname)
            .and_then(|files| files.get(filename))
            .map(|f| AttachedFile {
                hostname: hostname.to_string(),
                filename: filename.to_string(),
                mime: f.mime.clone(),
                payload: f.payload.clone(),
            })
            .ok_or_else(|| DbError::file_not_present(hostname, filename))
    }

    async fn list_files(&self, hostname: &str) -> Result<Vec<FileEntry>> {
        let st = self.state.lock().await;
        if !st.machines.contains_key(hostname) {
            return Err(DbError::no_such_machine(hostname));
        }
        Ok(st
            .files
            .get(hostname)
            .map(|files| {
                files
                    .iter()
                    .map(|(name, f)| FileEntry {
                        filename: name.clone(),
                        mime: f.mime.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_file(&self, req: &RemoveFileRequest) -> Result<()> {
        let mut st = self.state.lock().await;
        st.files
            .get_mut(&req.hostname)
            .and_then(|files| files.remove(&req.filename))
            .map(|_| ())
            .ok_or_else(|| DbError::file_not_present(&req.hostname, &req.filename))
    }

    async fn downsample(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let cutoff = truncate_to_micros(cutoff);
        let mut st = self.state.lock().await;
        for samples in st.samples.values_mut() {
            if samples.iter().filter(|s| s.time < cutoff).count() < 2 {
                continue;
            }
            let (mut old, keep): (Vec<_>, Vec<_>) =
                std::mem::take(samples).into_iter().partition(|s| s.time < cutoff);
            old.sort_by_key(|s| s.time);
            let mut next = Vec::with_capacity(keep.len() + 1);
            next.extend(average_samples(&old));
            next.extend(keep);
            *samples = next;
        }
        Ok(())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = truncate_to_micros(cutoff);
        let mut st = self.state.lock().await;
        let mut removed = 0u64;
        for samples in st.samples.values_mut() {
            let before = samples.len();
            samples.retain(|s| s.time >= cutoff);
            removed += (before - samples.len()) as u64;
        }
        Ok(removed)
    }

    async fn destroy(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        *st = State::default();
        Ok(())
    }
}
