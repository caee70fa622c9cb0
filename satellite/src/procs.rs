//! Resolves GPU-holding pids to process names and owning users.

use std::collections::HashMap;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLabel {
    pub name: String,
    pub owner: String,
}

pub struct ProcessTable {
    sys: System,
    users: Users,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            users: Users::new_with_refreshed_list(),
        }
    }

    /// Name and owner for each pid that still exists.
    pub fn resolve(&mut self, pids: &[u32]) -> HashMap<u32, ProcessLabel> {
        if pids.is_empty() {
            return HashMap::new();
        }
        let wanted: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&wanted),
            true,
            ProcessRefreshKind::nothing().with_user(UpdateKind::OnlyIfNotSet),
        );
        let mut refreshed_users = false;
        let mut out = HashMap::with_capacity(pids.len());
        for pid in &wanted {
            let Some(proc_) = self.sys.process(*pid) else {
                continue;
            };
            let owner = match proc_.user_id() {
                Some(uid) => {
                    // accounts created after startup show up on the next refresh
                    if self.users.get_user_by_id(uid).is_none() && !refreshed_users {
                        self.users.refresh();
                        refreshed_users = true;
                    }
                    self.users
                        .get_user_by_id(uid)
                        .map(|u| u.name().to_string())
                        .unwrap_or_default()
                }
                None => String::new(),
            };
            out.insert(
                pid.as_u32(),
                ProcessLabel {
                    name: proc_.name().to_string_lossy().into_owned(),
                    owner,
                },
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_own_process() {
        let me = std::process::id();
        let mut table = ProcessTable::new();
        let labels = table.resolve(&[me]);
        let label = labels.get(&me).expect("own pid resolves");
        assert!(!label.name.is_empty());
    }

    #[test]
    fn vanished_pids_are_skipped() {
        let mut table = ProcessTable::new();
        assert!(table.resolve(&[]).is_empty());
        assert!(table.resolve(&[u32::MAX - 7]).is_empty());
    }
}
