use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use taskd_core::protocol::Report;
use taskd_core::types::{status, ClusterCommand, ClusterInfo, ClusterSignal, StatusMap, CLUSTER_KEY};
use taskd_core::TaskdError;

/// Point-in-time copy of the store, read category by category.
///
/// Categories are copied under independent locks, so agent and cluster
/// state may come from slightly different instants.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub agent_infos: HashMap<String, StatusMap>,
    pub worker_infos: HashMap<String, StatusMap>,
    pub cluster_infos: HashMap<String, ClusterInfo>,
    pub mgr_info: Option<StatusMap>,
}

impl Snapshot {
    pub fn cluster(&self, key: &str) -> Result<&ClusterInfo, TaskdError> {
        self.cluster_infos
            .get(key)
            .ok_or_else(|| TaskdError::MissingCluster(key.to_string()))
    }

    /// Decoded command of the cluster controller entry.
    pub fn command(&self) -> Result<&ClusterCommand, TaskdError> {
        self.cluster(CLUSTER_KEY)?.command()
    }

    pub fn fault_recover_in_progress(&self) -> bool {
        self.mgr_info
            .as_ref()
            .and_then(|m| m.get(status::FAULT_RECOVER))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Agent names in a stable order.
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agent_infos.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Shared job state, one reader/writer lock per category.
///
/// Writers are processor workers; plugins only ever read snapshots. No
/// method holds more than one category lock at a time.
#[derive(Default)]
pub struct SnapshotStore {
    agents: RwLock<HashMap<String, StatusMap>>,
    workers: RwLock<HashMap<String, StatusMap>>,
    clusters: RwLock<HashMap<String, ClusterInfo>>,
    mgr: RwLock<Option<StatusMap>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a decoded report into the matching category.
    pub fn apply(&self, report: Report) {
        match report {
            Report::Agent { name, status } => self.update_agent(&name, status),
            Report::Worker { name, status } => self.update_worker(&name, status),
            Report::Cluster { key, command } => self.update_cluster(&key, command),
            Report::Manager { status } => self.update_manager(status),
        }
    }

    /// Merge status keys reported by an agent.
    pub fn update_agent(&self, name: &str, status: StatusMap) {
        let mut agents = self.agents.write();
        agents.entry(name.to_string()).or_default().extend(status);
        debug!("Agent {} status updated", name);
    }

    pub fn update_worker(&self, name: &str, status: StatusMap) {
        let mut workers = self.workers.write();
        workers.entry(name.to_string()).or_default().extend(status);
    }

    /// Replace the command bag for `key`, decoding it once here.
    pub fn update_cluster(&self, key: &str, command: StatusMap) {
        let info = ClusterInfo::from_command_map(command);
        if let ClusterSignal::Malformed { uuid, field, reason } = &info.signal {
            tracing::warn!(
                "Cluster {} sent malformed command (uuid={}, field={}): {}",
                key, uuid, field, reason
            );
        }
        self.clusters.write().insert(key.to_string(), info);
    }

    pub fn update_manager(&self, status: StatusMap) {
        let mut mgr = self.mgr.write();
        mgr.get_or_insert_with(StatusMap::new).extend(status);
    }

    pub fn get_cluster(&self, key: &str) -> Result<ClusterInfo, TaskdError> {
        self.clusters
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| TaskdError::MissingCluster(key.to_string()))
    }

    pub fn agent(&self, name: &str) -> Option<StatusMap> {
        self.agents.read().get(name).cloned()
    }

    pub fn snapshot(&self) -> Snapshot {
        let agent_infos = self.agents.read().clone();
        let worker_infos = self.workers.read().clone();
        let cluster_infos = self.clusters.read().clone();
        let mgr_info = self.mgr.read().clone();
        Snapshot {
            agent_infos,
            worker_infos,
            cluster_infos,
            mgr_info,
        }
    }
}
