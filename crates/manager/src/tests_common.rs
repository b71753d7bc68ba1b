use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use taskd_core::protocol::BaseMessage;
use taskd_core::transport::Transport;
use taskd_core::types::{status, StatusMap, CLUSTER_KEY};
use taskd_core::TaskdError;

use crate::store::{Snapshot, SnapshotStore};

pub fn status_map(pairs: &[(&str, &str)]) -> StatusMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Snapshot holding only a cluster command.
pub fn command_snapshot(pairs: &[(&str, &str)]) -> Snapshot {
    let store = SnapshotStore::new();
    store.update_cluster(CLUSTER_KEY, status_map(pairs));
    store.snapshot()
}

/// Store with the given agents, each flagged faulty or healthy.
pub fn agents_store(agents: &[(&str, bool)]) -> SnapshotStore {
    let store = SnapshotStore::new();
    for (name, faulty) in agents {
        let fault = if *faulty { "1" } else { "" };
        store.update_agent(name, status_map(&[(status::FAULT_RANK, fault)]));
    }
    store
}

/// Transport that records every frame it is asked to send.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<BaseMessage>>>,
    pub fail: bool,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, msg: &BaseMessage) -> Result<(), TaskdError> {
        if self.fail {
            return Err(TaskdError::Transport(format!("no route to {}", msg.dst)));
        }
        self.sent.lock().push(msg.clone());
        Ok(())
    }

    fn can_reach(&self, _receiver: &str) -> bool {
        !self.fail
    }
}
