pub mod elastic_training;
pub mod hot_switch;
pub mod pod_rescheduling;
pub mod recover;

use tracing::{debug, warn};

use taskd_core::types::{ClusterCommand, SignalType, Strategy};
use taskd_core::TaskdError;

use crate::store::Snapshot;

pub use elastic_training::ElasticTrainingPlugin;
pub use hot_switch::HotSwitchPlugin;
pub use pod_rescheduling::PodReschedulingPlugin;
pub use recover::RecoverPlugin;

pub const ELASTIC_TRAINING: &str = "ElasticTraining";
pub const HOT_SWITCH: &str = "HotSwitch";
pub const POD_RESCHEDULING: &str = "PodRescheduling";
pub const RECOVER: &str = "Recover";

/// Name of the stream a plugin claims while it holds the token.
pub const CLUSTER_STREAM: &str = "ClusterStream";

/// `(SignalType, Actions)` pair used to suppress repeated signals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalKey {
    pub signal_type: Option<SignalType>,
    pub actions: Vec<String>,
}

impl SignalKey {
    pub fn of(cmd: &ClusterCommand) -> Self {
        Self {
            signal_type: cmd.signal_type.clone(),
            actions: cmd.actions.clone(),
        }
    }
}

/// `(Uuid, ChangeStrategy)` pair identifying one recovery episode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EpisodeKey {
    pub uuid: String,
    pub strategy: Strategy,
}

/// Result of reading the cluster command for a plugin's predicate.
pub(crate) enum CommandRead {
    Present(ClusterCommand),
    /// No cluster entry yet.
    Absent,
    /// Entry present but undecodable.
    Malformed,
}

pub(crate) fn read_command(snapshot: &Snapshot, plugin: &str) -> CommandRead {
    match snapshot.command() {
        Ok(cmd) => CommandRead::Present(cmd.clone()),
        Err(TaskdError::MissingCluster(key)) => {
            debug!("{}: no cluster info for {}", plugin, key);
            CommandRead::Absent
        }
        Err(e) => {
            warn!("{}: ignoring cluster command: {}", plugin, e);
            CommandRead::Malformed
        }
    }
}
