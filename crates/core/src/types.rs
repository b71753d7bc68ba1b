use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::TaskdError;

/// Key of the cluster controller entry in `ClusterInfos`.
pub const CLUSTER_KEY: &str = "ClusterD";
/// Receiver identity of the cluster controller.
pub const CONTROLLER: &str = "Controller";
/// Receiver identity of the manager role.
pub const MANAGER_ROLE: &str = "Mgr";
pub const AGENT_PREFIX: &str = "Agent";
/// Identity of the rank-0 agent.
pub const RANK0_AGENT: &str = "Agent0";

/// Action name carried by save-and-exit controller messages.
pub const SAVE_AND_EXIT_ACTION: &str = "SaveAndExit";
/// `ExtraParams` value selecting in-place recovery.
pub const RECOVER_IN_PLACE: &str = "recover-in-place";

/// Agent, worker and manager status keys.
pub mod status {
    pub const FAULT_RANK: &str = "FaultRank";
    pub const RESTART_TIME: &str = "RestartTime";
    pub const STOP_COMPLETE: &str = "StopComplete";
    pub const FAULT_RECOVER: &str = "FaultRecover";
}

/// Keys of the `ClusterInfo.Command` bag.
pub mod command {
    pub const SIGNAL_TYPE: &str = "SignalType";
    pub const CHANGE_STRATEGY: &str = "ChangeStrategy";
    pub const ACTIONS: &str = "Actions";
    pub const FAULT_RANKS: &str = "FaultRanks";
    pub const NODE_RANK_IDS: &str = "NodeRankIds";
    pub const UUID: &str = "Uuid";
    pub const TIMEOUT: &str = "Timeout";
    pub const EXTRA_PARAMS: &str = "ExtraParams";
}

pub type StatusMap = HashMap<String, String>;

/// Agent identity for a node rank id, e.g. `"1"` -> `"Agent1"`.
pub fn agent_name(rank: &str) -> String {
    format!("{}{}", AGENT_PREFIX, rank)
}

/// Whether a status map carries a fault report.
pub fn is_fault_reported(status: &StatusMap) -> bool {
    status
        .get(status::FAULT_RANK)
        .map(|v| !v.is_empty() && v != "false")
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    ChangeStrategy,
    HotSwitch,
    SaveAndExit,
    FaultNodesExit,
    FaultNodesRestart,
    Other(String),
}

impl SignalType {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "ChangeStrategy" => Self::ChangeStrategy,
            "HotSwitch" => Self::HotSwitch,
            "SaveAndExit" => Self::SaveAndExit,
            "FaultNodesExit" => Self::FaultNodesExit,
            "FaultNodesRestart" => Self::FaultNodesRestart,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ChangeStrategy => "ChangeStrategy",
            Self::HotSwitch => "HotSwitch",
            Self::SaveAndExit => "SaveAndExit",
            Self::FaultNodesExit => "FaultNodesExit",
            Self::FaultNodesRestart => "FaultNodesRestart",
            Self::Other(s) => s,
        }
    }
}

/// Recovery strategy named by `ChangeStrategy`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    ScaleIn,
    ScaleOut,
    Migration,
    Exit,
    Retry,
    Recover,
    Dump,
    ContinueTrain,
    Other(String),
}

impl Strategy {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "ScaleIn" => Self::ScaleIn,
            "ScaleOut" => Self::ScaleOut,
            "migration" => Self::Migration,
            "exit" => Self::Exit,
            "retry" => Self::Retry,
            "recover" => Self::Recover,
            "dump" => Self::Dump,
            "continue" => Self::ContinueTrain,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ScaleIn => "ScaleIn",
            Self::ScaleOut => "ScaleOut",
            Self::Migration => "migration",
            Self::Exit => "exit",
            Self::Retry => "retry",
            Self::Recover => "recover",
            Self::Dump => "dump",
            Self::ContinueTrain => "continue",
            Self::Other(s) => s,
        }
    }

    pub fn is_elastic(&self) -> bool {
        matches!(self, Self::ScaleIn | Self::ScaleOut)
    }

    /// Strategies driven by the recover plugin.
    pub fn is_process_recovery(&self) -> bool {
        matches!(
            self,
            Self::Retry | Self::Recover | Self::Dump | Self::ContinueTrain
        )
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strongly-typed view of a `ClusterInfo.Command` bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCommand {
    pub signal_type: Option<SignalType>,
    pub change_strategy: Option<Strategy>,
    pub actions: Vec<String>,
    pub fault_ranks: BTreeMap<i32, i32>,
    pub node_rank_ids: Vec<String>,
    pub uuid: String,
    pub timeout: Option<u64>,
    pub extra_params: String,
}

impl ClusterCommand {
    /// Decode the string bag. Missing or empty fields take empty defaults;
    /// a present field that fails to decode is an error.
    pub fn decode(raw: &StatusMap) -> Result<Self, TaskdError> {
        let field = |key: &str| raw.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let timeout = match field(command::TIMEOUT) {
            Some(v) => Some(
                v.trim()
                    .parse::<u64>()
                    .map_err(|e| TaskdError::malformed(command::TIMEOUT, e))?,
            ),
            None => None,
        };

        Ok(Self {
            signal_type: field(command::SIGNAL_TYPE).map(SignalType::from_wire),
            change_strategy: field(command::CHANGE_STRATEGY).map(Strategy::from_wire),
            actions: decode_json(raw, command::ACTIONS)?,
            fault_ranks: decode_json(raw, command::FAULT_RANKS)?,
            node_rank_ids: decode_json(raw, command::NODE_RANK_IDS)?,
            uuid: field(command::UUID).unwrap_or_default().to_string(),
            timeout,
            extra_params: field(command::EXTRA_PARAMS).unwrap_or_default().to_string(),
        })
    }

    pub fn is_signal(&self, signal: &SignalType) -> bool {
        self.signal_type.as_ref() == Some(signal)
    }

    pub fn is_strategy(&self, strategy: &Strategy) -> bool {
        self.change_strategy.as_ref() == Some(strategy)
    }

    pub fn recover_in_place(&self) -> bool {
        self.extra_params == RECOVER_IN_PLACE
    }

    /// Agent identities named by `NodeRankIds`.
    pub fn node_agents(&self) -> Vec<String> {
        self.node_rank_ids.iter().map(|r| agent_name(r)).collect()
    }
}

fn decode_json<T>(raw: &StatusMap, key: &str) -> Result<T, TaskdError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match raw.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(v) => serde_json::from_str(v).map_err(|e| TaskdError::malformed(key, e)),
        None => Ok(T::default()),
    }
}

/// Result of decoding a cluster command at the store's write boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterSignal {
    Command(ClusterCommand),
    Malformed {
        uuid: String,
        field: String,
        reason: String,
    },
}

/// One `ClusterInfos` entry: the raw bag plus its decoded signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub raw: StatusMap,
    pub signal: ClusterSignal,
}

impl ClusterInfo {
    pub fn from_command_map(raw: StatusMap) -> Self {
        let signal = match ClusterCommand::decode(&raw) {
            Ok(cmd) => ClusterSignal::Command(cmd),
            Err(e) => {
                let (field, reason) = match e {
                    TaskdError::MalformedSignal { field, reason } => (field, reason),
                    other => (String::new(), other.to_string()),
                };
                ClusterSignal::Malformed {
                    uuid: raw.get(command::UUID).cloned().unwrap_or_default(),
                    field,
                    reason,
                }
            }
        };
        Self { raw, signal }
    }

    /// The decoded command, or the decode failure as an error.
    pub fn command(&self) -> Result<&ClusterCommand, TaskdError> {
        match &self.signal {
            ClusterSignal::Command(cmd) => Ok(cmd),
            ClusterSignal::Malformed { field, reason, .. } => {
                Err(TaskdError::malformed(field, reason))
            }
        }
    }
}
