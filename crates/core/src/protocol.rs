use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TaskdError;
use crate::types::{command, ClusterCommand, StatusMap};

/// Action codes carried in `MsgBody::code`.
pub mod code {
    pub const GENERIC: i32 = 0;
    pub const EXIT_AGENT: i32 = 101;
    pub const RESTART_AGENT: i32 = 102;
    pub const RESTART_TIME: i32 = 103;
    pub const RESTART_WORKERS: i32 = 104;
    pub const HOT_SWITCH: i32 = 105;
    pub const PROCESS_MANAGE_RECOVER_SIGNAL: i32 = 106;
}

/// `MsgBody::msg_type` of every action message.
pub const ACTION_MSG_TYPE: &str = "Action";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Position {
    pub role: String,
    pub name: String,
}

impl Position {
    pub fn new(role: &str, name: &str) -> Self {
        Self {
            role: role.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.role, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BizType {
    AgentStatus,
    WorkerStatus,
    ClusterCommand,
    ManagerStatus,
    Action,
    Ack,
    /// Upstream report to the cluster controller.
    ControllerReport,
}

/// Frame exchanged with agents, workers and the cluster controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseMessage {
    pub uuid: String,
    pub biz_type: BizType,
    pub src: Position,
    pub dst: Position,
    /// JSON-encoded payload, interpreted according to `biz_type`.
    pub body: String,
}

/// A decoded inbound report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Agent { name: String, status: StatusMap },
    Worker { name: String, status: StatusMap },
    Cluster { key: String, command: StatusMap },
    Manager { status: StatusMap },
}

impl BaseMessage {
    /// Decode the body into a report keyed by the sender's identity.
    pub fn decode_report(&self) -> Result<Report, TaskdError> {
        let decode_map = || -> Result<StatusMap, TaskdError> {
            serde_json::from_str(&self.body)
                .map_err(|e| TaskdError::Decode(format!("{:?} body from {}: {}", self.biz_type, self.src, e)))
        };
        match self.biz_type {
            BizType::AgentStatus => Ok(Report::Agent {
                name: self.src.name.clone(),
                status: decode_map()?,
            }),
            BizType::WorkerStatus => Ok(Report::Worker {
                name: self.src.name.clone(),
                status: decode_map()?,
            }),
            BizType::ClusterCommand => Ok(Report::Cluster {
                key: self.src.name.clone(),
                command: decode_map()?,
            }),
            BizType::ManagerStatus => Ok(Report::Manager {
                status: decode_map()?,
            }),
            BizType::Action | BizType::Ack | BizType::ControllerReport => Err(TaskdError::Decode(format!(
                "unexpected inbound {:?} from {}",
                self.biz_type, self.src
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgBody {
    pub msg_type: String,
    pub code: i32,
    pub message: String,
    pub extension: HashMap<String, String>,
}

/// A directed action produced by a manager plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    pub receiver: Vec<String>,
    pub body: MsgBody,
}

impl Msg {
    pub fn action(receiver: Vec<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            receiver,
            body: MsgBody {
                msg_type: ACTION_MSG_TYPE.to_string(),
                code,
                message: message.into(),
                extension: HashMap::new(),
            },
        }
    }

    pub fn with_extension(mut self, key: &str, value: impl Into<String>) -> Self {
        self.body.extension.insert(key.to_string(), value.into());
        self
    }

    /// Attach `Actions`, `ChangeStrategy` and `FaultRanks` from a command.
    pub fn with_command(self, cmd: &ClusterCommand) -> Self {
        let strategy = cmd
            .change_strategy
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        self.with_extension(command::ACTIONS, to_json(&cmd.actions))
            .with_extension(command::CHANGE_STRATEGY, strategy)
            .with_extension(command::FAULT_RANKS, to_json(&cmd.fault_ranks))
    }
}

/// JSON text of a value that always serializes (string lists, int maps).
pub fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// One pending network send, addressed to a single destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub uuid: String,
    pub biz_type: BizType,
    pub body: String,
    pub dst: Position,
}

impl SendRequest {
    pub fn into_message(self, src: Position) -> BaseMessage {
        BaseMessage {
            uuid: self.uuid,
            biz_type: self.biz_type,
            src,
            dst: self.dst,
            body: self.body,
        }
    }
}

/// Acknowledgement returned to a sender when its frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub uuid: String,
    pub code: i32,
    pub message: String,
}

impl Ack {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;

    pub fn failed(uuid: &str, message: impl Into<String>) -> Self {
        Self {
            uuid: uuid.to_string(),
            code: Self::FAILED,
            message: message.into(),
        }
    }
}
