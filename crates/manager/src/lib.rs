pub mod arbiter;
pub mod plugins;
pub mod queue;
pub mod reset_config;
pub mod sender;
pub mod store;

#[cfg(test)]
pub(crate) mod tests_common;

use std::collections::HashMap;

use taskd_core::protocol::Msg;
use taskd_core::TaskdError;

use crate::store::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    Unselected,
    Candidate,
}

/// Outcome of evaluating one plugin against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateResult {
    pub plugin_name: String,
    pub candidate_status: CandidateStatus,
    /// Streams the plugin wants while it holds the token, stream name -> plugin.
    pub predicate_stream: HashMap<String, String>,
}

impl PredicateResult {
    pub fn unselected(plugin_name: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            candidate_status: CandidateStatus::Unselected,
            predicate_stream: HashMap::new(),
        }
    }

    pub fn candidate(plugin_name: &str, stream: &str) -> Self {
        let mut predicate_stream = HashMap::new();
        predicate_stream.insert(stream.to_string(), plugin_name.to_string());
        Self {
            plugin_name: plugin_name.to_string(),
            candidate_status: CandidateStatus::Candidate,
            predicate_stream,
        }
    }

    pub fn is_candidate(&self) -> bool {
        self.candidate_status == CandidateStatus::Candidate
    }
}

/// Progress of the token holder's episode after `handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Episode still running, re-invoke next tick.
    Process,
    /// Episode complete, token released.
    Final,
    /// Episode aborted, token released and messages dropped.
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleResult {
    pub stage: Stage,
}

impl HandleResult {
    pub fn process() -> Self {
        Self { stage: Stage::Process }
    }

    pub fn finished() -> Self {
        Self { stage: Stage::Final }
    }
}

/// Contract shared by all recovery strategies driven by the arbiter.
///
/// Within one tick the arbiter calls `predicate`, then (if selected) `handle`
/// and `pull_msg`, always in that order.
pub trait ManagerPlugin: Send {
    fn name(&self) -> &str;

    /// Decide whether this plugin wants the token for the current snapshot.
    fn predicate(&mut self, snapshot: &Snapshot) -> Result<PredicateResult, TaskdError>;

    /// Advance the plugin's state machine by one tick.
    fn handle(&mut self) -> Result<HandleResult, TaskdError>;

    /// Drain the outbound buffer.
    fn pull_msg(&mut self) -> Result<Vec<Msg>, TaskdError>;

    /// Drop episode state after the token is released.
    fn release(&mut self) -> Result<(), TaskdError>;
}

pub use arbiter::Arbiter;
pub use plugins::{ElasticTrainingPlugin, HotSwitchPlugin, PodReschedulingPlugin, RecoverPlugin};
pub use store::SnapshotStore;
