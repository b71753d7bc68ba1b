use tracing::{debug, info};

use taskd_core::protocol::{code, Msg};
use taskd_core::types::{ClusterCommand, SignalType, Strategy, CONTROLLER};
use taskd_core::TaskdError;

use super::{read_command, CommandRead, SignalKey, CLUSTER_STREAM, HOT_SWITCH};
use crate::store::Snapshot;
use crate::{HandleResult, ManagerPlugin, PredicateResult};

/// Forwards hot-switch / process-migration decisions to the controller.
pub struct HotSwitchPlugin {
    last_seen: Option<SignalKey>,
    command: Option<ClusterCommand>,
    pending: Vec<Msg>,
}

impl HotSwitchPlugin {
    pub fn new() -> Self {
        Self {
            last_seen: None,
            command: None,
            pending: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.command = None;
        self.pending.clear();
    }
}

impl Default for HotSwitchPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerPlugin for HotSwitchPlugin {
    fn name(&self) -> &str {
        HOT_SWITCH
    }

    fn predicate(&mut self, snapshot: &Snapshot) -> Result<PredicateResult, TaskdError> {
        let cmd = match read_command(snapshot, HOT_SWITCH) {
            CommandRead::Present(cmd) => cmd,
            CommandRead::Absent => return Ok(PredicateResult::unselected(HOT_SWITCH)),
            CommandRead::Malformed => {
                self.reset();
                return Ok(PredicateResult::unselected(HOT_SWITCH));
            }
        };

        let key = SignalKey::of(&cmd);
        let unchanged = self.last_seen.as_ref() == Some(&key);
        self.last_seen = Some(key);

        if !(cmd.is_signal(&SignalType::HotSwitch) || cmd.is_strategy(&Strategy::Migration)) {
            return Ok(PredicateResult::unselected(HOT_SWITCH));
        }
        if unchanged {
            debug!("{}: signal unchanged since last tick, ignoring", HOT_SWITCH);
            return Ok(PredicateResult::unselected(HOT_SWITCH));
        }
        if cmd.uuid.is_empty() {
            debug!("{}: hot switch signal without uuid, ignoring", HOT_SWITCH);
            self.reset();
            return Ok(PredicateResult::unselected(HOT_SWITCH));
        }

        info!(
            "{}: selected for uuid={} fault_ranks={:?}",
            HOT_SWITCH, cmd.uuid, cmd.fault_ranks
        );
        self.command = Some(cmd);
        Ok(PredicateResult::candidate(HOT_SWITCH, CLUSTER_STREAM))
    }

    fn handle(&mut self) -> Result<HandleResult, TaskdError> {
        let cmd = self
            .command
            .take()
            .ok_or_else(|| TaskdError::plugin(HOT_SWITCH, "handle called without a signal"))?;
        self.pending.push(
            Msg::action(vec![CONTROLLER.to_string()], code::HOT_SWITCH, cmd.uuid.clone())
                .with_command(&cmd),
        );
        Ok(HandleResult::finished())
    }

    fn pull_msg(&mut self) -> Result<Vec<Msg>, TaskdError> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn release(&mut self) -> Result<(), TaskdError> {
        self.command = None;
        Ok(())
    }
}
