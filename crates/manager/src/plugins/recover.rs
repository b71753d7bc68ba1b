use tracing::{debug, info};

use taskd_core::protocol::{code, to_json, Msg};
use taskd_core::types::{command, ClusterCommand, SignalType, Strategy, CONTROLLER, SAVE_AND_EXIT_ACTION};
use taskd_core::TaskdError;

use super::{read_command, CommandRead, EpisodeKey, CLUSTER_STREAM, RECOVER};
use crate::store::Snapshot;
use crate::{HandleResult, ManagerPlugin, PredicateResult};

/// Save-and-exit and process-level recovery (retry, recover, dump, continue).
pub struct RecoverPlugin {
    last_save_uuid: String,
    save_and_exit: bool,
    /// Last strategy episode taken, and whether it completed.
    episode: Option<EpisodeKey>,
    done: bool,
    command: Option<ClusterCommand>,
    recover_in_place: bool,
    msg_send: bool,
    pending: Vec<Msg>,
}

impl RecoverPlugin {
    pub fn new() -> Self {
        Self {
            last_save_uuid: String::new(),
            save_and_exit: false,
            episode: None,
            done: false,
            command: None,
            recover_in_place: false,
            msg_send: false,
            pending: Vec::new(),
        }
    }

    /// Clear per-episode state. The handled-episode record survives.
    fn reset(&mut self) {
        self.save_and_exit = false;
        self.command = None;
        self.recover_in_place = false;
        self.msg_send = false;
        self.pending.clear();
    }

    fn controller_msg(cmd: &ClusterCommand, strategy: &str) -> Msg {
        Msg::action(
            vec![CONTROLLER.to_string()],
            code::PROCESS_MANAGE_RECOVER_SIGNAL,
            strategy.to_string(),
        )
        .with_command(cmd)
        .with_extension(command::UUID, cmd.uuid.clone())
    }

    fn exit_msgs(cmd: &ClusterCommand) -> Vec<Msg> {
        cmd.node_agents()
            .into_iter()
            .map(|agent| Msg::action(vec![agent], code::EXIT_AGENT, cmd.uuid.clone()))
            .collect()
    }

    fn handle_save_and_exit(&mut self, cmd: &ClusterCommand) -> HandleResult {
        info!("{}: save and exit for uuid={}", RECOVER, cmd.uuid);
        let controller = Self::controller_msg(cmd, "")
            .with_extension(command::ACTIONS, to_json(&[SAVE_AND_EXIT_ACTION]));
        self.pending.push(controller);
        self.pending.extend(Self::exit_msgs(cmd));
        self.finish()
    }

    fn handle_strategy(&mut self, cmd: &ClusterCommand, strategy: &Strategy) -> HandleResult {
        match strategy {
            Strategy::Recover if self.recover_in_place => {
                let ranks: Vec<i32> = cmd.fault_ranks.keys().copied().collect();
                self.pending.push(Self::controller_msg(cmd, strategy.as_str()));
                for agent in cmd.node_agents() {
                    self.pending
                        .push(Msg::action(vec![agent], code::RESTART_WORKERS, to_json(&ranks)));
                }
                self.finish()
            }
            Strategy::Recover if !self.msg_send => {
                self.pending.extend(Self::exit_msgs(cmd));
                self.msg_send = true;
                info!(
                    "{}: exit sent to {} nodes, waiting one tick before applying",
                    RECOVER,
                    cmd.node_rank_ids.len()
                );
                HandleResult::process()
            }
            _ => {
                self.pending.push(Self::controller_msg(cmd, strategy.as_str()));
                self.finish()
            }
        }
    }

    fn finish(&mut self) -> HandleResult {
        if !self.save_and_exit {
            self.done = true;
        }
        self.save_and_exit = false;
        self.command = None;
        self.msg_send = false;
        self.recover_in_place = false;
        HandleResult::finished()
    }
}

impl Default for RecoverPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerPlugin for RecoverPlugin {
    fn name(&self) -> &str {
        RECOVER
    }

    fn predicate(&mut self, snapshot: &Snapshot) -> Result<PredicateResult, TaskdError> {
        let cmd = match read_command(snapshot, RECOVER) {
            CommandRead::Present(cmd) => cmd,
            CommandRead::Absent => return Ok(PredicateResult::unselected(RECOVER)),
            CommandRead::Malformed => {
                self.reset();
                return Ok(PredicateResult::unselected(RECOVER));
            }
        };

        if cmd.is_signal(&SignalType::SaveAndExit) && cmd.uuid != self.last_save_uuid {
            info!("{}: save-and-exit signal uuid={}", RECOVER, cmd.uuid);
            self.last_save_uuid = cmd.uuid.clone();
            self.save_and_exit = true;
            self.command = Some(cmd);
            return Ok(PredicateResult::candidate(RECOVER, CLUSTER_STREAM));
        }

        let strategy = match cmd.change_strategy.clone() {
            Some(s) if s.is_process_recovery() => s,
            _ => return Ok(PredicateResult::unselected(RECOVER)),
        };

        let key = EpisodeKey {
            uuid: cmd.uuid.clone(),
            strategy,
        };
        if self.episode.as_ref() == Some(&key) {
            if self.done {
                debug!("{}: episode {} already handled", RECOVER, key.uuid);
                return Ok(PredicateResult::unselected(RECOVER));
            }
            if self.command.is_some() {
                return Ok(PredicateResult::candidate(RECOVER, CLUSTER_STREAM));
            }
        }

        info!(
            "{}: strategy {} selected for uuid={}",
            RECOVER, key.strategy, key.uuid
        );
        self.reset();
        self.recover_in_place = cmd.recover_in_place();
        self.command = Some(cmd);
        self.episode = Some(key);
        self.done = false;
        Ok(PredicateResult::candidate(RECOVER, CLUSTER_STREAM))
    }

    fn handle(&mut self) -> Result<HandleResult, TaskdError> {
        let cmd = self
            .command
            .clone()
            .ok_or_else(|| TaskdError::plugin(RECOVER, "handle called without a signal"))?;

        if self.save_and_exit {
            return Ok(self.handle_save_and_exit(&cmd));
        }

        let strategy = self
            .episode
            .as_ref()
            .map(|e| e.strategy.clone())
            .ok_or_else(|| TaskdError::plugin(RECOVER, "no recovery episode recorded"))?;
        Ok(self.handle_strategy(&cmd, &strategy))
    }

    fn pull_msg(&mut self) -> Result<Vec<Msg>, TaskdError> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn release(&mut self) -> Result<(), TaskdError> {
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_common::*;
    use crate::Stage;

    fn strategy(strategy: &str, uuid: &str, extra: &str) -> Snapshot {
        command_snapshot(&[
            (command::SIGNAL_TYPE, "ChangeStrategy"),
            (command::CHANGE_STRATEGY, strategy),
            (command::ACTIONS, r#"["stop"]"#),
            (command::FAULT_RANKS, r#"{"8":1,"9":1}"#),
            (command::NODE_RANK_IDS, r#"["1"]"#),
            (command::UUID, uuid),
            (command::EXTRA_PARAMS, extra),
        ])
    }

    #[test]
    fn test_recover_two_tick_protocol() {
        let mut plugin = RecoverPlugin::new();
        let snap = strategy("recover", "r-1", "");

        assert!(plugin.predicate(&snap).unwrap().is_candidate());
        assert_eq!(plugin.handle().unwrap().stage, Stage::Process);
        let msgs = plugin.pull_msg().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body.code, code::EXIT_AGENT);
        assert_eq!(msgs[0].receiver, vec!["Agent1"]);

        assert!(plugin.predicate(&snap).unwrap().is_candidate());
        assert_eq!(plugin.handle().unwrap().stage, Stage::Final);
        let msgs = plugin.pull_msg().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body.code, code::PROCESS_MANAGE_RECOVER_SIGNAL);
        assert_eq!(msgs[0].receiver, vec![CONTROLLER]);
        assert_eq!(msgs[0].body.extension[command::CHANGE_STRATEGY], "recover");

        // episode done: same snapshot no longer selects
        assert!(!plugin.predicate(&snap).unwrap().is_candidate());
    }

    #[test]
    fn test_recover_in_place_single_tick() {
        let mut plugin = RecoverPlugin::new();
        let snap = strategy("recover", "r-2", "recover-in-place");

        assert!(plugin.predicate(&snap).unwrap().is_candidate());
        assert_eq!(plugin.handle().unwrap().stage, Stage::Final);
        let msgs = plugin.pull_msg().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].body.code, code::PROCESS_MANAGE_RECOVER_SIGNAL);
        assert_eq!(msgs[1].body.code, code::RESTART_WORKERS);
        assert_eq!(msgs[1].receiver, vec!["Agent1"]);
        assert_eq!(msgs[1].body.message, "[8,9]");
    }

    #[test]
    fn test_single_tick_strategies() {
        for name in ["retry", "dump", "continue"] {
            let mut plugin = RecoverPlugin::new();
            let snap = strategy(name, "s-1", "");
            assert!(plugin.predicate(&snap).unwrap().is_candidate(), "{}", name);
            assert_eq!(plugin.handle().unwrap().stage, Stage::Final);
            let msgs = plugin.pull_msg().unwrap();
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0].body.message, name);
            assert!(!plugin.predicate(&snap).unwrap().is_candidate());
        }
    }

    #[test]
    fn test_strategy_change_same_uuid_is_new_episode() {
        let mut plugin = RecoverPlugin::new();
        plugin.predicate(&strategy("retry", "s-2", "")).unwrap();
        plugin.handle().unwrap();
        plugin.pull_msg().unwrap();

        assert!(plugin.predicate(&strategy("dump", "s-2", "")).unwrap().is_candidate());
    }

    #[test]
    fn test_save_and_exit_messages() {
        let mut plugin = RecoverPlugin::new();
        let snap = command_snapshot(&[
            (command::SIGNAL_TYPE, "SaveAndExit"),
            (command::NODE_RANK_IDS, r#"["0","1"]"#),
            (command::UUID, "save-1"),
        ]);

        assert!(plugin.predicate(&snap).unwrap().is_candidate());
        assert_eq!(plugin.handle().unwrap().stage, Stage::Final);
        let msgs = plugin.pull_msg().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].receiver, vec![CONTROLLER]);
        assert_eq!(msgs[0].body.extension[command::ACTIONS], r#"["SaveAndExit"]"#);
        assert_eq!(msgs[1].receiver, vec!["Agent0"]);
        assert_eq!(msgs[2].receiver, vec!["Agent1"]);
        assert!(msgs[1..].iter().all(|m| m.body.code == code::EXIT_AGENT));

        assert!(!plugin.predicate(&snap).unwrap().is_candidate());
    }

    #[test]
    fn test_malformed_aborts() {
        let mut plugin = RecoverPlugin::new();
        let snap = command_snapshot(&[
            (command::CHANGE_STRATEGY, "retry"),
            (command::ACTIONS, "not-json"),
            (command::UUID, "bad"),
        ]);
        assert!(!plugin.predicate(&snap).unwrap().is_candidate());
    }

    #[test]
    fn test_release_mid_episode_allows_restart() {
        let mut plugin = RecoverPlugin::new();
        let snap = strategy("recover", "r-3", "");
        plugin.predicate(&snap).unwrap();
        assert_eq!(plugin.handle().unwrap().stage, Stage::Process);
        plugin.pull_msg().unwrap();
        plugin.release().unwrap();

        // incomplete episode: starts over from the exit round
        assert!(plugin.predicate(&snap).unwrap().is_candidate());
        assert_eq!(plugin.handle().unwrap().stage, Stage::Process);
        assert_eq!(plugin.pull_msg().unwrap()[0].body.code, code::EXIT_AGENT);
    }
}
