use std::collections::HashSet;

use tracing::{debug, info};

use taskd_core::protocol::{code, to_json, Msg};
use taskd_core::types::{command, ClusterCommand, SignalType, Strategy, CONTROLLER};
use taskd_core::TaskdError;

use super::{read_command, CommandRead, SignalKey, CLUSTER_STREAM, ELASTIC_TRAINING};
use crate::store::Snapshot;
use crate::{HandleResult, ManagerPlugin, PredicateResult};

/// Drives scale-in / scale-out changes requested by the cluster controller.
///
/// Once the token is taken it is kept until the controller stops asking for
/// an elastic strategy.
pub struct ElasticTrainingPlugin {
    has_token: bool,
    current: Option<ClusterCommand>,
    emitted: HashSet<SignalKey>,
    pending: Vec<Msg>,
}

impl ElasticTrainingPlugin {
    pub fn new() -> Self {
        Self {
            has_token: false,
            current: None,
            emitted: HashSet::new(),
            pending: Vec::new(),
        }
    }

    fn is_elastic(cmd: &ClusterCommand) -> bool {
        cmd.is_signal(&SignalType::ChangeStrategy)
            && cmd.change_strategy.as_ref().is_some_and(Strategy::is_elastic)
    }

    fn current_is_elastic(&self) -> bool {
        self.current.as_ref().is_some_and(Self::is_elastic)
    }

    fn build_messages(cmd: &ClusterCommand) -> Vec<Msg> {
        let strategy = cmd
            .change_strategy
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        let mut msgs = vec![Msg::action(vec![CONTROLLER.to_string()], code::GENERIC, strategy)
            .with_command(cmd)
            .with_extension(command::NODE_RANK_IDS, to_json(&cmd.node_rank_ids))
            .with_extension(command::UUID, cmd.uuid.clone())];

        if cmd.is_strategy(&Strategy::ScaleIn) {
            for agent in cmd.node_agents() {
                msgs.push(Msg::action(vec![agent], code::EXIT_AGENT, cmd.uuid.clone()));
            }
        }
        msgs
    }

    fn reset(&mut self) {
        self.has_token = false;
        self.current = None;
        self.emitted.clear();
        self.pending.clear();
    }
}

impl Default for ElasticTrainingPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerPlugin for ElasticTrainingPlugin {
    fn name(&self) -> &str {
        ELASTIC_TRAINING
    }

    fn predicate(&mut self, snapshot: &Snapshot) -> Result<PredicateResult, TaskdError> {
        self.current = match read_command(snapshot, ELASTIC_TRAINING) {
            CommandRead::Present(cmd) => Some(cmd),
            CommandRead::Absent | CommandRead::Malformed => None,
        };

        if self.has_token {
            return Ok(PredicateResult::candidate(ELASTIC_TRAINING, CLUSTER_STREAM));
        }

        if self.current_is_elastic() {
            self.has_token = true;
            info!(
                "{}: token acquired for {:?}",
                ELASTIC_TRAINING,
                self.current.as_ref().and_then(|c| c.change_strategy.clone())
            );
            return Ok(PredicateResult::candidate(ELASTIC_TRAINING, CLUSTER_STREAM));
        }

        Ok(PredicateResult::unselected(ELASTIC_TRAINING))
    }

    fn handle(&mut self) -> Result<HandleResult, TaskdError> {
        if self.current_is_elastic() {
            return Ok(HandleResult::process());
        }
        info!("{}: elastic strategy withdrawn, releasing token", ELASTIC_TRAINING);
        self.reset();
        Ok(HandleResult::finished())
    }

    fn pull_msg(&mut self) -> Result<Vec<Msg>, TaskdError> {
        if self.has_token {
            if let Some(cmd) = self.current.as_ref().filter(|c| Self::is_elastic(c)) {
                if self.emitted.insert(SignalKey::of(cmd)) {
                    self.pending.extend(Self::build_messages(cmd));
                } else {
                    debug!("{}: signal already emitted, skipping", ELASTIC_TRAINING);
                }
            }
        }
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
    use crate::{CandidateStatus, Stage};

    fn scale(strategy: &str, actions: &str) -> Snapshot {
        command_snapshot(&[
            (command::SIGNAL_TYPE, "ChangeStrategy"),
            (command::CHANGE_STRATEGY, strategy),
            (command::ACTIONS, actions),
            (command::NODE_RANK_IDS, r#"["2"]"#),
            (command::UUID, "e-1"),
        ])
    }

    #[test]
    fn test_scale_in_acquires_token_and_emits_once() {
        let mut plugin = ElasticTrainingPlugin::new();
        let snap = scale("ScaleIn", r#"["scale"]"#);

        assert!(plugin.predicate(&snap).unwrap().is_candidate());
        assert_eq!(plugin.handle().unwrap().stage, Stage::Process);
        let msgs = plugin.pull_msg().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].receiver, vec![CONTROLLER]);
        assert_eq!(msgs[0].body.message, "ScaleIn");
        assert_eq!(msgs[1].receiver, vec!["Agent2"]);
        assert_eq!(msgs[1].body.code, code::EXIT_AGENT);

        // identical state on the next tick: still holding, nothing new
        assert!(plugin.predicate(&snap).unwrap().is_candidate());
        assert_eq!(plugin.handle().unwrap().stage, Stage::Process);
        assert!(plugin.pull_msg().unwrap().is_empty());
    }

    #[test]
    fn test_new_actions_emit_again() {
        let mut plugin = ElasticTrainingPlugin::new();
        plugin.predicate(&scale("ScaleOut", r#"["a"]"#)).unwrap();
        plugin.handle().unwrap();
        assert_eq!(plugin.pull_msg().unwrap().len(), 1);

        plugin.predicate(&scale("ScaleOut", r#"["b"]"#)).unwrap();
        plugin.handle().unwrap();
        assert_eq!(plugin.pull_msg().unwrap().len(), 1);
    }

    #[test]
    fn test_strategy_change_finalizes_and_releases() {
        let mut plugin = ElasticTrainingPlugin::new();
        plugin.predicate(&scale("ScaleIn", r#"["a"]"#)).unwrap();
        plugin.handle().unwrap();
        plugin.pull_msg().unwrap();

        let unrelated = scale("Unrelated", r#"["a"]"#);
        // token latched: still a candidate so it can wind down
        assert!(plugin.predicate(&unrelated).unwrap().is_candidate());
        assert_eq!(plugin.handle().unwrap().stage, Stage::Final);
        assert!(plugin.pull_msg().unwrap().is_empty());

        let result = plugin.predicate(&unrelated).unwrap();
        assert_eq!(result.candidate_status, CandidateStatus::Unselected);
    }

    #[test]
    fn test_other_signal_types_ignored() {
        let mut plugin = ElasticTrainingPlugin::new();
        let snap = command_snapshot(&[
            (command::SIGNAL_TYPE, "HotSwitch"),
            (command::CHANGE_STRATEGY, "ScaleIn"),
        ]);
        assert!(!plugin.predicate(&snap).unwrap().is_candidate());
    }

    #[test]
    fn test_malformed_or_missing_cluster_is_unselected() {
        let mut plugin = ElasticTrainingPlugin::new();
        assert!(!plugin.predicate(&Snapshot::default()).unwrap().is_candidate());

        let bad = command_snapshot(&[
            (command::SIGNAL_TYPE, "ChangeStrategy"),
            (command::CHANGE_STRATEGY, "ScaleIn"),
            (command::NODE_RANK_IDS, "[1,"),
        ]);
        assert!(!plugin.predicate(&bad).unwrap().is_candidate());
    }
}
