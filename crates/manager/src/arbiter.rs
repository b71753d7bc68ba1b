use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskd_core::protocol::Msg;
use taskd_core::TaskdError;

use crate::sender::MessageSender;
use crate::store::{Snapshot, SnapshotStore};
use crate::{CandidateStatus, ManagerPlugin, Stage};

/// What one tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub plugin: String,
    pub stage: Stage,
    pub msgs: Vec<Msg>,
}

/// Owns the plugins in priority order and the single recovery token.
///
/// If a plugin holds the token only that plugin is evaluated; otherwise the
/// first plugin (in registration order) returning `Candidate` wins the tick.
pub struct Arbiter {
    plugins: Vec<Box<dyn ManagerPlugin>>,
    holder: Option<usize>,
    store: Arc<SnapshotStore>,
    sender: MessageSender,
}

impl Arbiter {
    pub fn new(store: Arc<SnapshotStore>, sender: MessageSender) -> Self {
        Self {
            plugins: Vec::new(),
            holder: None,
            store,
            sender,
        }
    }

    /// Register a plugin after all previously registered ones.
    ///
    /// Returns an error if a plugin with the same name is already registered.
    pub fn register(&mut self, plugin: Box<dyn ManagerPlugin>) -> Result<&mut Self, TaskdError> {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(TaskdError::plugin(plugin.name(), "already registered"));
        }
        info!("Registered plugin {} (priority {})", plugin.name(), self.plugins.len());
        self.plugins.push(plugin);
        Ok(self)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn token_holder(&self) -> Option<&str> {
        self.holder.map(|idx| self.plugins[idx].name())
    }

    /// Run arbitration against one snapshot.
    pub fn decide(&mut self, snapshot: &Snapshot) -> Option<Decision> {
        let mut skip = None;
        if let Some(idx) = self.holder {
            if self.is_candidate(idx, snapshot) {
                return Some(self.drive(idx));
            }
            info!("{} gave up the token", self.plugins[idx].name());
            self.holder = None;
            self.release(idx);
            skip = Some(idx);
        }

        for idx in 0..self.plugins.len() {
            if Some(idx) == skip {
                continue;
            }
            if self.is_candidate(idx, snapshot) {
                info!("{} acquired the token", self.plugins[idx].name());
                return Some(self.drive(idx));
            }
        }
        None
    }

    /// Snapshot the store, decide, and queue the winner's messages.
    pub async fn tick(&mut self) -> Option<Decision> {
        let snapshot = self.store.snapshot();
        let decision = self.decide(&snapshot)?;
        for msg in &decision.msgs {
            if let Err(e) = self.sender.send_msg(msg.clone()).await {
                error!("{}: failed to queue message: {}", decision.plugin, e);
            }
        }
        Some(decision)
    }

    /// Tick on a fixed interval until cancelled.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        info!(
            "Arbitration loop started, plugins={:?} interval={:?}",
            self.plugin_names(),
            interval
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(d) = self.tick().await {
                        debug!("Tick: {} -> {:?}, {} messages", d.plugin, d.stage, d.msgs.len());
                    }
                }
            }
        }
        if let Some(idx) = self.holder.take() {
            self.release(idx);
        }
        info!("Arbitration loop stopped");
    }

    fn is_candidate(&mut self, idx: usize, snapshot: &Snapshot) -> bool {
        let plugin = &mut self.plugins[idx];
        match plugin.predicate(snapshot) {
            Ok(result) => {
                if result.candidate_status == CandidateStatus::Candidate {
                    debug!("{} candidate, streams={:?}", plugin.name(), result.predicate_stream);
                }
                result.candidate_status == CandidateStatus::Candidate
            }
            Err(e) => {
                warn!("{} predicate failed: {}", plugin.name(), e);
                false
            }
        }
    }

    fn drive(&mut self, idx: usize) -> Decision {
        let plugin = &mut self.plugins[idx];
        let name = plugin.name().to_string();

        let stage = match plugin.handle() {
            Ok(result) => result.stage,
            Err(e) => {
                warn!("{} handle failed: {}", name, e);
                Stage::Exception
            }
        };
        let mut msgs = plugin.pull_msg().unwrap_or_else(|e| {
            warn!("{} pull_msg failed: {}", name, e);
            Vec::new()
        });

        match stage {
            Stage::Process => self.holder = Some(idx),
            Stage::Final => {
                info!("{} finished its episode", name);
                self.holder = None;
                self.release(idx);
            }
            Stage::Exception => {
                if !msgs.is_empty() {
                    warn!("{} aborted, dropping {} messages", name, msgs.len());
                }
                msgs.clear();
                self.holder = None;
                self.release(idx);
            }
        }

        Decision {
            plugin: name,
            stage,
            msgs,
        }
    }

    fn release(&mut self, idx: usize) {
        let plugin = &mut self.plugins[idx];
        if let Err(e) = plugin.release() {
            warn!("{} release failed: {}", plugin.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::plugins::{ElasticTrainingPlugin, HotSwitchPlugin, RecoverPlugin};
    use crate::tests_common::*;
    use crate::{HandleResult, PredicateResult};
    use taskd_core::protocol::code;
    use taskd_core::types::{command, CLUSTER_KEY};

    /// Candidate until its scripted stages run out; one message per handle.
    struct Scripted {
        name: &'static str,
        stages: Vec<Stage>,
        handled: usize,
        pending: Vec<Msg>,
    }

    impl Scripted {
        fn new(name: &'static str, stages: Vec<Stage>) -> Self {
            Self {
                name,
                stages,
                handled: 0,
                pending: Vec::new(),
            }
        }
    }

    impl ManagerPlugin for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn predicate(&mut self, _snapshot: &Snapshot) -> Result<PredicateResult, TaskdError> {
            if self.handled < self.stages.len() {
                Ok(PredicateResult::candidate(self.name, "test"))
            } else {
                Ok(PredicateResult::unselected(self.name))
            }
        }

        fn handle(&mut self) -> Result<HandleResult, TaskdError> {
            let stage = self.stages[self.handled];
            self.handled += 1;
            self.pending.push(Msg::action(vec!["Controller".into()], code::GENERIC, self.name));
            Ok(HandleResult { stage })
        }

        fn pull_msg(&mut self) -> Result<Vec<Msg>, TaskdError> {
            Ok(std::mem::take(&mut self.pending))
        }

        fn release(&mut self) -> Result<(), TaskdError> {
            Ok(())
        }
    }

    fn arbiter() -> (Arbiter, tokio::sync::mpsc::Receiver<taskd_core::protocol::SendRequest>) {
        let (sender, rx) = MessageSender::new(64);
        (Arbiter::new(Arc::new(SnapshotStore::new()), sender), rx)
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (mut arb, _rx) = arbiter();
        arb.register(Box::new(HotSwitchPlugin::new())).unwrap();
        assert!(arb.register(Box::new(HotSwitchPlugin::new())).is_err());
    }

    #[test]
    fn test_first_candidate_wins_and_holds_token() {
        let (mut arb, _rx) = arbiter();
        arb.register(Box::new(Scripted::new("first", vec![Stage::Process, Stage::Final])))
            .unwrap();
        arb.register(Box::new(Scripted::new("second", vec![Stage::Final])))
            .unwrap();
        let snap = Snapshot::default();

        let d = arb.decide(&snap).unwrap();
        assert_eq!(d.plugin, "first");
        assert_eq!(d.stage, Stage::Process);
        assert_eq!(arb.token_holder(), Some("first"));

        let d = arb.decide(&snap).unwrap();
        assert_eq!(d.plugin, "first");
        assert_eq!(d.stage, Stage::Final);
        assert_eq!(arb.token_holder(), None);

        let d = arb.decide(&snap).unwrap();
        assert_eq!(d.plugin, "second");
        assert!(arb.decide(&snap).is_none());
    }

    #[test]
    fn test_exception_drops_messages_and_releases() {
        let (mut arb, _rx) = arbiter();
        arb.register(Box::new(Scripted::new("boom", vec![Stage::Exception])))
            .unwrap();
        let d = arb.decide(&Snapshot::default()).unwrap();
        assert_eq!(d.stage, Stage::Exception);
        assert!(d.msgs.is_empty());
        assert_eq!(arb.token_holder(), None);
    }

    #[test]
    fn test_conflicting_plugins_only_one_handles() {
        // hot switch signal that is also a process-recovery strategy
        let snap = command_snapshot(&[
            (command::SIGNAL_TYPE, "HotSwitch"),
            (command::CHANGE_STRATEGY, "retry"),
            (command::ACTIONS, r#"["a"]"#),
            (command::UUID, "c-1"),
        ]);
        let (mut arb, _rx) = arbiter();
        arb.register(Box::new(RecoverPlugin::new())).unwrap();
        arb.register(Box::new(HotSwitchPlugin::new())).unwrap();

        let d = arb.decide(&snap).unwrap();
        assert_eq!(d.plugin, "Recover");
        assert_eq!(d.msgs.len(), 1);
        assert_eq!(d.msgs[0].body.code, code::PROCESS_MANAGE_RECOVER_SIGNAL);

        // recover is done with the episode; hot switch gets its turn next tick
        let d = arb.decide(&snap).unwrap();
        assert_eq!(d.plugin, "HotSwitch");
        assert!(arb.decide(&snap).is_none());
    }

    #[test]
    fn test_holder_blocks_others_until_done() {
        let store = Arc::new(SnapshotStore::new());
        let (sender, _rx) = MessageSender::new(64);
        let mut arb = Arbiter::new(store.clone(), sender);
        arb.register(Box::new(RecoverPlugin::new())).unwrap();
        arb.register(Box::new(ElasticTrainingPlugin::new())).unwrap();

        store.update_cluster(
            CLUSTER_KEY,
            status_map(&[
                (command::SIGNAL_TYPE, "ChangeStrategy"),
                (command::CHANGE_STRATEGY, "ScaleIn"),
                (command::UUID, "e-9"),
            ]),
        );
        let d = arb.decide(&store.snapshot()).unwrap();
        assert_eq!(d.plugin, "ElasticTraining");
        assert_eq!(arb.token_holder(), Some("ElasticTraining"));

        // recover signal arrives while elastic holds the token
        store.update_cluster(
            CLUSTER_KEY,
            status_map(&[
                (command::SIGNAL_TYPE, "ChangeStrategy"),
                (command::CHANGE_STRATEGY, "dump"),
                (command::UUID, "d-1"),
            ]),
        );
        let d = arb.decide(&store.snapshot()).unwrap();
        assert_eq!(d.plugin, "ElasticTraining");
        assert_eq!(d.stage, Stage::Final);

        let d = arb.decide(&store.snapshot()).unwrap();
        assert_eq!(d.plugin, "Recover");
    }

    #[test]
    fn test_stuck_rescheduling_yields_to_save_and_exit() {
        let store = Arc::new(SnapshotStore::new());
        let (sender, _rx) = MessageSender::new(64);
        let mut arb = Arbiter::new(store.clone(), sender);
        arb.register(Box::new(RecoverPlugin::new())).unwrap();
        arb.register(Box::new(
            crate::PodReschedulingPlugin::new(PathBuf::from("/nonexistent/reset.json"), 3)
                .with_stop_wait(Duration::ZERO),
        ))
        .unwrap();

        store.update_agent("Agent0", status_map(&[]));
        store.update_agent("Agent1", status_map(&[("FaultRank", "1")]));
        let d = arb.decide(&store.snapshot()).unwrap();
        assert_eq!(d.plugin, "PodRescheduling");
        assert_eq!(d.stage, Stage::Process);

        // Agent1 never stops; a save-and-exit arrives meanwhile
        store.update_cluster(
            CLUSTER_KEY,
            status_map(&[
                (command::SIGNAL_TYPE, "SaveAndExit"),
                (command::NODE_RANK_IDS, r#"["1"]"#),
                (command::UUID, "s-9"),
            ]),
        );
        let d = arb.decide(&store.snapshot()).unwrap();
        assert_eq!(d.plugin, "PodRescheduling");
        assert_eq!(d.stage, Stage::Exception);
        assert_eq!(arb.token_holder(), None);

        let d = arb.decide(&store.snapshot()).unwrap();
        assert_eq!(d.plugin, "Recover");
        assert_eq!(d.stage, Stage::Final);
    }

    #[tokio::test]
    async fn test_tick_queues_messages() {
        let store = Arc::new(SnapshotStore::new());
        let (sender, mut rx) = MessageSender::new(64);
        let mut arb = Arbiter::new(store.clone(), sender);
        arb.register(Box::new(RecoverPlugin::new())).unwrap();
        arb.register(Box::new(crate::PodReschedulingPlugin::new(
            PathBuf::from("/nonexistent/reset.json"),
            3,
        )))
        .unwrap();

        store.update_cluster(
            CLUSTER_KEY,
            status_map(&[
                (command::SIGNAL_TYPE, "SaveAndExit"),
                (command::NODE_RANK_IDS, r#"["0","1"]"#),
                (command::UUID, "s-1"),
            ]),
        );
        let d = arb.tick().await.unwrap();
        assert_eq!(d.msgs.len(), 3);

        let mut dsts = Vec::new();
        while let Ok(req) = rx.try_recv() {
            dsts.push(req.dst.name);
        }
        assert_eq!(dsts, vec!["Controller", "Agent0", "Agent1"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (arb, _rx) = arbiter();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(arb.run(Duration::from_millis(5), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
