use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use uuid::Uuid;

use taskd_core::protocol::{code, to_json, Msg};
use taskd_core::types::{
    command, is_fault_reported, status, Strategy, CONTROLLER, MANAGER_ROLE, RANK0_AGENT,
};
use taskd_core::TaskdError;

use super::{read_command, CommandRead, CLUSTER_STREAM, POD_RESCHEDULING};
use crate::reset_config::read_reset_config;
use crate::store::Snapshot;
use crate::{HandleResult, ManagerPlugin, PredicateResult};

/// Exit-strategy uuids remembered for dedup.
const HANDLED_HISTORY: usize = 32;

/// How long exited agents get to report `StopComplete` when the command
/// carries no `Timeout`.
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(300);

/// Restarts the job by exiting faulted agents and restarting the rest.
///
/// Selection happens on an explicit exit strategy while fault recovery is
/// in progress, on agent fault reports, or on an external change of the
/// reset config's retry counter. Faults reported by rank 0 are never
/// handled here.
pub struct PodReschedulingPlugin {
    reset_config_path: PathBuf,
    restart_times: i64,
    retry_baseline: Option<i64>,
    stop_wait: Duration,
    /// Most recent exit-strategy uuids already acted on, oldest first.
    handled: VecDeque<String>,
    /// Fault set of the last bottom-up episode.
    last_fault_set: Vec<String>,

    episode_id: String,
    exit_agents: Vec<String>,
    healthy_agents: Vec<String>,
    actions: Vec<String>,
    restart_time: String,
    fault_occur: bool,
    retried: Option<i64>,
    from_exit_strategy: bool,
    episode_timeout: Option<Duration>,
    stop_deadline: Option<Instant>,
    sent: bool,
    exit_num: usize,
    pending: Vec<Msg>,
}

impl PodReschedulingPlugin {
    pub fn new(reset_config_path: PathBuf, restart_times: i64) -> Self {
        let retry_baseline = match read_reset_config(&reset_config_path) {
            Ok(info) => info.map(|i| i.retry_time),
            Err(e) => {
                warn!("{}: unreadable reset config at start: {}", POD_RESCHEDULING, e);
                None
            }
        };
        Self {
            reset_config_path,
            restart_times,
            retry_baseline,
            stop_wait: DEFAULT_STOP_WAIT,
            handled: VecDeque::new(),
            last_fault_set: Vec::new(),
            episode_id: String::new(),
            exit_agents: Vec::new(),
            healthy_agents: Vec::new(),
            actions: Vec::new(),
            restart_time: String::new(),
            fault_occur: false,
            retried: None,
            from_exit_strategy: false,
            episode_timeout: None,
            stop_deadline: None,
            sent: false,
            exit_num: 0,
            pending: Vec::new(),
        }
    }

    /// Upper bound on waiting for exited agents when the command sets no
    /// `Timeout`.
    pub fn with_stop_wait(mut self, stop_wait: Duration) -> Self {
        self.stop_wait = stop_wait;
        self
    }

    pub fn restart_times(&self) -> i64 {
        self.restart_times
    }

    pub fn retry_baseline(&self) -> Option<i64> {
        self.retry_baseline
    }

    fn reset(&mut self) {
        self.episode_id.clear();
        self.exit_agents.clear();
        self.healthy_agents.clear();
        self.actions.clear();
        self.restart_time.clear();
        self.fault_occur = false;
        self.retried = None;
        self.from_exit_strategy = false;
        self.episode_timeout = None;
        self.stop_deadline = None;
        self.sent = false;
        self.exit_num = 0;
        self.pending.clear();
    }

    /// Capture the exit set and everything needed to build the batch.
    fn select(&mut self, snapshot: &Snapshot, episode_id: String, exit_agents: Vec<String>) {
        self.episode_id = episode_id;
        self.healthy_agents = snapshot
            .agent_names()
            .into_iter()
            .filter(|a| !exit_agents.contains(a))
            .collect();
        self.exit_agents = exit_agents;
        self.restart_time = latest_restart_time(snapshot);
    }

    fn pending_exits(&self, snapshot: &Snapshot) -> usize {
        self.exit_agents
            .iter()
            .filter(|agent| {
                snapshot
                    .agent_infos
                    .get(*agent)
                    .and_then(|s| s.get(status::STOP_COMPLETE))
                    != Some(&self.episode_id)
            })
            .count()
    }

    /// Path A: explicit exit strategy while fault recovery is in progress.
    fn exit_strategy_requested(&mut self, snapshot: &Snapshot) -> bool {
        if !snapshot.fault_recover_in_progress() {
            return false;
        }
        let cmd = match read_command(snapshot, POD_RESCHEDULING) {
            CommandRead::Present(cmd) => cmd,
            CommandRead::Absent | CommandRead::Malformed => return false,
        };
        if !cmd.is_strategy(&Strategy::Exit) || cmd.uuid.is_empty() {
            return false;
        }
        if self.handled.contains(&cmd.uuid) {
            debug!("{}: exit strategy {} already handled", POD_RESCHEDULING, cmd.uuid);
            return false;
        }
        info!(
            "{}: exit strategy uuid={} nodes={:?}",
            POD_RESCHEDULING, cmd.uuid, cmd.node_rank_ids
        );
        self.actions = cmd.actions.clone();
        self.from_exit_strategy = true;
        self.episode_timeout = cmd.timeout.filter(|t| *t > 0).map(Duration::from_secs);
        self.select(snapshot, cmd.uuid.clone(), cmd.node_agents());
        true
    }

    /// Path C: the external retry counter moved.
    fn retry_counter_changed(&mut self) -> bool {
        let info = match read_reset_config(&self.reset_config_path) {
            Ok(Some(info)) => info,
            Ok(None) => return false,
            Err(e) => {
                debug!("{}: ignoring reset config: {}", POD_RESCHEDULING, e);
                return false;
            }
        };
        match self.retry_baseline {
            None => {
                self.retry_baseline = Some(info.retry_time);
                false
            }
            Some(baseline) if baseline != info.retry_time => {
                info!(
                    "{}: retry counter changed {} -> {}",
                    POD_RESCHEDULING, baseline, info.retry_time
                );
                self.retried = Some(info.retry_time);
                true
            }
            Some(_) => false,
        }
    }

    fn handle_retried(&mut self, retry_time: i64, snapshot_agents: &[String]) -> HandleResult {
        self.restart_times = (self.restart_times - 1).max(0);
        self.retry_baseline = Some(retry_time);
        if !snapshot_agents.is_empty() {
            self.pending.push(Msg::action(
                snapshot_agents.to_vec(),
                code::RESTART_AGENT,
                retry_time.to_string(),
            ));
        }
        self.pending.push(Msg::action(
            vec![MANAGER_ROLE.to_string()],
            code::RESTART_TIME,
            self.restart_times.to_string(),
        ));
        info!(
            "{}: retried, {} restarts left",
            POD_RESCHEDULING, self.restart_times
        );
        self.finish()
    }

    fn emit_batch(&mut self) {
        for agent in &self.exit_agents {
            self.pending.push(
                Msg::action(vec![agent.clone()], code::EXIT_AGENT, self.episode_id.clone())
                    .with_extension(command::ACTIONS, to_json(&self.actions)),
            );
        }
        for agent in &self.healthy_agents {
            self.pending.push(Msg::action(
                vec![agent.clone()],
                code::RESTART_AGENT,
                self.episode_id.clone(),
            ));
        }
        self.pending.push(Msg::action(
            vec![MANAGER_ROLE.to_string()],
            code::RESTART_TIME,
            self.restart_time.clone(),
        ));
        self.pending.push(
            Msg::action(
                vec![CONTROLLER.to_string()],
                code::RESTART_AGENT,
                self.episode_id.clone(),
            )
            .with_extension(command::NODE_RANK_IDS, to_json(&self.exit_agents))
            .with_extension(command::UUID, self.episode_id.clone()),
        );
    }

    fn mark_handled(&mut self) {
        if !self.from_exit_strategy || self.handled.contains(&self.episode_id) {
            return;
        }
        self.handled.push_back(self.episode_id.clone());
        while self.handled.len() > HANDLED_HISTORY {
            self.handled.pop_front();
        }
    }

    fn finish(&mut self) -> HandleResult {
        // keep the drained batch, drop everything else
        let pending = std::mem::take(&mut self.pending);
        self.reset();
        self.pending = pending;
        HandleResult::finished()
    }
}

/// Latest restart time reported by any agent, or now.
fn latest_restart_time(snapshot: &Snapshot) -> String {
    snapshot
        .agent_infos
        .values()
        .filter_map(|s| s.get(status::RESTART_TIME))
        .filter_map(|v| v.parse::<i64>().ok())
        .max()
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default()
        })
        .to_string()
}

impl ManagerPlugin for PodReschedulingPlugin {
    fn name(&self) -> &str {
        POD_RESCHEDULING
    }

    fn predicate(&mut self, snapshot: &Snapshot) -> Result<PredicateResult, TaskdError> {
        if self.sent {
            self.exit_num = self.pending_exits(snapshot);
            return Ok(PredicateResult::candidate(POD_RESCHEDULING, CLUSTER_STREAM));
        }

        if self.exit_strategy_requested(snapshot) {
            return Ok(PredicateResult::candidate(POD_RESCHEDULING, CLUSTER_STREAM));
        }

        let mut faulted = Vec::new();
        for name in snapshot.agent_names() {
            if !is_fault_reported(&snapshot.agent_infos[&name]) {
                continue;
            }
            if name == RANK0_AGENT {
                debug!("{}: rank 0 fault is not handled here", POD_RESCHEDULING);
                self.reset();
                return Ok(PredicateResult::unselected(POD_RESCHEDULING));
            }
            faulted.push(name);
        }
        if faulted.is_empty() {
            self.last_fault_set.clear();
        } else if faulted != self.last_fault_set {
            info!("{}: agents reported faults: {:?}", POD_RESCHEDULING, faulted);
            self.fault_occur = true;
            self.select(snapshot, Uuid::new_v4().to_string(), faulted);
            return Ok(PredicateResult::candidate(POD_RESCHEDULING, CLUSTER_STREAM));
        }

        if self.retry_counter_changed() {
            self.healthy_agents = snapshot.agent_names();
            return Ok(PredicateResult::candidate(POD_RESCHEDULING, CLUSTER_STREAM));
        }

        Ok(PredicateResult::unselected(POD_RESCHEDULING))
    }

    fn handle(&mut self) -> Result<HandleResult, TaskdError> {
        if let Some(retry_time) = self.retried {
            let agents = self.healthy_agents.clone();
            return Ok(self.handle_retried(retry_time, &agents));
        }

        if self.exit_agents.is_empty() {
            match read_reset_config(&self.reset_config_path) {
                Ok(Some(info)) => self.retry_baseline = Some(info.retry_time),
                Ok(None) => {}
                Err(e) => debug!("{}: baseline not recorded: {}", POD_RESCHEDULING, e),
            }
            self.mark_handled();
            return Ok(self.finish());
        }

        if !self.sent {
            self.emit_batch();
            self.mark_handled();
            if self.fault_occur {
                self.last_fault_set = self.exit_agents.clone();
            }
            self.exit_num = self.exit_agents.len();
            self.stop_deadline =
                Some(Instant::now() + self.episode_timeout.unwrap_or(self.stop_wait));
            self.sent = true;
            info!(
                "{}: episode {} exiting {} agents, restarting {}",
                POD_RESCHEDULING,
                self.episode_id,
                self.exit_agents.len(),
                self.healthy_agents.len()
            );
            return Ok(HandleResult::process());
        }

        if self.exit_num != 0 {
            if self.stop_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(TaskdError::plugin(
                    POD_RESCHEDULING,
                    format!(
                        "episode {} gave up waiting for {} agents to stop",
                        self.episode_id, self.exit_num
                    ),
                ));
            }
            debug!(
                "{}: waiting for {} agents to stop",
                POD_RESCHEDULING, self.exit_num
            );
            return Ok(HandleResult::process());
        }

        info!("{}: episode {} complete", POD_RESCHEDULING, self.episode_id);
        Ok(self.finish())
    }

    fn pull_msg(&mut self) -> Result<Vec<Msg>, TaskdError> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn release(&mut self) -> Result<(), TaskdError> {
        self.reset();
        Ok(())
    }
}
