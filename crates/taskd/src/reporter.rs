use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use taskd_core::protocol::{BaseMessage, BizType, Position};
use taskd_core::transport::Transport;
use taskd_core::types::{CONTROLLER, MANAGER_ROLE};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerMessage {
    pub code: i32,
    pub msg: String,
    pub fault_ranks: BTreeMap<i32, i32>,
}

/// Body of a `ControllerReport` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportBody {
    pub method: String,
    pub job_id: String,
    pub message: ControllerMessage,
}

pub const RECOVER_STATUS: &str = "ReportRecoverStatus";
pub const PROCESS_FAULT: &str = "ReportProcessFault";
pub const RECOVER_STRATEGY: &str = "ReportRecoverStrategy";
pub const STOP_COMPLETE: &str = "ReportStopComplete";

/// Pushes recovery progress to the cluster controller.
///
/// Each report is a single attempt; failures come back as `false`.
pub struct ControllerReporter {
    transport: Arc<dyn Transport>,
    job_id: String,
}

impl ControllerReporter {
    pub fn new(transport: Arc<dyn Transport>, job_id: &str) -> Self {
        Self {
            transport,
            job_id: job_id.to_string(),
        }
    }

    pub async fn report_recover_status(&self, message: ControllerMessage) -> bool {
        self.report(RECOVER_STATUS, message).await
    }

    pub async fn report_process_fault(&self, message: ControllerMessage) -> bool {
        self.report(PROCESS_FAULT, message).await
    }

    pub async fn report_recover_strategy(&self, message: ControllerMessage) -> bool {
        self.report(RECOVER_STRATEGY, message).await
    }

    pub async fn report_stop_complete(&self, message: ControllerMessage) -> bool {
        self.report(STOP_COMPLETE, message).await
    }

    async fn report(&self, method: &str, message: ControllerMessage) -> bool {
        let body = ReportBody {
            method: method.to_string(),
            job_id: self.job_id.clone(),
            message,
        };
        let body = match serde_json::to_string(&body) {
            Ok(body) => body,
            Err(e) => {
                warn!("{}: cannot encode report: {}", method, e);
                return false;
            }
        };
        let frame = BaseMessage {
            uuid: uuid::Uuid::new_v4().to_string(),
            biz_type: BizType::ControllerReport,
            src: Position::new(MANAGER_ROLE, MANAGER_ROLE),
            dst: Position::new(CONTROLLER, CONTROLLER),
            body,
        };
        match self.transport.send(&frame).await {
            Ok(()) => {
                info!("{} reported to controller ({})", method, frame.uuid);
                true
            }
            Err(e) => {
                warn!("{} failed: {}", method, e);
                false
            }
        }
    }
}
