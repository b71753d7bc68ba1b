use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use taskd_core::protocol::{to_json, Ack, BaseMessage, BizType, Msg, Position, SendRequest};
use taskd_core::transport::Transport;
use taskd_core::types::{AGENT_PREFIX, CONTROLLER, MANAGER_ROLE};
use taskd_core::TaskdError;

/// Position of a receiver identity such as `Agent3`, `Controller` or `Mgr`.
pub fn position_for(receiver: &str) -> Position {
    let role = if receiver.starts_with(AGENT_PREFIX) {
        AGENT_PREFIX
    } else if receiver == CONTROLLER {
        CONTROLLER
    } else if receiver == MANAGER_ROLE {
        MANAGER_ROLE
    } else {
        receiver
    };
    Position::new(role, receiver)
}

/// Producer handle for the bounded outbound request channel.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<SendRequest>,
}

impl MessageSender {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SendRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a request, waiting for capacity if the channel is full.
    pub async fn send(&self, req: SendRequest) -> Result<(), TaskdError> {
        self.tx
            .send(req)
            .await
            .map_err(|e| TaskdError::ChannelClosed(format!("outbound request for {}", e.0.dst)))
    }

    /// Non-blocking enqueue. A closed or full channel yields `false`.
    pub fn try_send(&self, req: SendRequest) -> bool {
        match self.tx.try_send(req) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                warn!("Outbound queue full, dropping request for {}", req.dst);
                false
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                warn!("Outbound queue closed, dropping request for {}", req.dst);
                false
            }
        }
    }

    /// Fan a plugin message out into one request per receiver.
    pub async fn send_msg(&self, msg: Msg) -> Result<usize, TaskdError> {
        let body = to_json(&msg.body);
        let mut queued = 0;
        for receiver in &msg.receiver {
            self.send(SendRequest {
                uuid: Uuid::new_v4().to_string(),
                biz_type: BizType::Action,
                body: body.clone(),
                dst: position_for(receiver),
            })
            .await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Tell the originator of `original` that processing failed.
    pub fn report_failure(&self, original: &BaseMessage, err: &TaskdError) -> bool {
        let ack = Ack::failed(&original.uuid, err.to_string());
        self.try_send(SendRequest {
            uuid: Uuid::new_v4().to_string(),
            biz_type: BizType::Ack,
            body: to_json(&ack),
            dst: original.src.clone(),
        })
    }
}

/// Drains the request channel and performs the network sends.
pub struct Dispatcher {
    rx: mpsc::Receiver<SendRequest>,
    transport: Arc<dyn Transport>,
    local: Position,
    inflight: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        rx: mpsc::Receiver<SendRequest>,
        transport: Arc<dyn Transport>,
        local: Position,
        max_inflight: usize,
    ) -> Self {
        Self {
            rx,
            transport,
            local,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    /// Run until cancelled or every producer is gone. Sends run concurrently,
    /// at most `max_inflight` at a time.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Outbound dispatcher started");
        loop {
            let req = tokio::select! {
                _ = cancel.cancelled() => break,
                req = self.rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.inflight.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let transport = self.transport.clone();
            let msg = req.into_message(self.local.clone());
            tokio::spawn(async move {
                match transport.send(&msg).await {
                    Ok(()) => debug!("Sent {:?} {} to {}", msg.biz_type, msg.uuid, msg.dst),
                    Err(e) => error!("Send {} to {} failed: {}", msg.uuid, msg.dst, e),
                }
                drop(permit);
            });
        }
        info!("Outbound dispatcher stopped");
    }
}
