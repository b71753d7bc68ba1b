use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskd_core::protocol::BaseMessage;
use taskd_core::TaskdError;

use crate::sender::MessageSender;
use crate::store::SnapshotStore;

/// Bounded FIFO between the network receiver and the processor pool.
#[derive(Clone)]
pub struct InboundQueue {
    tx: mpsc::Sender<BaseMessage>,
    capacity: usize,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BaseMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity }, rx)
    }

    /// Fails fast instead of waiting when the queue is full.
    pub fn enqueue(&self, msg: BaseMessage) -> Result<(), TaskdError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TaskdError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(msg) => {
                TaskdError::ChannelClosed(format!("inbound queue, message {}", msg.uuid))
            }
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Decode one frame and fold it into the store.
pub fn process(store: &SnapshotStore, msg: &BaseMessage) -> Result<(), TaskdError> {
    let report = msg.decode_report()?;
    store.apply(report);
    Ok(())
}

/// Fixed set of workers draining the inbound queue.
pub struct ProcessorPool {
    handles: Vec<JoinHandle<()>>,
}

impl ProcessorPool {
    pub fn spawn(
        workers: usize,
        rx: mpsc::Receiver<BaseMessage>,
        store: Arc<SnapshotStore>,
        sender: MessageSender,
        cancel: CancellationToken,
    ) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    rx.clone(),
                    store.clone(),
                    sender.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        info!("Processor pool started with {} workers", workers.max(1));
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!("Processor worker ended abnormally: {}", e);
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<BaseMessage>>>,
    store: Arc<SnapshotStore>,
    sender: MessageSender,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = async { rx.lock().await.recv().await } => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match process(&store, &msg) {
            Ok(()) => debug!("Worker {} applied {:?} from {}", id, msg.biz_type, msg.src),
            Err(e) => {
                warn!("Worker {} failed to process {} from {}: {}", id, msg.uuid, msg.src, e);
                if !sender.report_failure(&msg, &e) {
                    warn!("Could not report failure of {} back to {}", msg.uuid, msg.src);
                }
            }
        }
    }
    debug!("Processor worker {} stopped", id);
}
