//! Per-path write queues.
//!
//! Each path gets one task that applies writes strictly in the order they
//! were enqueued. Writes that pile up while an earlier one is in flight are
//! coalesced to the newest content, so an older write can never land after
//! a newer one.
//!
//! A flush resolves with the outcome of the last write applied before it. A
//! failed write keeps failing flushes until a later write to the same path
//! succeeds.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use sandpad_protocol::Event;
use sandpad_sandbox::Sandbox;

use crate::broker::EventBroker;

pub(crate) type FlushAck = oneshot::Receiver<Result<(), String>>;

enum WriteOp {
    Write(String),
    Flush(oneshot::Sender<Result<(), String>>),
}

pub(crate) struct PathWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
    task: JoinHandle<()>,
}

impl PathWriter {
    pub(crate) fn spawn(sandbox: Arc<dyn Sandbox>, path: String, events: Arc<EventBroker>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(sandbox, path, events, rx));
        Self { tx, task }
    }

    /// Queue `content`. Returns false once the writer has been shut down.
    pub(crate) fn enqueue(&self, content: String) -> bool {
        self.tx.send(WriteOp::Write(content)).is_ok()
    }

    /// Resolves once every write queued before this call has been applied.
    pub(crate) fn flush(&self) -> Option<FlushAck> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send(WriteOp::Flush(ack_tx)).ok()?;
        Some(ack_rx)
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

async fn run_writer(
    sandbox: Arc<dyn Sandbox>,
    path: String,
    events: Arc<EventBroker>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    let target = format!("/{path}");
    let mut last_error: Option<String> = None;
    while let Some(op) = rx.recv().await {
        let mut pending = None;
        let mut acks = Vec::new();
        let mut coalesced = 0usize;

        let mut next = Some(op);
        while let Some(op) = next {
            match op {
                WriteOp::Write(content) => {
                    if pending.replace(content).is_some() {
                        coalesced += 1;
                    }
                }
                WriteOp::Flush(ack) => acks.push(ack),
            }
            next = rx.try_recv().ok();
        }

        if let Some(content) = pending {
            trace!(path = %path, coalesced, bytes = content.len(), "writing file");
            match sandbox.write_file(&target, &content).await {
                Ok(()) => last_error = None,
                Err(err) => {
                    warn!(path = %path, "background write failed: {err}");
                    let message = err.to_string();
                    events.broadcast(Event::WriteFailed {
                        path: path.clone(),
                        message: message.clone(),
                    });
                    last_error = Some(message);
                }
            }
        }

        for ack in acks {
            let _ = ack.send(match &last_error {
                Some(message) => Err(message.clone()),
                None => Ok(()),
            });
        }
    }
}
