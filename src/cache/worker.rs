//! Background flush task.
//!
//! One tokio task per provider runs the periodic timer, threshold-triggered
//! flushes and explicit flush requests. Every flush runs on the blocking
//! pool because store calls are synchronous.

use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, error, trace, warn};

use super::provider::{CachingProvider, FlushReport};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("flush worker is not running")]
    ChannelClosed,
    #[error("flush task failed: {0}")]
    Join(String),
}

enum Command {
    Flush {
        send_to_cluster: bool,
        resp: Option<oneshot::Sender<Result<FlushReport, WorkerError>>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<FlushReport, WorkerError>>,
    },
}

/// Handle to a running flush worker. Dropping every handle stops the worker
/// after one last flush.
#[derive(Clone)]
pub struct FlushWorker {
    cmd_tx: mpsc::Sender<Command>,
}

/// Non-owning sender the provider uses to ask for a threshold flush.
pub(crate) struct FlushTrigger {
    cmd_tx: mpsc::WeakSender<Command>,
}

impl FlushTrigger {
    pub(crate) fn request(&self) -> bool {
        self.cmd_tx.upgrade().is_some_and(|tx| {
            tx.try_send(Command::Flush {
                send_to_cluster: false,
                resp: None,
            })
            .is_ok()
        })
    }
}

/// Starts the flush worker for `provider` on the current tokio runtime.
///
/// The periodic timer starts after a random offset within one period so
/// cluster members do not flush in lockstep. It only runs when
/// `max_items_flush` is positive.
pub fn spawn_flush_worker(provider: Arc<CachingProvider>) -> FlushWorker {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(64);
    if !provider.attach_flush_trigger(FlushTrigger {
        cmd_tx: cmd_tx.downgrade(),
    }) {
        warn!("provider already has a flush worker; threshold flushes stay with the first one");
    }

    let config = provider.config().clone();
    let period = config.flush_period();
    let offset_ms = rand::thread_rng().gen_range(0..period.as_millis().max(1) as u64);
    let timer_enabled = config.timer_enabled();
    debug!(?period, offset_ms, timer_enabled, "starting flush worker");

    tokio::spawn(async move {
        let mut timer = time::interval_at(Instant::now() + Duration::from_millis(offset_ms), period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = run_flush(&provider, false).await;
                        break;
                    };
                    match cmd {
                        Command::Flush { send_to_cluster, resp } => {
                            let result = run_flush(&provider, send_to_cluster).await;
                            if let Some(resp) = resp {
                                let _ = resp.send(result);
                            }
                        }
                        Command::Shutdown { resp } => {
                            let result = run_flush(&provider, false).await;
                            let _ = resp.send(result);
                            break;
                        }
                    }
                }
                _ = timer.tick(), if timer_enabled => {
                    trace!("periodic flush");
                    let _ = run_flush(&provider, false).await;
                }
            }
        }
        debug!("flush worker stopped");
    });

    FlushWorker { cmd_tx }
}

async fn run_flush(
    provider: &Arc<CachingProvider>,
    send_to_cluster: bool,
) -> Result<FlushReport, WorkerError> {
    let provider = Arc::clone(provider);
    let result = tokio::task::spawn_blocking(move || provider.flush_pending_changes(send_to_cluster))
        .await
        .map_err(|e| WorkerError::Join(format!("join error: {e}")));
    if let Err(err) = &result {
        error!(error = %err, "background flush failed");
    }
    result
}

impl FlushWorker {
    /// Queues a local full flush without waiting for it. Returns false when
    /// the worker is gone or its queue is full.
    pub fn request_flush(&self) -> bool {
        self.cmd_tx
            .try_send(Command::Flush {
                send_to_cluster: false,
                resp: None,
            })
            .is_ok()
    }

    /// Runs a full flush and waits for it.
    pub async fn flush_now(&self, send_to_cluster: bool) -> Result<FlushReport, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush {
                send_to_cluster,
                resp: Some(tx),
            })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    /// Runs a final local flush and stops the worker.
    pub async fn shutdown(&self) -> Result<FlushReport, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }
}
