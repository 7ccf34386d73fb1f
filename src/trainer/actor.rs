//! Single-owner task around [`IncrementalTrainer`].
//!
//! Handlers clone a [`TrainerHandle`] and send commands over a bounded mpsc
//! channel; the task applies them one at a time and answers on a oneshot.
//! Forward and backward passes are CPU-bound, so the loop lives on the
//! blocking pool rather than a runtime worker. Dropping every handle ends it.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{IncrementalTrainer, TrainError, TrainOutcome, TrainSummary, TrainerStats};
use crate::trace::Trace;

enum Command {
    Train {
        trace: Box<Trace>,
        reply: oneshot::Sender<Result<TrainOutcome, TrainError>>,
    },
    TrainMany {
        traces: Vec<Trace>,
        reply: oneshot::Sender<TrainSummary>,
    },
    Score {
        trace: Box<Trace>,
        reply: oneshot::Sender<Result<f32, TrainError>>,
    },
    Stats {
        reply: oneshot::Sender<TrainerStats>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct TrainerHandle {
    tx: mpsc::Sender<Command>,
}

impl TrainerHandle {
    /// Move `trainer` onto a blocking thread. `queue` bounds the pending
    /// commands. Must be called from within a tokio runtime.
    pub fn spawn(trainer: IncrementalTrainer, queue: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let task = tokio::task::spawn_blocking(move || run(trainer, rx));
        (Self { tx }, task)
    }

    pub async fn train(&self, trace: Trace) -> Result<TrainOutcome, TrainError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Train {
            trace: Box::new(trace),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TrainError::Unavailable)?
    }

    pub async fn train_many(&self, traces: Vec<Trace>) -> Result<TrainSummary, TrainError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TrainMany { traces, reply }).await?;
        rx.await.map_err(|_| TrainError::Unavailable)
    }

    pub async fn score(&self, trace: Trace) -> Result<f32, TrainError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Score {
            trace: Box::new(trace),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TrainError::Unavailable)?
    }

    pub async fn stats(&self) -> Result<TrainerStats, TrainError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| TrainError::Unavailable)
    }

    pub async fn reset(&self) -> Result<(), TrainError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { reply }).await?;
        rx.await.map_err(|_| TrainError::Unavailable)
    }

    async fn send(&self, command: Command) -> Result<(), TrainError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| TrainError::Unavailable)
    }
}

fn run(mut trainer: IncrementalTrainer, mut rx: mpsc::Receiver<Command>) {
    info!(parameters = trainer.parameter_count(), "trainer task started");

    // A dropped reply receiver just means the caller stopped waiting.
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Train { trace, reply } => {
                let _ = reply.send(trainer.train_one(&trace));
            }
            Command::TrainMany { traces, reply } => {
                let _ = reply.send(trainer.train_many(&traces));
            }
            Command::Score { trace, reply } => {
                let _ = reply.send(trainer.score_one(&trace));
            }
            Command::Stats { reply } => {
                let _ = reply.send(trainer.stats());
            }
            Command::Reset { reply } => {
                trainer.reset();
                info!("trainer reset");
                let _ = reply.send(());
            }
        }
    }

    debug!("all trainer handles dropped; trainer task exiting");
}
