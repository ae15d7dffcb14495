//! Deferred work off the webhook response path.

use std::future::Future;
use std::pin::Pin;

use lendbot_config::Dispatch;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct Dispatcher {
    queue: Option<mpsc::Sender<Job>>,
}

impl Dispatcher {
    /// Jobs run one at a time on a spawned worker. Must be called inside a
    /// tokio runtime.
    pub fn background(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { queue: Some(tx) }
    }

    pub fn inline() -> Self {
        Self { queue: None }
    }

    pub fn from_config(cfg: &Dispatch) -> Self {
        match cfg.mode.as_str() {
            "inline" => Self::inline(),
            _ => Self::background(cfg.queue_capacity),
        }
    }

    /// Queues `job`, or awaits it here when running inline or when the
    /// queue cannot take it. Work is never dropped.
    pub async fn dispatch<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(job);
        let Some(queue) = &self.queue else {
            return job.await;
        };
        match queue.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!("dispatch queue full, running job inline");
                job.await;
            }
            Err(TrySendError::Closed(job)) => {
                warn!("dispatch worker gone, running job inline");
                job.await;
            }
        }
    }
}
