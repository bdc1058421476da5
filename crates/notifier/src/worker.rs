use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use courier_common::config::AppConfig;
use courier_common::error::DeliveryError;
use courier_common::types::Channel;

use crate::dispatcher::DeliveryDispatcher;
use crate::queue::dequeue_order;

/// Worker pool sizing and pacing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub default_concurrency: usize,
    pub concurrency: HashMap<Channel, usize>,
    /// Sleep when every queue of a channel is empty.
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    /// Max pending tasks re-pushed per reconcile pass.
    pub reconcile_batch: usize,
}

impl WorkerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_concurrency: config.worker_concurrency,
            concurrency: config.worker_concurrency_overrides.iter().copied().collect(),
            poll_interval: config.queue_poll_interval(),
            ..Self::default()
        }
    }

    pub fn concurrency_for(&self, channel: Channel) -> usize {
        self.concurrency
            .get(&channel)
            .copied()
            .unwrap_or(self.default_concurrency)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            concurrency: HashMap::new(),
            poll_interval: Duration::from_millis(250),
            reconcile_interval: Duration::from_secs(30),
            reconcile_batch: 500,
        }
    }
}

/// Independent worker pools, one per channel, plus a reconcile loop.
///
/// A slow or failing channel only ties up its own workers.
pub struct WorkerPool {
    dispatcher: DeliveryDispatcher,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(dispatcher: DeliveryDispatcher, config: WorkerConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Spawn workers for every channel with a registered transport. They stop
    /// once `shutdown` flips to `true`, after finishing the task in hand.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for channel in self.dispatcher.transports().channels() {
            let workers = self.config.concurrency_for(channel);
            tracing::info!(channel = %channel, workers, "Starting channel worker pool");
            for worker_id in 0..workers {
                let dispatcher = self.dispatcher.clone();
                let poll_interval = self.config.poll_interval;
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(run_worker(
                    dispatcher,
                    channel,
                    worker_id,
                    poll_interval,
                    shutdown,
                )));
            }
        }

        handles.push(tokio::spawn(run_reconciler(
            self.dispatcher.clone(),
            self.config.reconcile_interval,
            self.config.reconcile_batch,
            shutdown,
        )));
        handles
    }
}

async fn run_worker(
    dispatcher: DeliveryDispatcher,
    channel: Channel,
    worker_id: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let queues = dequeue_order();
    tracing::debug!(channel = %channel, worker_id, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let entry = match dispatcher.queue().pop(channel, &queues).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                idle(&mut shutdown, poll_interval).await;
                continue;
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Queue pop failed");
                idle(&mut shutdown, poll_interval).await;
                continue;
            }
        };

        // Own task so a panicking transport cannot take the worker down
        let job = {
            let dispatcher = dispatcher.clone();
            let entry = entry.clone();
            tokio::spawn(async move { dispatcher.process(&entry).await })
        };

        match job.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log_outcome(&entry.task_id, channel, &e),
            Err(e) => tracing::error!(
                task_id = %entry.task_id,
                channel = %channel,
                error = %e,
                "Delivery task panicked"
            ),
        }
    }

    tracing::debug!(channel = %channel, worker_id, "Worker stopped");
}

fn log_outcome(task_id: &uuid::Uuid, channel: Channel, err: &DeliveryError) {
    match err {
        DeliveryError::AdmissionRejected { .. }
        | DeliveryError::RateLimited { .. }
        | DeliveryError::NotDue { .. }
        | DeliveryError::Cancelled(_)
        | DeliveryError::InvalidTransition { .. } => {
            tracing::debug!(task_id = %task_id, channel = %channel, outcome = %err, "Task deferred or skipped");
        }
        DeliveryError::Transport(_) | DeliveryError::TransportPermanent(_) => {
            tracing::debug!(task_id = %task_id, channel = %channel, error = %err, "Attempt failed");
        }
        DeliveryError::Corrupt(_) => {
            tracing::error!(task_id = %task_id, channel = %channel, error = %err, "Dropping unreadable task");
        }
        _ => {
            tracing::warn!(task_id = %task_id, channel = %channel, error = %err, "Task processing failed");
        }
    }
}

async fn run_reconciler(
    dispatcher: DeliveryDispatcher,
    interval: Duration,
    batch: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        idle(&mut shutdown, interval).await;
        if *shutdown.borrow() {
            break;
        }
        match dispatcher.reconcile(batch).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(requeued = n, "Reconciled queue with task store"),
            Err(e) => tracing::warn!(error = %e, "Reconcile pass failed"),
        }
    }
}

/// Sleep, waking early on shutdown.
async fn idle(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_override() {
        let mut config = WorkerConfig::default();
        config.concurrency.insert(Channel::Whatsapp, 1);
        assert_eq!(config.concurrency_for(Channel::Whatsapp), 1);
        assert_eq!(config.concurrency_for(Channel::Email), 4);
    }
}
