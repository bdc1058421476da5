use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use courier_common::error::TransportError;
use courier_common::types::{Ack, Channel, DeliveryTask};

use super::Transport;

/// Scripted transport for tests and local runs without provider credentials.
///
/// Scripted failures are returned in order; once they run out every send
/// succeeds with a provider id of `mock-{task id}`.
pub struct MockTransport {
    channel: Channel,
    script: Mutex<VecDeque<TransportError>>,
    sent: Mutex<Vec<Uuid>>,
    delay: Option<Duration>,
    panics: AtomicUsize,
}

impl MockTransport {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            delay: None,
            panics: AtomicUsize::new(0),
        }
    }

    /// Fail the next send with `err`.
    pub fn fail_next(self, err: TransportError) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
        self
    }

    /// Fail the next `n` sends with `err`.
    pub fn fail_times(self, n: usize, err: TransportError) -> Self {
        (0..n).fold(self, |t, _| t.fail_next(err.clone()))
    }

    /// Panic inside the next `n` sends, before any scripted failure.
    pub fn panic_times(self, n: usize) -> Self {
        self.panics.store(n, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of send calls, successful or not.
    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn sent_to(&self) -> Vec<Uuid> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, task: &DeliveryTask) -> Result<Ack, TransportError> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.id);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let panicking = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panicking {
            panic!("mock {} transport panicked", self.channel);
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match scripted {
            Some(err) => Err(err),
            None => Ok(Ack {
                provider_message_id: format!("mock-{}", task.id),
                delivered_at: Utc::now(),
            }),
        }
    }
}
