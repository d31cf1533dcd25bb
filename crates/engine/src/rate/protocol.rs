//! Cross-context acquisition protocol.
//!
//! Worker side: [`GrantClient`] sends `rate-limit-request { request_id }`
//! and parks the caller until the matching `rate-limit-grant` arrives or the
//! wait times out. Coordinator side: [`serve_grant`] queues the request on
//! the budget and answers once a token is available.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{RateBudget, RateGate, RateLimitError};
use crate::protocol::{CoordinatorMessage, WorkerEnvelope, WorkerId, WorkerMessage};

type GrantSender = oneshot::Sender<Result<(), RateLimitError>>;

/// Worker-local proxy for the coordinator's rate budget.
#[derive(Debug)]
pub struct GrantClient {
    worker: WorkerId,
    outbound: mpsc::UnboundedSender<WorkerEnvelope>,
    pending: Mutex<HashMap<Uuid, GrantSender>>,
    timeout: Duration,
    closed: AtomicBool,
}

/// Removes a request from the pending table when its waiter goes away
/// (timeout, or the chunk future being dropped).
struct PendingRequest<'a> {
    client: &'a GrantClient,
    request_id: Uuid,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.client.pending.lock().unwrap().remove(&self.request_id);
    }
}

impl GrantClient {
    pub fn new(worker: WorkerId, outbound: mpsc::UnboundedSender<WorkerEnvelope>, timeout: Duration) -> Self {
        Self {
            worker,
            outbound,
            pending: Mutex::new(HashMap::new()),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Ask the coordinator for one token and wait for it (bounded).
    pub async fn request(&self) -> Result<(), RateLimitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RateLimitError::Rejected);
        }

        let request_id = Uuid::now_v7();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);
        let _pending = PendingRequest {
            client: self,
            request_id,
        };

        let message = WorkerMessage::RateLimitRequest { request_id };
        if self.outbound.send(WorkerEnvelope::new(self.worker, message)).is_err() {
            return Err(RateLimitError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RateLimitError::Rejected),
            Err(_) => {
                warn!(worker = self.worker, %request_id, timeout_ms = self.timeout.as_millis() as u64, "rate grant timed out");
                Err(RateLimitError::Timeout(self.timeout))
            }
        }
    }

    /// Deliver a grant. Returns `false` for grants nobody is waiting on
    /// (late after a timeout, or unknown); those are ignored.
    pub fn on_grant(&self, request_id: Uuid) -> bool {
        let waiter = self.pending.lock().unwrap().remove(&request_id);
        match waiter {
            Some(tx) => tx.send(Ok(())).is_ok(),
            None => {
                warn!(worker = self.worker, %request_id, "ignoring late rate grant");
                false
            }
        }
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn reject_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RateLimitError::Rejected));
        }
        if count > 0 {
            debug!(worker = self.worker, count, "rejected pending rate requests");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl RateGate for GrantClient {
    async fn acquire(&self) -> Result<(), RateLimitError> {
        self.request().await
    }
}

/// Coordinator side of one request: take a place in the budget's queue now,
/// answer with a grant once a token is available.
pub fn serve_grant(budget: &RateBudget, request_id: Uuid, reply: mpsc::UnboundedSender<CoordinatorMessage>) {
    let wait = budget.acquire();
    tokio::spawn(async move {
        match wait.await {
            Ok(()) => {
                if reply.send(CoordinatorMessage::RateLimitGrant { request_id }).is_err() {
                    debug!(%request_id, "worker gone before its rate grant");
                }
            }
            Err(err) => debug!(%request_id, error = %err, "rate request dropped"),
        }
    });
}
