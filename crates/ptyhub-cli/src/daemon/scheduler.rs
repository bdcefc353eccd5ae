//! Grace-period disposal timers, at most one per client.
//!
//! Arming starts a tokio task that sleeps for the grace period and then
//! reports a [`GraceExpired`] on the scheduler's channel. The owner decides
//! whether the expiry is still current via [`DisposalScheduler::take_expired`],
//! which rejects firings from timers that were cancelled or re-armed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A grace period ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceExpired {
    pub client_id: String,
    token: u64,
}

struct PendingDisposal {
    token: u64,
    task: JoinHandle<()>,
}

pub struct DisposalScheduler {
    timers: HashMap<String, PendingDisposal>,
    next_token: u64,
    expired_tx: mpsc::UnboundedSender<GraceExpired>,
}

impl DisposalScheduler {
    /// Create a scheduler reporting expiries on the returned receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GraceExpired>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            timers: HashMap::new(),
            next_token: 0,
            expired_tx,
        };
        (scheduler, expired_rx)
    }

    /// Start the grace period for `client_id`, replacing any pending one.
    pub fn arm(&mut self, client_id: &str, delay: Duration) {
        if self.cancel(client_id) {
            debug!("Re-arming disposal timer of client {}", client_id);
        }

        self.next_token += 1;
        let expired = GraceExpired {
            client_id: client_id.to_string(),
            token: self.next_token,
        };
        let tx = self.expired_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(expired);
        });

        self.timers.insert(
            client_id.to_string(),
            PendingDisposal {
                token: self.next_token,
                task,
            },
        );
    }

    /// Cancel the pending timer of `client_id`. Returns whether one existed.
    pub fn cancel(&mut self, client_id: &str) -> bool {
        match self.timers.remove(client_id) {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, client_id: &str) -> bool {
        self.timers.contains_key(client_id)
    }

    /// Clear the slot for a firing timer. Returns `false` for stale firings.
    pub fn take_expired(&mut self, expired: &GraceExpired) -> bool {
        match self.timers.get(&expired.client_id) {
            Some(pending) if pending.token == expired.token => {
                self.timers.remove(&expired.client_id);
                true
            }
            _ => {
                debug!("Ignoring stale disposal timer of client {}", expired.client_id);
                false
            }
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, pending) in self.timers.drain() {
            pending.task.abort();
        }
    }
}

impl Drop for DisposalScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
