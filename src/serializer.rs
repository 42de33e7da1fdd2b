//! Per-client admission serialization.
//!
//! Admissions for one client must not interleave their read-modify-write
//! cycles against the counter store, so calls for the same client funnel
//! through a FIFO queue: the head runs, everyone else parks on a one-shot
//! channel and is woken in arrival order. The queue mutex is held only for
//! queue manipulation, never across a store round-trip.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

#[derive(Clone, Default)]
pub struct ClientSerializer {
    inner: Arc<Queues>,
}

#[derive(Default)]
struct Queues {
    /// An entry exists while a call is in flight for that client; the deque
    /// holds the waiters behind it.
    queues: Mutex<HashMap<String, VecDeque<oneshot::Sender<Turn>>>>,
}

/// Possession of a client's turn. Dropping it, on any outcome, hands the
/// turn to the next live waiter or removes the queue when none remain.
pub struct Turn {
    inner: Option<Arc<Queues>>,
    client_id: String,
}

impl ClientSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no earlier call for `client_id` is in flight.
    pub async fn acquire(&self, client_id: &str) -> Turn {
        let waiter = {
            let mut queues = self
                .inner
                .queues
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match queues.get_mut(client_id) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(tx);
                    Some(rx)
                }
                None => {
                    queues.insert(client_id.to_string(), VecDeque::new());
                    None
                }
            }
        };

        match waiter {
            None => Turn {
                inner: Some(Arc::clone(&self.inner)),
                client_id: client_id.to_string(),
            },
            // The sender is only dropped after handing over a turn, so a
            // pending receiver cannot outlive its queue entry.
            Some(rx) => rx.await.expect("serializer dropped a pending turn"),
        }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    #[cfg(test)]
    fn waiting(&self, client_id: &str) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

/// Hand the turn to the next waiter, skipping any that abandoned the wait,
/// and drop the queue entry once nobody is left.
fn release(inner: &Arc<Queues>, client_id: &str) {
    let mut queues = inner.queues.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        let Some(waiters) = queues.get_mut(client_id) else {
            return;
        };
        match waiters.pop_front() {
            Some(waiter) => {
                let turn = Turn {
                    inner: Some(Arc::clone(inner)),
                    client_id: client_id.to_string(),
                };
                match waiter.send(turn) {
                    Ok(()) => return,
                    Err(mut unclaimed) => {
                        // Receiver is gone; disarm the returned turn so it
                        // does not re-enter release, and wake the next one.
                        unclaimed.inner = None;
                    }
                }
            }
            None => {
                queues.remove(client_id);
                return;
            }
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            release(&inner, &self.client_id);
        }
    }
}
