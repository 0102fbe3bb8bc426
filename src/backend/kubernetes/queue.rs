//! Rate-limited, deduplicating work queue keyed by [`ObjectKey`].
//!
//! Modeled on the client-go workqueue algorithm: a `dirty` set of keys that need
//! processing, a `processing` set of keys currently owned by a worker (so a key touched
//! again mid-reconcile is requeued rather than processed twice concurrently), and a FIFO
//! of dirty-but-not-yet-claimed keys. Delayed (backoff) re-adds are handled by a
//! single-owner task wrapping a [`DelayQueue`], the same "one task owns the timer state"
//! idiom the engine uses for its own bookkeeping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::time::{delay_queue, DelayQueue};

use super::ObjectKey;

const BASE_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Default)]
struct State {
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    queue: VecDeque<ObjectKey>,
    attempts: HashMap<ObjectKey, u32>,
}

enum DelayCmd {
    Schedule(ObjectKey, Duration),
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    delay_cmd_tx: mpsc::UnboundedSender<DelayCmd>,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        let (delay_cmd_tx, delay_cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        let queue = Arc::new(Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            delay_cmd_tx,
        });

        tokio::spawn(run_delay_dispatcher(delay_cmd_rx, ready_tx));
        tokio::spawn(queue.clone().forward_expired(ready_rx));
        queue
    }

    async fn forward_expired(self: Arc<Self>, mut ready_rx: mpsc::UnboundedReceiver<ObjectKey>) {
        while let Some(key) = ready_rx.recv().await {
            self.add(key).await;
        }
    }

    /// Marks `key` dirty, scheduling it for immediate processing unless it is already
    /// queued or currently being processed (in which case it is marked to be reprocessed
    /// once the in-flight attempt finishes).
    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.dirty.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Schedules `key` to become dirty after `delay` (used for rate-limited retries).
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        let _ = self.delay_cmd_tx.send(DelayCmd::Schedule(key, delay));
    }

    /// Blocks until a key is available for processing. The caller owns the key
    /// exclusively until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> ObjectKey {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Signals that processing of `key` has finished. If the key was marked dirty again
    /// while processing, it is immediately re-queued.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clears the retry counter for `key` after a successful reconcile.
    pub async fn forget(&self, key: &ObjectKey) {
        self.state.lock().await.attempts.remove(key);
    }

    /// Re-enqueues `key` after an exponentially increasing, capped delay.
    pub async fn requeue_rate_limited(&self, key: ObjectKey) {
        let delay = {
            let mut state = self.state.lock().await;
            let attempts = state.attempts.entry(key.clone()).or_insert(0);
            *attempts += 1;
            backoff_for(*attempts)
        };
        self.add_after(key, delay);
    }
}

fn backoff_for(attempts: u32) -> Duration {
    BASE_BACKOFF
        .saturating_mul(1u32 << attempts.min(16))
        .min(MAX_BACKOFF)
}

async fn run_delay_dispatcher(
    mut cmd_rx: mpsc::UnboundedReceiver<DelayCmd>,
    ready_tx: mpsc::UnboundedSender<ObjectKey>,
) {
    use futures::StreamExt;

    let mut delayed: DelayQueue<ObjectKey> = DelayQueue::new();
    let mut keys: HashMap<ObjectKey, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(DelayCmd::Schedule(key, delay)) => {
                        if let Some(existing) = keys.get(&key) {
                            delayed.reset(existing, delay);
                        } else {
                            let handle = delayed.insert(key.clone(), delay);
                            keys.insert(key, handle);
                        }
                    }
                    None => break,
                }
            }
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                let key = expired.into_inner();
                keys.remove(&key);
                let _ = ready_tx.send(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ObjectKind;
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey {
            kind: ObjectKind::Deployment,
            namespace: "keppel".into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn dedups_while_queued_and_requeues_when_dirtied_mid_processing() {
        let queue = WorkQueue::new();

        queue.add(key("a")).await;
        queue.add(key("a")).await; // dedup: still only one entry in the FIFO

        let got = queue.get().await;
        assert_eq!(got, key("a"));

        // Dirtied again while "a" is being processed by the worker above.
        queue.add(key("a")).await;
        queue.done(&got).await;

        // Should come back around exactly once.
        let got_again = queue.get().await;
        assert_eq!(got_again, key("a"));
    }

    #[tokio::test]
    async fn backoff_increases_with_repeated_failures() {
        assert!(backoff_for(1) < backoff_for(2));
        assert!(backoff_for(2) < backoff_for(3));
        assert_eq!(backoff_for(100), MAX_BACKOFF);
    }
}
