//! Per-key serialization of sync jobs
//!
//! At most one job per key runs at a time. Callers arriving while a key is
//! busy are parked in that key's FIFO list and woken one at a time, after the
//! running job settles and a quiescence interval has passed. A woken caller
//! runs its own operation afresh; results are never shared between callers.
//!
//! Jobs for different keys run concurrently. The only shared section is the
//! short critical section over the coordinator state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::types::SyncConfig;

#[derive(Default)]
struct CoordinatorState {
    /// Keys whose job is executing (or has just been handed to a woken waiter)
    running: HashSet<String>,
    /// Keys inside their quiescence interval
    settling: HashSet<String>,
    parked: HashMap<String, VecDeque<oneshot::Sender<()>>>,
}

impl CoordinatorState {
    fn is_busy(&self, key: &str) -> bool {
        self.running.contains(key) || self.settling.contains(key)
    }
}

/// Serializes sync jobs per key
pub struct SyncCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    quiescence: Duration,
}

impl SyncCoordinator {
    pub fn new(quiescence: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            quiescence,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(Duration::from_millis(config.quiescence_ms))
    }

    pub fn quiescence(&self) -> Duration {
        self.quiescence
    }

    /// Run `operation` once no other job for `key` is running.
    ///
    /// The operation's output, success or failure, goes to this caller only.
    /// The key is released when the operation finishes, fails, panics or is
    /// dropped.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.acquire(key).await;
        let _permit = KeyPermit {
            state: Arc::clone(&self.state),
            key: key.to_string(),
            quiescence: self.quiescence,
        };

        operation().await
    }

    async fn acquire(&self, key: &str) {
        loop {
            let parked = {
                let mut state = self.state.lock();
                if !state.is_busy(key) {
                    state.running.insert(key.to_string());
                    return;
                }

                let (tx, rx) = oneshot::channel();
                state
                    .parked
                    .entry(key.to_string())
                    .or_default()
                    .push_back(tx);
                ParkedCaller {
                    rx,
                    state: Arc::clone(&self.state),
                    key: key.to_string(),
                    woken: false,
                }
            };

            tracing::debug!(key, "Sync already running, caller parked");

            if parked.wait().await {
                // The key was handed over to us
                return;
            }
        }
    }

    /// Whether a job for `key` is executing
    pub fn is_running(&self, key: &str) -> bool {
        self.state.lock().running.contains(key)
    }

    /// Number of callers parked behind `key`
    pub fn parked(&self, key: &str) -> usize {
        self.state
            .lock()
            .parked
            .get(key)
            .map(|queue| queue.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Keys with an executing job
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().running.iter().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Held for the duration of a job; releases the key on drop
struct KeyPermit {
    state: Arc<Mutex<CoordinatorState>>,
    key: String,
    quiescence: Duration,
}

impl Drop for KeyPermit {
    fn drop(&mut self) {
        {
            let mut state = self.state.lock();
            state.running.remove(&self.key);
            state.settling.insert(self.key.clone());
        }

        if self.quiescence.is_zero() {
            hand_off(&self.state, &self.key);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let state = Arc::clone(&self.state);
                let key = std::mem::take(&mut self.key);
                let quiescence = self.quiescence;
                handle.spawn(async move {
                    tokio::time::sleep(quiescence).await;
                    hand_off(&state, &key);
                });
            }
            // No runtime to wait on (runtime shutting down)
            Err(_) => hand_off(&self.state, &self.key),
        }
    }
}

/// Wake the first live parked caller of `key` and hand it the key, or mark
/// the key idle when nobody is waiting
fn hand_off(state: &Mutex<CoordinatorState>, key: &str) {
    let mut guard = state.lock();
    let state = &mut *guard;
    state.settling.remove(key);

    let Some(queue) = state.parked.get_mut(key) else {
        return;
    };

    while let Some(tx) = queue.pop_front() {
        // Fails only if the parked caller was dropped
        if tx.send(()).is_ok() {
            state.running.insert(key.to_string());
            break;
        }
    }

    if queue.is_empty() {
        state.parked.remove(key);
    }
}

/// A caller waiting for its turn on a key
struct ParkedCaller {
    rx: oneshot::Receiver<()>,
    state: Arc<Mutex<CoordinatorState>>,
    key: String,
    woken: bool,
}

impl ParkedCaller {
    /// True when the key was handed over, false when the sender went away
    async fn wait(mut self) -> bool {
        let handed_over = (&mut self.rx).await.is_ok();
        self.woken = true;
        handed_over
    }
}

impl Drop for ParkedCaller {
    fn drop(&mut self) {
        // Dropped between hand-over and resumption: pass the key on
        if !self.woken && self.rx.try_recv().is_ok() {
            {
                let mut state = self.state.lock();
                state.running.remove(&self.key);
                state.settling.insert(self.key.clone());
            }
            hand_off(&self.state, &self.key);
        }
    }
}
