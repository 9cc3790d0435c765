//! Work queue and reconciliation workers.
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! in flight marks it dirty; it goes back on the queue once the current pass
//! finishes. Requeue delays are timers feeding the same queue.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::{CancelHandle, Cancellation, cancellation};
use crate::controller::{ConvergenceController, Outcome};
use crate::model::{DesiredSpec, InstanceKey};
use crate::resolver::InstanceLookup;
use crate::store::InstanceStore;

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<InstanceKey>,
    queued: HashSet<InstanceKey>,
    in_flight: HashSet<InstanceKey>,
    dirty: HashSet<InstanceKey>,
    shutdown: bool,
}

/// Deduplicating queue of instance keys.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: InstanceKey) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: InstanceKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key; `None` once the queue is shut down.
    pub async fn next(&self) -> Option<InstanceKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark the pass for `key` finished, re-queueing it if it went dirty.
    pub fn done(&self, key: &InstanceKey) {
        let requeue = {
            let mut state = self.lock();
            state.in_flight.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.add(key.clone());
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting or in flight.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Emitted after every pass.
#[derive(Debug, Clone)]
pub struct ReconcileEvent {
    pub key: InstanceKey,
    pub outcome: Outcome,
}

/// Running engine: a store, a queue and a pool of workers.
pub struct Engine {
    store: Arc<InstanceStore>,
    queue: Arc<WorkQueue>,
    events: broadcast::Sender<ReconcileEvent>,
    cancel: CancelHandle,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Spawn `workers` reconciliation workers.
    pub fn start(
        controller: Arc<ConvergenceController>,
        store: Arc<InstanceStore>,
        workers: usize,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cancel, observer) = cancellation();

        let handles = (0..workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    controller: controller.clone(),
                    store: store.clone(),
                    queue: queue.clone(),
                    events: events.clone(),
                    cancel: observer.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers = workers.max(1), "Engine started");
        Self {
            store,
            queue,
            events,
            cancel,
            workers: handles,
        }
    }

    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    /// Track (or update) an instance and schedule a pass. Returns its generation.
    pub fn submit(&self, key: InstanceKey, spec: DesiredSpec) -> u64 {
        let generation = self.store.apply(key.clone(), spec);
        self.queue.add(key);
        generation
    }

    /// Request deletion of a tracked instance.
    pub fn delete(&self, key: &InstanceKey) -> bool {
        if !self.store.request_deletion(key) {
            return false;
        }
        self.queue.add(key.clone());
        true
    }

    pub fn enqueue(&self, key: InstanceKey) {
        self.queue.add(key);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.events.subscribe()
    }

    /// Cancel in-flight passes and wait for the workers to exit.
    pub async fn shutdown(self) {
        info!("Engine shutting down");
        self.cancel.cancel();
        self.queue.shutdown();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
    }
}

struct Worker {
    id: usize,
    controller: Arc<ConvergenceController>,
    store: Arc<InstanceStore>,
    queue: Arc<WorkQueue>,
    events: broadcast::Sender<ReconcileEvent>,
    cancel: Cancellation,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while let Some(key) = self.queue.next().await {
            let Some(instance) = self.store.get(&key) else {
                debug!(worker = self.id, key = %key, "Instance no longer tracked");
                self.queue.done(&key);
                continue;
            };

            let outcome = self.controller.reconcile(&instance, &self.cancel).await;
            match &outcome {
                // Dependents may have been waiting on this one.
                Outcome::Ready => {
                    for dependent in self.store.referencing(&key) {
                        self.queue.add(dependent.key);
                    }
                }
                // Targets may have been waiting for this one to go away.
                Outcome::Deleted => {
                    for reference in &instance.spec.references {
                        self.queue.add(reference.target.clone());
                    }
                }
                Outcome::Requeue { after, .. } if !self.cancel.is_cancelled() => {
                    self.queue.add_after(key.clone(), *after);
                }
                Outcome::Requeue { .. } | Outcome::Failed { .. } => {}
            }

            self.queue.done(&key);
            let _ = self.events.send(ReconcileEvent { key, outcome });
        }
        debug!(worker = self.id, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;

    fn key(name: &str) -> InstanceKey {
        InstanceKey::new(ResourceKind::SqlServer, "sub", "rg", name)
    }

    #[tokio::test]
    async fn duplicate_adds_are_collapsed() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, Some(key("b")));
    }

    #[tokio::test]
    async fn in_flight_key_is_rerun_after_done() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let first = queue.next().await.unwrap();

        queue.add(key("a"));
        assert_eq!(queue.len(), 1, "dirty key must not be handed out twice");

        queue.done(&first);
        assert_eq!(queue.next().await, Some(key("a")));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn delayed_add() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_millis(5));
        assert!(queue.is_empty());
        let next = tokio::time::timeout(Duration::from_secs(1), queue.next()).await;
        assert_eq!(next.unwrap(), Some(key("a")));
    }
}
