/*
 * Copyright (C) 2024 The Sandboxd Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::sandboxd::controller::reconcile::ReconcileContext;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Controller runtime offering per-kind work queues and shared dependencies.
pub struct ControllerRuntime {
    dependencies: DependencyRegistry,
    queues: HashMap<TargetKind, WorkQueue<ControllerTarget>>,
}

impl ControllerRuntime {
    pub fn new() -> Arc<Self> {
        let queues = TargetKind::ALL
            .iter()
            .map(|kind| (*kind, WorkQueue::new()))
            .collect();
        Arc::new(Self {
            dependencies: DependencyRegistry::new(),
            queues,
        })
    }

    pub fn register_dependency<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(dependency)
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.get::<T>()
    }

    pub fn context(&self) -> ReconcileContext<'_> {
        ReconcileContext::new(self)
    }

    pub fn work_queue(&self, kind: TargetKind) -> WorkQueue<ControllerTarget> {
        // Every kind gets a queue at construction.
        self.queues
            .get(&kind)
            .cloned()
            .unwrap_or_else(WorkQueue::new)
    }

    /// Adds `target` to the queue for its kind.
    pub fn enqueue(&self, target: ControllerTarget) {
        self.work_queue(target.kind()).enqueue(target);
    }

    pub fn shutdown(&self) {
        for queue in self.queues.values() {
            queue.shutdown();
        }
    }

    /// Starts `workers` tasks draining the queue for `kind`. A key is never
    /// handed to two workers at once.
    pub fn spawn_executor<H, Fut>(
        &self,
        kind: TargetKind,
        workers: usize,
        handler: H,
    ) -> Vec<JoinHandle<()>>
    where
        H: Fn(ControllerTarget) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let queue = self.work_queue(kind);
        let handler = Arc::new(handler);
        (0..workers.max(1))
            .map(|_| {
                let queue = queue.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    while let Some(item) = queue.next().await {
                        (handler.as_ref())(item.clone()).await;
                        queue.done(&item);
                    }
                })
            })
            .collect()
    }
}

#[derive(Default)]
struct DependencyRegistry {
    values: StdRwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DependencyRegistry {
    fn new() -> Self {
        Self::default()
    }

    fn insert<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let mut guard = self.values.write().unwrap_or_else(|p| p.into_inner());
        let existing = guard.insert(
            TypeId::of::<T>(),
            dependency as Arc<dyn Any + Send + Sync>,
        );
        existing.and_then(|arc| arc.downcast::<T>().ok())
    }

    fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let guard = self.values.read().unwrap_or_else(|p| p.into_inner());
        guard
            .get(&TypeId::of::<T>())
            .and_then(|arc| arc.clone().downcast::<T>().ok())
    }
}

/// Deduplicating work queue.
///
/// A key waits in the queue at most once. A key enqueued while a worker holds
/// it is marked dirty and re-queued when that worker calls [`WorkQueue::done`].
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct WorkQueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    queue: VecDeque<T>,
    pending: HashSet<T>,
    processing: HashSet<T>,
    dirty: HashSet<T>,
    shutdown: bool,
}

impl<T> WorkQueueInner<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    pending: HashSet::new(),
                    processing: HashSet::new(),
                    dirty: HashSet::new(),
                    shutdown: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn enqueue(&self, item: T) {
        let mut state = self.inner.lock();
        if state.shutdown || state.pending.contains(&item) {
            return;
        }
        if state.processing.contains(&item) {
            state.dirty.insert(item);
            return;
        }
        state.pending.insert(item.clone());
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueues `item` once `delay` has passed. Must run inside a tokio runtime.
    pub fn enqueue_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(item);
        });
    }

    /// Waits for the next key. Returns `None` after [`WorkQueue::shutdown`].
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.pending.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Releases a key handed out by [`WorkQueue::next`].
    pub fn done(&self, item: &T) {
        let mut state = self.inner.lock();
        state.processing.remove(item);
        if state.dirty.remove(item) && !state.shutdown && state.pending.insert(item.clone()) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Sandbox,
    WarmPool,
    Claim,
}

impl TargetKind {
    pub const ALL: [TargetKind; 3] = [TargetKind::Sandbox, TargetKind::WarmPool, TargetKind::Claim];

    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Sandbox => "sandbox",
            TargetKind::WarmPool => "warmpool",
            TargetKind::Claim => "claim",
        }
    }
}

/// Key of an object a controller reconciles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControllerTarget {
    Sandbox { namespace: String, name: String },
    WarmPool { namespace: String, name: String },
    Claim { namespace: String, name: String },
}

impl ControllerTarget {
    pub fn sandbox(namespace: &str, name: &str) -> Self {
        ControllerTarget::Sandbox {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn warm_pool(namespace: &str, name: &str) -> Self {
        ControllerTarget::WarmPool {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn claim(namespace: &str, name: &str) -> Self {
        ControllerTarget::Claim {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            ControllerTarget::Sandbox { .. } => TargetKind::Sandbox,
            ControllerTarget::WarmPool { .. } => TargetKind::WarmPool,
            ControllerTarget::Claim { .. } => TargetKind::Claim,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ControllerTarget::Sandbox { namespace, .. }
            | ControllerTarget::WarmPool { namespace, .. }
            | ControllerTarget::Claim { namespace, .. } => namespace,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ControllerTarget::Sandbox { name, .. }
            | ControllerTarget::WarmPool { name, .. }
            | ControllerTarget::Claim { name, .. } => name,
        }
    }
}

impl fmt::Display for ControllerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ControllerTarget::Sandbox { .. } => "Sandbox",
            ControllerTarget::WarmPool { .. } => "SandboxWarmPool",
            ControllerTarget::Claim { .. } => "SandboxClaim",
        };
        write!(f, "{}/{}/{}", kind, self.namespace(), self.name())
    }
}
