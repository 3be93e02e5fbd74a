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

//! Wires the reconcilers to the object store: per-kind worker pools, a watch
//! dispatcher that maps store events onto work-queue keys, and a periodic
//! resync that re-enqueues everything.

use crate::sandboxd::clock::Clock;
use crate::sandboxd::config::ControllerConfig;
use crate::sandboxd::controller::backoff::Backoff;
use crate::sandboxd::controller::claim::ClaimController;
use crate::sandboxd::controller::error::{ControllerError, ErrorClass};
use crate::sandboxd::controller::reconcile::{
    register_controller_dependencies, ReconcileOutcome, Reconciler,
};
use crate::sandboxd::controller::runtime::{ControllerRuntime, ControllerTarget, TargetKind};
use crate::sandboxd::controller::sandbox::{owning_sandbox, SandboxController};
use crate::sandboxd::controller::warmpool::WarmPoolController;
use crate::sandboxd::k8s::claim::SandboxClaim;
use crate::sandboxd::k8s::naming::ANNOTATION_ADOPTED_FROM;
use crate::sandboxd::k8s::networkpolicy::NetworkPolicy;
use crate::sandboxd::k8s::pod::Pod;
use crate::sandboxd::k8s::sandbox::Sandbox;
use crate::sandboxd::k8s::service::Service;
use crate::sandboxd::k8s::store::{Client, Resource, ResourceKind, StoreError, StoreEvent};
use crate::sandboxd::k8s::warmpool::SandboxWarmPool;
use crate::sandboxd::logger::{log_debug, log_error, log_info, log_warn};
use crate::sandboxd::observability::metrics::{self, ControllerReconcileResult};
use crate::sandboxd::observability::tracing;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller-manager";

/// Runs one reconcile pass for `target` with the matching reconciler.
pub fn reconcile_target(
    runtime: &ControllerRuntime,
    target: &ControllerTarget,
) -> Result<ReconcileOutcome, ControllerError> {
    let ctx = runtime.context();
    match target.kind() {
        TargetKind::Sandbox => SandboxController::new().reconcile_and_apply(&ctx, target),
        TargetKind::WarmPool => WarmPoolController::new().reconcile_and_apply(&ctx, target),
        TargetKind::Claim => ClaimController::new().reconcile_and_apply(&ctx, target),
    }
}

/// Work-queue keys affected by a store event.
pub fn targets_for_event(client: &Client, event: &StoreEvent) -> Vec<ControllerTarget> {
    let namespace = event.namespace.as_str();
    let name = event.name.as_str();
    match event.kind {
        ResourceKind::SandboxWarmPool => vec![ControllerTarget::warm_pool(namespace, name)],
        ResourceKind::SandboxClaim => vec![ControllerTarget::claim(namespace, name)],
        ResourceKind::Sandbox => {
            let mut targets = vec![ControllerTarget::sandbox(namespace, name)];
            let Ok(sandbox) = event.decode::<Sandbox>() else {
                return targets;
            };
            if let Some(owner) = sandbox.metadata.controller_ref() {
                if owner.kind == SandboxWarmPool::KIND.as_str() {
                    targets.push(ControllerTarget::warm_pool(namespace, &owner.name));
                } else if owner.kind == SandboxClaim::KIND.as_str() {
                    targets.push(ControllerTarget::claim(namespace, &owner.name));
                }
            }
            // An adopted member leaves a gap in the pool it came from.
            if let Some(pool) = sandbox.metadata.annotation(ANNOTATION_ADOPTED_FROM) {
                targets.push(ControllerTarget::warm_pool(namespace, pool));
            }
            targets
        }
        ResourceKind::Pod => event
            .decode::<Pod>()
            .ok()
            .and_then(|pod| {
                owning_sandbox(&pod).map(|owner| ControllerTarget::sandbox(namespace, owner))
            })
            .into_iter()
            .collect(),
        ResourceKind::Service => event
            .decode::<Service>()
            .ok()
            .and_then(|service| {
                service
                    .metadata
                    .controller_ref()
                    .filter(|owner| owner.kind == Sandbox::KIND.as_str())
                    .map(|owner| ControllerTarget::sandbox(namespace, &owner.name))
            })
            .into_iter()
            .collect(),
        ResourceKind::NetworkPolicy => event
            .decode::<NetworkPolicy>()
            .ok()
            .and_then(|policy| {
                policy
                    .metadata
                    .controller_ref()
                    .filter(|owner| owner.kind == SandboxClaim::KIND.as_str())
                    .map(|owner| ControllerTarget::claim(namespace, &owner.name))
            })
            .into_iter()
            .collect(),
        ResourceKind::SandboxTemplate => {
            let mut targets = Vec::new();
            match client.list::<SandboxWarmPool>(Some(namespace)) {
                Ok(pools) => targets.extend(
                    pools
                        .iter()
                        .filter(|pool| pool.spec.template_ref.name == name)
                        .map(|pool| ControllerTarget::warm_pool(namespace, &pool.metadata.name)),
                ),
                Err(err) => log_warn(COMPONENT, "failed to list pools", &[("error", &err.to_string())]),
            }
            match client.list::<SandboxClaim>(Some(namespace)) {
                Ok(claims) => targets.extend(
                    claims
                        .iter()
                        .filter(|claim| claim.spec.template_ref.name == name)
                        .map(|claim| ControllerTarget::claim(namespace, &claim.metadata.name)),
                ),
                Err(err) => log_warn(COMPONENT, "failed to list claims", &[("error", &err.to_string())]),
            }
            targets
        }
    }
}

/// Enqueues every pool, claim and sandbox in the store.
pub fn enqueue_all(runtime: &ControllerRuntime, client: &Client) -> Result<usize, StoreError> {
    let mut count = 0;
    for pool in client.list::<SandboxWarmPool>(None)? {
        runtime.enqueue(ControllerTarget::warm_pool(&pool.metadata.namespace, &pool.metadata.name));
        count += 1;
    }
    for claim in client.list::<SandboxClaim>(None)? {
        runtime.enqueue(ControllerTarget::claim(&claim.metadata.namespace, &claim.metadata.name));
        count += 1;
    }
    for sandbox in client.list::<Sandbox>(None)? {
        runtime.enqueue(ControllerTarget::sandbox(
            &sandbox.metadata.namespace,
            &sandbox.metadata.name,
        ));
        count += 1;
    }
    Ok(count)
}

/// Routes the result of a pass: requeue, back off, or drop the key.
fn handle_result(
    runtime: &ControllerRuntime,
    backoff: &Backoff<ControllerTarget>,
    target: ControllerTarget,
    result: Result<ReconcileOutcome, ControllerError>,
) {
    let controller = target.kind().as_str();
    let queue = runtime.work_queue(target.kind());
    let key = target.to_string();
    match result {
        Ok(ReconcileOutcome::Converged) => {
            backoff.reset(&target);
            metrics::record_controller_reconcile(controller, ControllerReconcileResult::Success);
        }
        Ok(ReconcileOutcome::RequeueAfter(delay)) => {
            backoff.reset(&target);
            metrics::record_controller_reconcile(controller, ControllerReconcileResult::Requeue);
            queue.enqueue_after(target, delay);
        }
        Err(err) => match err.class() {
            ErrorClass::Conflict => {
                metrics::record_controller_reconcile(controller, ControllerReconcileResult::Conflict);
                log_debug(COMPONENT, "write conflict; retrying", &[("target", &key)]);
                queue.enqueue(target);
            }
            ErrorClass::NotFound => {
                backoff.reset(&target);
                metrics::record_controller_reconcile(controller, ControllerReconcileResult::Success);
                log_debug(COMPONENT, "object vanished mid-reconcile", &[("target", &key)]);
            }
            ErrorClass::Transient => {
                metrics::record_controller_reconcile(controller, ControllerReconcileResult::Error);
                let delay = backoff.next_delay(&target);
                log_warn(
                    COMPONENT,
                    "reconcile failed; backing off",
                    &[
                        ("target", &key),
                        ("error", &err.to_string()),
                        ("delay_ms", &delay.as_millis().to_string()),
                    ],
                );
                queue.enqueue_after(target, delay);
            }
            ErrorClass::Terminal => {
                backoff.reset(&target);
                metrics::record_controller_reconcile(controller, ControllerReconcileResult::Error);
                log_error(
                    COMPONENT,
                    "reconcile failed permanently",
                    &[("target", &key), ("error", &err.to_string())],
                );
            }
        },
    }
}

/// Owns the controller runtime and the background tasks driving it.
pub struct ControllerManager {
    runtime: Arc<ControllerRuntime>,
    client: Client,
    config: ControllerConfig,
    backoff: Arc<Backoff<ControllerTarget>>,
    shutdown: CancellationToken,
}

impl ControllerManager {
    pub fn new(client: Client, config: ControllerConfig, clock: Arc<dyn Clock>) -> Self {
        let runtime = ControllerRuntime::new();
        register_controller_dependencies(&runtime, client.clone(), config.clone(), clock);
        let backoff = Arc::new(Backoff::from_config(&config));
        Self {
            runtime,
            client,
            config,
            backoff,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn runtime(&self) -> Arc<ControllerRuntime> {
        Arc::clone(&self.runtime)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns the workers, the watch dispatcher and the resync loop.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for kind in TargetKind::ALL {
            handles.extend(self.spawn_workers(kind));
        }
        handles.push(self.spawn_dispatcher());
        handles.push(self.spawn_resync());
        log_info(
            COMPONENT,
            "controllers started",
            &[("workers", &self.config.workers.to_string())],
        );
        handles
    }

    /// Stops the background tasks and releases idle workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.runtime.shutdown();
    }

    fn spawn_workers(&self, kind: TargetKind) -> Vec<JoinHandle<()>> {
        let runtime = Arc::clone(&self.runtime);
        let backoff = Arc::clone(&self.backoff);
        self.runtime
            .spawn_executor(kind, self.config.workers, move |target: ControllerTarget| {
                let runtime = Arc::clone(&runtime);
                let backoff = Arc::clone(&backoff);
                async move {
                    let span = format!("reconcile {target}");
                    tracing::with_span("controller", span, async move {
                        let result = reconcile_target(&runtime, &target);
                        handle_result(&runtime, &backoff, target, result);
                    })
                    .await;
                }
            })
    }

    fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        let client = self.client.clone();
        let shutdown = self.shutdown.clone();
        // Subscribe before the initial listing so nothing falls in between.
        let mut events = client.watch();
        tokio::spawn(async move {
            if let Err(err) = enqueue_all(&runtime, &client) {
                log_warn(COMPONENT, "initial listing failed", &[("error", &err.to_string())]);
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            for target in targets_for_event(&client, &event) {
                                runtime.enqueue(target);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log_warn(
                                COMPONENT,
                                "watch lagged; resyncing",
                                &[("skipped", &skipped.to_string())],
                            );
                            if let Err(err) = enqueue_all(&runtime, &client) {
                                log_warn(COMPONENT, "resync failed", &[("error", &err.to_string())]);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_resync(&self) -> JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        let client = self.client.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.resync_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => match enqueue_all(&runtime, &client) {
                        Ok(count) => {
                            log_debug(COMPONENT, "periodic resync", &[("objects", &count.to_string())])
                        }
                        Err(err) => {
                            log_warn(COMPONENT, "resync failed", &[("error", &err.to_string())])
                        }
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandboxd::clock::ManualClock;
    use crate::sandboxd::k8s::pod::{ObjectMeta, OwnerReference};
    use crate::sandboxd::k8s::store::{InMemoryApi, WatchEventType};
    use crate::sandboxd::test_support::sample_template;
    use std::time::Duration;

    fn event_for<T: Resource>(object: &T, event_type: WatchEventType) -> StoreEvent {
        let meta = object.metadata();
        StoreEvent {
            event_type,
            kind: T::KIND,
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            object: serde_json::to_value(object).expect("encode"),
            resource_version: 1,
        }
    }

    fn client() -> Client {
        Client::new(Arc::new(InMemoryApi::new()))
    }

    #[test]
    fn sandbox_events_reach_the_sandbox_and_its_controller() {
        let client = client();
        let pool = client
            .create(&SandboxWarmPool::new("default", "py-pool", "python", 1))
            .expect("pool");
        let mut sandbox = Sandbox::default();
        sandbox.metadata = ObjectMeta::named("default", "py-pool-abcde");
        sandbox.metadata.owner_references =
            vec![OwnerReference::controller_for("SandboxWarmPool", &pool.metadata).expect("owner")];

        let targets = targets_for_event(&client, &event_for(&sandbox, WatchEventType::Modified));
        assert_eq!(
            targets,
            vec![
                ControllerTarget::sandbox("default", "py-pool-abcde"),
                ControllerTarget::warm_pool("default", "py-pool"),
            ]
        );
    }

    #[test]
    fn adopted_sandboxes_wake_their_former_pool() {
        let client = client();
        let claim = client
            .create(&SandboxClaim::new("default", "c1", "python"))
            .expect("claim");
        let mut sandbox = Sandbox::default();
        sandbox.metadata = ObjectMeta::named("default", "py-pool-abcde");
        sandbox.metadata.owner_references =
            vec![OwnerReference::controller_for("SandboxClaim", &claim.metadata).expect("owner")];
        sandbox
            .metadata
            .annotations
            .insert(ANNOTATION_ADOPTED_FROM.to_string(), "py-pool".to_string());

        let targets = targets_for_event(&client, &event_for(&sandbox, WatchEventType::Modified));
        assert!(targets.contains(&ControllerTarget::claim("default", "c1")));
        assert!(targets.contains(&ControllerTarget::warm_pool("default", "py-pool")));
    }

    #[test]
    fn pod_and_template_events_map_to_dependents() {
        let client = client();
        let sandbox = client
            .create(&{
                let mut sandbox = Sandbox::default();
                sandbox.metadata = ObjectMeta::named("default", "sb-1");
                sandbox
            })
            .expect("sandbox");
        let mut pod = Pod::default();
        pod.metadata = ObjectMeta::named("default", "sb-1");
        pod.metadata.owner_references =
            vec![OwnerReference::controller_for("Sandbox", &sandbox.metadata).expect("owner")];
        assert_eq!(
            targets_for_event(&client, &event_for(&pod, WatchEventType::Deleted)),
            vec![ControllerTarget::sandbox("default", "sb-1")]
        );

        client
            .create(&SandboxWarmPool::new("default", "py-pool", "python", 1))
            .expect("pool");
        client
            .create(&SandboxWarmPool::new("default", "go-pool", "golang", 1))
            .expect("pool");
        let template = sample_template("default", "python");
        assert_eq!(
            targets_for_event(&client, &event_for(&template, WatchEventType::Modified)),
            vec![ControllerTarget::warm_pool("default", "py-pool")]
        );
    }

    #[test]
    fn networking_events_wake_their_owner() {
        let client = client();
        let sandbox = client
            .create(&{
                let mut sandbox = Sandbox::default();
                sandbox.metadata = ObjectMeta::named("default", "sb-1");
                sandbox
            })
            .expect("sandbox");
        let mut service = Service::default();
        service.metadata = ObjectMeta::named("default", "sb-1");
        service.metadata.owner_references =
            vec![OwnerReference::controller_for("Sandbox", &sandbox.metadata).expect("owner")];
        assert_eq!(
            targets_for_event(&client, &event_for(&service, WatchEventType::Deleted)),
            vec![ControllerTarget::sandbox("default", "sb-1")]
        );

        let claim = client
            .create(&SandboxClaim::new("default", "c1", "python"))
            .expect("claim");
        let mut policy = NetworkPolicy::default();
        policy.metadata = ObjectMeta::named("default", "c1-network-policy");
        policy.metadata.owner_references =
            vec![OwnerReference::controller_for("SandboxClaim", &claim.metadata).expect("owner")];
        assert_eq!(
            targets_for_event(&client, &event_for(&policy, WatchEventType::Modified)),
            vec![ControllerTarget::claim("default", "c1")]
        );
    }

    #[tokio::test]
    async fn manager_fills_a_pool_from_watch_events() {
        let client = client();
        let manager = ControllerManager::new(
            client.clone(),
            ControllerConfig {
                workers: 1,
                ..ControllerConfig::default()
            },
            Arc::new(ManualClock::default()),
        );
        let handles = manager.start();

        client.create(&sample_template("default", "python")).expect("template");
        client
            .create(&SandboxWarmPool::new("default", "py-pool", "python", 2))
            .expect("pool");

        let mut pods = 0;
        for _ in 0..200 {
            pods = client.list::<Pod>(Some("default")).expect("pods").len();
            if pods == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pods, 2);

        manager.shutdown();
        for handle in handles {
            handle.await.expect("task exits cleanly");
        }
    }
}
