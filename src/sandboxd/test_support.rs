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

//! Helpers shared by unit and integration tests: an in-memory platform with a
//! manual clock, synchronous reconcile drivers and a failure-injecting store.

use crate::sandboxd::clock::ManualClock;
use crate::sandboxd::config::ControllerConfig;
use crate::sandboxd::controller::error::ControllerError;
use crate::sandboxd::controller::manager::reconcile_target;
use crate::sandboxd::controller::reconcile::{register_controller_dependencies, ReconcileOutcome};
use crate::sandboxd::controller::runtime::{ControllerRuntime, ControllerTarget};
use crate::sandboxd::k8s::claim::SandboxClaim;
use crate::sandboxd::k8s::pod::{ContainerPort, ContainerSpec, Pod};
use crate::sandboxd::k8s::sandbox::Sandbox;
use crate::sandboxd::k8s::store::{
    Client, InMemoryApi, ObjectApi, Preconditions, ResourceKind, StoreError, StoreEvent,
};
use crate::sandboxd::k8s::template::{SandboxTemplate, SandboxTemplateSpec};
use crate::sandboxd::k8s::warmpool::SandboxWarmPool;
use crate::sandboxd::kubelet;
use crate::sandboxd::metadata::Metadata;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Template running a single python container.
pub fn sample_template(namespace: &str, name: &str) -> SandboxTemplate {
    let mut spec = SandboxTemplateSpec::default();
    spec.pod_template.metadata = Metadata::default().with_label("app", "agent-sandbox");
    spec.pod_template.spec.containers = vec![ContainerSpec {
        name: "agent".to_string(),
        image: Some("python:3.12-slim".to_string()),
        command: vec!["python".to_string(), "-m".to_string(), "http.server".to_string()],
        ports: vec![ContainerPort {
            container_port: 8888,
            name: Some("http".to_string()),
            protocol: None,
        }],
        ..ContainerSpec::default()
    }];
    SandboxTemplate::new(namespace, name, spec)
}

/// Controllers wired to an in-memory store, driven one pass at a time.
pub struct Harness {
    pub client: Client,
    pub clock: Arc<ManualClock>,
    pub config: ControllerConfig,
    pub runtime: Arc<ControllerRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let api = Arc::new(InMemoryApi::with_clock(clock.clone()));
        Self::assemble(api, clock, config)
    }

    /// Uses `api` as the store. Its timestamps do not follow [`Harness::clock`].
    pub fn with_api(api: Arc<dyn ObjectApi>) -> Self {
        Self::assemble(api, Arc::new(ManualClock::default()), ControllerConfig::default())
    }

    fn assemble(api: Arc<dyn ObjectApi>, clock: Arc<ManualClock>, config: ControllerConfig) -> Self {
        let client = Client::new(api);
        let runtime = ControllerRuntime::new();
        register_controller_dependencies(&runtime, client.clone(), config.clone(), clock.clone());
        Self {
            client,
            clock,
            config,
            runtime,
        }
    }

    pub fn reconcile(&self, target: &ControllerTarget) -> Result<ReconcileOutcome, ControllerError> {
        reconcile_target(&self.runtime, target)
    }

    pub fn reconcile_sandbox(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        self.reconcile(&ControllerTarget::sandbox(namespace, name))
    }

    pub fn reconcile_pool(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        self.reconcile(&ControllerTarget::warm_pool(namespace, name))
    }

    pub fn reconcile_claim(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, ControllerError> {
        self.reconcile(&ControllerTarget::claim(namespace, name))
    }

    /// Every pool, claim and sandbox currently stored, in that order.
    pub fn all_targets(&self) -> Vec<ControllerTarget> {
        let mut targets = Vec::new();
        for pool in self.client.list::<SandboxWarmPool>(None).expect("list pools") {
            targets.push(ControllerTarget::warm_pool(&pool.metadata.namespace, &pool.metadata.name));
        }
        for claim in self.client.list::<SandboxClaim>(None).expect("list claims") {
            targets.push(ControllerTarget::claim(&claim.metadata.namespace, &claim.metadata.name));
        }
        for sandbox in self.client.list::<Sandbox>(None).expect("list sandboxes") {
            targets.push(ControllerTarget::sandbox(
                &sandbox.metadata.namespace,
                &sandbox.metadata.name,
            ));
        }
        targets
    }

    /// Runs `passes` rounds over every object, ignoring per-object errors the
    /// way the work queue would before retrying.
    pub fn settle(&self, passes: usize) {
        for _ in 0..passes {
            for target in self.all_targets() {
                let _ = self.reconcile(&target);
            }
        }
    }

    pub fn mark_pod_ready(&self, namespace: &str, name: &str) {
        kubelet::mark_pod_ready(&self.client, namespace, name).expect("mark pod ready");
    }

    pub fn mark_pod_failed(&self, namespace: &str, name: &str, message: &str) {
        kubelet::mark_pod_failed(&self.client, namespace, name, message).expect("mark pod failed");
    }

    /// Marks every pod that is not yet ready as ready.
    pub fn mark_all_pods_ready(&self) {
        for pod in self.client.list::<Pod>(None).expect("list pods") {
            if !pod.is_ready() {
                self.mark_pod_ready(&pod.metadata.namespace, &pod.metadata.name);
            }
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Store wrapper that fails a configured number of writes per kind.
pub struct FlakyApi {
    inner: Arc<dyn ObjectApi>,
    failing_creates: Mutex<HashMap<ResourceKind, usize>>,
    failing_updates: Mutex<HashMap<ResourceKind, usize>>,
}

impl FlakyApi {
    pub fn new(inner: Arc<dyn ObjectApi>) -> Self {
        Self {
            inner,
            failing_creates: Mutex::new(HashMap::new()),
            failing_updates: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryApi::new()))
    }

    pub fn fail_next_creates(&self, kind: ResourceKind, count: usize) {
        *self.failing_creates.lock().unwrap().entry(kind).or_default() += count;
    }

    pub fn fail_next_updates(&self, kind: ResourceKind, count: usize) {
        *self.failing_updates.lock().unwrap().entry(kind).or_default() += count;
    }

    fn take(counters: &Mutex<HashMap<ResourceKind, usize>>, kind: ResourceKind) -> bool {
        let mut counters = counters.lock().unwrap();
        match counters.get_mut(&kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl ObjectApi for FlakyApi {
    fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Value, StoreError> {
        self.inner.get(kind, namespace, name)
    }

    fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Vec<Value>, StoreError> {
        self.inner.list(kind, namespace)
    }

    fn create(&self, kind: ResourceKind, object: Value) -> Result<Value, StoreError> {
        if Self::take(&self.failing_creates, kind) {
            return Err(StoreError::Unavailable(format!("injected {kind} create failure")));
        }
        self.inner.create(kind, object)
    }

    fn update(&self, kind: ResourceKind, object: Value) -> Result<Value, StoreError> {
        if Self::take(&self.failing_updates, kind) {
            return Err(StoreError::Unavailable(format!("injected {kind} update failure")));
        }
        self.inner.update(kind, object)
    }

    fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<(), StoreError> {
        self.inner.delete(kind, namespace, name, preconditions)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.watch()
    }
}
