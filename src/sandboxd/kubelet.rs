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

//! Simulated node agent for the in-memory platform: starts every new pod by
//! marking it running and ready after a fixed delay.

use crate::sandboxd::k8s::pod::{Pod, PodCondition, PodStatus};
use crate::sandboxd::k8s::store::{Client, ResourceKind, StoreError, WatchEventType};
use crate::sandboxd::logger::{log_debug, log_warn};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "kubelet";
const STATUS_WRITE_ATTEMPTS: usize = 5;

/// Re-reads the pod and rewrites its status until the write lands.
fn write_pod_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &PodStatus,
) -> Result<Pod, StoreError> {
    let mut attempt = 0;
    loop {
        let mut pod: Pod = client.get(namespace, name)?;
        if pod.status.as_ref() == Some(status) {
            return Ok(pod);
        }
        pod.status = Some(status.clone());
        match client.update(&pod) {
            Err(err) if err.is_conflict() && attempt + 1 < STATUS_WRITE_ATTEMPTS => attempt += 1,
            other => return other,
        }
    }
}

pub fn ready_status() -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        conditions: vec![PodCondition {
            condition_type: "Ready".to_string(),
            status: "True".to_string(),
        }],
        message: None,
    }
}

/// Marks the pod running with `Ready=True`.
pub fn mark_pod_ready(client: &Client, namespace: &str, name: &str) -> Result<Pod, StoreError> {
    write_pod_status(client, namespace, name, &ready_status())
}

/// Marks the pod terminally failed.
pub fn mark_pod_failed(
    client: &Client,
    namespace: &str,
    name: &str,
    message: &str,
) -> Result<Pod, StoreError> {
    let status = PodStatus {
        phase: Some("Failed".to_string()),
        conditions: vec![PodCondition {
            condition_type: "Ready".to_string(),
            status: "False".to_string(),
        }],
        message: Some(message.to_string()),
    };
    write_pod_status(client, namespace, name, &status)
}

pub struct SimulatedKubelet {
    client: Client,
    startup_delay: Duration,
}

impl SimulatedKubelet {
    pub fn new(client: Client, startup_delay: Duration) -> Self {
        Self {
            client,
            startup_delay,
        }
    }

    fn start_pod(&self, namespace: String, name: String) {
        let client = self.client.clone();
        let delay = self.startup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match mark_pod_ready(&client, &namespace, &name) {
                Ok(_) => log_debug(COMPONENT, "pod ready", &[("namespace", &namespace), ("pod", &name)]),
                Err(err) if err.is_not_found() => {}
                Err(err) => log_warn(
                    COMPONENT,
                    "failed to start pod",
                    &[("namespace", &namespace), ("pod", &name), ("error", &err.to_string())],
                ),
            }
        });
    }

    /// Watches for new pods until `shutdown` fires. Pods that exist before
    /// the watch starts are started too.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self.client.watch();
        tokio::spawn(async move {
            match self.client.list::<Pod>(None) {
                Ok(pods) => {
                    for pod in pods.into_iter().filter(|pod| pod.status.is_none()) {
                        self.start_pod(pod.metadata.namespace, pod.metadata.name);
                    }
                }
                Err(err) => log_warn(COMPONENT, "failed to list pods", &[("error", &err.to_string())]),
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) if event.kind == ResourceKind::Pod
                            && event.event_type == WatchEventType::Added => {
                            self.start_pod(event.namespace, event.name);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => log_warn(
                            COMPONENT,
                            "pod watch lagged",
                            &[("skipped", &skipped.to_string())],
                        ),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandboxd::k8s::pod::ObjectMeta;
    use crate::sandboxd::k8s::store::InMemoryApi;
    use std::sync::Arc;

    fn pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata = ObjectMeta::named("default", name);
        pod
    }

    #[test]
    fn marking_ready_is_idempotent() {
        let client = Client::new(Arc::new(InMemoryApi::new()));
        client.create(&pod("p1")).expect("pod");
        let first = mark_pod_ready(&client, "default", "p1").expect("ready");
        assert!(first.is_ready());
        let second = mark_pod_ready(&client, "default", "p1").expect("ready again");
        assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
    }

    #[test]
    fn failed_pods_carry_the_message() {
        let client = Client::new(Arc::new(InMemoryApi::new()));
        client.create(&pod("p2")).expect("pod");
        let failed = mark_pod_failed(&client, "default", "p2", "OOMKilled").expect("failed");
        assert!(failed.is_failed());
        assert!(!failed.is_ready());
        assert_eq!(
            failed.status.and_then(|s| s.message).as_deref(),
            Some("OOMKilled")
        );
    }

    #[tokio::test]
    async fn new_pods_become_ready_after_the_delay() {
        let client = Client::new(Arc::new(InMemoryApi::new()));
        let shutdown = CancellationToken::new();
        let handle = SimulatedKubelet::new(client.clone(), Duration::from_millis(5))
            .spawn(shutdown.clone());
        tokio::task::yield_now().await;
        client.create(&pod("p3")).expect("pod");

        let mut ready = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if client.get::<Pod>("default", "p3").expect("pod").is_ready() {
                ready = true;
                break;
            }
        }
        assert!(ready);
        shutdown.cancel();
        handle.await.expect("kubelet stops");
    }
}
