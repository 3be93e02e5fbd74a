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

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::sandboxd::k8s::store::Client;
use crate::sandboxd::k8s::template::SandboxTemplate;

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            message.truncate(ERROR_MAX_LEN);
        }
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

/// Inputs for the readiness probe.
#[derive(Clone)]
pub struct HealthProbe {
    client: Client,
    controllers_running: Arc<AtomicBool>,
}

impl HealthProbe {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            controllers_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_controllers_running(&self, running: bool) {
        self.controllers_running.store(running, Ordering::SeqCst);
    }

    /// Returns a readiness assessment used by `/readyz` and `/healthz`.
    pub fn readiness_report(&self) -> HealthReport {
        let mut components = Vec::with_capacity(2);

        match self.client.list::<SandboxTemplate>(None) {
            Ok(_) => components.push(ComponentHealth::healthy("object_store")),
            Err(err) => components.push(ComponentHealth::unhealthy("object_store", err)),
        }

        if self.controllers_running.load(Ordering::SeqCst) {
            components.push(ComponentHealth::healthy("controllers"));
        } else {
            components.push(ComponentHealth::unhealthy(
                "controllers",
                "controllers have not started",
            ));
        }

        let status = if components.iter().all(|component| component.healthy) {
            HealthStatus::Ready
        } else {
            HealthStatus::Degraded
        };

        HealthReport { status, components }
    }
}

/// Liveness only reports that the process answers requests.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth::healthy("process")],
    }
}
