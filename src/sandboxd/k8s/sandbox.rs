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

use crate::sandboxd::k8s::condition::Condition;
use crate::sandboxd::k8s::pod::{ObjectMeta, PodTemplateSpec};
use crate::sandboxd::k8s::service::ServicePort;
use crate::sandboxd::k8s::store::{Resource, ResourceKind};
use crate::sandboxd::k8s::template::TemplateRef;
use crate::sandboxd::metadata::AppliedKeys;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One execution environment, always backed by a pod of the same name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub metadata: ObjectMeta,
    pub spec: SandboxSpec,
    #[serde(default)]
    pub status: SandboxStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    #[serde(
        rename = "sandboxTemplateRef",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub template_ref: Option<TemplateRef>,
    #[serde(rename = "podTemplate", default)]
    pub pod_template: PodTemplateSpec,
    #[serde(default)]
    pub paused: bool,
    #[serde(
        rename = "shutdownTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub shutdown_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<NetworkingSpec>,
}

/// How the sandbox is reachable from inside the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkingSpec {
    /// Exposes the sandbox through a regular service instead of a headless one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceExposure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceExposure {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxPhase {
    #[default]
    Pending,
    Creating,
    Ready,
    Paused,
    Failed,
    Terminating,
}

impl SandboxPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Creating => "Creating",
            SandboxPhase::Ready => "Ready",
            SandboxPhase::Paused => "Paused",
            SandboxPhase::Failed => "Failed",
            SandboxPhase::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(rename = "podName", default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Keys last written onto the pod by the metadata merge.
    #[serde(
        rename = "appliedPodMetadata",
        default,
        skip_serializing_if = "AppliedKeys::is_empty"
    )]
    pub applied_pod_metadata: AppliedKeys,
    /// Name of the service fronting the pod, once it exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(rename = "serviceFQDN", default, skip_serializing_if = "Option::is_none")]
    pub service_fqdn: Option<String>,
}

impl Sandbox {
    pub fn is_ready(&self) -> bool {
        self.status.phase == SandboxPhase::Ready
    }

    pub fn is_failed(&self) -> bool {
        self.status.phase == SandboxPhase::Failed
    }

    pub fn template_name(&self) -> Option<&str> {
        self.spec.template_ref.as_ref().map(|r| r.name.as_str())
    }
}

impl Resource for Sandbox {
    const KIND: ResourceKind = ResourceKind::Sandbox;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
