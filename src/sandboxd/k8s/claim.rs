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

use crate::sandboxd::k8s::condition::{find_condition, Condition, ConditionStatus, CONDITION_READY};
use crate::sandboxd::k8s::pod::ObjectMeta;
use crate::sandboxd::k8s::store::{Resource, ResourceKind};
use crate::sandboxd::k8s::template::TemplateRef;
use crate::sandboxd::metadata::{AppliedKeys, Metadata};
use serde::{Deserialize, Serialize};

pub const REASON_TEMPLATE_NOT_FOUND: &str = "TemplateNotFound";
pub const REASON_SANDBOX_NOT_READY: &str = "SandboxNotReady";
pub const REASON_SANDBOX_READY: &str = "SandboxReady";
pub const REASON_SANDBOX_FAILED: &str = "SandboxFailed";
pub const REASON_STARTUP_TIMEOUT: &str = "StartupTimeout";
pub const REASON_INVARIANT_VIOLATION: &str = "InvariantViolation";

/// Request for one ready sandbox stamped from a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxClaim {
    pub metadata: ObjectMeta,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimSpec {
    #[serde(rename = "sandboxTemplateRef")]
    pub template_ref: TemplateRef,
    #[serde(rename = "sandboxMetadata", default)]
    pub sandbox_metadata: Metadata,
    #[serde(rename = "podMetadata", default)]
    pub pod_metadata: Metadata,
}

/// How the bound sandbox was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchType {
    Warm,
    Cold,
    Unknown,
}

impl LaunchType {
    pub fn as_label(self) -> &'static str {
        match self {
            LaunchType::Warm => "warm",
            LaunchType::Cold => "cold",
            LaunchType::Unknown => "unknown",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "warm" => Some(LaunchType::Warm),
            "cold" => Some(LaunchType::Cold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSandboxRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<ClaimSandboxRef>,
    #[serde(rename = "launchType", default, skip_serializing_if = "Option::is_none")]
    pub launch_type: Option<LaunchType>,
    /// Set once the startup latency sample has been emitted.
    #[serde(rename = "startupRecorded", default)]
    pub startup_recorded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(
        rename = "appliedSandboxMetadata",
        default,
        skip_serializing_if = "AppliedKeys::is_empty"
    )]
    pub applied_sandbox_metadata: AppliedKeys,
    #[serde(
        rename = "appliedPodMetadata",
        default,
        skip_serializing_if = "AppliedKeys::is_empty"
    )]
    pub applied_pod_metadata: AppliedKeys,
}

impl ClaimStatus {
    /// A failed startup stays failed until the conditions are cleared.
    pub fn is_terminal(&self) -> bool {
        find_condition(&self.conditions, CONDITION_READY)
            .map(|condition| {
                condition.status == ConditionStatus::False
                    && (condition.reason == REASON_SANDBOX_FAILED
                        || condition.reason == REASON_STARTUP_TIMEOUT)
            })
            .unwrap_or(false)
    }

    pub fn sandbox_name(&self) -> Option<&str> {
        self.sandbox.as_ref().map(|s| s.name.as_str())
    }
}

impl SandboxClaim {
    pub fn new(namespace: &str, name: &str, template: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec: ClaimSpec {
                template_ref: TemplateRef::new(template),
                ..ClaimSpec::default()
            },
            status: ClaimStatus::default(),
        }
    }
}

impl Resource for SandboxClaim {
    const KIND: ResourceKind = ResourceKind::SandboxClaim;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
