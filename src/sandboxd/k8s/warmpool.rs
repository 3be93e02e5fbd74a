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
use crate::sandboxd::k8s::pod::ObjectMeta;
use crate::sandboxd::k8s::store::{Resource, ResourceKind};
use crate::sandboxd::k8s::template::TemplateRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keeps a number of idle sandboxes stamped from one template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxWarmPool {
    pub metadata: ObjectMeta,
    pub spec: WarmPoolSpec,
    #[serde(default)]
    pub status: WarmPoolStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmPoolSpec {
    pub replicas: u32,
    #[serde(rename = "sandboxTemplateRef")]
    pub template_ref: TemplateRef,
    /// Extra labels stamped on members and required of them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmPoolStatus {
    #[serde(default)]
    pub replicas: u32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: u32,
    #[serde(
        rename = "observedGeneration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl SandboxWarmPool {
    pub fn new(namespace: &str, name: &str, template: &str, replicas: u32) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec: WarmPoolSpec {
                replicas,
                template_ref: TemplateRef::new(template),
                selector: BTreeMap::new(),
            },
            status: WarmPoolStatus::default(),
        }
    }
}

impl Resource for SandboxWarmPool {
    const KIND: ResourceKind = ResourceKind::SandboxWarmPool;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
