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

use crate::sandboxd::k8s::networkpolicy::SandboxNetworkPolicy;
use crate::sandboxd::k8s::pod::{ObjectMeta, PodTemplateSpec};
use crate::sandboxd::k8s::store::{Resource, ResourceKind};
use crate::sandboxd::metadata::Metadata;
use serde::{Deserialize, Serialize};

/// Reference from a pool, sandbox or claim to a template by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
}

impl TemplateRef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

/// Read-only blueprint used to stamp new sandboxes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxTemplate {
    pub metadata: ObjectMeta,
    pub spec: SandboxTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxTemplateSpec {
    #[serde(rename = "podTemplate", default)]
    pub pod_template: PodTemplateSpec,
    /// Labels and annotations propagated onto every sandbox stamped from
    /// this template.
    #[serde(rename = "sandboxMetadata", default)]
    pub sandbox_metadata: Metadata,
    /// Isolation applied to sandboxes handed out through claims.
    #[serde(
        rename = "networkPolicy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub network_policy: Option<SandboxNetworkPolicy>,
}

impl SandboxTemplate {
    pub fn new(namespace: &str, name: &str, spec: SandboxTemplateSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
        }
    }

    /// Content hash of the spec, used to tell fresh pool members from stale ones.
    pub fn revision(&self) -> Result<String, serde_json::Error> {
        crate::sandboxd::k8s::naming::revision_hash(&self.spec)
    }
}

impl Resource for SandboxTemplate {
    const KIND: ResourceKind = ResourceKind::SandboxTemplate;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
