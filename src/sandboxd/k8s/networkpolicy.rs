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

//! NetworkPolicy objects plus the template-level policy they are rendered from.

use crate::sandboxd::k8s::pod::ObjectMeta;
use crate::sandboxd::k8s::store::{Resource, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const POLICY_TYPE_INGRESS: &str = "Ingress";
pub const POLICY_TYPE_EGRESS: &str = "Egress";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NetworkPolicySpec,
}

impl Resource for NetworkPolicy {
    const KIND: ResourceKind = ResourceKind::NetworkPolicy;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicySpec {
    #[serde(rename = "podSelector", default)]
    pub pod_selector: BTreeMap<String, String>,
    #[serde(rename = "policyTypes", default)]
    pub policy_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<NetworkPolicyIngressRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<NetworkPolicyEgressRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyIngressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<NetworkPolicyPeer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPolicyPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyEgressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<NetworkPolicyPeer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPolicyPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyPeer {
    #[serde(rename = "podSelector", default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<BTreeMap<String, String>>,
    #[serde(rename = "namespaceSelector", default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<BTreeMap<String, String>>,
    #[serde(rename = "ipBlock", default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IpBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<NetworkPolicyPortValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkPolicyPortValue {
    Int(u16),
    Str(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBlock {
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

/// Network isolation requested by a template for every claimed sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxNetworkPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Where the ingress controller runs; it may always reach the sandbox.
    #[serde(
        rename = "ingressControllerSelectors",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ingress_controller_selectors: Option<PeerSelectors>,
    #[serde(rename = "ingressFromIPBlocks", default, skip_serializing_if = "Vec::is_empty")]
    pub ingress_from_ip_blocks: Vec<IpBlock>,
    #[serde(rename = "additionalIngressRules", default, skip_serializing_if = "Vec::is_empty")]
    pub additional_ingress_rules: Vec<AdditionalIngressRule>,
    #[serde(rename = "additionalEgressRules", default, skip_serializing_if = "Vec::is_empty")]
    pub additional_egress_rules: Vec<AdditionalEgressRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSelectors {
    #[serde(rename = "namespaceSelector", default)]
    pub namespace_selector: BTreeMap<String, String>,
    #[serde(rename = "podSelector", default)]
    pub pod_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalIngressRule {
    #[serde(rename = "inNamespaceSelector", default, skip_serializing_if = "Option::is_none")]
    pub in_namespace_selector: Option<BTreeMap<String, String>>,
    #[serde(rename = "fromPodSelector", default, skip_serializing_if = "Option::is_none")]
    pub from_pod_selector: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalEgressRule {
    #[serde(rename = "toIPBlock", default, skip_serializing_if = "Option::is_none")]
    pub to_ip_block: Option<IpBlock>,
    #[serde(rename = "toPodSelector", default, skip_serializing_if = "Option::is_none")]
    pub to_pod_selector: Option<BTreeMap<String, String>>,
    #[serde(rename = "inNamespaceSelector", default, skip_serializing_if = "Option::is_none")]
    pub in_namespace_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<EgressPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressPort {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}
