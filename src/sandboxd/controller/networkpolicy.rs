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

//! Per-claim network isolation.
//!
//! A template with an enabled `networkPolicy` gets one NetworkPolicy per
//! claim, controlled by the claim and selecting the bound sandbox's pod by
//! its name-hash label. Egress to cluster DNS is always allowed. When the
//! template stops asking for isolation the policy is removed.

use crate::sandboxd::controller::error::ControllerError;
use crate::sandboxd::k8s::claim::SandboxClaim;
use crate::sandboxd::k8s::naming::{name_hash, LABEL_SANDBOX_NAME_HASH};
use crate::sandboxd::k8s::networkpolicy::{
    IpBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicyPortValue, NetworkPolicySpec, SandboxNetworkPolicy,
    POLICY_TYPE_EGRESS, POLICY_TYPE_INGRESS,
};
use crate::sandboxd::k8s::pod::{ObjectMeta, OwnerReference};
use crate::sandboxd::k8s::store::{Client, Resource};
use crate::sandboxd::k8s::template::SandboxTemplate;
use crate::sandboxd::logger::{log_debug, log_info};
use std::collections::BTreeMap;

const COMPONENT: &str = "networkpolicy";
const DEFAULT_PROTOCOL: &str = "TCP";
const DNS_PORT: u16 = 53;

pub fn policy_name(claim: &str) -> String {
    format!("{claim}-network-policy")
}

fn selector(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

fn port(number: u16, protocol: Option<&str>) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some(protocol.unwrap_or(DEFAULT_PROTOCOL).to_string()),
        port: Some(NetworkPolicyPortValue::Int(number)),
    }
}

fn dns_egress() -> NetworkPolicyEgressRule {
    let namespace = BTreeMap::from([(
        "kubernetes.io/metadata.name".to_string(),
        "kube-system".to_string(),
    )]);
    let pods = BTreeMap::from([("k8s-app".to_string(), "kube-dns".to_string())]);
    NetworkPolicyEgressRule {
        to: vec![NetworkPolicyPeer {
            namespace_selector: Some(namespace),
            pod_selector: Some(pods),
            ip_block: None,
        }],
        ports: vec![port(DNS_PORT, Some("UDP")), port(DNS_PORT, Some("TCP"))],
    }
}

fn ingress_rules(
    policy: &SandboxNetworkPolicy,
    template: &SandboxTemplate,
) -> Vec<NetworkPolicyIngressRule> {
    let mut peers = Vec::new();
    if let Some(selectors) = policy.ingress_controller_selectors.as_ref() {
        peers.push(NetworkPolicyPeer {
            namespace_selector: selector(&selectors.namespace_selector),
            pod_selector: selector(&selectors.pod_selector),
            ip_block: None,
        });
    }
    for block in &policy.ingress_from_ip_blocks {
        peers.push(NetworkPolicyPeer {
            ip_block: Some(IpBlock {
                cidr: block.cidr.clone(),
                except: Vec::new(),
            }),
            ..NetworkPolicyPeer::default()
        });
    }
    for rule in &policy.additional_ingress_rules {
        peers.push(NetworkPolicyPeer {
            namespace_selector: rule.in_namespace_selector.clone(),
            pod_selector: rule.from_pod_selector.clone(),
            ip_block: None,
        });
    }
    if peers.is_empty() {
        return Vec::new();
    }

    let ports = template
        .spec
        .pod_template
        .spec
        .containers
        .iter()
        .flat_map(|container| container.ports.iter())
        .map(|p| port(p.container_port, p.protocol.as_deref()))
        .collect();
    vec![NetworkPolicyIngressRule { from: peers, ports }]
}

fn egress_rules(policy: &SandboxNetworkPolicy) -> Vec<NetworkPolicyEgressRule> {
    let mut rules = vec![dns_egress()];
    for rule in &policy.additional_egress_rules {
        let mut peers = Vec::new();
        if let Some(block) = rule.to_ip_block.as_ref() {
            peers.push(NetworkPolicyPeer {
                ip_block: Some(block.clone()),
                ..NetworkPolicyPeer::default()
            });
        } else if let Some(pods) = rule.to_pod_selector.as_ref() {
            peers.push(NetworkPolicyPeer {
                namespace_selector: rule.in_namespace_selector.clone(),
                pod_selector: Some(pods.clone()),
                ip_block: None,
            });
        }
        let ports = rule
            .ports
            .iter()
            .map(|p| port(p.port, p.protocol.as_deref()))
            .collect();
        rules.push(NetworkPolicyEgressRule { to: peers, ports });
    }
    rules
}

/// Renders the policy `template` requests for `claim` bound to `sandbox`,
/// or `None` when the template does not ask for isolation.
pub fn build_network_policy(
    claim: &SandboxClaim,
    template: &SandboxTemplate,
    sandbox: &str,
) -> Result<Option<NetworkPolicy>, ControllerError> {
    let Some(policy) = template.spec.network_policy.as_ref().filter(|p| p.enabled) else {
        return Ok(None);
    };
    let owner = OwnerReference::controller_for(SandboxClaim::KIND.as_str(), &claim.metadata)
        .ok_or_else(|| {
            ControllerError::InvariantViolation(format!(
                "claim {}/{} has no uid",
                claim.metadata.namespace, claim.metadata.name
            ))
        })?;

    let mut metadata = ObjectMeta::named(&claim.metadata.namespace, &policy_name(&claim.metadata.name));
    metadata.owner_references = vec![owner];
    Ok(Some(NetworkPolicy {
        metadata,
        spec: NetworkPolicySpec {
            pod_selector: BTreeMap::from([(LABEL_SANDBOX_NAME_HASH.to_string(), name_hash(sandbox))]),
            policy_types: vec![POLICY_TYPE_INGRESS.to_string(), POLICY_TYPE_EGRESS.to_string()],
            ingress: ingress_rules(policy, template),
            egress: egress_rules(policy),
        },
    }))
}

/// Creates, updates or removes the claim's policy so it matches `template`.
pub fn sync_network_policy(
    client: &Client,
    claim: &SandboxClaim,
    template: &SandboxTemplate,
    sandbox: &str,
) -> Result<(), ControllerError> {
    let namespace = claim.metadata.namespace.as_str();
    let name = policy_name(&claim.metadata.name);
    let desired = build_network_policy(claim, template, sandbox)?;
    let live = client.get_opt::<NetworkPolicy>(namespace, &name)?;
    let uid = claim.metadata.uid.as_deref().unwrap_or_default();

    match (desired, live) {
        (None, None) => Ok(()),
        (None, Some(live)) => {
            if !live.metadata.is_controlled_by(uid) {
                return Ok(());
            }
            match client.delete_observed(&live) {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {}
            }
            log_info(
                COMPONENT,
                "removed network policy",
                &[("namespace", namespace), ("claim", &claim.metadata.name)],
            );
            Ok(())
        }
        (Some(desired), None) => {
            client.create(&desired)?;
            log_info(
                COMPONENT,
                "created network policy",
                &[
                    ("namespace", namespace),
                    ("claim", &claim.metadata.name),
                    ("sandbox", sandbox),
                ],
            );
            Ok(())
        }
        (Some(desired), Some(mut live)) => {
            if !live.metadata.is_controlled_by(uid) {
                return Err(ControllerError::InvariantViolation(format!(
                    "network policy {name} already exists and is not owned by claim {}",
                    claim.metadata.name
                )));
            }
            if live.spec == desired.spec {
                return Ok(());
            }
            live.spec = desired.spec;
            client.update(&live)?;
            log_debug(
                COMPONENT,
                "updated network policy",
                &[("namespace", namespace), ("claim", &claim.metadata.name)],
            );
            Ok(())
        }
    }
}
