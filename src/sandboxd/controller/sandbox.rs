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

//! Sandbox controller.
//!
//! Keeps exactly one pod per sandbox, named after the sandbox and controlled
//! by it, and mirrors pod readiness onto the sandbox status:
//! `Pending -> Creating -> Ready`, with `Paused`, `Failed` and `Terminating`
//! as side exits. Pod labels and annotations follow the sandbox's pod
//! template through the three-way metadata merge, so claim metadata changes
//! reach a running pod without recreating it. A service of the same name
//! selects the pod; it is headless unless `spec.networking.service` asks for
//! an exposed one.

use crate::sandboxd::controller::error::ControllerError;
use crate::sandboxd::controller::reconcile::{
    ReconcileContext, ReconcileData, ReconcileOutcome, Reconciler,
};
use crate::sandboxd::controller::runtime::ControllerTarget;
use crate::sandboxd::k8s::condition::{
    find_condition, set_condition, Condition, ConditionStatus, CONDITION_DEGRADED,
    CONDITION_READY,
};
use crate::sandboxd::clock::elapsed_ms;
use crate::sandboxd::k8s::naming::{
    name_hash, ANNOTATION_POD_NAME, ANNOTATION_READINESS_OBSERVED, FINALIZER_SANDBOX,
    LABEL_SANDBOX_NAME_HASH,
};
use crate::sandboxd::k8s::pod::{ObjectMeta, OwnerReference, Pod};
use crate::sandboxd::k8s::sandbox::{Sandbox, SandboxPhase, SandboxStatus};
use crate::sandboxd::k8s::service::{service_fqdn, Service, ServiceSpec, CLUSTER_IP_NONE};
use crate::sandboxd::k8s::store::{Client, Resource, ResourceKind};
use crate::sandboxd::logger::{log_debug, log_info, log_warn};
use crate::sandboxd::metadata::{merge, AppliedKeys, Metadata};
use crate::sandboxd::observability::metrics;
use crate::sandboxd::observability::tracing::{self, TraceContext};
use chrono::{DateTime, SecondsFormat, Utc};

const COMPONENT: &str = "sandbox-controller";

pub const REASON_POD_READY: &str = "PodReady";
pub const REASON_POD_NOT_READY: &str = "PodNotReady";
pub const REASON_POD_CREATING: &str = "PodCreating";
pub const REASON_POD_FAILED: &str = "PodFailed";
pub const REASON_PAUSED: &str = "Paused";
pub const REASON_TERMINATING: &str = "Terminating";
pub const REASON_NAME_COLLISION: &str = "PodNameCollision";
pub const REASON_SERVICE_COLLISION: &str = "ServiceNameCollision";

/// State observed for one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxObservedState {
    pub pod: Option<Pod>,
    pub service: Option<Service>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PodAction {
    None,
    Create(Pod),
    /// Rewrite labels and annotations of the live pod.
    SyncMetadata(Pod),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceAction {
    None,
    Create(Service),
    /// Rewrite selector, ports and type of the live service.
    Update(Service),
    /// Headless and exposed services cannot be converted in place.
    Replace { stale: Service, desired: Service },
}

#[derive(Debug, Clone)]
pub struct SandboxPlan {
    pub sandbox: Sandbox,
    /// Sandbox metadata that must be written first (finalizer, pod back-reference).
    pub metadata_update: Option<ObjectMeta>,
    pub pod_action: PodAction,
    pub service_action: ServiceAction,
    pub status: SandboxStatus,
    /// Milliseconds from creation to first readiness, emitted once the
    /// readiness annotation is stored.
    pub creation_latency_ms: Option<u64>,
    pub release_finalizer: bool,
    pub violation: Option<String>,
    pub requeue_after: Option<std::time::Duration>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxController;

impl SandboxController {
    pub fn new() -> Self {
        Self
    }
}

/// Labels the controller owns on every pod, on top of the pod template.
fn managed_pod_metadata(sandbox: &Sandbox) -> Metadata {
    Metadata::default().with_label(LABEL_SANDBOX_NAME_HASH, name_hash(&sandbox.metadata.name))
}

/// Builds the pod for `sandbox`: same name and namespace, controlled by it.
pub fn build_pod(sandbox: &Sandbox) -> Result<(Pod, AppliedKeys), ControllerError> {
    let owner = OwnerReference::controller_for(ResourceKind::Sandbox.as_str(), &sandbox.metadata)
        .ok_or_else(|| {
            ControllerError::InvariantViolation(format!(
                "sandbox {}/{} has no uid",
                sandbox.metadata.namespace, sandbox.metadata.name
            ))
        })?;
    let outcome = merge(
        &Metadata::default(),
        &sandbox.spec.pod_template.metadata,
        &managed_pod_metadata(sandbox),
        &Default::default(),
    );

    let mut metadata = ObjectMeta::named(&sandbox.metadata.namespace, &sandbox.metadata.name);
    metadata.apply_projection(outcome.metadata);
    metadata.owner_references = vec![owner];

    Ok((
        Pod {
            metadata,
            spec: sandbox.spec.pod_template.spec.clone(),
            status: None,
        },
        outcome.applied,
    ))
}

/// Builds the service fronting `sandbox`: same name, selecting its pod.
pub fn build_service(sandbox: &Sandbox) -> Result<Service, ControllerError> {
    let owner = OwnerReference::controller_for(ResourceKind::Sandbox.as_str(), &sandbox.metadata)
        .ok_or_else(|| {
            ControllerError::InvariantViolation(format!(
                "sandbox {}/{} has no uid",
                sandbox.metadata.namespace, sandbox.metadata.name
            ))
        })?;
    let hash = name_hash(&sandbox.metadata.name);

    let mut metadata = ObjectMeta::named(&sandbox.metadata.namespace, &sandbox.metadata.name);
    metadata
        .labels
        .insert(LABEL_SANDBOX_NAME_HASH.to_string(), hash.clone());
    metadata.owner_references = vec![owner];

    let mut spec = ServiceSpec::default();
    spec.selector.insert(LABEL_SANDBOX_NAME_HASH.to_string(), hash);
    match sandbox
        .spec
        .networking
        .as_ref()
        .and_then(|networking| networking.service.as_ref())
    {
        Some(exposure) => {
            spec.type_name = Some(
                exposure
                    .type_name
                    .clone()
                    .unwrap_or_else(|| "ClusterIP".to_string()),
            );
            spec.ports = exposure.ports.clone();
        }
        None => spec.cluster_ip = Some(CLUSTER_IP_NONE.to_string()),
    }
    Ok(Service { metadata, spec })
}

/// Decides how to bring `live` in line with `desired`. Only the fields the
/// controller sets are compared, so platform-assigned values do not churn.
fn plan_service(live: &Service, desired: Service) -> ServiceAction {
    if live.is_headless() != desired.is_headless() {
        return ServiceAction::Replace {
            stale: live.clone(),
            desired,
        };
    }
    let drifted = live.spec.selector != desired.spec.selector
        || live.spec.ports != desired.spec.ports
        || (!desired.is_headless() && live.spec.type_name != desired.spec.type_name)
        || live.metadata.labels.get(LABEL_SANDBOX_NAME_HASH)
            != desired.metadata.labels.get(LABEL_SANDBOX_NAME_HASH);
    if !drifted {
        return ServiceAction::None;
    }
    let mut updated = live.clone();
    updated.metadata.labels.extend(desired.metadata.labels);
    updated.spec.selector = desired.spec.selector;
    updated.spec.ports = desired.spec.ports;
    updated.spec.type_name = desired.spec.type_name;
    ServiceAction::Update(updated)
}

fn apply_service(
    client: &Client,
    action: ServiceAction,
    namespace: &str,
    name: &str,
) -> Result<(), ControllerError> {
    match action {
        ServiceAction::None => {}
        ServiceAction::Create(service) => match client.create(&service) {
            Ok(_) => log_info(
                COMPONENT,
                "created service",
                &[("namespace", namespace), ("sandbox", name)],
            ),
            Err(err) if err.is_already_exists() => {
                let existing = client.get::<Service>(namespace, name)?;
                let uid = service
                    .metadata
                    .controller_ref()
                    .map(|owner| owner.uid.as_str())
                    .unwrap_or_default();
                if !existing.metadata.is_controlled_by(uid) {
                    return Err(ControllerError::InvariantViolation(format!(
                        "service {name} already exists and is owned by another object"
                    )));
                }
            }
            Err(err) => return Err(err.into()),
        },
        ServiceAction::Update(service) => {
            client.update(&service)?;
            log_debug(
                COMPONENT,
                "synced service",
                &[("namespace", namespace), ("sandbox", name)],
            );
        }
        ServiceAction::Replace { stale, desired } => {
            match client.delete_observed(&stale) {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {}
            }
            client.create(&desired)?;
            log_info(
                COMPONENT,
                "replaced service",
                &[("namespace", namespace), ("sandbox", name)],
            );
        }
    }
    Ok(())
}

fn ready_condition(
    status: &mut SandboxStatus,
    state: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_READY, state, reason, message, now),
    );
}

fn clear_degraded(status: &mut SandboxStatus, now: DateTime<Utc>) {
    if find_condition(&status.conditions, CONDITION_DEGRADED).is_some() {
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_DEGRADED, ConditionStatus::False, "AsExpected", "", now),
        );
    }
}

fn mark_collision(status: &mut SandboxStatus, reason: &str, message: &str, now: DateTime<Utc>) {
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_DEGRADED, ConditionStatus::True, reason, message, now),
    );
    ready_condition(status, ConditionStatus::False, reason, message, now);
}

impl Reconciler for SandboxController {
    type Desired = Sandbox;
    type Observed = SandboxObservedState;
    type Plan = SandboxPlan;
    type Error = ControllerError;

    fn kind(&self) -> &'static str {
        "sandbox"
    }

    fn fetch(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Option<ReconcileData<Self::Desired, Self::Observed>>, Self::Error> {
        let client = ctx.client()?;
        let Some(sandbox) = client.get_opt::<Sandbox>(target.namespace(), target.name())? else {
            return Ok(None);
        };
        let pod = client.get_opt::<Pod>(target.namespace(), target.name())?;
        let service = client.get_opt::<Service>(target.namespace(), target.name())?;
        let now = ctx.clock()?.now();
        Ok(Some(ReconcileData {
            desired: sandbox,
            observed: SandboxObservedState { pod, service, now },
        }))
    }

    fn diff(
        &self,
        _target: &ControllerTarget,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error> {
        let now = observed.now;
        let name = desired.metadata.name.clone();
        let uid = desired.metadata.uid.clone().unwrap_or_default();
        let owned_pod = observed
            .pod
            .as_ref()
            .filter(|pod| pod.metadata.is_controlled_by(&uid));

        let mut plan = SandboxPlan {
            sandbox: desired.clone(),
            metadata_update: None,
            pod_action: PodAction::None,
            service_action: ServiceAction::None,
            status: desired.status.clone(),
            creation_latency_ms: None,
            release_finalizer: false,
            violation: None,
            requeue_after: None,
        };
        plan.status.pod_name = Some(name.clone());

        if desired.metadata.is_deleting() {
            plan.status.phase = SandboxPhase::Terminating;
            ready_condition(&mut plan.status, ConditionStatus::False, REASON_TERMINATING, "", now);
            if owned_pod.is_some() {
                plan.pod_action = PodAction::Delete;
            } else {
                plan.release_finalizer = desired.metadata.has_finalizer(FINALIZER_SANDBOX);
            }
            return Ok(plan);
        }

        let mut metadata = desired.metadata.clone();
        let mut metadata_changed = false;
        if !metadata.has_finalizer(FINALIZER_SANDBOX) {
            metadata.finalizers.push(FINALIZER_SANDBOX.to_string());
            metadata_changed = true;
        }
        if metadata.annotation(ANNOTATION_POD_NAME) != Some(name.as_str()) {
            metadata
                .annotations
                .insert(ANNOTATION_POD_NAME.to_string(), name.clone());
            metadata_changed = true;
        }
        if metadata_changed {
            plan.metadata_update = Some(metadata);
        }

        if let Some(pod) = observed.pod.as_ref().filter(|_| owned_pod.is_none()) {
            let owner = pod
                .metadata
                .controller_ref()
                .map(|o| format!("{} {}", o.kind, o.name))
                .unwrap_or_else(|| "no controller".to_string());
            let message = format!("pod {name} already exists and is owned by {owner}");
            mark_collision(&mut plan.status, REASON_NAME_COLLISION, &message, now);
            plan.violation = Some(message);
            return Ok(plan);
        }

        let service = build_service(desired)?;
        match observed.service.as_ref() {
            None => plan.service_action = ServiceAction::Create(service),
            Some(live) if live.metadata.is_controlled_by(&uid) => {
                plan.service_action = plan_service(live, service);
            }
            Some(_) => {
                let message = format!("service {name} already exists and is owned by another object");
                mark_collision(&mut plan.status, REASON_SERVICE_COLLISION, &message, now);
                plan.violation = Some(message);
                return Ok(plan);
            }
        }
        plan.status.service = Some(name.clone());
        plan.status.service_fqdn = Some(service_fqdn(&name, &desired.metadata.namespace));
        clear_degraded(&mut plan.status, now);

        let shutdown_due = desired
            .spec
            .shutdown_time
            .map(|deadline| deadline <= now)
            .unwrap_or(false);
        if desired.spec.paused || shutdown_due {
            if owned_pod.is_some() {
                plan.pod_action = PodAction::Delete;
            }
            plan.status.phase = SandboxPhase::Paused;
            let message = if shutdown_due {
                "shutdown time reached"
            } else {
                "sandbox is paused"
            };
            ready_condition(&mut plan.status, ConditionStatus::False, REASON_PAUSED, message, now);
            return Ok(plan);
        }
        if let Some(deadline) = desired.spec.shutdown_time {
            plan.requeue_after = (deadline - now).to_std().ok();
        }

        match owned_pod {
            None => {
                let (pod, applied) = build_pod(desired)?;
                plan.pod_action = PodAction::Create(pod);
                plan.status.applied_pod_metadata = applied;
                plan.status.phase = SandboxPhase::Creating;
                ready_condition(&mut plan.status, ConditionStatus::False, REASON_POD_CREATING, "", now);
            }
            Some(pod) => {
                let outcome = merge(
                    &pod.metadata.projection(),
                    &desired.spec.pod_template.metadata,
                    &managed_pod_metadata(desired),
                    &desired.status.applied_pod_metadata,
                );
                if outcome.differs_from(&pod.metadata.projection()) {
                    let mut synced = pod.clone();
                    synced.metadata.apply_projection(outcome.metadata);
                    plan.pod_action = PodAction::SyncMetadata(synced);
                }
                plan.status.applied_pod_metadata = outcome.applied;

                if pod.is_ready() {
                    plan.status.phase = SandboxPhase::Ready;
                    ready_condition(
                        &mut plan.status,
                        ConditionStatus::True,
                        REASON_POD_READY,
                        "pod is ready; service exists",
                        now,
                    );
                    if desired.metadata.annotation(ANNOTATION_READINESS_OBSERVED).is_none() {
                        let metadata = plan
                            .metadata_update
                            .get_or_insert_with(|| desired.metadata.clone());
                        metadata.annotations.insert(
                            ANNOTATION_READINESS_OBSERVED.to_string(),
                            now.to_rfc3339_opts(SecondsFormat::Millis, true),
                        );
                        plan.creation_latency_ms = desired
                            .metadata
                            .creation_timestamp
                            .map(|created| elapsed_ms(created, now));
                    }
                } else if pod.is_failed() {
                    plan.status.phase = SandboxPhase::Failed;
                    let message = pod
                        .status
                        .as_ref()
                        .and_then(|s| s.message.clone())
                        .unwrap_or_else(|| "pod failed".to_string());
                    ready_condition(&mut plan.status, ConditionStatus::False, REASON_POD_FAILED, message, now);
                } else {
                    plan.status.phase = SandboxPhase::Creating;
                    ready_condition(&mut plan.status, ConditionStatus::False, REASON_POD_NOT_READY, "", now);
                }
            }
        }

        Ok(plan)
    }

    fn apply(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
        plan: Self::Plan,
    ) -> Result<ReconcileOutcome, Self::Error> {
        let client = ctx.client()?;
        let namespace = target.namespace();
        let name = target.name();
        let mut sandbox = plan.sandbox;
        let mut status = plan.status;

        if let Some(metadata) = plan.metadata_update {
            sandbox.metadata = metadata;
            sandbox = client.update(&sandbox)?;
            if let Some(elapsed) = plan.creation_latency_ms {
                metrics::record_sandbox_creation_latency(
                    sandbox.template_name().unwrap_or("none"),
                    elapsed,
                );
                log_info(
                    COMPONENT,
                    "sandbox first ready",
                    &[
                        ("namespace", namespace),
                        ("sandbox", name),
                        ("elapsed_ms", &elapsed.to_string()),
                    ],
                );
            }
        }

        if plan.release_finalizer {
            sandbox
                .metadata
                .finalizers
                .retain(|finalizer| finalizer != FINALIZER_SANDBOX);
            match client.update(&sandbox) {
                Err(err) if err.is_not_found() => {}
                other => {
                    other?;
                }
            }
            log_info(
                COMPONENT,
                "released sandbox",
                &[("namespace", namespace), ("sandbox", name)],
            );
            return Ok(ReconcileOutcome::Converged);
        }

        let mut violation = plan.violation;
        match plan.pod_action {
            PodAction::None => {}
            PodAction::Create(pod) => match client.create(&pod) {
                Ok(_) => log_info(
                    COMPONENT,
                    "created pod",
                    &[("namespace", namespace), ("sandbox", name)],
                ),
                Err(err) if err.is_already_exists() => {
                    let existing = client.get::<Pod>(namespace, name)?;
                    let uid = sandbox.metadata.uid.as_deref().unwrap_or_default();
                    if !existing.metadata.is_controlled_by(uid) {
                        let message = format!("pod {name} already exists and is owned by another object");
                        mark_collision(&mut status, REASON_NAME_COLLISION, &message, ctx.clock()?.now());
                        violation = Some(message);
                    }
                }
                Err(err) => return Err(err.into()),
            },
            PodAction::SyncMetadata(pod) => {
                client.update(&pod)?;
                log_debug(
                    COMPONENT,
                    "synced pod metadata",
                    &[("namespace", namespace), ("sandbox", name)],
                );
            }
            PodAction::Delete => match client.delete::<Pod>(namespace, name) {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => log_info(
                    COMPONENT,
                    "deleted pod",
                    &[("namespace", namespace), ("sandbox", name), ("phase", status.phase.as_str())],
                ),
            },
        }

        if violation.is_none() {
            match apply_service(&client, plan.service_action, namespace, name) {
                Err(ControllerError::InvariantViolation(message)) => {
                    mark_collision(&mut status, REASON_SERVICE_COLLISION, &message, ctx.clock()?.now());
                    violation = Some(message);
                }
                other => other?,
            }
        }

        if sandbox.status != status {
            sandbox.status = status;
            client.update(&sandbox)?;
        }

        if let Some(message) = violation {
            log_warn(
                COMPONENT,
                "name collision",
                &[("namespace", namespace), ("sandbox", name), ("detail", &message)],
            );
            return Err(ControllerError::InvariantViolation(message));
        }

        Ok(plan
            .requeue_after
            .map(ReconcileOutcome::RequeueAfter)
            .unwrap_or(ReconcileOutcome::Converged))
    }

    fn trace_parent(&self, desired: &Self::Desired) -> Option<TraceContext> {
        tracing::extract(&desired.metadata.annotations)
    }
}

/// Name of the sandbox a pod belongs to, if it is controlled by one.
pub fn owning_sandbox(pod: &Pod) -> Option<&str> {
    pod.metadata
        .controller_ref()
        .filter(|owner| owner.kind == Sandbox::KIND.as_str())
        .map(|owner| owner.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandboxd::clock::Clock;
    use crate::sandboxd::k8s::pod::ContainerSpec;
    use crate::sandboxd::k8s::sandbox::{NetworkingSpec, ServiceExposure};
    use crate::sandboxd::k8s::service::ServicePort;
    use crate::sandboxd::k8s::template::TemplateRef;
    use crate::sandboxd::test_support::Harness;

    fn sandbox(name: &str) -> Sandbox {
        let mut sandbox = Sandbox::default();
        sandbox.metadata = ObjectMeta::named("default", name);
        sandbox.spec.pod_template.metadata = Metadata::default().with_label("app", "agent");
        sandbox.spec.pod_template.spec.containers = vec![ContainerSpec {
            name: "agent".into(),
            image: Some("python:3.12".into()),
            ..ContainerSpec::default()
        }];
        sandbox
    }

    #[test]
    fn creates_pod_with_identical_name_then_reports_ready() {
        let harness = Harness::new();
        harness.client.create(&sandbox("sb-1")).expect("create sandbox");

        harness.reconcile_sandbox("default", "sb-1").expect("first pass");
        let pod: Pod = harness.client.get("default", "sb-1").expect("pod exists");
        assert_eq!(pod.metadata.name, "sb-1");
        assert_eq!(pod.metadata.label("app"), Some("agent"));
        assert_eq!(pod.metadata.label(LABEL_SANDBOX_NAME_HASH), Some(name_hash("sb-1").as_str()));
        assert_eq!(owning_sandbox(&pod), Some("sb-1"));

        let current: Sandbox = harness.client.get("default", "sb-1").expect("sandbox");
        assert_eq!(current.status.phase, SandboxPhase::Creating);
        assert!(current.metadata.has_finalizer(FINALIZER_SANDBOX));
        assert_eq!(current.metadata.annotation(ANNOTATION_POD_NAME), Some("sb-1"));

        harness.mark_pod_ready("default", "sb-1");
        harness.reconcile_sandbox("default", "sb-1").expect("second pass");
        let current: Sandbox = harness.client.get("default", "sb-1").expect("sandbox");
        assert_eq!(current.status.phase, SandboxPhase::Ready);
        assert_eq!(current.status.pod_name.as_deref(), Some("sb-1"));

        let version = current.metadata.resource_version.clone();
        harness.reconcile_sandbox("default", "sb-1").expect("converged pass");
        let again: Sandbox = harness.client.get("default", "sb-1").expect("sandbox");
        assert_eq!(again.metadata.resource_version, version, "converged reconcile must not write");
    }

    #[test]
    fn foreign_pod_with_same_name_is_a_terminal_collision() {
        let harness = Harness::new();
        let mut foreign = Pod::default();
        foreign.metadata = ObjectMeta::named("default", "sb-2");
        harness.client.create(&foreign).expect("foreign pod");
        harness.client.create(&sandbox("sb-2")).expect("sandbox");

        let err = harness
            .reconcile_sandbox("default", "sb-2")
            .expect_err("collision");
        assert!(matches!(err, ControllerError::InvariantViolation(_)));

        let current: Sandbox = harness.client.get("default", "sb-2").expect("sandbox");
        let degraded = find_condition(&current.status.conditions, CONDITION_DEGRADED).expect("degraded");
        assert_eq!(degraded.status, ConditionStatus::True);
        assert_eq!(degraded.reason, REASON_NAME_COLLISION);
    }

    #[test]
    fn deletion_removes_pod_before_releasing_sandbox() {
        let harness = Harness::new();
        harness.client.create(&sandbox("sb-3")).expect("sandbox");
        harness.reconcile_sandbox("default", "sb-3").expect("create pod");

        harness
            .client
            .delete::<Sandbox>("default", "sb-3")
            .expect("request deletion");
        harness.reconcile_sandbox("default", "sb-3").expect("delete pod");
        assert!(harness.client.get_opt::<Pod>("default", "sb-3").expect("lookup").is_none());
        let terminating: Sandbox = harness.client.get("default", "sb-3").expect("still present");
        assert_eq!(terminating.status.phase, SandboxPhase::Terminating);

        harness.reconcile_sandbox("default", "sb-3").expect("release");
        assert!(harness
            .client
            .get_opt::<Sandbox>("default", "sb-3")
            .expect("lookup")
            .is_none());
    }

    #[test]
    fn paused_sandbox_drops_its_pod() {
        let harness = Harness::new();
        harness.client.create(&sandbox("sb-4")).expect("sandbox");
        harness.reconcile_sandbox("default", "sb-4").expect("create pod");

        let mut current: Sandbox = harness.client.get("default", "sb-4").expect("sandbox");
        current.spec.paused = true;
        harness.client.update(&current).expect("pause");
        harness.reconcile_sandbox("default", "sb-4").expect("pause pass");

        assert!(harness.client.get_opt::<Pod>("default", "sb-4").expect("lookup").is_none());
        let paused: Sandbox = harness.client.get("default", "sb-4").expect("sandbox");
        assert_eq!(paused.status.phase, SandboxPhase::Paused);
    }

    #[test]
    fn future_shutdown_time_schedules_a_requeue() {
        let harness = Harness::new();
        let mut object = sandbox("sb-5");
        object.spec.shutdown_time = Some(harness.clock.now() + chrono::Duration::seconds(60));
        harness.client.create(&object).expect("sandbox");

        let outcome = harness.reconcile_sandbox("default", "sb-5").expect("pass");
        assert!(matches!(outcome, ReconcileOutcome::RequeueAfter(_)));

        harness.clock.advance(std::time::Duration::from_secs(61));
        harness.reconcile_sandbox("default", "sb-5").expect("shutdown pass");
        let current: Sandbox = harness.client.get("default", "sb-5").expect("sandbox");
        assert_eq!(current.status.phase, SandboxPhase::Paused);
    }

    #[test]
    fn headless_service_selects_the_pod_and_is_reported() {
        let harness = Harness::new();
        harness.client.create(&sandbox("sb-7")).expect("sandbox");
        harness.reconcile_sandbox("default", "sb-7").expect("first pass");

        let service: Service = harness.client.get("default", "sb-7").expect("service");
        assert!(service.is_headless());
        let hash = name_hash("sb-7");
        assert_eq!(service.spec.selector.get(LABEL_SANDBOX_NAME_HASH), Some(&hash));
        assert_eq!(service.metadata.label(LABEL_SANDBOX_NAME_HASH), Some(hash.as_str()));
        let pod: Pod = harness.client.get("default", "sb-7").expect("pod");
        assert_eq!(pod.metadata.label(LABEL_SANDBOX_NAME_HASH), Some(hash.as_str()));

        let current: Sandbox = harness.client.get("default", "sb-7").expect("sandbox");
        assert!(service
            .metadata
            .is_controlled_by(current.metadata.uid.as_deref().unwrap_or_default()));
        assert_eq!(current.status.service.as_deref(), Some("sb-7"));
        assert_eq!(
            current.status.service_fqdn.as_deref(),
            Some("sb-7.default.svc.cluster.local")
        );

        harness
            .client
            .delete::<Sandbox>("default", "sb-7")
            .expect("request deletion");
        harness.reconcile_sandbox("default", "sb-7").expect("delete pod");
        harness.reconcile_sandbox("default", "sb-7").expect("release");
        assert!(harness.client.get_opt::<Service>("default", "sb-7").expect("lookup").is_none());
    }

    #[test]
    fn requested_exposure_replaces_the_headless_service() {
        let harness = Harness::new();
        harness.client.create(&sandbox("sb-8")).expect("sandbox");
        harness.reconcile_sandbox("default", "sb-8").expect("first pass");

        let mut current: Sandbox = harness.client.get("default", "sb-8").expect("sandbox");
        current.spec.networking = Some(NetworkingSpec {
            service: Some(ServiceExposure {
                type_name: None,
                ports: vec![ServicePort {
                    name: Some("http".into()),
                    port: 80,
                    target_port: Some(8888),
                    protocol: Some("TCP".into()),
                }],
            }),
        });
        harness.client.update(&current).expect("expose");
        harness.reconcile_sandbox("default", "sb-8").expect("expose pass");

        let service: Service = harness.client.get("default", "sb-8").expect("service");
        assert!(!service.is_headless());
        assert_eq!(service.spec.type_name.as_deref(), Some("ClusterIP"));
        assert_eq!(service.spec.ports.len(), 1);
        assert_eq!(service.spec.ports[0].target_port, Some(8888));

        let version = service.metadata.resource_version.clone();
        harness.reconcile_sandbox("default", "sb-8").expect("steady pass");
        let again: Service = harness.client.get("default", "sb-8").expect("service");
        assert_eq!(again.metadata.resource_version, version);
    }

    #[test]
    fn foreign_service_with_same_name_is_a_terminal_collision() {
        let harness = Harness::new();
        let mut foreign = Service::default();
        foreign.metadata = ObjectMeta::named("default", "sb-9");
        harness.client.create(&foreign).expect("foreign service");
        harness.client.create(&sandbox("sb-9")).expect("sandbox");

        let err = harness
            .reconcile_sandbox("default", "sb-9")
            .expect_err("collision");
        assert!(matches!(err, ControllerError::InvariantViolation(_)));
        assert!(harness.client.get_opt::<Pod>("default", "sb-9").expect("lookup").is_none());

        let current: Sandbox = harness.client.get("default", "sb-9").expect("sandbox");
        let degraded = find_condition(&current.status.conditions, CONDITION_DEGRADED).expect("degraded");
        assert_eq!(degraded.reason, REASON_SERVICE_COLLISION);
        assert!(current.status.service.is_none());
    }

    #[test]
    fn first_readiness_records_creation_latency_once() {
        let harness = Harness::new();
        let template = "creation-latency-once";
        let mut object = sandbox("sb-10");
        object.spec.template_ref = Some(TemplateRef::new(template));
        harness.client.create(&object).expect("sandbox");
        harness.reconcile_sandbox("default", "sb-10").expect("create pod");

        harness.clock.advance(std::time::Duration::from_millis(1500));
        harness.mark_pod_ready("default", "sb-10");
        harness.reconcile_sandbox("default", "sb-10").expect("ready pass");
        assert_eq!(metrics::sandbox_creation_sample_count(template), 1);

        let current: Sandbox = harness.client.get("default", "sb-10").expect("sandbox");
        assert!(current.metadata.annotation(ANNOTATION_READINESS_OBSERVED).is_some());
        assert!(current.is_ready());

        harness.reconcile_sandbox("default", "sb-10").expect("steady pass");
        assert_eq!(metrics::sandbox_creation_sample_count(template), 1);
    }

    #[test]
    fn failed_pod_marks_sandbox_failed() {
        let harness = Harness::new();
        harness.client.create(&sandbox("sb-6")).expect("sandbox");
        harness.reconcile_sandbox("default", "sb-6").expect("create pod");
        harness.mark_pod_failed("default", "sb-6", "image pull backoff");
        harness.reconcile_sandbox("default", "sb-6").expect("observe failure");

        let current: Sandbox = harness.client.get("default", "sb-6").expect("sandbox");
        assert!(current.is_failed());
        let ready = find_condition(&current.status.conditions, CONDITION_READY).expect("ready");
        assert_eq!(ready.reason, REASON_POD_FAILED);
        assert_eq!(ready.message, "image pull backoff");
    }
}
