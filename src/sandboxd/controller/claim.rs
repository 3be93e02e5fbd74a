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

//! Claim controller.
//!
//! Binds each claim to exactly one sandbox. Idle pool members are adopted by
//! rewriting their controller reference under the member's observed
//! `resourceVersion`, so of several claims racing for one member at most one
//! write lands; the losers re-list and eventually fall back to creating a
//! sandbox of their own. The sandbox a claim owns is always rediscovered by
//! listing, never trusted from status alone.

use crate::sandboxd::clock::elapsed_ms;
use crate::sandboxd::config::ControllerConfig;
use crate::sandboxd::controller::error::ControllerError;
use crate::sandboxd::controller::networkpolicy::sync_network_policy;
use crate::sandboxd::controller::reconcile::{
    ReconcileContext, ReconcileData, ReconcileOutcome, Reconciler,
};
use crate::sandboxd::controller::runtime::ControllerTarget;
use crate::sandboxd::k8s::claim::{
    ClaimSandboxRef, ClaimStatus, LaunchType, SandboxClaim, REASON_INVARIANT_VIOLATION,
    REASON_SANDBOX_FAILED, REASON_SANDBOX_NOT_READY, REASON_SANDBOX_READY,
    REASON_STARTUP_TIMEOUT, REASON_TEMPLATE_NOT_FOUND,
};
use crate::sandboxd::k8s::condition::{set_condition, Condition, ConditionStatus, CONDITION_READY};
use crate::sandboxd::k8s::naming::{
    name_hash, ANNOTATION_ADOPTED_FROM, ANNOTATION_LAUNCH_TYPE, ANNOTATION_TRACE_CONTEXT,
    LABEL_POOL, LABEL_TEMPLATE_REF_HASH,
};
use crate::sandboxd::k8s::pod::{ObjectMeta, OwnerReference};
use crate::sandboxd::k8s::sandbox::{Sandbox, SandboxSpec};
use crate::sandboxd::k8s::store::{Client, Resource};
use crate::sandboxd::k8s::template::SandboxTemplate;
use crate::sandboxd::k8s::warmpool::SandboxWarmPool;
use crate::sandboxd::logger::{log_debug, log_info, log_warn};
use crate::sandboxd::metadata::merge;
use crate::sandboxd::observability::metrics::{self, AdoptionResult, StartupStatus};
use crate::sandboxd::observability::tracing::{self, TraceContext};
use chrono::{DateTime, Utc};
use std::time::Duration;

const COMPONENT: &str = "claim-controller";

#[derive(Debug, Clone)]
pub struct ClaimObservedState {
    pub template: Option<SandboxTemplate>,
    /// Live sandboxes whose controller is this claim.
    pub owned: Vec<Sandbox>,
    pub candidates: Vec<Sandbox>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ClaimAction {
    /// Startup already failed; nothing changes until the conditions are cleared.
    Hold,
    Bind(Box<Sandbox>),
    Acquire,
    TemplateMissing,
    Violation(String),
}

#[derive(Debug, Clone)]
pub struct ClaimPlan {
    pub claim: SandboxClaim,
    pub template: Option<SandboxTemplate>,
    pub action: ClaimAction,
    pub candidates: Vec<Sandbox>,
    pub now: DateTime<Utc>,
}

/// Startup latency sample to emit once the status carrying it is stored.
struct StartupSample {
    launch_type: LaunchType,
    status: StartupStatus,
    elapsed_ms: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimController;

impl ClaimController {
    pub fn new() -> Self {
        Self
    }
}

/// Idle pool members stamped from the claim's template, best candidate first.
///
/// Ready members come before unready ones, then older before newer, then by
/// name.
pub fn idle_candidates(
    client: &Client,
    claim: &SandboxClaim,
) -> Result<Vec<Sandbox>, ControllerError> {
    let template = &claim.spec.template_ref.name;
    let template_hash = name_hash(template);
    let mut candidates: Vec<Sandbox> = client
        .list::<Sandbox>(Some(&claim.metadata.namespace))?
        .into_iter()
        .filter(|sandbox| {
            !sandbox.metadata.is_deleting()
                && !sandbox.is_failed()
                && sandbox
                    .metadata
                    .controller_ref()
                    .map(|owner| owner.kind == SandboxWarmPool::KIND.as_str())
                    .unwrap_or(false)
                && sandbox.metadata.label(LABEL_TEMPLATE_REF_HASH) == Some(template_hash.as_str())
                && sandbox.template_name() == Some(template.as_str())
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.is_ready()
            .cmp(&a.is_ready())
            .then_with(|| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    Ok(candidates)
}

/// Sandboxes controlled by `claim`, excluding those already being deleted.
pub fn owned_sandboxes(
    client: &Client,
    claim: &SandboxClaim,
) -> Result<Vec<Sandbox>, ControllerError> {
    let Some(uid) = claim.metadata.uid.as_deref() else {
        return Ok(Vec::new());
    };
    Ok(client
        .list::<Sandbox>(Some(&claim.metadata.namespace))?
        .into_iter()
        .filter(|sandbox| !sandbox.metadata.is_deleting() && sandbox.metadata.is_controlled_by(uid))
        .collect())
}

fn claim_owner(claim: &SandboxClaim) -> Result<OwnerReference, ControllerError> {
    OwnerReference::controller_for(SandboxClaim::KIND.as_str(), &claim.metadata).ok_or_else(|| {
        ControllerError::InvariantViolation(format!(
            "claim {}/{} has no uid",
            claim.metadata.namespace, claim.metadata.name
        ))
    })
}

/// Applies claim and template metadata to `sandbox` at both levels.
///
/// Returns whether anything changed; the applied key sets are recorded on
/// `status` for the next pass.
fn sync_metadata(
    sandbox: &mut Sandbox,
    claim: &SandboxClaim,
    template: &SandboxTemplate,
    status: &mut ClaimStatus,
) -> bool {
    let live = sandbox.metadata.projection();
    let sandbox_level = merge(
        &live,
        &template.spec.sandbox_metadata,
        &claim.spec.sandbox_metadata,
        &status.applied_sandbox_metadata,
    );
    let pod_level = merge(
        &sandbox.spec.pod_template.metadata,
        &template.spec.pod_template.metadata,
        &claim.spec.pod_metadata,
        &status.applied_pod_metadata,
    );

    let changed = sandbox_level.differs_from(&live)
        || pod_level.differs_from(&sandbox.spec.pod_template.metadata);
    sandbox.metadata.apply_projection(sandbox_level.metadata);
    sandbox.spec.pod_template.metadata = pod_level.metadata;
    status.applied_sandbox_metadata = sandbox_level.applied;
    status.applied_pod_metadata = pod_level.applied;
    changed
}

fn stamp_launch(sandbox: &mut Sandbox, claim: &SandboxClaim, launch_type: LaunchType) {
    let annotations = &mut sandbox.metadata.annotations;
    annotations.insert(ANNOTATION_LAUNCH_TYPE.to_string(), launch_type.as_label().to_string());
    if let Some(carrier) = claim.metadata.annotation(ANNOTATION_TRACE_CONTEXT) {
        annotations.insert(ANNOTATION_TRACE_CONTEXT.to_string(), carrier.to_string());
    }
}

/// Rewrites `candidate` so that `claim` controls it. The write is guarded by
/// the candidate's observed version.
fn adopt(
    client: &Client,
    claim: &SandboxClaim,
    template: &SandboxTemplate,
    candidate: &Sandbox,
    status: &mut ClaimStatus,
) -> Result<Sandbox, ControllerError> {
    let mut sandbox = candidate.clone();
    let pool = sandbox
        .metadata
        .controller_ref()
        .map(|owner| owner.name.clone())
        .unwrap_or_default();
    sandbox
        .metadata
        .owner_references
        .retain(|owner| owner.controller != Some(true));
    sandbox.metadata.owner_references.push(claim_owner(claim)?);
    sandbox.metadata.labels.remove(LABEL_POOL);

    let mut applied = status.clone();
    sync_metadata(&mut sandbox, claim, template, &mut applied);
    stamp_launch(&mut sandbox, claim, LaunchType::Warm);
    sandbox
        .metadata
        .annotations
        .insert(ANNOTATION_ADOPTED_FROM.to_string(), pool);

    let adopted = client.update(&sandbox)?;
    *status = applied;
    Ok(adopted)
}

/// Creates a sandbox named after `claim` and controlled by it.
fn create_cold(
    client: &Client,
    claim: &SandboxClaim,
    template: &SandboxTemplate,
    status: &mut ClaimStatus,
) -> Result<Sandbox, ControllerError> {
    let mut sandbox = Sandbox {
        metadata: ObjectMeta::named(&claim.metadata.namespace, &claim.metadata.name),
        spec: SandboxSpec {
            template_ref: Some(claim.spec.template_ref.clone()),
            pod_template: template.spec.pod_template.clone(),
            ..SandboxSpec::default()
        },
        ..Sandbox::default()
    };
    sandbox.metadata.owner_references = vec![claim_owner(claim)?];
    sandbox.metadata.labels.insert(
        LABEL_TEMPLATE_REF_HASH.to_string(),
        name_hash(&claim.spec.template_ref.name),
    );

    let mut applied = status.clone();
    sync_metadata(&mut sandbox, claim, template, &mut applied);
    stamp_launch(&mut sandbox, claim, LaunchType::Cold);

    match client.create(&sandbox) {
        Ok(created) => {
            *status = applied;
            Ok(created)
        }
        Err(err) if err.is_already_exists() => {
            let existing: Sandbox = client.get(&claim.metadata.namespace, &claim.metadata.name)?;
            let uid = claim.metadata.uid.as_deref().unwrap_or_default();
            if existing.metadata.is_controlled_by(uid) && existing.metadata.is_deleting() {
                // The previous sandbox must be gone before the name can be reused.
                Err(ControllerError::Pending(format!(
                    "sandbox {} is still terminating",
                    claim.metadata.name
                )))
            } else if existing.metadata.is_controlled_by(uid) {
                Ok(existing)
            } else {
                Err(ControllerError::InvariantViolation(format!(
                    "sandbox {} already exists and is not owned by claim {}",
                    claim.metadata.name, claim.metadata.name
                )))
            }
        }
        Err(err) => Err(err.into()),
    }
}

fn set_ready(
    status: &mut ClaimStatus,
    state: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
    generation: Option<i64>,
) {
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_READY, state, reason, message, now).with_generation(generation),
    );
}

/// Folds the bound sandbox's readiness into `status`.
///
/// Returns the latency sample to emit, if this pass is the claim's first
/// ready or failed observation, and how long to wait before looking again.
fn observe_readiness(
    claim: &SandboxClaim,
    sandbox: &Sandbox,
    status: &mut ClaimStatus,
    config: &ControllerConfig,
    now: DateTime<Utc>,
) -> (Option<StartupSample>, Option<Duration>) {
    let generation = claim.metadata.generation;
    let launch_type = status.launch_type.unwrap_or(LaunchType::Unknown);
    let elapsed = claim
        .metadata
        .creation_timestamp
        .map(|created| elapsed_ms(created, now))
        .unwrap_or(0);
    let first = !status.startup_recorded;
    let sample = |result: StartupStatus| StartupSample {
        launch_type,
        status: result,
        elapsed_ms: elapsed,
    };

    if sandbox.is_ready() {
        set_ready(
            status,
            ConditionStatus::True,
            REASON_SANDBOX_READY,
            format!("sandbox {} is ready", sandbox.metadata.name),
            now,
            generation,
        );
        status.startup_recorded = true;
        return (first.then(|| sample(StartupStatus::Success)), None);
    }
    if sandbox.is_failed() {
        set_ready(
            status,
            ConditionStatus::False,
            REASON_SANDBOX_FAILED,
            format!("sandbox {} failed", sandbox.metadata.name),
            now,
            generation,
        );
        status.startup_recorded = true;
        return (first.then(|| sample(StartupStatus::Failure)), None);
    }

    let timeout_ms = config.ready_timeout.as_millis() as u64;
    if first && elapsed >= timeout_ms {
        set_ready(
            status,
            ConditionStatus::False,
            REASON_STARTUP_TIMEOUT,
            format!(
                "sandbox {} not ready after {}s",
                sandbox.metadata.name,
                config.ready_timeout.as_secs()
            ),
            now,
            generation,
        );
        status.startup_recorded = true;
        return (Some(sample(StartupStatus::Failure)), None);
    }

    set_ready(
        status,
        ConditionStatus::False,
        REASON_SANDBOX_NOT_READY,
        format!("waiting for sandbox {}", sandbox.metadata.name),
        now,
        generation,
    );
    let wait = first.then(|| Duration::from_millis(timeout_ms.saturating_sub(elapsed)));
    (None, wait)
}

impl ClaimController {
    /// Adopts an idle member or, when none can be had, creates a sandbox.
    fn acquire(
        &self,
        client: &Client,
        config: &ControllerConfig,
        claim: &SandboxClaim,
        template: &SandboxTemplate,
        mut candidates: Vec<Sandbox>,
        status: &mut ClaimStatus,
    ) -> Result<(Sandbox, LaunchType), ControllerError> {
        let namespace = claim.metadata.namespace.as_str();
        let name = claim.metadata.name.as_str();
        let mut conflicts = 0;

        while let Some(candidate) = candidates.first() {
            match adopt(client, claim, template, candidate, status) {
                Ok(sandbox) => {
                    metrics::record_claim_adoption(AdoptionResult::Adopted);
                    log_info(
                        COMPONENT,
                        "adopted pool sandbox",
                        &[
                            ("namespace", namespace),
                            ("claim", name),
                            ("sandbox", &sandbox.metadata.name),
                        ],
                    );
                    return Ok((sandbox, LaunchType::Warm));
                }
                Err(ControllerError::Store(err)) if err.is_conflict() || err.is_not_found() => {
                    metrics::record_claim_adoption(AdoptionResult::Conflict);
                    conflicts += 1;
                    log_debug(
                        COMPONENT,
                        "lost adoption race",
                        &[
                            ("namespace", namespace),
                            ("claim", name),
                            ("sandbox", &candidate.metadata.name),
                        ],
                    );
                    if conflicts >= config.max_adoption_attempts {
                        break;
                    }
                    candidates = idle_candidates(client, claim)?;
                }
                Err(err) => return Err(err),
            }
        }

        let sandbox = create_cold(client, claim, template, status)?;
        metrics::record_claim_adoption(AdoptionResult::Cold);
        log_info(
            COMPONENT,
            "created sandbox for claim",
            &[("namespace", namespace), ("claim", name), ("sandbox", &sandbox.metadata.name)],
        );
        Ok((sandbox, LaunchType::Cold))
    }
}

impl Reconciler for ClaimController {
    type Desired = SandboxClaim;
    type Observed = ClaimObservedState;
    type Plan = ClaimPlan;
    type Error = ControllerError;

    fn kind(&self) -> &'static str {
        "claim"
    }

    fn fetch(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Option<ReconcileData<Self::Desired, Self::Observed>>, Self::Error> {
        let client = ctx.client()?;
        let claim = match client.get_opt::<SandboxClaim>(target.namespace(), target.name())? {
            Some(claim) if !claim.metadata.is_deleting() => claim,
            _ => return Ok(None),
        };
        let template =
            client.get_opt::<SandboxTemplate>(target.namespace(), &claim.spec.template_ref.name)?;
        let owned = owned_sandboxes(&client, &claim)?;
        let candidates = if owned.is_empty() {
            idle_candidates(&client, &claim)?
        } else {
            Vec::new()
        };
        Ok(Some(ReconcileData {
            desired: claim,
            observed: ClaimObservedState {
                template,
                owned,
                candidates,
                now: ctx.clock()?.now(),
            },
        }))
    }

    fn diff(
        &self,
        _target: &ControllerTarget,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error> {
        let action = if desired.status.is_terminal() {
            ClaimAction::Hold
        } else {
            match observed.owned.as_slice() {
                [sandbox] => ClaimAction::Bind(Box::new(sandbox.clone())),
                [] if observed.template.is_none() => ClaimAction::TemplateMissing,
                [] => ClaimAction::Acquire,
                many => {
                    let names: Vec<&str> = many.iter().map(|s| s.metadata.name.as_str()).collect();
                    ClaimAction::Violation(format!(
                        "claim controls {} sandboxes: {}",
                        many.len(),
                        names.join(", ")
                    ))
                }
            }
        };
        Ok(ClaimPlan {
            claim: desired.clone(),
            template: observed.template.clone(),
            action,
            candidates: observed.candidates.clone(),
            now: observed.now,
        })
    }

    fn apply(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
        plan: Self::Plan,
    ) -> Result<ReconcileOutcome, Self::Error> {
        let client = ctx.client()?;
        let config = ctx.config()?;
        let namespace = target.namespace();
        let name = target.name();
        let now = plan.now;
        let mut claim = plan.claim;

        if matches!(plan.action, ClaimAction::Hold) {
            return Ok(ReconcileOutcome::Converged);
        }

        if tracing::inject_if_absent(&mut claim.metadata.annotations) {
            claim = client.update(&claim)?;
        }

        let mut status = claim.status.clone();
        let generation = claim.metadata.generation;
        let (sandbox, launch_type) = match plan.action {
            ClaimAction::Hold => return Ok(ReconcileOutcome::Converged),
            ClaimAction::TemplateMissing => {
                let template = claim.spec.template_ref.name.clone();
                set_ready(
                    &mut status,
                    ConditionStatus::False,
                    REASON_TEMPLATE_NOT_FOUND,
                    format!("sandbox template {template} not found"),
                    now,
                    generation,
                );
                write_status(&client, &mut claim, status)?;
                log_warn(
                    COMPONENT,
                    "template not found",
                    &[("namespace", namespace), ("claim", name), ("template", &template)],
                );
                return Err(ControllerError::TemplateNotFound {
                    namespace: namespace.to_string(),
                    name: template,
                });
            }
            ClaimAction::Violation(message) => {
                set_ready(
                    &mut status,
                    ConditionStatus::False,
                    REASON_INVARIANT_VIOLATION,
                    message.clone(),
                    now,
                    generation,
                );
                write_status(&client, &mut claim, status)?;
                return Err(ControllerError::InvariantViolation(message));
            }
            ClaimAction::Bind(sandbox) => {
                let mut sandbox = *sandbox;
                if let Some(template) = plan.template.as_ref() {
                    if sync_metadata(&mut sandbox, &claim, template, &mut status) {
                        sandbox = client.update(&sandbox)?;
                        log_debug(
                            COMPONENT,
                            "synced sandbox metadata",
                            &[
                                ("namespace", namespace),
                                ("claim", name),
                                ("sandbox", &sandbox.metadata.name),
                            ],
                        );
                    }
                }
                let launch_type = status
                    .launch_type
                    .or_else(|| {
                        sandbox
                            .metadata
                            .annotation(ANNOTATION_LAUNCH_TYPE)
                            .and_then(LaunchType::from_label)
                    })
                    .unwrap_or(LaunchType::Unknown);
                (sandbox, launch_type)
            }
            ClaimAction::Acquire => {
                let Some(template) = plan.template.as_ref() else {
                    return Err(ControllerError::TemplateNotFound {
                        namespace: namespace.to_string(),
                        name: claim.spec.template_ref.name.clone(),
                    });
                };
                if let Some(stale) = status.sandbox_name() {
                    log_info(
                        COMPONENT,
                        "bound sandbox is gone; matching again",
                        &[("namespace", namespace), ("claim", name), ("sandbox", stale)],
                    );
                }
                let outcome =
                    self.acquire(&client, &config, &claim, template, plan.candidates, &mut status);
                match outcome {
                    Ok(bound) => bound,
                    Err(ControllerError::InvariantViolation(message)) => {
                        set_ready(
                            &mut status,
                            ConditionStatus::False,
                            REASON_INVARIANT_VIOLATION,
                            message.clone(),
                            now,
                            generation,
                        );
                        write_status(&client, &mut claim, status)?;
                        return Err(ControllerError::InvariantViolation(message));
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        status.sandbox = Some(ClaimSandboxRef {
            name: sandbox.metadata.name.clone(),
        });
        status.launch_type = Some(launch_type);
        let (sample, wait) = observe_readiness(&claim, &sandbox, &mut status, &config, now);
        write_status(&client, &mut claim, status)?;
        if let Some(template) = plan.template.as_ref() {
            sync_network_policy(&client, &claim, template, &sandbox.metadata.name)?;
        }

        if let Some(sample) = sample {
            metrics::record_claim_startup_latency(
                sample.launch_type,
                sample.status,
                &claim.spec.template_ref.name,
                sample.elapsed_ms,
            );
            log_info(
                COMPONENT,
                "claim startup finished",
                &[
                    ("namespace", namespace),
                    ("claim", name),
                    ("sandbox", &sandbox.metadata.name),
                    ("launch_type", sample.launch_type.as_label()),
                    ("status", sample.status.as_label()),
                    ("elapsed_ms", &sample.elapsed_ms.to_string()),
                ],
            );
        }

        Ok(wait
            .map(ReconcileOutcome::RequeueAfter)
            .unwrap_or(ReconcileOutcome::Converged))
    }

    fn trace_parent(&self, desired: &Self::Desired) -> Option<TraceContext> {
        tracing::extract(&desired.metadata.annotations)
    }
}

fn write_status(
    client: &Client,
    claim: &mut SandboxClaim,
    status: ClaimStatus,
) -> Result<(), ControllerError> {
    if claim.status == status {
        return Ok(());
    }
    claim.status = status;
    *claim = client.update(claim)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandboxd::controller::error::ErrorClass;
    use crate::sandboxd::controller::networkpolicy::policy_name;
    use crate::sandboxd::k8s::condition::find_condition;
    use crate::sandboxd::k8s::naming::LABEL_SANDBOX_NAME_HASH;
    use crate::sandboxd::k8s::networkpolicy::{NetworkPolicy, SandboxNetworkPolicy};
    use crate::sandboxd::metadata::Metadata;
    use crate::sandboxd::test_support::{sample_template, Harness};

    fn ready_reason(claim: &SandboxClaim) -> Option<String> {
        find_condition(&claim.status.conditions, CONDITION_READY).map(|c| c.reason.clone())
    }

    fn seed_pool(harness: &Harness, replicas: u32) {
        harness.client.create(&sample_template("default", "python")).expect("template");
        harness
            .client
            .create(&SandboxWarmPool::new("default", "py-pool", "python", replicas))
            .expect("pool");
        harness.reconcile_pool("default", "py-pool").expect("fill pool");
    }

    #[test]
    fn adopts_an_idle_member_and_reports_warm_launch() {
        let harness = Harness::new();
        seed_pool(&harness, 1);
        let member = harness.client.list::<Sandbox>(Some("default")).expect("list").remove(0);

        harness
            .client
            .create(&SandboxClaim::new("default", "c1", "python"))
            .expect("claim");
        harness.reconcile_claim("default", "c1").expect("adopt");

        let claim: SandboxClaim = harness.client.get("default", "c1").expect("claim");
        assert_eq!(claim.status.sandbox_name(), Some(member.metadata.name.as_str()));
        assert_eq!(claim.status.launch_type, Some(LaunchType::Warm));
        assert_eq!(ready_reason(&claim).as_deref(), Some(REASON_SANDBOX_NOT_READY));
        assert!(claim.metadata.annotation(ANNOTATION_TRACE_CONTEXT).is_some());

        let adopted: Sandbox = harness
            .client
            .get("default", &member.metadata.name)
            .expect("sandbox");
        assert!(adopted
            .metadata
            .is_controlled_by(claim.metadata.uid.as_deref().unwrap_or_default()));
        assert_eq!(adopted.metadata.label(LABEL_POOL), None);
        assert_eq!(adopted.metadata.annotation(ANNOTATION_ADOPTED_FROM), Some("py-pool"));
        assert_eq!(adopted.metadata.annotation(ANNOTATION_LAUNCH_TYPE), Some("warm"));
    }

    #[test]
    fn falls_back_to_cold_creation_named_after_the_claim() {
        let harness = Harness::new();
        harness.client.create(&sample_template("default", "python")).expect("template");
        harness
            .client
            .create(&SandboxClaim::new("default", "c2", "python"))
            .expect("claim");
        harness.reconcile_claim("default", "c2").expect("cold");

        let claim: SandboxClaim = harness.client.get("default", "c2").expect("claim");
        assert_eq!(claim.status.sandbox_name(), Some("c2"));
        assert_eq!(claim.status.launch_type, Some(LaunchType::Cold));
        let sandbox: Sandbox = harness.client.get("default", "c2").expect("sandbox");
        assert_eq!(sandbox.metadata.annotation(ANNOTATION_LAUNCH_TYPE), Some("cold"));
    }

    #[test]
    fn ready_transition_records_latency_once() {
        let harness = Harness::new();
        harness.client.create(&sample_template("default", "latency-once")).expect("template");
        harness
            .client
            .create(&SandboxClaim::new("default", "c3", "latency-once"))
            .expect("claim");
        harness.reconcile_claim("default", "c3").expect("cold");
        harness.reconcile_sandbox("default", "c3").expect("pod");
        harness.clock.advance(Duration::from_millis(1500));
        harness.mark_pod_ready("default", "c3");
        harness.reconcile_sandbox("default", "c3").expect("sandbox ready");
        harness.reconcile_claim("default", "c3").expect("claim ready");
        harness.reconcile_claim("default", "c3").expect("steady");

        let claim: SandboxClaim = harness.client.get("default", "c3").expect("claim");
        assert_eq!(ready_reason(&claim).as_deref(), Some(REASON_SANDBOX_READY));
        assert!(claim.status.startup_recorded);
        assert_eq!(
            metrics::claim_startup_sample_count(
                LaunchType::Cold,
                StartupStatus::Success,
                "latency-once"
            ),
            1
        );
    }

    #[test]
    fn startup_timeout_is_terminal_and_recorded_as_failure() {
        let harness = Harness::new();
        harness.client.create(&sample_template("default", "slow")).expect("template");
        harness
            .client
            .create(&SandboxClaim::new("default", "c4", "slow"))
            .expect("claim");
        let outcome = harness.reconcile_claim("default", "c4").expect("cold");
        assert!(matches!(outcome, ReconcileOutcome::RequeueAfter(_)));

        harness.clock.advance(harness.config.ready_timeout + Duration::from_secs(1));
        harness.reconcile_claim("default", "c4").expect("timeout");
        let claim: SandboxClaim = harness.client.get("default", "c4").expect("claim");
        assert_eq!(ready_reason(&claim).as_deref(), Some(REASON_STARTUP_TIMEOUT));
        assert!(claim.status.is_terminal());
        assert_eq!(
            metrics::claim_startup_sample_count(LaunchType::Cold, StartupStatus::Failure, "slow"),
            1
        );

        let version = claim.metadata.resource_version.clone();
        harness.reconcile_claim("default", "c4").expect("hold");
        let held: SandboxClaim = harness.client.get("default", "c4").expect("claim");
        assert_eq!(held.metadata.resource_version, version);
    }

    #[test]
    fn missing_template_without_sandbox_is_reported() {
        let harness = Harness::new();
        harness
            .client
            .create(&SandboxClaim::new("default", "c5", "absent"))
            .expect("claim");
        let err = harness.reconcile_claim("default", "c5").expect_err("missing");
        assert!(matches!(err, ControllerError::TemplateNotFound { .. }));
        let claim: SandboxClaim = harness.client.get("default", "c5").expect("claim");
        assert_eq!(ready_reason(&claim).as_deref(), Some(REASON_TEMPLATE_NOT_FOUND));
    }

    #[test]
    fn stale_sandbox_reference_is_rebound() {
        let harness = Harness::new();
        harness.client.create(&sample_template("default", "python")).expect("template");
        let mut claim = SandboxClaim::new("default", "c6", "python");
        claim.status.sandbox = Some(ClaimSandboxRef { name: "gone".into() });
        harness.client.create(&claim).expect("claim");

        harness.reconcile_claim("default", "c6").expect("rebind");
        let claim: SandboxClaim = harness.client.get("default", "c6").expect("claim");
        assert_eq!(claim.status.sandbox_name(), Some("c6"));
    }

    #[test]
    fn foreign_sandbox_with_claim_name_is_an_invariant_violation() {
        let harness = Harness::new();
        harness.client.create(&sample_template("default", "python")).expect("template");
        let mut foreign = Sandbox::default();
        foreign.metadata = ObjectMeta::named("default", "c7");
        harness.client.create(&foreign).expect("foreign sandbox");
        harness
            .client
            .create(&SandboxClaim::new("default", "c7", "python"))
            .expect("claim");

        let err = harness.reconcile_claim("default", "c7").expect_err("collision");
        assert!(matches!(err, ControllerError::InvariantViolation(_)));
        let claim: SandboxClaim = harness.client.get("default", "c7").expect("claim");
        assert_eq!(ready_reason(&claim).as_deref(), Some(REASON_INVARIANT_VIOLATION));
    }

    #[test]
    fn claim_metadata_wins_over_template_metadata() {
        let harness = Harness::new();
        let mut template = sample_template("default", "python");
        template.spec.sandbox_metadata = Metadata::default()
            .with_label("team", "infra")
            .with_label("tier", "gold");
        harness.client.create(&template).expect("template");
        let mut claim = SandboxClaim::new("default", "c8", "python");
        claim.spec.sandbox_metadata = Metadata::default().with_label("team", "billing");
        harness.client.create(&claim).expect("claim");

        harness.reconcile_claim("default", "c8").expect("cold");
        let sandbox: Sandbox = harness.client.get("default", "c8").expect("sandbox");
        assert_eq!(sandbox.metadata.label("team"), Some("billing"));
        assert_eq!(sandbox.metadata.label("tier"), Some("gold"));
    }

    #[test]
    fn deleting_a_claim_releases_its_sandbox() {
        let harness = Harness::new();
        harness.client.create(&sample_template("default", "python")).expect("template");
        harness
            .client
            .create(&SandboxClaim::new("default", "c9", "python"))
            .expect("claim");
        harness.reconcile_claim("default", "c9").expect("cold");
        harness.reconcile_sandbox("default", "c9").expect("pod");

        harness.client.delete::<SandboxClaim>("default", "c9").expect("delete claim");
        harness.reconcile_sandbox("default", "c9").expect("tear down pod");
        harness.reconcile_sandbox("default", "c9").expect("release");
        assert!(harness.client.get_opt::<Sandbox>("default", "c9").expect("lookup").is_none());
    }

    #[test]
    fn terminating_sandbox_with_claim_name_defers_cold_creation() {
        let harness = Harness::new();
        harness.client.create(&sample_template("default", "python")).expect("template");
        harness
            .client
            .create(&SandboxClaim::new("default", "c10", "python"))
            .expect("claim");
        harness.reconcile_claim("default", "c10").expect("cold");
        harness.reconcile_sandbox("default", "c10").expect("pod");
        let first: Sandbox = harness.client.get("default", "c10").expect("sandbox");

        harness.client.delete::<Sandbox>("default", "c10").expect("delete sandbox");
        let err = harness.reconcile_claim("default", "c10").expect_err("still terminating");
        assert!(matches!(err, ControllerError::Pending(_)));
        assert_eq!(err.class(), ErrorClass::Transient);

        harness.reconcile_sandbox("default", "c10").expect("tear down pod");
        harness.reconcile_sandbox("default", "c10").expect("release");
        harness.reconcile_claim("default", "c10").expect("recreate");

        let second: Sandbox = harness.client.get("default", "c10").expect("sandbox");
        assert_ne!(second.metadata.uid, first.metadata.uid);
        assert!(!second.metadata.is_deleting());
        let claim: SandboxClaim = harness.client.get("default", "c10").expect("claim");
        assert_eq!(claim.status.sandbox_name(), Some("c10"));
    }

    #[test]
    fn isolated_template_gets_a_policy_selecting_the_bound_sandbox() {
        let harness = Harness::new();
        let mut template = sample_template("default", "python");
        template.spec.network_policy = Some(SandboxNetworkPolicy {
            enabled: true,
            ..SandboxNetworkPolicy::default()
        });
        harness.client.create(&template).expect("template");
        harness
            .client
            .create(&SandboxWarmPool::new("default", "py-pool", "python", 1))
            .expect("pool");
        harness.reconcile_pool("default", "py-pool").expect("fill pool");
        harness
            .client
            .create(&SandboxClaim::new("default", "c11", "python"))
            .expect("claim");
        harness.reconcile_claim("default", "c11").expect("adopt");

        let claim: SandboxClaim = harness.client.get("default", "c11").expect("claim");
        let bound = claim.status.sandbox_name().expect("bound").to_string();
        assert_ne!(bound, "c11");
        let policy: NetworkPolicy = harness
            .client
            .get("default", &policy_name("c11"))
            .expect("policy");
        assert!(policy
            .metadata
            .is_controlled_by(claim.metadata.uid.as_deref().unwrap_or_default()));
        assert_eq!(
            policy.spec.pod_selector.get(LABEL_SANDBOX_NAME_HASH),
            Some(&name_hash(&bound))
        );

        let version = policy.metadata.resource_version.clone();
        harness.reconcile_claim("default", "c11").expect("steady");
        let again: NetworkPolicy = harness
            .client
            .get("default", &policy_name("c11"))
            .expect("policy");
        assert_eq!(again.metadata.resource_version, version);

        let mut template: SandboxTemplate = harness.client.get("default", "python").expect("template");
        template.spec.network_policy = None;
        harness.client.update(&template).expect("disable isolation");
        harness.reconcile_claim("default", "c11").expect("remove policy");
        assert!(harness
            .client
            .get_opt::<NetworkPolicy>("default", &policy_name("c11"))
            .expect("lookup")
            .is_none());
    }
}
