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

//! Warm pool controller.
//!
//! Membership is derived on every pass by listing sandboxes that carry the
//! pool label and are controlled by the pool; nothing is remembered between
//! passes. The controller only ever creates or deletes `Sandbox` objects and
//! leaves pods to the sandbox controller.

use crate::sandboxd::controller::error::ControllerError;
use crate::sandboxd::controller::reconcile::{
    ReconcileContext, ReconcileData, ReconcileOutcome, Reconciler,
};
use crate::sandboxd::controller::runtime::ControllerTarget;
use crate::sandboxd::k8s::claim::REASON_TEMPLATE_NOT_FOUND;
use crate::sandboxd::k8s::condition::{
    set_condition, Condition, ConditionStatus, CONDITION_DEGRADED, CONDITION_READY,
};
use crate::sandboxd::k8s::naming::{
    member_name, name_hash, random_suffix, LABEL_POD_TEMPLATE_HASH, LABEL_POOL,
    LABEL_TEMPLATE_REF_HASH,
};
use crate::sandboxd::k8s::pod::{ObjectMeta, OwnerReference};
use crate::sandboxd::k8s::sandbox::{Sandbox, SandboxSpec, SandboxStatus};
use crate::sandboxd::k8s::store::{Client, Resource};
use crate::sandboxd::k8s::template::SandboxTemplate;
use crate::sandboxd::k8s::warmpool::{SandboxWarmPool, WarmPoolStatus};
use crate::sandboxd::logger::{log_debug, log_info, log_warn};
use crate::sandboxd::observability::metrics;
use crate::sandboxd::observability::tracing;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const COMPONENT: &str = "warmpool-controller";
const MEMBER_SUFFIX_LEN: usize = 5;

/// Whether `sandbox` carries the pool label and every selector label of `pool`.
pub fn carries_pool_labels(pool: &SandboxWarmPool, sandbox: &Sandbox) -> bool {
    let pool_hash = name_hash(&pool.metadata.name);
    sandbox.metadata.label(LABEL_POOL) == Some(pool_hash.as_str())
        && pool
            .spec
            .selector
            .iter()
            .all(|(key, value)| sandbox.metadata.label(key) == Some(value.as_str()))
}

#[derive(Debug, Clone)]
pub struct WarmPoolObservedState {
    pub template: Option<SandboxTemplate>,
    pub members: Vec<Sandbox>,
    /// Labelled for this pool but without any controller.
    pub orphans: Vec<Sandbox>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WarmPoolPlan {
    pub pool: SandboxWarmPool,
    pub adopt: Vec<Sandbox>,
    /// Members to remove, as observed. Deletes are pinned to these versions
    /// so a member adopted by a claim in the meantime survives.
    pub delete: Vec<Sandbox>,
    pub create: usize,
    /// Unnamed member stamped from the current template revision.
    pub prototype: Option<Sandbox>,
    pub kept: u32,
    pub kept_ready: u32,
    pub template_missing: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WarmPoolController;

impl WarmPoolController {
    pub fn new() -> Self {
        Self
    }
}

/// Builds an unnamed pool member for `template`, owned by `pool`.
pub fn stamp_member(
    pool: &SandboxWarmPool,
    template: &SandboxTemplate,
    revision: &str,
) -> Result<Sandbox, ControllerError> {
    let owner = OwnerReference::controller_for(SandboxWarmPool::KIND.as_str(), &pool.metadata)
        .ok_or_else(|| {
            ControllerError::InvariantViolation(format!(
                "warm pool {}/{} has no uid",
                pool.metadata.namespace, pool.metadata.name
            ))
        })?;

    let mut metadata = ObjectMeta::named(&pool.metadata.namespace, "");
    metadata.labels = template.spec.sandbox_metadata.labels.clone();
    metadata.annotations = template.spec.sandbox_metadata.annotations.clone();
    for (key, value) in &pool.spec.selector {
        metadata.labels.insert(key.clone(), value.clone());
    }
    metadata
        .labels
        .insert(LABEL_POOL.to_string(), name_hash(&pool.metadata.name));
    metadata.labels.insert(
        LABEL_TEMPLATE_REF_HASH.to_string(),
        name_hash(&pool.spec.template_ref.name),
    );
    metadata
        .labels
        .insert(LABEL_POD_TEMPLATE_HASH.to_string(), revision.to_string());
    metadata.owner_references = vec![owner];

    Ok(Sandbox {
        metadata,
        spec: SandboxSpec {
            template_ref: Some(pool.spec.template_ref.clone()),
            pod_template: template.spec.pod_template.clone(),
            ..SandboxSpec::default()
        },
        status: SandboxStatus::default(),
    })
}

fn oldest_first(a: &Sandbox, b: &Sandbox) -> std::cmp::Ordering {
    a.metadata
        .creation_timestamp
        .cmp(&b.metadata.creation_timestamp)
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

fn create_member(
    client: &Client,
    pool: &str,
    prototype: &Sandbox,
) -> Result<Sandbox, ControllerError> {
    let mut sandbox = prototype.clone();
    tracing::inject_if_absent(&mut sandbox.metadata.annotations);
    // A suffix collision gets one more draw before it counts as a failure.
    let mut attempts = 0;
    loop {
        sandbox.metadata.name = member_name(pool, &random_suffix(MEMBER_SUFFIX_LEN));
        match client.create(&sandbox) {
            Err(err) if err.is_already_exists() && attempts == 0 => attempts += 1,
            other => return other.map_err(ControllerError::from),
        }
    }
}

impl Reconciler for WarmPoolController {
    type Desired = SandboxWarmPool;
    type Observed = WarmPoolObservedState;
    type Plan = WarmPoolPlan;
    type Error = ControllerError;

    fn kind(&self) -> &'static str {
        "warmpool"
    }

    fn fetch(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Option<ReconcileData<Self::Desired, Self::Observed>>, Self::Error> {
        let client = ctx.client()?;
        let namespace = target.namespace();
        let pool = match client.get_opt::<SandboxWarmPool>(namespace, target.name())? {
            Some(pool) if !pool.metadata.is_deleting() => pool,
            _ => {
                metrics::clear_warmpool(namespace, target.name());
                return Ok(None);
            }
        };
        let template =
            client.get_opt::<SandboxTemplate>(namespace, &pool.spec.template_ref.name)?;
        let pool_uid = pool.metadata.uid.clone().unwrap_or_default();

        let mut members = Vec::new();
        let mut orphans = Vec::new();
        for sandbox in client.list::<Sandbox>(Some(namespace))? {
            if sandbox.metadata.is_deleting() || !carries_pool_labels(&pool, &sandbox) {
                continue;
            }
            match sandbox.metadata.controller_ref() {
                Some(_) if sandbox.metadata.is_controlled_by(&pool_uid) => members.push(sandbox),
                Some(_) => {}
                None => orphans.push(sandbox),
            }
        }

        Ok(Some(ReconcileData {
            desired: pool,
            observed: WarmPoolObservedState {
                template,
                members,
                orphans,
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
        let mut plan = WarmPoolPlan {
            pool: desired.clone(),
            adopt: Vec::new(),
            delete: Vec::new(),
            create: 0,
            prototype: None,
            kept: observed.members.len() as u32,
            kept_ready: observed.members.iter().filter(|s| s.is_ready()).count() as u32,
            template_missing: false,
            now: observed.now,
        };

        let Some(template) = observed.template.as_ref() else {
            plan.template_missing = true;
            return Ok(plan);
        };
        let revision = template.revision()?;

        let owner = OwnerReference::controller_for(SandboxWarmPool::KIND.as_str(), &desired.metadata);
        let mut current = observed.members.clone();
        if let Some(owner) = owner {
            for orphan in &observed.orphans {
                let mut adopted = orphan.clone();
                adopted.metadata.owner_references.push(owner.clone());
                current.push(adopted.clone());
                plan.adopt.push(adopted);
            }
        }

        let (mut up_to_date, stale): (Vec<Sandbox>, Vec<Sandbox>) = current
            .into_iter()
            .partition(|s| {
                s.metadata.label(LABEL_POD_TEMPLATE_HASH) == Some(revision.as_str()) && !s.is_failed()
            });
        plan.delete.extend(stale);

        let target = desired.spec.replicas as usize;
        if up_to_date.len() > target {
            up_to_date.sort_by(oldest_first);
            let excess = up_to_date.len() - target;
            plan.delete.extend(up_to_date.drain(..excess));
        }
        plan.create = target - up_to_date.len();
        plan.kept = up_to_date.len() as u32;
        plan.kept_ready = up_to_date.iter().filter(|s| s.is_ready()).count() as u32;

        if plan.create > 0 {
            plan.prototype = Some(stamp_member(desired, template, &revision)?);
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
        let pool_name = target.name();
        let mut pool = plan.pool;
        let mut status = pool.status.clone();
        let now = plan.now;
        status.observed_generation = pool.metadata.generation;

        if plan.template_missing {
            let message = format!("sandbox template {} not found", pool.spec.template_ref.name);
            status.replicas = plan.kept;
            status.ready_replicas = plan.kept_ready;
            set_pool_conditions(&mut status, &pool, Some((REASON_TEMPLATE_NOT_FOUND, &message)), now);
            write_status(&client, &mut pool, status)?;
            log_warn(
                COMPONENT,
                "template not found",
                &[
                    ("namespace", namespace),
                    ("pool", pool_name),
                    ("template", &pool.spec.template_ref.name),
                ],
            );
            return Err(ControllerError::TemplateNotFound {
                namespace: namespace.to_string(),
                name: pool.spec.template_ref.name.clone(),
            });
        }

        let mut failures: Vec<String> = Vec::new();
        let mut replicas = plan.kept;

        let mut adopted: HashMap<String, Sandbox> = HashMap::new();
        for orphan in &plan.adopt {
            match client.update(orphan) {
                Ok(updated) => {
                    log_info(
                        COMPONENT,
                        "adopted orphaned sandbox",
                        &[("namespace", namespace), ("pool", pool_name), ("sandbox", &orphan.metadata.name)],
                    );
                    adopted.insert(updated.metadata.name.clone(), updated);
                }
                // Lost to a concurrent writer; the next pass sees the result.
                Err(err) if err.is_conflict() || err.is_not_found() => {
                    if plan.delete.iter().all(|s| s.metadata.name != orphan.metadata.name) {
                        replicas = replicas.saturating_sub(1);
                    }
                }
                Err(err) => failures.push(format!("adopt {}: {err}", orphan.metadata.name)),
            }
        }

        for member in &plan.delete {
            let name = member.metadata.name.as_str();
            let observed = adopted.get(name).unwrap_or(member);
            match client.delete_observed(observed) {
                Ok(()) => log_info(
                    COMPONENT,
                    "deleted pool sandbox",
                    &[("namespace", namespace), ("pool", pool_name), ("sandbox", name)],
                ),
                Err(err) if err.is_not_found() => {}
                // Changed since fetch, typically adopted by a claim. The
                // next pass decides again from fresh state.
                Err(err) if err.is_conflict() => log_debug(
                    COMPONENT,
                    "pool sandbox changed before delete; skipped",
                    &[("namespace", namespace), ("pool", pool_name), ("sandbox", name)],
                ),
                Err(err) => failures.push(format!("delete {name}: {err}")),
            }
        }

        if let Some(prototype) = plan.prototype.as_ref() {
            for _ in 0..plan.create {
                match create_member(&client, pool_name, prototype) {
                    Ok(created) => {
                        replicas += 1;
                        log_info(
                            COMPONENT,
                            "created pool sandbox",
                            &[
                                ("namespace", namespace),
                                ("pool", pool_name),
                                ("sandbox", &created.metadata.name),
                            ],
                        );
                    }
                    Err(err) => failures.push(format!("create: {err}")),
                }
            }
        }

        status.replicas = replicas;
        status.ready_replicas = plan.kept_ready;
        let failure_message = failures.join("; ");
        let degraded =
            (!failures.is_empty()).then_some(("ReconcileError", failure_message.as_str()));
        set_pool_conditions(&mut status, &pool, degraded, now);
        metrics::set_warmpool_sandboxes(
            namespace,
            pool_name,
            status.replicas,
            status.ready_replicas,
        );
        write_status(&client, &mut pool, status)?;

        if failures.is_empty() {
            log_debug(
                COMPONENT,
                "pool reconciled",
                &[("namespace", namespace), ("pool", pool_name), ("replicas", &replicas.to_string())],
            );
            Ok(ReconcileOutcome::Converged)
        } else {
            log_warn(
                COMPONENT,
                "pool partially reconciled",
                &[("namespace", namespace), ("pool", pool_name), ("error", &failure_message)],
            );
            Err(ControllerError::Partial(failure_message))
        }
    }
}

fn set_pool_conditions(
    status: &mut WarmPoolStatus,
    pool: &SandboxWarmPool,
    degraded: Option<(&str, &str)>,
    now: DateTime<Utc>,
) {
    let generation = pool.metadata.generation;
    let wanted = pool.spec.replicas;
    let ready = match degraded {
        Some((reason, message)) if reason == REASON_TEMPLATE_NOT_FOUND => {
            Condition::new(CONDITION_READY, ConditionStatus::False, reason, message, now)
        }
        _ if status.replicas == wanted && status.ready_replicas == wanted => Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "PoolReady",
            format!("{wanted} sandboxes ready"),
            now,
        ),
        _ => Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "Scaling",
            format!("{} of {wanted} sandboxes ready", status.ready_replicas),
            now,
        ),
    };
    set_condition(&mut status.conditions, ready.with_generation(generation));

    let degraded = match degraded {
        Some((reason, message)) => {
            Condition::new(CONDITION_DEGRADED, ConditionStatus::True, reason, message, now)
        }
        None => Condition::new(CONDITION_DEGRADED, ConditionStatus::False, "AsExpected", "", now),
    };
    set_condition(&mut status.conditions, degraded.with_generation(generation));
}

/// Persists `status` when it differs from what is stored.
fn write_status(
    client: &Client,
    pool: &mut SandboxWarmPool,
    status: WarmPoolStatus,
) -> Result<(), ControllerError> {
    if pool.status == status {
        return Ok(());
    }
    pool.status = status;
    match client.update(pool) {
        Ok(updated) => {
            *pool = updated;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
